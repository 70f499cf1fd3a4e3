//! WebRTC peer connections driven by a worker task per link.
//!
//! The mesh loop talks to a link through [`RtcPeerConnection`], which only
//! queues operations. The worker applies them to the `RTCPeerConnection` in
//! order, and the connection's callbacks report back through
//! [`ConnectionEvents`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use huddle_common::{Error, Result};
use huddle_core::{
    ConnectionConfig, ConnectionEvent, ConnectionEvents, ConnectionFactory, IceServer,
    LocalSession, PeerConnection, RemoteStream, RemoteTrack, Role, SignalPayload, TrackKind,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::payload::RtcSignal;
use crate::tracks::RtcTrackStore;

enum Op {
    Remote(SignalPayload),
    Attach(LocalSession),
    NegotiationNeeded,
    Close,
}

pub struct RtcConnectionFactory {
    api: Arc<API>,
    tracks: RtcTrackStore,
}

impl RtcConnectionFactory {
    pub fn new(tracks: RtcTrackStore) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(Error::connection)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(Error::connection)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api: Arc::new(api),
            tracks,
        })
    }

    pub fn tracks(&self) -> &RtcTrackStore {
        &self.tracks
    }
}

impl ConnectionFactory for RtcConnectionFactory {
    fn create(
        &self,
        config: ConnectionConfig,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerConnection>> {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let peer = config.peer.clone();
        tokio::spawn(run_link(
            Arc::clone(&self.api),
            self.tracks.clone(),
            config,
            events,
            ops_tx.clone(),
            ops_rx,
        ));
        Ok(Box::new(RtcPeerConnection {
            peer,
            ops: ops_tx,
            closed: false,
        }))
    }
}

pub struct RtcPeerConnection {
    peer: huddle_core::PeerId,
    ops: mpsc::UnboundedSender<Op>,
    closed: bool,
}

impl RtcPeerConnection {
    fn submit(&self, op: Op) {
        if self.ops.send(op).is_err() {
            debug!(peer = %self.peer, "link worker already stopped");
        }
    }
}

impl PeerConnection for RtcPeerConnection {
    fn signal(&mut self, payload: SignalPayload) {
        self.submit(Op::Remote(payload));
    }

    fn attach_local_media(&mut self, media: &LocalSession) {
        self.submit(Op::Attach(media.clone()));
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.submit(Op::Close);
        }
    }
}

impl Drop for RtcPeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

async fn run_link(
    api: Arc<API>,
    tracks: RtcTrackStore,
    config: ConnectionConfig,
    events: ConnectionEvents,
    ops_tx: mpsc::UnboundedSender<Op>,
    mut ops: mpsc::UnboundedReceiver<Op>,
) {
    let peer = config.peer.clone();
    let mut link = match Link::open(&api, tracks, &config, events.clone(), ops_tx).await {
        Ok(link) => link,
        Err(e) => {
            warn!(%peer, "failed to open peer connection: {}", e);
            events.emit(ConnectionEvent::Failed(e.to_string()));
            return;
        }
    };

    if config.role.is_initiator() {
        if let Err(e) = link.offer().await {
            link.fail(e).await;
            return;
        }
    }

    while let Some(op) = ops.recv().await {
        let result = match op {
            Op::Remote(payload) => link.on_remote(payload).await,
            Op::Attach(media) => link.attach(media).await,
            Op::NegotiationNeeded => link.on_negotiation_needed().await,
            Op::Close => break,
        };
        if let Err(e) = result {
            link.fail(e).await;
            return;
        }
    }

    link.close().await;
    debug!(%peer, "link worker finished");
}

struct Link {
    pc: Arc<RTCPeerConnection>,
    role: Role,
    events: ConnectionEvents,
    tracks: RtcTrackStore,
    pending_candidates: Vec<RTCIceCandidateInit>,
    /// Set once the first offer/answer exchange has completed.
    negotiated: bool,
    /// The responder asked for an offer while one was in flight.
    offer_requested: bool,
}

impl Link {
    async fn open(
        api: &API,
        tracks: RtcTrackStore,
        config: &ConnectionConfig,
        events: ConnectionEvents,
        ops_tx: mpsc::UnboundedSender<Op>,
    ) -> Result<Self> {
        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&config.ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(Error::connection)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(candidate) => emit_signal(&events, RtcSignal::Candidate { candidate }),
                    Err(e) => warn!(peer = %events.peer(), "failed to encode candidate: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        let established = Arc::new(AtomicBool::new(false));
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            let established = Arc::clone(&established);
            Box::pin(async move {
                debug!(peer = %events.peer(), %state, "peer connection state");
                match state {
                    RTCPeerConnectionState::Connected => {
                        if !established.swap(true, Ordering::SeqCst) {
                            info!(peer = %events.peer(), "peer connection established");
                            events.emit(ConnectionEvent::Established);
                        }
                    }
                    RTCPeerConnectionState::Failed => {
                        events.emit(ConnectionEvent::Failed("ice connection failed".into()));
                    }
                    _ => {}
                }
            })
        }));

        let track_events = events.clone();
        let streams: Arc<Mutex<HashMap<String, Vec<RemoteTrack>>>> = Arc::default();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                other => {
                    debug!(peer = %events.peer(), ?other, "ignoring remote track");
                    None
                }
            };
            let stream = kind.and_then(|kind| {
                collect_stream(&streams, &track.stream_id(), track.id(), kind)
            });
            Box::pin(async move {
                if let Some(stream) = stream {
                    events.emit(ConnectionEvent::RemoteStream(stream));
                }
            })
        }));

        pc.on_negotiation_needed(Box::new(move || {
            let _ = ops_tx.send(Op::NegotiationNeeded);
            Box::pin(async {})
        }));

        if config.role.is_initiator() {
            // The first offer carries both media sections so the responder
            // can answer with its own tracks later.
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                pc.add_transceiver_from_kind(kind, None)
                    .await
                    .map_err(Error::connection)?;
            }
        }

        Ok(Self {
            pc,
            role: config.role,
            events,
            tracks,
            pending_candidates: Vec::new(),
            negotiated: false,
            offer_requested: false,
        })
    }

    async fn on_remote(&mut self, payload: SignalPayload) -> Result<()> {
        let signal = match RtcSignal::from_payload(&payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(peer = %self.events.peer(), "{}", e);
                return Ok(());
            }
        };
        debug!(peer = %self.events.peer(), kind = signal.kind(), "remote negotiation payload");

        match signal {
            RtcSignal::Offer { sdp } => {
                if self.role.is_initiator() {
                    warn!(peer = %self.events.peer(), "initiator ignoring remote offer");
                    return Ok(());
                }
                let offer = RTCSessionDescription::offer(sdp).map_err(Error::protocol)?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(Error::connection)?;
                self.flush_candidates().await?;
                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(Error::connection)?;
                self.pc
                    .set_local_description(answer.clone())
                    .await
                    .map_err(Error::connection)?;
                emit_signal(&self.events, RtcSignal::Answer { sdp: answer.sdp });
                self.negotiated = true;
            }
            RtcSignal::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp).map_err(Error::protocol)?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(Error::connection)?;
                self.flush_candidates().await?;
                self.negotiated = true;
                if self.offer_requested {
                    self.offer_requested = false;
                    self.offer().await?;
                }
            }
            RtcSignal::Candidate { candidate } => {
                if self.pc.remote_description().await.is_none() {
                    self.pending_candidates.push(candidate);
                } else if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                    warn!(peer = %self.events.peer(), "rejected remote candidate: {}", e);
                }
            }
            RtcSignal::Renegotiate => {
                if !self.role.is_initiator() {
                    return Ok(());
                }
                if self.is_idle() {
                    self.offer().await?;
                } else {
                    self.offer_requested = true;
                }
            }
        }
        Ok(())
    }

    async fn attach(&mut self, media: LocalSession) -> Result<()> {
        for track in media.tracks() {
            let rtp = self.tracks.get_or_create(media.stream_id(), track)?;
            let sender = self
                .pc
                .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(Error::connection)?;
            // RTCP has to be read for the interceptors to run.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        info!(
            peer = %self.events.peer(),
            stream = media.stream_id(),
            tracks = media.tracks().len(),
            "local media attached"
        );
        Ok(())
    }

    /// The connection raises this again whenever it returns to stable with
    /// changes still unnegotiated, so a request arriving mid-exchange (or
    /// before the first one completes) is dropped.
    async fn on_negotiation_needed(&mut self) -> Result<()> {
        if !self.is_idle() {
            debug!(peer = %self.events.peer(), "negotiation in flight; deferring");
            return Ok(());
        }
        if self.role.is_initiator() {
            self.offer().await
        } else {
            emit_signal(&self.events, RtcSignal::Renegotiate);
            Ok(())
        }
    }

    fn is_idle(&self) -> bool {
        self.negotiated && self.pc.signaling_state() == RTCSignalingState::Stable
    }

    async fn offer(&mut self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(Error::connection)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(Error::connection)?;
        emit_signal(&self.events, RtcSignal::Offer { sdp: offer.sdp });
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<()> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(peer = %self.events.peer(), "rejected queued candidate: {}", e);
            }
        }
        Ok(())
    }

    async fn fail(self, error: Error) {
        warn!(peer = %self.events.peer(), "negotiation failed: {}", error);
        self.events.emit(ConnectionEvent::Failed(error.to_string()));
        self.close().await;
    }

    async fn close(self) {
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.events.peer(), "error closing peer connection: {}", e);
        }
    }
}

/// Tracks of one remote stream arrive one callback at a time; report the
/// stream with every track seen so far.
fn collect_stream(
    streams: &Mutex<HashMap<String, Vec<RemoteTrack>>>,
    stream_id: &str,
    track_id: String,
    kind: TrackKind,
) -> Option<RemoteStream> {
    let mut streams = streams.lock().ok()?;
    let tracks = streams.entry(stream_id.to_string()).or_default();
    tracks.push(RemoteTrack { track_id, kind });
    Some(RemoteStream {
        stream_id: stream_id.to_string(),
        tracks: tracks.clone(),
    })
}

fn emit_signal(events: &ConnectionEvents, signal: RtcSignal) {
    match signal.into_payload() {
        Ok(payload) => {
            events.emit(ConnectionEvent::Signal(payload));
        }
        Err(e) => warn!(peer = %events.peer(), "failed to encode negotiation payload: {}", e),
    }
}
