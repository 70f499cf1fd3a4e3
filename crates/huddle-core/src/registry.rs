//! Peer sessions keyed by id, and the mesh join protocol.
//!
//! Tie-break: the newcomer receives the roster and initiates toward every
//! existing member. Existing members never initiate; they learn about the
//! newcomer from `peerJoined` and answer its first signal. This keeps two
//! sides from offering to each other at the same time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionId,
    PeerConnection, TaggedConnectionEvent,
};
use crate::ice::IceServer;
use crate::media::{LocalSession, MediaReadiness};
use crate::peer::{PeerSession, PeerTransition};
use crate::sink::MediaSink;
use crate::types::{PeerId, Role, SignalEnvelope};

/// Everything a session needs from its surroundings, owned by the mesh
/// controller for the lifetime of one signaling connection.
#[derive(Clone)]
pub struct SessionContext {
    pub local_id: PeerId,
    pub ice_servers: Vec<IceServer>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub sink: Arc<dyn MediaSink>,
    pub media: MediaReadiness,
    pub events: mpsc::UnboundedSender<TaggedConnectionEvent>,
}

pub struct PeerRegistry {
    ctx: SessionContext,
    sessions: HashMap<PeerId, PeerSession>,
    next_connection: u64,
}

impl PeerRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            sessions: HashMap::new(),
            next_connection: 1,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.ctx.local_id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    /// Roster received on join: initiate toward everyone not yet known.
    pub fn on_introduction(&mut self, ids: &[PeerId]) {
        info!(count = ids.len(), "introduction received");
        for id in ids {
            if *id == self.ctx.local_id || self.sessions.contains_key(id) {
                continue;
            }
            self.sessions
                .insert(id.clone(), PeerSession::pending(id.clone()));
            self.ctx.sink.on_sink_needed(id);
            self.open_session(id, Role::Initiator);
        }
    }

    /// Reserve a slot for a newcomer; it will send the first signal.
    pub fn on_peer_joined(&mut self, id: PeerId) {
        if id == self.ctx.local_id || self.sessions.contains_key(&id) {
            debug!(peer = %id, "peer joined ignored");
            return;
        }
        info!(peer = %id, "peer joined");
        self.sessions
            .insert(id.clone(), PeerSession::pending(id.clone()));
        self.ctx.sink.on_sink_needed(&id);
    }

    pub fn on_peer_left(&mut self, id: &PeerId) {
        let Some(mut session) = self.sessions.remove(id) else {
            debug!(peer = %id, "peer left for unknown id");
            return;
        };
        let transition = session.close();
        log_transition(id, &transition);
        info!(peer = %id, "peer left");
        self.ctx.sink.on_sink_removed(id);
    }

    pub fn on_signal(&mut self, envelope: SignalEnvelope) {
        if envelope.to != self.ctx.local_id {
            debug!(to = %envelope.to, from = %envelope.from, "signal for another peer dropped");
            return;
        }
        if envelope.from == self.ctx.local_id {
            debug!("signal from ourselves dropped");
            return;
        }

        let from = envelope.from;
        let existing = self
            .sessions
            .get(&from)
            .map(|s| (s.has_connection(), s.state().is_terminal()));
        match existing {
            Some((true, _)) => {}
            Some((false, true)) => {
                debug!(peer = %from, "signal for finished session dropped");
                return;
            }
            Some((false, false)) => {
                self.open_session(&from, Role::Responder);
            }
            None => {
                self.sessions
                    .insert(from.clone(), PeerSession::pending(from.clone()));
                self.ctx.sink.on_sink_needed(&from);
                self.open_session(&from, Role::Responder);
            }
        }

        let Some(session) = self.sessions.get_mut(&from) else {
            return;
        };
        match session.receive_signal(envelope.payload) {
            Ok(transition) => log_transition(&from, &transition),
            Err(e) => debug!(peer = %from, "signal not delivered: {}", e),
        }
    }

    /// Apply a callback from a connection object. Returns the envelope to
    /// send when the connection produced an outbound payload.
    pub fn on_connection_event(&mut self, tagged: TaggedConnectionEvent) -> Option<SignalEnvelope> {
        let TaggedConnectionEvent {
            peer,
            connection,
            event,
        } = tagged;
        let Some(session) = self.sessions.get_mut(&peer) else {
            debug!(%peer, %connection, "event for departed peer dropped");
            return None;
        };
        if session.connection_id() != Some(connection) {
            debug!(%peer, %connection, "event from stale connection dropped");
            return None;
        }

        match event {
            ConnectionEvent::Signal(payload) => match session.on_signal_sent() {
                Ok(transition) => {
                    log_transition(&peer, &transition);
                    Some(SignalEnvelope {
                        to: peer,
                        from: self.ctx.local_id.clone(),
                        payload,
                    })
                }
                Err(e) => {
                    warn!(%peer, "outbound signal dropped: {}", e);
                    None
                }
            },
            ConnectionEvent::Established => {
                let media = self.ctx.media.current();
                match session.on_established(media.as_ref()) {
                    Ok((transition, held)) => {
                        log_transition(&peer, &transition);
                        if media.is_none() {
                            debug!(%peer, "local media not ready; attachment deferred");
                        }
                        for stream in held {
                            match session.on_remote_stream(stream) {
                                Ok(Some(stream)) => self.ctx.sink.on_remote_stream(&peer, &stream),
                                Ok(None) => {}
                                Err(e) => warn!(%peer, "held stream dropped: {}", e),
                            }
                        }
                    }
                    Err(e) => warn!(%peer, "{}", e),
                }
                None
            }
            ConnectionEvent::RemoteStream(stream) => {
                match session.on_remote_stream(stream) {
                    Ok(Some(stream)) => {
                        info!(%peer, stream = %stream.stream_id, "remote stream received");
                        self.ctx.sink.on_remote_stream(&peer, &stream);
                    }
                    Ok(None) => debug!(%peer, "remote stream held until connected"),
                    Err(e) => warn!(%peer, "{}", e),
                }
                None
            }
            ConnectionEvent::Failed(reason) => {
                Self::fail_session(session, &self.ctx, &reason);
                None
            }
            ConnectionEvent::Closed => {
                Self::fail_session(session, &self.ctx, "connection closed by backend");
                None
            }
        }
    }

    /// Attach newly available local media to every link that is already up.
    pub fn attach_local_media(&mut self, media: &LocalSession) -> usize {
        let mut attached = 0;
        for session in self.sessions.values_mut() {
            if session.attach_local_media(media) {
                debug!(peer = %session.id(), "deferred local media attached");
                attached += 1;
            }
        }
        attached
    }

    /// Dispose of every session.
    pub fn close_all(&mut self) {
        for (id, mut session) in self.sessions.drain() {
            let transition = session.close();
            log_transition(&id, &transition);
            self.ctx.sink.on_sink_removed(&id);
        }
    }

    fn open_session(&mut self, id: &PeerId, role: Role) {
        let connection_id = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let opened = self.create_connection(id, role, connection_id);
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        match opened {
            Ok(connection) => {
                if let Err(e) = session.open(role, connection_id, connection) {
                    warn!(peer = %id, "cannot open session: {}", e);
                    return;
                }
                debug!(peer = %id, ?role, %connection_id, "connection created");
            }
            Err(e) => {
                error!(peer = %id, "failed to create connection: {}", e);
                Self::fail_session(session, &self.ctx, &e.to_string());
            }
        }
    }

    fn create_connection(
        &self,
        id: &PeerId,
        role: Role,
        connection_id: ConnectionId,
    ) -> huddle_common::Result<Box<dyn PeerConnection>> {
        let config = ConnectionConfig {
            peer: id.clone(),
            role,
            ice_servers: self.ctx.ice_servers.clone(),
        };
        let events = ConnectionEvents::new(id.clone(), connection_id, self.ctx.events.clone());
        self.ctx.factory.create(config, events)
    }

    fn fail_session(session: &mut PeerSession, ctx: &SessionContext, reason: &str) {
        match session.fail(reason) {
            Ok(transition) => {
                log_transition(session.id(), &transition);
                warn!(peer = %session.id(), "peer connection failed: {}", reason);
                ctx.sink.on_peer_failed(session.id(), reason);
            }
            Err(e) => debug!(peer = %session.id(), "{}", e),
        }
    }
}

fn log_transition(id: &PeerId, transition: &PeerTransition) {
    if transition.from != transition.to {
        debug!(
            peer = %id,
            from = ?transition.from,
            to = ?transition.to,
            event = ?transition.event,
            "peer transition"
        );
    }
}
