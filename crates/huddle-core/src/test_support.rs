//! In-memory doubles shared by the unit tests.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionId,
    PeerConnection, TaggedConnectionEvent,
};
use crate::media::{
    CaptureDevice, LocalMediaController, LocalSession, LocalTrack, MediaAcquisitionError,
    MediaConstraints,
};
use crate::registry::{PeerRegistry, SessionContext};
use crate::sink::MediaSink;
use crate::types::{PeerId, RemoteStream, Role, SignalPayload};

#[derive(Debug, Default)]
struct ProbeState {
    signals: Vec<SignalPayload>,
    attached: Vec<String>,
    closed: usize,
}

/// Test-side view of one connection handed out by [`FakeFactory`].
#[derive(Clone)]
pub struct ConnectionProbe {
    role: Role,
    events: ConnectionEvents,
    state: Arc<Mutex<ProbeState>>,
}

impl ConnectionProbe {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.events.connection()
    }

    pub fn signals(&self) -> Vec<SignalPayload> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn attached(&self) -> Vec<String> {
        self.state.lock().unwrap().attached.clone()
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn tagged(&self, event: ConnectionEvent) -> TaggedConnectionEvent {
        TaggedConnectionEvent {
            peer: self.events.peer().clone(),
            connection: self.events.connection(),
            event,
        }
    }

    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.events.emit(event)
    }
}

struct FakeConnection(Arc<Mutex<ProbeState>>);

impl PeerConnection for FakeConnection {
    fn signal(&mut self, payload: SignalPayload) {
        self.0.lock().unwrap().signals.push(payload);
    }

    fn attach_local_media(&mut self, media: &LocalSession) {
        self.0
            .lock()
            .unwrap()
            .attached
            .push(media.stream_id().to_string());
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closed += 1;
    }
}

#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<ConnectionProbe>>,
    fail_next: Mutex<Option<String>>,
}

impl FakeFactory {
    pub fn created(&self) -> Vec<ConnectionProbe> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> ConnectionProbe {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection created")
    }

    pub fn fail_next(&self, reason: &str) {
        *self.fail_next.lock().unwrap() = Some(reason.to_string());
    }
}

impl ConnectionFactory for FakeFactory {
    fn create(
        &self,
        config: ConnectionConfig,
        events: ConnectionEvents,
    ) -> huddle_common::Result<Box<dyn PeerConnection>> {
        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            return Err(huddle_common::Error::connection(reason));
        }
        let state = Arc::new(Mutex::new(ProbeState::default()));
        self.created.lock().unwrap().push(ConnectionProbe {
            role: config.role,
            events,
            state: state.clone(),
        });
        Ok(Box::new(FakeConnection(state)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Needed(PeerId),
    Stream(PeerId, String),
    Removed(PeerId),
    Failed(PeerId, String),
}

#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn needed(&self) -> Vec<PeerId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Needed(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn streams(&self) -> Vec<(PeerId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Stream(id, stream) => Some((id, stream)),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<PeerId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Removed(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn failed(&self) -> Vec<(PeerId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Failed(id, reason) => Some((id, reason)),
                _ => None,
            })
            .collect()
    }
}

impl MediaSink for RecordingSink {
    fn on_sink_needed(&self, id: &PeerId) {
        self.calls.lock().unwrap().push(SinkCall::Needed(id.clone()));
    }

    fn on_remote_stream(&self, id: &PeerId, stream: &RemoteStream) {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Stream(id.clone(), stream.stream_id.clone()));
    }

    fn on_sink_removed(&self, id: &PeerId) {
        self.calls.lock().unwrap().push(SinkCall::Removed(id.clone()));
    }

    fn on_peer_failed(&self, id: &PeerId, reason: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Failed(id.clone(), reason.to_string()));
    }
}

/// Capture device that resolves immediately, or with a fixed error.
pub struct InstantCamera {
    fail: Option<MediaAcquisitionError>,
}

impl InstantCamera {
    pub fn working() -> Arc<Self> {
        Arc::new(Self { fail: None })
    }

    pub fn failing(err: MediaAcquisitionError) -> Arc<Self> {
        Arc::new(Self { fail: Some(err) })
    }
}

impl CaptureDevice for InstantCamera {
    fn open(
        &self,
        _constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<LocalSession, MediaAcquisitionError>> {
        let result = match &self.fail {
            Some(err) => Err(err.clone()),
            None => Ok(LocalSession::new(
                "local-stream",
                vec![
                    LocalTrack::new("mic", crate::types::TrackKind::Audio, "Microphone"),
                    LocalTrack::new("cam", crate::types::TrackKind::Video, "Camera"),
                ],
            )),
        };
        Box::pin(async move { result })
    }
}

/// A registry wired to fakes, for driving the mesh protocol synchronously.
pub struct Harness {
    pub registry: PeerRegistry,
    pub factory: Arc<FakeFactory>,
    pub sink: Arc<RecordingSink>,
    pub media: LocalMediaController,
    pub events: mpsc::UnboundedReceiver<TaggedConnectionEvent>,
}

impl Harness {
    pub fn new(local_id: &str) -> Self {
        let factory = Arc::new(FakeFactory::default());
        let sink = Arc::new(RecordingSink::default());
        let media = LocalMediaController::new(InstantCamera::working());
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            local_id: PeerId::new(local_id),
            ice_servers: crate::ice::resolve("", None, None),
            factory: factory.clone(),
            sink: sink.clone(),
            media: media.readiness(),
            events: events_tx,
        };
        Self {
            registry: PeerRegistry::new(ctx),
            factory,
            sink,
            media,
            events,
        }
    }

    pub fn resolve_media(&self) -> LocalSession {
        futures::executor::block_on(self.media.acquire()).expect("instant camera")
    }
}
