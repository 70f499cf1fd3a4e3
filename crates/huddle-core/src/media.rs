//! Local capture stream and its track toggles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::types::TrackKind;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("permission to capture media was denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture device busy: {0}")]
    DeviceBusy(String),
}

impl From<MediaAcquisitionError> for huddle_common::Error {
    fn from(err: MediaAcquisitionError) -> Self {
        huddle_common::Error::media(err)
    }
}

/// A single captured track. The `enabled` flag is shared by every clone, so
/// toggling it affects every peer link the track is attached to.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// A disabled track keeps flowing at the transport layer as silence or
    /// black frames.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct LocalSessionInner {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

/// The local capture stream, acquired once and shared by every peer link.
#[derive(Debug, Clone)]
pub struct LocalSession {
    inner: Arc<LocalSessionInner>,
}

impl LocalSession {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(LocalSessionInner {
                stream_id: stream_id.into(),
                tracks,
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.inner.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// True when both handles refer to the same acquired stream.
    pub fn same_stream(&self, other: &LocalSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakLocalSession {
        WeakLocalSession {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Handle that does not keep the capture stream alive.
#[derive(Debug, Clone)]
pub struct WeakLocalSession {
    inner: Weak<LocalSessionInner>,
}

impl WeakLocalSession {
    pub fn upgrade(&self) -> Option<LocalSession> {
        self.inner.upgrade().map(|inner| LocalSession { inner })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Platform capture capability.
pub trait CaptureDevice: Send + Sync {
    /// Request capture; resolves when the platform grants or denies access.
    fn open(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<LocalSession, MediaAcquisitionError>>;
}

/// One-shot readiness of the local session. Resolved at most once and
/// awaitable from any number of places.
#[derive(Debug, Clone)]
pub struct MediaReadiness {
    rx: watch::Receiver<Option<LocalSession>>,
}

impl MediaReadiness {
    pub fn current(&self) -> Option<LocalSession> {
        self.rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait until the session is available. Returns `None` if the owning
    /// controller goes away first.
    pub async fn ready(&self) -> Option<LocalSession> {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(session) => session.clone(),
            Err(_) => None,
        };
        result
    }
}

#[derive(Clone)]
pub struct LocalMediaController {
    device: Arc<dyn CaptureDevice>,
    constraints: MediaConstraints,
    session_tx: Arc<watch::Sender<Option<LocalSession>>>,
    acquire_lock: Arc<Mutex<()>>,
}

impl LocalMediaController {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self::with_constraints(device, MediaConstraints::default())
    }

    pub fn with_constraints(device: Arc<dyn CaptureDevice>, constraints: MediaConstraints) -> Self {
        let (session_tx, _) = watch::channel(None);
        Self {
            device,
            constraints,
            session_tx: Arc::new(session_tx),
            acquire_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Acquire the capture stream. Errors are returned as-is without retry;
    /// once acquired, later calls return the same session.
    pub async fn acquire(&self) -> Result<LocalSession, MediaAcquisitionError> {
        let _guard = self.acquire_lock.lock().await;
        if let Some(session) = self.current_session() {
            return Ok(session);
        }

        let session = self.device.open(self.constraints).await?;
        info!(
            stream = session.stream_id(),
            tracks = session.tracks().len(),
            "local media acquired"
        );
        self.session_tx.send_replace(Some(session.clone()));
        Ok(session)
    }

    pub fn current_session(&self) -> Option<LocalSession> {
        self.session_tx.borrow().clone()
    }

    pub fn readiness(&self) -> MediaReadiness {
        MediaReadiness {
            rx: self.session_tx.subscribe(),
        }
    }

    /// Returns false when there is no session yet.
    pub fn toggle_audio(&self, enabled: bool) -> bool {
        self.set_kind_enabled(Some(TrackKind::Audio), enabled)
    }

    pub fn toggle_video(&self, enabled: bool) -> bool {
        self.set_kind_enabled(Some(TrackKind::Video), enabled)
    }

    /// Enable or disable every outgoing track at once.
    pub fn set_outgoing_enabled(&self, enabled: bool) -> bool {
        self.set_kind_enabled(None, enabled)
    }

    fn set_kind_enabled(&self, kind: Option<TrackKind>, enabled: bool) -> bool {
        let Some(session) = self.current_session() else {
            debug!(?kind, enabled, "no local media yet; toggle ignored");
            return false;
        };
        for track in session
            .tracks()
            .iter()
            .filter(|t| kind.map_or(true, |k| t.kind() == k))
        {
            track.set_enabled(enabled);
        }
        debug!(?kind, enabled, "local tracks toggled");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeCamera {
        opens: AtomicUsize,
        fail: Option<MediaAcquisitionError>,
    }

    impl FakeCamera {
        fn working() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                fail: None,
            })
        }

        fn failing(err: MediaAcquisitionError) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                fail: Some(err),
            })
        }
    }

    impl CaptureDevice for FakeCamera {
        fn open(
            &self,
            _constraints: MediaConstraints,
        ) -> BoxFuture<'static, Result<LocalSession, MediaAcquisitionError>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let result = match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(LocalSession::new(
                    "local",
                    vec![
                        LocalTrack::new("mic", TrackKind::Audio, "Microphone"),
                        LocalTrack::new("cam", TrackKind::Video, "Camera"),
                    ],
                )),
            };
            Box::pin(async move { result })
        }
    }

    fn enabled_flags(session: &LocalSession, kind: TrackKind) -> Vec<bool> {
        session.tracks_of(kind).map(LocalTrack::is_enabled).collect()
    }

    #[tokio::test]
    async fn acquire_once_and_reuse() {
        let camera = FakeCamera::working();
        let media = LocalMediaController::new(camera.clone());

        let first = media.acquire().await.unwrap();
        let second = media.acquire().await.unwrap();
        assert!(first.same_stream(&second));
        assert_eq!(camera.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquisition_error_is_propagated_without_retry() {
        let camera = FakeCamera::failing(MediaAcquisitionError::PermissionDenied);
        let media = LocalMediaController::new(camera.clone());

        let err = media.acquire().await.unwrap_err();
        assert_eq!(err, MediaAcquisitionError::PermissionDenied);
        assert_eq!(camera.opens.load(Ordering::SeqCst), 1);
        assert!(media.current_session().is_none());
    }

    #[tokio::test]
    async fn audio_toggle_round_trip_keeps_tracks() {
        let media = LocalMediaController::new(FakeCamera::working());
        let session = media.acquire().await.unwrap();
        let ids_before: Vec<String> = session.tracks().iter().map(|t| t.id().to_string()).collect();

        assert!(media.toggle_audio(false));
        assert_eq!(enabled_flags(&session, TrackKind::Audio), vec![false]);
        assert_eq!(enabled_flags(&session, TrackKind::Video), vec![true]);

        assert!(media.toggle_audio(true));
        assert_eq!(enabled_flags(&session, TrackKind::Audio), vec![true]);

        let current = media.current_session().unwrap();
        assert!(current.same_stream(&session));
        let ids_after: Vec<String> = current.tracks().iter().map(|t| t.id().to_string()).collect();
        assert_eq!(ids_before, ids_after);
    }

    #[tokio::test]
    async fn outgoing_toggle_covers_every_track() {
        let media = LocalMediaController::new(FakeCamera::working());
        let session = media.acquire().await.unwrap();

        assert!(media.set_outgoing_enabled(false));
        assert!(session.tracks().iter().all(|t| !t.is_enabled()));
        assert!(media.toggle_video(true));
        assert_eq!(enabled_flags(&session, TrackKind::Video), vec![true]);
        assert_eq!(enabled_flags(&session, TrackKind::Audio), vec![false]);
    }

    #[test]
    fn toggle_before_ready_is_noop() {
        let media = LocalMediaController::new(FakeCamera::working());
        assert!(!media.toggle_audio(false));
        assert!(!media.toggle_video(false));
        assert!(media.current_session().is_none());
    }

    #[tokio::test]
    async fn readiness_resolves_for_every_waiter() {
        let media = LocalMediaController::new(FakeCamera::working());
        let readiness = media.readiness();
        assert!(!readiness.is_ready());

        let first = tokio::spawn({
            let readiness = readiness.clone();
            async move { readiness.ready().await }
        });
        let second = tokio::spawn({
            let readiness = readiness.clone();
            async move { readiness.ready().await }
        });

        let session = media.acquire().await.unwrap();
        assert!(first.await.unwrap().unwrap().same_stream(&session));
        assert!(second.await.unwrap().unwrap().same_stream(&session));
        assert!(readiness.is_ready());
        assert!(media.readiness().ready().await.unwrap().same_stream(&session));
    }

    #[tokio::test]
    async fn readiness_yields_none_when_controller_dropped() {
        let media = LocalMediaController::new(FakeCamera::working());
        let readiness = media.readiness();
        drop(media);
        assert!(readiness.ready().await.is_none());
    }

    #[tokio::test]
    async fn weak_session_ends_with_controller() {
        let media = LocalMediaController::new(FakeCamera::working());
        let weak = media.acquire().await.unwrap().downgrade();
        assert!(weak.upgrade().is_some());
        drop(media);
        assert!(weak.upgrade().is_none());
    }
}
