use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use huddle_core::{
    CaptureDevice, LocalSession, LocalTrack, MediaAcquisitionError, MediaConstraints, TrackKind,
    WeakLocalSession,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::media::Sample;

use crate::tracks::{RtcTrackStore, WeakTrackStore, OPUS_SILENCE};

const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Capture device with no hardware behind it.
///
/// It creates the RTP tracks so links negotiate audio and video, and paces
/// Opus silence into the audio tracks so every link carries media from the
/// start. Video frames are pushed by the embedder through
/// [`RtcTrackStore::write_sample`].
pub struct HeadlessCapture {
    store: RtcTrackStore,
}

impl HeadlessCapture {
    pub fn new(store: RtcTrackStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RtcTrackStore {
        &self.store
    }
}

impl CaptureDevice for HeadlessCapture {
    fn open(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<LocalSession, MediaAcquisitionError>> {
        let store = self.store.clone();
        Box::pin(async move {
            if !constraints.audio && !constraints.video {
                return Err(MediaAcquisitionError::DeviceUnavailable(
                    "neither audio nor video requested".into(),
                ));
            }

            let stream_id = Uuid::new_v4().to_string();
            let mut tracks = Vec::new();
            if constraints.audio {
                tracks.push(LocalTrack::new(
                    format!("{stream_id}-audio"),
                    TrackKind::Audio,
                    "headless audio",
                ));
            }
            if constraints.video {
                tracks.push(LocalTrack::new(
                    format!("{stream_id}-video"),
                    TrackKind::Video,
                    "headless video",
                ));
            }
            for track in &tracks {
                store
                    .get_or_create(&stream_id, track)
                    .map_err(|e| MediaAcquisitionError::DeviceUnavailable(e.to_string()))?;
            }

            info!(stream = %stream_id, tracks = tracks.len(), "headless capture opened");
            let session = LocalSession::new(stream_id, tracks);
            if constraints.audio {
                tokio::spawn(pace_silence(store.downgrade(), session.downgrade()));
            }
            Ok(session)
        })
    }
}

/// Write one silence frame per audio track every 20 ms until the session or
/// the store goes away.
async fn pace_silence(store: WeakTrackStore, session: WeakLocalSession) {
    let mut ticker = tokio::time::interval(AUDIO_FRAME);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let (Some(store), Some(session)) = (store.upgrade(), session.upgrade()) else {
            break;
        };
        for track in session.tracks_of(TrackKind::Audio) {
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: AUDIO_FRAME,
                ..Default::default()
            };
            // A failing link reports here but the others still got the frame.
            if let Err(e) = store.write_sample(track, &sample).await {
                debug!(track = track.id(), "silence frame not delivered everywhere: {}", e);
            }
        }
    }
    debug!("headless audio pacing finished");
}
