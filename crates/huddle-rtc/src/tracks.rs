use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use huddle_common::{Error, Result};
use huddle_core::{LocalTrack, TrackKind};
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// One 20 ms Opus frame of silence (CELT fullband, mono).
pub const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

type TrackMap = HashMap<String, Arc<StoredTrack>>;

struct StoredTrack {
    rtp: Arc<TrackLocalStaticSample>,
    kind: TrackKind,
    last_keyframe: Mutex<Option<Bytes>>,
    written: AtomicU64,
}

impl StoredTrack {
    fn remember(&self, sample: &Sample) {
        if self.kind == TrackKind::Video && is_vp8_keyframe(&sample.data) {
            if let Ok(mut last) = self.last_keyframe.lock() {
                *last = Some(sample.data.clone());
            }
        }
    }

    fn last_keyframe(&self) -> Option<Bytes> {
        self.last_keyframe.lock().ok()?.clone()
    }
}

/// RTP-side counterparts of the local capture tracks, keyed by track id.
///
/// One sample track is shared by every peer link the capture track is
/// attached to, so a single write reaches the whole mesh.
#[derive(Clone, Default)]
pub struct RtcTrackStore {
    tracks: Arc<Mutex<TrackMap>>,
}

/// Non-owning handle to an [`RtcTrackStore`], for background writers that
/// must not keep the store alive.
#[derive(Clone)]
pub struct WeakTrackStore {
    tracks: Weak<Mutex<TrackMap>>,
}

impl WeakTrackStore {
    pub fn upgrade(&self) -> Option<RtcTrackStore> {
        self.tracks.upgrade().map(|tracks| RtcTrackStore { tracks })
    }
}

impl RtcTrackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakTrackStore {
        WeakTrackStore {
            tracks: Arc::downgrade(&self.tracks),
        }
    }

    pub fn get_or_create(
        &self,
        stream_id: &str,
        track: &LocalTrack,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        let mut tracks = self
            .tracks
            .lock()
            .map_err(|_| Error::internal("track store poisoned"))?;
        let stored = tracks.entry(track.id().to_string()).or_insert_with(|| {
            debug!(track = track.id(), kind = %track.kind(), "creating rtp track");
            Arc::new(StoredTrack {
                rtp: Arc::new(TrackLocalStaticSample::new(
                    codec_for(track.kind()),
                    track.id().to_string(),
                    stream_id.to_string(),
                )),
                kind: track.kind(),
                last_keyframe: Mutex::new(None),
                written: AtomicU64::new(0),
            })
        });
        Ok(Arc::clone(&stored.rtp))
    }

    pub fn get(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.stored(track_id).map(|stored| Arc::clone(&stored.rtp))
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples handed to the RTP track so far, substitutes included.
    pub fn samples_written(&self, track_id: &str) -> u64 {
        self.stored(track_id)
            .map_or(0, |stored| stored.written.load(Ordering::Relaxed))
    }

    /// Push one encoded sample for `track`.
    ///
    /// A disabled track keeps transmitting: audio becomes Opus silence and
    /// video repeats the last keyframe, both with the sample's duration.
    /// Returns false only when a disabled video track has no picture to
    /// repeat yet.
    pub async fn write_sample(&self, track: &LocalTrack, sample: &Sample) -> Result<bool> {
        let Some(stored) = self.stored(track.id()) else {
            return Err(Error::internal(format!("no rtp track for {}", track.id())));
        };

        let substitute;
        let outgoing = if track.is_enabled() {
            stored.remember(sample);
            sample
        } else {
            match substitute_sample(stored.kind, stored.last_keyframe(), sample.duration) {
                Some(sample) => {
                    substitute = sample;
                    &substitute
                }
                None => return Ok(false),
            }
        };

        stored
            .rtp
            .write_sample(outgoing)
            .await
            .map_err(Error::connection)?;
        stored.written.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn stored(&self, track_id: &str) -> Option<Arc<StoredTrack>> {
        self.tracks.lock().ok()?.get(track_id).cloned()
    }
}

/// What a disabled track sends in place of captured media.
fn substitute_sample(
    kind: TrackKind,
    last_keyframe: Option<Bytes>,
    duration: Duration,
) -> Option<Sample> {
    let data = match kind {
        TrackKind::Audio => Bytes::from_static(&OPUS_SILENCE),
        TrackKind::Video => last_keyframe?,
    };
    Some(Sample {
        data,
        duration,
        ..Default::default()
    })
}

/// The P bit of the VP8 frame tag is clear on keyframes.
fn is_vp8_keyframe(data: &[u8]) -> bool {
    data.first().is_some_and(|tag| tag & 0x01 == 0)
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}
