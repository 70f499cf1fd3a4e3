use huddle_core::{MediaSink, PeerId, RemoteStream};
use tracing::{info, warn};

/// Headless rendering layer: reports what a UI would show.
pub struct LoggingSink;

impl MediaSink for LoggingSink {
    fn on_sink_needed(&self, id: &PeerId) {
        info!(peer = %id, "participant tile created");
    }

    fn on_remote_stream(&self, id: &PeerId, stream: &RemoteStream) {
        info!(
            peer = %id,
            stream = %stream.stream_id,
            audio = stream.audio_tracks().count(),
            video = stream.video_tracks().count(),
            "receiving media"
        );
    }

    fn on_sink_removed(&self, id: &PeerId) {
        info!(peer = %id, "participant tile removed");
    }

    fn on_peer_failed(&self, id: &PeerId, reason: &str) {
        warn!(peer = %id, "link to participant lost: {}", reason);
    }
}
