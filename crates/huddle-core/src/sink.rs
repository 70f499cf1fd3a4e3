use crate::types::{PeerId, RemoteStream};

/// Rendering-side observer, one sink per remote participant.
pub trait MediaSink: Send + Sync {
    fn on_sink_needed(&self, id: &PeerId);

    fn on_remote_stream(&self, id: &PeerId, stream: &RemoteStream);

    fn on_sink_removed(&self, id: &PeerId);

    /// The link to `id` failed and will not recover. The sink stays until
    /// the participant leaves.
    fn on_peer_failed(&self, _id: &PeerId, _reason: &str) {}
}
