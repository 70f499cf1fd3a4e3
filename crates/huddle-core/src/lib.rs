//! Full-mesh audio/video session core: signaling, peer lifecycle and local
//! media, independent of any particular peer-connection backend.

pub mod connection;
pub mod controller;
pub mod ice;
pub mod media;
pub mod peer;
pub mod registry;
pub mod signaling;
pub mod sink;
pub mod types;

#[cfg(test)]
mod test_support;

pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionId,
    PeerConnection, TaggedConnectionEvent,
};
pub use controller::{MeshCommand, MeshController, MeshHandle};
pub use ice::{IceServer, DEFAULT_DISCOVERY_SERVER};
pub use media::{
    CaptureDevice, LocalMediaController, LocalSession, LocalTrack, MediaAcquisitionError,
    MediaConstraints, MediaReadiness, WeakLocalSession,
};
pub use peer::{PeerEvent, PeerSession, PeerSessionError, PeerState, PeerTransition};
pub use registry::{PeerRegistry, SessionContext};
pub use signaling::{ChannelEvent, SignalMessage, SignalingChannel};
pub use sink::MediaSink;
pub use types::{
    PeerId, RemoteStream, RemoteTrack, Role, SignalEnvelope, SignalPayload, TrackKind,
};
