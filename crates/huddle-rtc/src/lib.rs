//! WebRTC backend for the Huddle mesh.
//!
//! Implements [`huddle_core::ConnectionFactory`] on top of `webrtc`, plus a
//! headless capture device whose RTP tracks are fed by the embedder.

mod capture;
mod connection;
mod payload;
mod tracks;

pub use capture::HeadlessCapture;
pub use connection::{rtc_ice_servers, RtcConnectionFactory, RtcPeerConnection};
pub use payload::RtcSignal;
pub use tracks::RtcTrackStore;
