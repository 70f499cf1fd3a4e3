//! Peer-connection capability consumed by the mesh layer.
//!
//! A backend (see `huddle-rtc`) owns the actual transport. It reports progress
//! asynchronously through [`ConnectionEvents`]; every event is tagged with the
//! connection it came from so that callbacks flushed by a discarded connection
//! can be recognised and dropped.

use std::fmt;

use tokio::sync::mpsc;

use crate::ice::IceServer;
use crate::media::LocalSession;
use crate::types::{PeerId, RemoteStream, Role, SignalPayload};

/// Distinguishes successive connections made toward the same peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub peer: PeerId,
    pub role: Role,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A payload the remote side must receive.
    Signal(SignalPayload),
    /// The transport channel is up.
    Established,
    RemoteStream(RemoteStream),
    /// Negotiation or connectivity failed; the connection is unusable.
    Failed(String),
    /// The backend closed on its own.
    Closed,
}

#[derive(Debug)]
pub struct TaggedConnectionEvent {
    pub peer: PeerId,
    pub connection: ConnectionId,
    pub event: ConnectionEvent,
}

/// Sender half handed to a connection at creation.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    peer: PeerId,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<TaggedConnectionEvent>,
}

impl ConnectionEvents {
    pub fn new(
        peer: PeerId,
        connection: ConnectionId,
        tx: mpsc::UnboundedSender<TaggedConnectionEvent>,
    ) -> Self {
        Self {
            peer,
            connection,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns false once the mesh loop has gone away.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.tx
            .send(TaggedConnectionEvent {
                peer: self.peer.clone(),
                connection: self.connection,
                event,
            })
            .is_ok()
    }
}

/// One negotiated link to a remote participant. Exclusively owned by its
/// peer session and never reused after `close`.
pub trait PeerConnection: Send {
    /// Feed a payload received from the remote side.
    fn signal(&mut self, payload: SignalPayload);

    /// Start sending the local tracks over this link.
    fn attach_local_media(&mut self, media: &LocalSession);

    /// Release the link. No further events are expected after this.
    fn close(&mut self);
}

pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: ConnectionConfig,
        events: ConnectionEvents,
    ) -> huddle_common::Result<Box<dyn PeerConnection>>;
}
