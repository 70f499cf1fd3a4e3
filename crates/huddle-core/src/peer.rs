//! Per-participant session state machine.
//!
//! ```text
//! Pending ──signal──▶ Negotiating ──established──▶ Connected ──stream──▶ Streaming
//!    │                     │                           │                     │
//!    └─────────────────────┴──────── fail ─────────────┴─────────────────────┴──▶ Failed
//!    (any state) ── close ──▶ Closed
//! ```
//!
//! The connection object exists from `open` until the session reaches a
//! terminal state; it is closed and dropped on that transition.

use std::fmt;

use crate::connection::{ConnectionId, PeerConnection};
use crate::media::LocalSession;
use crate::types::{PeerId, RemoteStream, Role, SignalPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    /// Slot reserved. An initiator already owns its connection here; a
    /// placeholder created from a join notification does not.
    Pending,
    Negotiating,
    Connected,
    Streaming,
    Failed { reason: String },
    Closed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed { .. } | PeerState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    SignalSent,
    SignalReceived,
    Established,
    RemoteStream,
    Fail,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTransition {
    pub from: PeerState,
    pub to: PeerState,
    pub event: PeerEvent,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerSessionError {
    #[error("invalid peer transition from {0:?} via {1:?}")]
    InvalidTransition(PeerState, PeerEvent),
    #[error("peer session has no connection")]
    NoConnection,
    #[error("peer session already has a connection")]
    AlreadyOpen,
}

struct Link {
    role: Role,
    id: ConnectionId,
    connection: Box<dyn PeerConnection>,
    media_attached: bool,
    held_streams: Vec<RemoteStream>,
}

pub struct PeerSession {
    id: PeerId,
    state: PeerState,
    link: Option<Link>,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("role", &self.role())
            .field("connection", &self.connection_id())
            .finish()
    }
}

impl PeerSession {
    pub fn pending(id: PeerId) -> Self {
        Self {
            id,
            state: PeerState::Pending,
            link: None,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.link.as_ref().map(|link| link.role)
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.link.as_ref().map(|link| link.id)
    }

    pub fn has_connection(&self) -> bool {
        self.link.is_some()
    }

    pub fn media_attached(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.media_attached)
    }

    /// Give a pending slot its connection object.
    pub fn open(
        &mut self,
        role: Role,
        id: ConnectionId,
        connection: Box<dyn PeerConnection>,
    ) -> Result<(), PeerSessionError> {
        if self.link.is_some() {
            return Err(PeerSessionError::AlreadyOpen);
        }
        if self.state != PeerState::Pending {
            return Err(PeerSessionError::NoConnection);
        }
        self.link = Some(Link {
            role,
            id,
            connection,
            media_attached: false,
            held_streams: Vec::new(),
        });
        Ok(())
    }

    /// The connection produced an outbound payload.
    pub fn on_signal_sent(&mut self) -> Result<PeerTransition, PeerSessionError> {
        match (&self.state, self.link.is_some()) {
            (PeerState::Pending, true) => {
                self.transition(PeerEvent::SignalSent, PeerState::Negotiating)
            }
            (PeerState::Negotiating | PeerState::Connected | PeerState::Streaming, true) => {
                let same = self.state.clone();
                self.transition(PeerEvent::SignalSent, same)
            }
            _ => Err(PeerSessionError::InvalidTransition(
                self.state.clone(),
                PeerEvent::SignalSent,
            )),
        }
    }

    /// Forward a remote payload into the connection.
    pub fn receive_signal(
        &mut self,
        payload: SignalPayload,
    ) -> Result<PeerTransition, PeerSessionError> {
        if self.state.is_terminal() {
            return Err(PeerSessionError::InvalidTransition(
                self.state.clone(),
                PeerEvent::SignalReceived,
            ));
        }
        let link = self.link.as_mut().ok_or(PeerSessionError::NoConnection)?;
        link.connection.signal(payload);

        let next = match self.state {
            PeerState::Pending => PeerState::Negotiating,
            ref other => other.clone(),
        };
        self.transition(PeerEvent::SignalReceived, next)
    }

    /// The transport is up. Attaches `media` when it is ready and hands back
    /// any remote streams that arrived early.
    pub fn on_established(
        &mut self,
        media: Option<&LocalSession>,
    ) -> Result<(PeerTransition, Vec<RemoteStream>), PeerSessionError> {
        if self.state != PeerState::Negotiating {
            return Err(PeerSessionError::InvalidTransition(
                self.state.clone(),
                PeerEvent::Established,
            ));
        }
        let held = match self.link.as_mut() {
            Some(link) => std::mem::take(&mut link.held_streams),
            None => return Err(PeerSessionError::NoConnection),
        };
        let transition = self.transition(PeerEvent::Established, PeerState::Connected)?;
        if let Some(media) = media {
            self.attach_local_media(media);
        }
        Ok((transition, held))
    }

    /// Returns the stream when it should reach the sink now, or `None` when it
    /// is held until the session is connected.
    pub fn on_remote_stream(
        &mut self,
        stream: RemoteStream,
    ) -> Result<Option<RemoteStream>, PeerSessionError> {
        match self.state {
            PeerState::Negotiating => {
                let link = self.link.as_mut().ok_or(PeerSessionError::NoConnection)?;
                link.held_streams.push(stream);
                Ok(None)
            }
            PeerState::Connected | PeerState::Streaming => {
                self.transition(PeerEvent::RemoteStream, PeerState::Streaming)?;
                Ok(Some(stream))
            }
            _ => Err(PeerSessionError::InvalidTransition(
                self.state.clone(),
                PeerEvent::RemoteStream,
            )),
        }
    }

    /// Attach local media once per link, and only after the link is up.
    /// Returns true when the attachment happened on this call.
    pub fn attach_local_media(&mut self, media: &LocalSession) -> bool {
        if !matches!(self.state, PeerState::Connected | PeerState::Streaming) {
            return false;
        }
        match self.link.as_mut() {
            Some(link) if !link.media_attached => {
                link.connection.attach_local_media(media);
                link.media_attached = true;
                true
            }
            _ => false,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<PeerTransition, PeerSessionError> {
        if self.state.is_terminal() {
            return Err(PeerSessionError::InvalidTransition(
                self.state.clone(),
                PeerEvent::Fail,
            ));
        }
        self.release();
        self.transition(
            PeerEvent::Fail,
            PeerState::Failed {
                reason: reason.into(),
            },
        )
    }

    /// Terminal from any state. No reconnection is attempted; a participant
    /// that comes back does so under a new id.
    pub fn close(&mut self) -> PeerTransition {
        self.release();
        let from = std::mem::replace(&mut self.state, PeerState::Closed);
        PeerTransition {
            from,
            to: PeerState::Closed,
            event: PeerEvent::Close,
        }
    }

    fn release(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.connection.close();
        }
    }

    fn transition(
        &mut self,
        event: PeerEvent,
        next: PeerState,
    ) -> Result<PeerTransition, PeerSessionError> {
        let from = self.state.clone();
        let to = next;
        self.state = to.clone();
        Ok(PeerTransition { from, to, event })
    }
}
