//! Signaling channel: membership events in, directed negotiation payloads out.
//!
//! The relay speaks JSON text frames over a WebSocket, tagged by `type`. The
//! first frame after connecting is always `welcome`, carrying the id the
//! relay assigned to us.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::types::{PeerId, SignalEnvelope, SignalPayload};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_QUEUE_CAPACITY: usize = 256;
const OUTBOX_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalMessage {
    /// Id assigned to this client by the relay.
    Welcome { id: PeerId },
    /// Everyone already present when we joined, excluding ourselves.
    Introduction { ids: Vec<PeerId> },
    PeerJoined { id: PeerId },
    PeerLeft { id: PeerId },
    /// Relayed by `to`; the payload is opaque to the relay.
    Signal {
        to: PeerId,
        from: PeerId,
        payload: SignalPayload,
    },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Introduction(Vec<PeerId>),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Signal(SignalEnvelope),
}

impl ChannelEvent {
    fn from_message(msg: SignalMessage) -> Option<Self> {
        match msg {
            SignalMessage::Introduction { ids } => Some(ChannelEvent::Introduction(ids)),
            SignalMessage::PeerJoined { id } => Some(ChannelEvent::PeerJoined(id)),
            SignalMessage::PeerLeft { id } => Some(ChannelEvent::PeerLeft(id)),
            SignalMessage::Signal { to, from, payload } => {
                Some(ChannelEvent::Signal(SignalEnvelope { to, from, payload }))
            }
            SignalMessage::Welcome { id } => {
                warn!(%id, "unexpected welcome after handshake");
                None
            }
            SignalMessage::Error { message } => {
                warn!("signaling server error: {}", message);
                None
            }
        }
    }
}

pub struct SignalingChannel {
    local_id: PeerId,
    events: mpsc::Receiver<ChannelEvent>,
    outbound: mpsc::Sender<SignalEnvelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Open the WebSocket, wait for our id, then pump frames in both
    /// directions on background tasks.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| Error::signaling(format!("failed to connect to {endpoint}: {e}")))?;
        info!("connected to signaling server: {}", endpoint);

        let (mut write, mut read) = ws_stream.split();

        let local_id = tokio::time::timeout(WELCOME_TIMEOUT, async {
            while let Some(msg) = read.next().await {
                let msg = msg.map_err(Error::signaling)?;
                let Message::Text(text) = msg else {
                    continue;
                };
                return match serde_json::from_str::<SignalMessage>(&text)? {
                    SignalMessage::Welcome { id } => Ok(id),
                    SignalMessage::Error { message } => Err(Error::signaling(message)),
                    other => Err(Error::protocol(format!(
                        "expected welcome as first message, got {other:?}"
                    ))),
                };
            }
            Err::<PeerId, Error>(Error::signaling("connection closed before welcome"))
        })
        .await
        .map_err(|_| Error::signaling("timed out waiting for welcome"))??;
        info!(id = %local_id, "assigned signaling id");

        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_QUEUE_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalEnvelope>(OUTBOX_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let msg = SignalMessage::Signal {
                    to: envelope.to,
                    from: envelope.from,
                    payload: envelope.payload,
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to encode signal: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!("failed to send signaling message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let parsed: SignalMessage = match serde_json::from_str(&text) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                warn!("failed to parse signaling message: {}", e);
                                continue;
                            }
                        };
                        if let Some(event) = ChannelEvent::from_message(parsed) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("signaling server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("signaling WebSocket error: {}", e);
                        break;
                    }
                }
            }
            debug!("signaling reader finished");
        });

        Ok(Self {
            local_id,
            events: event_rx,
            outbound: outbound_tx,
            tasks: vec![writer, reader],
        })
    }

    /// Assemble a channel over an already-established transport.
    pub fn from_parts(
        local_id: PeerId,
        events: mpsc::Receiver<ChannelEvent>,
        outbound: mpsc::Sender<SignalEnvelope>,
    ) -> Self {
        Self {
            local_id,
            events,
            outbound,
            tasks: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Next inbound event, or `None` once the transport is gone.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Fire-and-forget: there is no acknowledgement from the remote side.
    pub async fn emit_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| Error::signaling("signaling channel closed"))
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_uses_camel_case_tags() {
        let msg = SignalMessage::PeerJoined {
            id: PeerId::new("abc"),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "peerJoined", "id": "abc"})
        );

        let parsed: SignalMessage =
            serde_json::from_value(json!({"type": "introduction", "ids": ["a", "b"]})).unwrap();
        assert_eq!(
            parsed,
            SignalMessage::Introduction {
                ids: vec![PeerId::new("a"), PeerId::new("b")]
            }
        );
    }

    #[test]
    fn signal_payload_is_carried_verbatim() {
        let payload = json!({"type": "offer", "sdp": "v=0\r\n", "extra": [1, 2, 3]});
        let text = json!({"type": "signal", "to": "me", "from": "them", "payload": payload})
            .to_string();
        let parsed: SignalMessage = serde_json::from_str(&text).unwrap();
        let Some(ChannelEvent::Signal(envelope)) = ChannelEvent::from_message(parsed) else {
            panic!("expected a signal event");
        };
        assert_eq!(envelope.to, PeerId::new("me"));
        assert_eq!(envelope.from, PeerId::new("them"));
        assert_eq!(envelope.payload.as_value(), &payload);
    }

    #[test]
    fn welcome_and_error_do_not_become_events() {
        assert!(ChannelEvent::from_message(SignalMessage::Welcome {
            id: PeerId::new("x")
        })
        .is_none());
        assert!(ChannelEvent::from_message(SignalMessage::Error {
            message: "nope".into()
        })
        .is_none());
    }

    #[tokio::test]
    async fn from_parts_routes_events_and_signals() {
        let (event_tx, event_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let mut channel = SignalingChannel::from_parts(PeerId::new("me"), event_rx, out_tx);
        assert_eq!(channel.local_id(), &PeerId::new("me"));

        event_tx
            .send(ChannelEvent::PeerJoined(PeerId::new("p2")))
            .await
            .unwrap();
        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::PeerJoined(PeerId::new("p2")))
        );

        let envelope = SignalEnvelope {
            to: PeerId::new("p2"),
            from: PeerId::new("me"),
            payload: SignalPayload::new(json!({"type": "offer"})),
        };
        channel.emit_signal(envelope.clone()).await.unwrap();
        assert_eq!(out_rx.recv().await, Some(envelope));

        drop(event_tx);
        assert_eq!(channel.next_event().await, None);
    }
}
