//! Negotiation payloads exchanged between two WebRTC peers.
//!
//! The shape follows the JSON produced by browser peer libraries, so a
//! native client can sit in the same room as a web one:
//! `{"type":"offer","sdp":"..."}`, `{"type":"candidate","candidate":{...}}`.

use huddle_common::{Error, Result};
use huddle_core::SignalPayload;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RtcSignal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
    /// Sent by the responder when it needs a fresh offer, since only the
    /// initiator ever offers.
    Renegotiate,
}

impl RtcSignal {
    pub fn from_payload(payload: &SignalPayload) -> Result<Self> {
        serde_json::from_value(payload.as_value().clone())
            .map_err(|e| Error::protocol(format!("unrecognised negotiation payload: {e}")))
    }

    pub fn into_payload(self) -> Result<SignalPayload> {
        Ok(SignalPayload::new(serde_json::to_value(self)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RtcSignal::Offer { .. } => "offer",
            RtcSignal::Answer { .. } => "answer",
            RtcSignal::Candidate { .. } => "candidate",
            RtcSignal::Renegotiate => "renegotiate",
        }
    }
}
