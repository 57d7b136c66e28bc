use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// A session description produced by the transport engine. The body is opaque
/// to everything except the engine itself; only the kind tag is inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled network candidate. Opaque payload, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

/// Envelope carried by the signaling link between the two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalEnvelope {
    Offer {
        description: SessionDescription,
        handshake_id: String,
    },
    Answer {
        description: SessionDescription,
        handshake_id: String,
    },
    Candidate {
        candidate: IceCandidate,
        handshake_id: String,
    },
}

impl SignalEnvelope {
    pub fn kind_str(&self) -> &'static str {
        match self {
            SignalEnvelope::Offer { .. } => "offer",
            SignalEnvelope::Answer { .. } => "answer",
            SignalEnvelope::Candidate { .. } => "candidate",
        }
    }

    pub fn handshake_id(&self) -> &str {
        match self {
            SignalEnvelope::Offer { handshake_id, .. }
            | SignalEnvelope::Answer { handshake_id, .. }
            | SignalEnvelope::Candidate { handshake_id, .. } => handshake_id,
        }
    }
}
