use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IceCandidate, SessionDescription};

pub mod mock;
pub mod webrtc;

/// Negotiation phase of the underlying engine. The engine is the source of
/// truth; the coordinator only mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        };
        write!(f, "{text}")
    }
}

/// Link-level state of the underlying engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    CandidateDiscovered(IceCandidate),
    RenegotiationNeeded,
    SignalingStateChanged(SignalingState),
    ConnectionStateChanged(ConnectionState),
}

/// Target for `set_local_description`: either a concrete description or a
/// rollback of the outstanding local offer.
#[derive(Debug, Clone)]
pub enum LocalDescription {
    Apply(SessionDescription),
    Rollback,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("{operation} is not valid in signaling state {state}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("timed out waiting for transport")]
    Timeout,
}

/// Contract the coordinator holds against the connection engine. Descriptions
/// and candidates pass through opaquely; the engine owns the actual session
/// establishment.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: LocalDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    /// Hand out the engine event feed. The receiver can be taken exactly once.
    fn events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
