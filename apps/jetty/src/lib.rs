pub mod chat;
pub mod negotiation;
pub mod protocol;
pub mod signaling;
pub mod transport;
