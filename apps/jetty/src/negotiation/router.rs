use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Session;
use crate::protocol::SignalEnvelope;
use crate::signaling::SignalingChannel;
use crate::transport::{Transport, TransportError, TransportEvent};

/// Pumps the two inbound feeds of a session: envelopes arriving from the
/// signaling link, and events emitted by the transport engine. Pure dispatch;
/// every decision lives in the session itself.
pub struct SessionDriver {
    session: Arc<Session>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionDriver {
    pub fn spawn(session: Arc<Session>) -> Result<Self, TransportError> {
        let events = session.transport().events()?;
        let inbound = tokio::spawn(inbound_loop(Arc::clone(&session)));
        let engine = tokio::spawn(event_loop(Arc::clone(&session), events));
        Ok(Self {
            session,
            tasks: vec![inbound, engine],
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn inbound_loop(session: Arc<Session>) {
    while let Some(envelope) = session.signaling().recv().await {
        tracing::trace!(
            target = "negotiation",
            session = %session.label(),
            kind = envelope.kind_str(),
            handshake_id = envelope.handshake_id(),
            "inbound envelope"
        );
        match envelope {
            SignalEnvelope::Offer { description, .. } => {
                match session.handle_offer(description).await {
                    Ok(outcome) => {
                        tracing::debug!(
                            target = "negotiation",
                            session = %session.label(),
                            ?outcome,
                            "handled inbound offer"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "negotiation",
                            session = %session.label(),
                            error = %err,
                            "inbound offer failed; session stays usable"
                        );
                    }
                }
            }
            SignalEnvelope::Answer { description, .. } => {
                match session.handle_answer(description).await {
                    Ok(outcome) => {
                        tracing::debug!(
                            target = "negotiation",
                            session = %session.label(),
                            ?outcome,
                            "handled inbound answer"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "negotiation",
                            session = %session.label(),
                            error = %err,
                            "inbound answer failed; session stays usable"
                        );
                    }
                }
            }
            SignalEnvelope::Candidate { candidate, .. } => {
                session.handle_candidate(candidate).await;
            }
        }
    }
    tracing::debug!(
        target = "negotiation",
        session = %session.label(),
        "signaling feed ended"
    );
}

async fn event_loop(session: Arc<Session>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::CandidateDiscovered(candidate) => {
                session.publish_candidate(candidate).await;
            }
            TransportEvent::RenegotiationNeeded => {
                if let Err(err) = session.negotiate().await {
                    tracing::warn!(
                        target = "negotiation",
                        session = %session.label(),
                        error = %err,
                        "renegotiation attempt failed"
                    );
                }
            }
            TransportEvent::SignalingStateChanged(state) => {
                tracing::trace!(
                    target = "negotiation",
                    session = %session.label(),
                    state = %state,
                    "signaling state changed"
                );
                session.note_signaling_state(state);
            }
            TransportEvent::ConnectionStateChanged(state) => {
                tracing::info!(
                    target = "negotiation",
                    session = %session.label(),
                    state = %state,
                    "connection state changed"
                );
                session.note_connection_state(state);
            }
        }
    }
    tracing::debug!(
        target = "negotiation",
        session = %session.label(),
        "transport event feed ended"
    );
}
