use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::{
    ConnectionState, LocalDescription, SignalingState, Transport, TransportError, TransportEvent,
};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// In-memory connection engine. Implements the same signaling-state machine a
/// real engine enforces (including rejecting out-of-order description applies)
/// so the coordinator can be exercised deterministically and offline.
pub struct MockTransport {
    label: String,
    state: Mutex<EngineState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    /// Simulated engine latency for description applies. The state transition
    /// commits first; the call stays in flight for the configured duration,
    /// which is the window concurrent handlers observe during glare.
    apply_latency: Duration,
}

struct EngineState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    sdp_seq: u64,
    fail_next_local_apply: bool,
    fail_next_remote_apply: bool,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            local: None,
            remote: None,
            applied_candidates: Vec::new(),
            sdp_seq: 0,
            fail_next_local_apply: false,
            fail_next_remote_apply: false,
        }
    }
}

impl MockTransport {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Self::with_apply_latency(label, Duration::ZERO)
    }

    pub fn with_apply_latency(label: impl Into<String>, apply_latency: Duration) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            state: Mutex::new(EngineState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            apply_latency,
        })
    }

    /// Simulate the engine discovering a local network candidate.
    pub fn discover_candidate(&self, candidate: IceCandidate) {
        let _ = self
            .events_tx
            .send(TransportEvent::CandidateDiscovered(candidate));
    }

    /// Simulate the engine asking for a fresh negotiation round.
    pub fn request_renegotiation(&self) {
        let _ = self.events_tx.send(TransportEvent::RenegotiationNeeded);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().applied_candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    /// Make the next local description apply (including rollback) fail.
    pub fn fail_next_local_apply(&self) {
        self.state.lock().unwrap().fail_next_local_apply = true;
    }

    /// Make the next remote description apply fail.
    pub fn fail_next_remote_apply(&self) {
        self.state.lock().unwrap().fail_next_remote_apply = true;
    }

    fn transition(&self, state: &mut EngineState, next: SignalingState) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if state.signaling != next {
            state.signaling = next;
            events.push(TransportEvent::SignalingStateChanged(next));
        }
        // Both descriptions applied and the exchange settled: the link is up.
        if next == SignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some()
            && state.connection != ConnectionState::Connected
        {
            state.connection = ConnectionState::Connected;
            events.push(TransportEvent::ConnectionStateChanged(
                ConnectionState::Connected,
            ));
        }
        events
    }

    fn emit(&self, events: Vec<TransportEvent>) {
        for event in events {
            let _ = self.events_tx.send(event);
        }
    }

    fn generated_sdp(&self, state: &mut EngineState, kind: SdpKind) -> String {
        state.sdp_seq += 1;
        format!("v=0 {} {} {}", self.label, kind, state.sdp_seq)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.signaling == SignalingState::Closed {
            return Err(TransportError::InvalidState {
                operation: "create_offer",
                state: SignalingState::Closed,
            });
        }
        let sdp = self.generated_sdp(&mut state, SdpKind::Offer);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::InvalidState {
                operation: "create_answer",
                state: state.signaling,
            });
        }
        let sdp = self.generated_sdp(&mut state, SdpKind::Answer);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(
        &self,
        description: LocalDescription,
    ) -> Result<(), TransportError> {
        let events = {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_local_apply {
                state.fail_next_local_apply = false;
                return Err(TransportError::Setup(
                    "simulated local description failure".into(),
                ));
            }
            let current = state.signaling;
            match description {
                LocalDescription::Apply(desc) => match desc.kind {
                    SdpKind::Offer
                        if matches!(
                            current,
                            SignalingState::Stable | SignalingState::HaveLocalOffer
                        ) =>
                    {
                        state.local = Some(desc);
                        self.transition(&mut state, SignalingState::HaveLocalOffer)
                    }
                    SdpKind::Answer if current == SignalingState::HaveRemoteOffer => {
                        state.local = Some(desc);
                        self.transition(&mut state, SignalingState::Stable)
                    }
                    _ => {
                        return Err(TransportError::InvalidState {
                            operation: "set_local_description",
                            state: current,
                        });
                    }
                },
                LocalDescription::Rollback => {
                    if current != SignalingState::HaveLocalOffer {
                        return Err(TransportError::InvalidState {
                            operation: "rollback",
                            state: current,
                        });
                    }
                    state.local = None;
                    self.transition(&mut state, SignalingState::Stable)
                }
            }
        };
        self.emit(events);
        if !self.apply_latency.is_zero() {
            sleep(self.apply_latency).await;
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let events = {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_remote_apply {
                state.fail_next_remote_apply = false;
                return Err(TransportError::Setup(
                    "simulated remote description failure".into(),
                ));
            }
            let current = state.signaling;
            match description.kind {
                SdpKind::Offer
                    if matches!(
                        current,
                        SignalingState::Stable | SignalingState::HaveRemoteOffer
                    ) =>
                {
                    state.remote = Some(description);
                    self.transition(&mut state, SignalingState::HaveRemoteOffer)
                }
                SdpKind::Answer if current == SignalingState::HaveLocalOffer => {
                    state.remote = Some(description);
                    self.transition(&mut state, SignalingState::Stable)
                }
                _ => {
                    return Err(TransportError::InvalidState {
                        operation: "set_remote_description",
                        state: current,
                    });
                }
            }
        };
        self.emit(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(TransportError::Setup(
                "remote description not set; cannot attach candidate".into(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Setup("event stream already taken".into()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let events = {
            let mut state = self.state.lock().unwrap();
            let mut events = self.transition(&mut state, SignalingState::Closed);
            if state.connection != ConnectionState::Closed {
                state.connection = ConnectionState::Closed;
                events.push(TransportEvent::ConnectionStateChanged(
                    ConnectionState::Closed,
                ));
            }
            events
        };
        self.emit(events);
        Ok(())
    }
}
