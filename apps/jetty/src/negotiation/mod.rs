use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{IceCandidate, SdpKind, SessionDescription, SignalEnvelope};
use crate::signaling::{SignalingChannel, SignalingError};
use crate::transport::{
    ConnectionState, LocalDescription, SignalingState, Transport, TransportError,
};

pub mod router;

/// Decision taken for one inbound session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Applied,
    AppliedWithRollback,
    /// Glare resolution: the offer was discarded on purpose. Not a failure.
    Ignored,
    /// The message arrived in a state window where it no longer applies.
    DiscardedStale,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("transport rejected {context}: {source}")]
    DescriptionApply {
        context: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("failed to publish {context}: {source}")]
    Publish {
        context: &'static str,
        #[source]
        source: SignalingError,
    },
}

#[derive(Debug, Default)]
struct Flags {
    /// True only between starting local offer creation and that offer's
    /// description being set locally. Concurrently-arriving inbound handlers
    /// read it to detect collisions, so the reset must be unconditional.
    making_offer: bool,
    /// Set while an incoming offer is being ignored; gates candidates that
    /// belong to the discarded offer.
    ignore_offer: bool,
    /// Covers the whole negotiate() span including publish, so a second
    /// trigger coalesces instead of queueing.
    negotiating: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub ignored_offers: u64,
    pub stale_answers: u64,
    pub dropped_candidates: u64,
    pub rollbacks: u64,
}

/// One negotiating endpoint: wraps a single transport session and decides, for
/// every inbound or outbound description and candidate, whether to apply it,
/// ignore it, or roll back. All role state lives here, per session, never
/// process-wide.
pub struct Session {
    label: String,
    handshake_id: String,
    transport: Arc<dyn Transport>,
    signaling: Arc<dyn SignalingChannel>,
    flags: Mutex<Flags>,
    stats: Mutex<SessionStats>,
    observed_signaling: Mutex<SignalingState>,
    observed_connection: Mutex<ConnectionState>,
}

impl Session {
    pub fn new(
        label: impl Into<String>,
        transport: Arc<dyn Transport>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            handshake_id: Uuid::new_v4().to_string(),
            transport,
            signaling,
            flags: Mutex::new(Flags::default()),
            stats: Mutex::new(SessionStats::default()),
            observed_signaling: Mutex::new(SignalingState::Stable),
            observed_connection: Mutex::new(ConnectionState::New),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn handshake_id(&self) -> &str {
        &self.handshake_id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn signaling(&self) -> &Arc<dyn SignalingChannel> {
        &self.signaling
    }

    pub fn making_offer(&self) -> bool {
        self.flags.lock().unwrap().making_offer
    }

    pub fn ignore_offer(&self) -> bool {
        self.flags.lock().unwrap().ignore_offer
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock().unwrap()
    }

    /// Last link state reported by the transport event feed.
    pub fn connection_state(&self) -> ConnectionState {
        *self.observed_connection.lock().unwrap()
    }

    /// Last negotiation phase reported by the transport event feed.
    pub fn observed_signaling_state(&self) -> SignalingState {
        *self.observed_signaling.lock().unwrap()
    }

    pub(crate) fn note_signaling_state(&self, state: SignalingState) {
        *self.observed_signaling.lock().unwrap() = state;
    }

    pub(crate) fn note_connection_state(&self, state: ConnectionState) {
        *self.observed_connection.lock().unwrap() = state;
    }

    /// Start a negotiation round: create a local offer, apply it, publish it.
    /// Invoked at session start and whenever the transport reports that
    /// renegotiation is needed. A trigger that lands while a round is already
    /// in flight is coalesced; the transport will ask again if it still wants
    /// one.
    pub async fn negotiate(&self) -> Result<(), NegotiationError> {
        {
            let mut flags = self.flags.lock().unwrap();
            if flags.negotiating {
                tracing::debug!(
                    target = "negotiation",
                    session = %self.label,
                    "negotiation already in flight; coalescing trigger"
                );
                return Ok(());
            }
            let state = self.transport.signaling_state();
            if state != SignalingState::Stable {
                // A round is already outstanding at the engine level. The
                // transport asks again if it still wants one once settled.
                tracing::debug!(
                    target = "negotiation",
                    session = %self.label,
                    state = %state,
                    "skipping negotiate outside stable state"
                );
                return Ok(());
            }
            flags.negotiating = true;
            flags.making_offer = true;
        }

        let created = self.create_and_apply_offer().await;
        // The offer window closes once the local apply has resolved, success
        // or failure. Collision detection depends on this reset happening
        // unconditionally.
        self.flags.lock().unwrap().making_offer = false;

        let result = match created {
            Ok(offer) => {
                tracing::debug!(
                    target = "negotiation",
                    session = %self.label,
                    "publishing local offer"
                );
                self.publish(
                    SignalEnvelope::Offer {
                        description: offer,
                        handshake_id: self.handshake_id.clone(),
                    },
                    "offer",
                )
                .await
            }
            Err(err) => Err(err),
        };
        self.flags.lock().unwrap().negotiating = false;
        result
    }

    async fn create_and_apply_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .transport
            .create_offer()
            .await
            .map_err(|source| NegotiationError::DescriptionApply {
                context: "local offer",
                source,
            })?;
        self.transport
            .set_local_description(LocalDescription::Apply(offer.clone()))
            .await
            .map_err(|source| NegotiationError::DescriptionApply {
                context: "local offer",
                source,
            })?;
        Ok(offer)
    }

    /// Decide what to do with an inbound offer. The polite side of a glare
    /// (the one not currently making an offer of its own) discards; the side
    /// caught mid-offer rolls its own offer back and takes the remote one.
    pub async fn handle_offer(
        &self,
        description: SessionDescription,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        if description.kind != SdpKind::Offer {
            tracing::warn!(
                target = "negotiation",
                session = %self.label,
                kind = %description.kind,
                "offer handler received a non-offer description; discarding"
            );
            return Ok(NegotiationOutcome::DiscardedStale);
        }

        // Collision decision and flag update are one critical section; the
        // engine state is read inside it so no other handler can interleave.
        let (collision, ignore, state) = {
            let mut flags = self.flags.lock().unwrap();
            let state = self.transport.signaling_state();
            let collision = flags.making_offer || state != SignalingState::Stable;
            flags.ignore_offer = !flags.making_offer && collision;
            (collision, flags.ignore_offer, state)
        };

        if ignore {
            self.stats.lock().unwrap().ignored_offers += 1;
            tracing::debug!(
                target = "negotiation",
                session = %self.label,
                state = %state,
                "glare: ignoring remote offer against our outstanding one"
            );
            return Ok(NegotiationOutcome::Ignored);
        }

        if collision {
            // We are mid-offer: abandon ours, take theirs. Sequential on
            // purpose: a failed rollback leaves the engine untouched, and a
            // failure after it leaves us rolled back to stable with nothing
            // half-applied.
            self.transport
                .set_local_description(LocalDescription::Rollback)
                .await
                .map_err(|source| NegotiationError::DescriptionApply {
                    context: "rollback",
                    source,
                })?;
            self.transport
                .set_remote_description(description)
                .await
                .map_err(|source| NegotiationError::DescriptionApply {
                    context: "remote offer",
                    source,
                })?;
            self.stats.lock().unwrap().rollbacks += 1;
            tracing::info!(
                target = "negotiation",
                session = %self.label,
                "rolled back local offer in favor of the remote one"
            );
        } else {
            self.transport
                .set_remote_description(description)
                .await
                .map_err(|source| NegotiationError::DescriptionApply {
                    context: "remote offer",
                    source,
                })?;
        }

        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(|source| NegotiationError::DescriptionApply {
                context: "local answer",
                source,
            })?;
        self.transport
            .set_local_description(LocalDescription::Apply(answer.clone()))
            .await
            .map_err(|source| NegotiationError::DescriptionApply {
                context: "local answer",
                source,
            })?;
        self.publish(
            SignalEnvelope::Answer {
                description: answer,
                handshake_id: self.handshake_id.clone(),
            },
            "answer",
        )
        .await?;

        Ok(if collision {
            NegotiationOutcome::AppliedWithRollback
        } else {
            NegotiationOutcome::Applied
        })
    }

    /// Apply an inbound answer if we are still in a state that expects one;
    /// stale or duplicate answers are discarded with a warning.
    pub async fn handle_answer(
        &self,
        description: SessionDescription,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        if description.kind != SdpKind::Answer {
            tracing::warn!(
                target = "negotiation",
                session = %self.label,
                kind = %description.kind,
                "answer handler received a non-answer description; discarding"
            );
            return Ok(NegotiationOutcome::DiscardedStale);
        }

        let ready = {
            let flags = self.flags.lock().unwrap();
            let state = self.transport.signaling_state();
            !flags.making_offer
                && matches!(
                    state,
                    SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer
                )
        };
        if !ready {
            self.stats.lock().unwrap().stale_answers += 1;
            tracing::warn!(
                target = "negotiation",
                session = %self.label,
                state = %self.transport.signaling_state(),
                "not ready for an answer; discarding as stale"
            );
            return Ok(NegotiationOutcome::DiscardedStale);
        }

        self.transport
            .set_remote_description(description)
            .await
            .map_err(|source| NegotiationError::DescriptionApply {
                context: "remote answer",
                source,
            })?;
        Ok(NegotiationOutcome::Applied)
    }

    /// Apply an inbound candidate unless it belongs to an offer we chose to
    /// ignore. The gate re-checks `ignore_offer` at arrival time; it can have
    /// flipped since the candidate was sent. An apply failure is logged and
    /// swallowed: one bad candidate must not take the session down.
    pub async fn handle_candidate(&self, candidate: IceCandidate) {
        if self.flags.lock().unwrap().ignore_offer {
            self.stats.lock().unwrap().dropped_candidates += 1;
            tracing::trace!(
                target = "negotiation",
                session = %self.label,
                "dropping candidate for an ignored offer"
            );
            return;
        }
        if let Err(err) = self.transport.add_ice_candidate(candidate).await {
            tracing::warn!(
                target = "negotiation",
                session = %self.label,
                error = %err,
                "failed to apply remote candidate"
            );
        }
    }

    /// Forward a locally discovered candidate to the peer. Loss here is
    /// non-fatal; later candidates keep the exchange going.
    pub async fn publish_candidate(&self, candidate: IceCandidate) {
        let envelope = SignalEnvelope::Candidate {
            candidate,
            handshake_id: self.handshake_id.clone(),
        };
        if let Err(err) = self.signaling.send(envelope).await {
            tracing::warn!(
                target = "negotiation",
                session = %self.label,
                error = %err,
                "failed to publish local candidate"
            );
        }
    }

    /// Tear the session down. After this the transport is closed for good; a
    /// restart binds a fresh transport to a fresh session.
    pub async fn close(&self) -> Result<(), NegotiationError> {
        {
            let mut flags = self.flags.lock().unwrap();
            *flags = Flags::default();
        }
        self.note_connection_state(ConnectionState::Closed);
        self.note_signaling_state(SignalingState::Closed);
        self.transport
            .close()
            .await
            .map_err(|source| NegotiationError::DescriptionApply {
                context: "close",
                source,
            })
    }

    async fn publish(
        &self,
        envelope: SignalEnvelope,
        context: &'static str,
    ) -> Result<(), NegotiationError> {
        self.signaling
            .send(envelope)
            .await
            .map_err(|source| NegotiationError::Publish { context, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::LocalSignalingLink;
    use crate::transport::mock::MockTransport;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Signaling stub that records everything published through it.
    struct CaptureSignaling {
        sent: Mutex<Vec<SignalEnvelope>>,
    }

    impl CaptureSignaling {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<SignalEnvelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignalingChannel for CaptureSignaling {
        async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }

        async fn recv(&self) -> Option<SignalEnvelope> {
            None
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.2 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn negotiate_publishes_offer_and_resets_flag() {
        let transport = MockTransport::new("a");
        let signaling = CaptureSignaling::new();
        let session = Session::new("a", transport.clone(), signaling.clone());

        session.negotiate().await.expect("negotiate");

        assert!(!session.making_offer());
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);
        let sent = signaling.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalEnvelope::Offer { .. }));
    }

    #[tokio::test]
    async fn concurrent_negotiate_triggers_coalesce() {
        let transport = MockTransport::with_apply_latency("a", Duration::from_millis(80));
        let signaling = CaptureSignaling::new();
        let session = Session::new("a", transport, signaling.clone());

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.negotiate().await })
        };
        sleep(Duration::from_millis(20)).await;
        // The offer window is still open; this trigger must be a no-op.
        session.negotiate().await.expect("coalesced negotiate");

        first.await.expect("join").expect("first negotiate");
        assert_eq!(signaling.sent().len(), 1);
        assert!(!session.making_offer());
    }

    #[tokio::test]
    async fn offer_applied_directly_when_stable() {
        let transport = MockTransport::new("b");
        let signaling = CaptureSignaling::new();
        let session = Session::new("b", transport.clone(), signaling.clone());

        let outcome = session
            .handle_offer(SessionDescription::offer("v=0 a offer 1"))
            .await
            .expect("handle offer");

        assert_eq!(outcome, NegotiationOutcome::Applied);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        let sent = signaling.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], SignalEnvelope::Answer { .. }));
    }

    #[tokio::test]
    async fn offer_ignored_while_our_offer_is_outstanding() {
        let transport = MockTransport::new("b");
        let signaling = CaptureSignaling::new();
        let session = Session::new("b", transport.clone(), signaling.clone());

        session.negotiate().await.expect("negotiate");
        let outcome = session
            .handle_offer(SessionDescription::offer("v=0 a offer 1"))
            .await
            .expect("handle offer");

        assert_eq!(outcome, NegotiationOutcome::Ignored);
        assert!(session.ignore_offer());
        assert_eq!(session.stats().ignored_offers, 1);
        // Our local offer is untouched and no answer went out.
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(signaling.sent().len(), 1);
    }

    #[tokio::test]
    async fn offer_during_our_open_window_rolls_back() {
        let transport = MockTransport::with_apply_latency("a", Duration::from_millis(80));
        let signaling = CaptureSignaling::new();
        let session = Session::new("a", transport.clone(), signaling.clone());

        let negotiate = {
            let session = session.clone();
            tokio::spawn(async move { session.negotiate().await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(session.making_offer());

        let outcome = session
            .handle_offer(SessionDescription::offer("v=0 b offer 1"))
            .await
            .expect("handle offer");
        assert_eq!(outcome, NegotiationOutcome::AppliedWithRollback);
        assert_eq!(session.stats().rollbacks, 1);

        negotiate.await.expect("join").expect("negotiate");
        assert!(!session.making_offer());
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        // The rolled-back offer still went out; the peer is the one that
        // ignores it. An answer to the remote offer went out as well.
        let kinds: Vec<_> = signaling.sent().iter().map(|e| e.kind_str()).collect();
        assert!(kinds.contains(&"offer"));
        assert!(kinds.contains(&"answer"));
    }

    #[tokio::test]
    async fn failed_remote_apply_after_rollback_leaves_engine_consistent() {
        let transport = MockTransport::with_apply_latency("a", Duration::from_millis(80));
        let signaling = CaptureSignaling::new();
        let session = Session::new("a", transport.clone(), signaling.clone());

        let negotiate = {
            let session = session.clone();
            tokio::spawn(async move { session.negotiate().await })
        };
        sleep(Duration::from_millis(20)).await;
        transport.fail_next_remote_apply();

        let err = session
            .handle_offer(SessionDescription::offer("v=0 b offer 1"))
            .await
            .expect_err("remote apply must fail");
        assert!(matches!(
            err,
            NegotiationError::DescriptionApply {
                context: "remote offer",
                ..
            }
        ));
        // Rolled back to stable, nothing half-applied.
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        assert!(transport.local_description().is_none());
        assert!(transport.remote_description().is_none());

        negotiate.await.expect("join").expect("negotiate");
    }

    #[tokio::test]
    async fn duplicate_answer_is_discarded_stale() {
        let transport = MockTransport::new("a");
        let signaling = CaptureSignaling::new();
        let session = Session::new("a", transport.clone(), signaling.clone());

        session.negotiate().await.expect("negotiate");
        let answer = SessionDescription::answer("v=0 b answer 1");
        let outcome = session
            .handle_answer(answer.clone())
            .await
            .expect("first answer");
        assert_eq!(outcome, NegotiationOutcome::Applied);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);

        let outcome = session
            .handle_answer(answer)
            .await
            .expect("duplicate answer");
        assert_eq!(outcome, NegotiationOutcome::DiscardedStale);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        assert_eq!(session.stats().stale_answers, 1);
    }

    #[tokio::test]
    async fn candidates_are_gated_by_ignore_offer() {
        let transport = MockTransport::new("b");
        let signaling = CaptureSignaling::new();
        let session = Session::new("b", transport.clone(), signaling.clone());

        // Enter glare: our offer is outstanding, the remote one gets ignored.
        session.negotiate().await.expect("negotiate");
        let outcome = session
            .handle_offer(SessionDescription::offer("v=0 a offer 1"))
            .await
            .expect("handle offer");
        assert_eq!(outcome, NegotiationOutcome::Ignored);

        session.handle_candidate(candidate(1)).await;
        assert!(transport.applied_candidates().is_empty());
        assert_eq!(session.stats().dropped_candidates, 1);
    }

    #[tokio::test]
    async fn candidate_apply_failure_is_swallowed() {
        let transport = MockTransport::new("a");
        let signaling = CaptureSignaling::new();
        let session = Session::new("a", transport.clone(), signaling);

        // No remote description: the engine rejects the candidate, the
        // session logs and carries on.
        session.handle_candidate(candidate(1)).await;
        assert!(transport.applied_candidates().is_empty());
        assert_eq!(session.stats().dropped_candidates, 0);
    }

    #[tokio::test]
    async fn negotiate_failure_still_resets_flags() {
        let transport = MockTransport::new("a");
        let signaling = CaptureSignaling::new();
        let session = Session::new("a", transport.clone(), signaling.clone());

        transport.fail_next_local_apply();
        let err = session.negotiate().await.expect_err("apply must fail");
        assert!(matches!(
            err,
            NegotiationError::DescriptionApply {
                context: "local offer",
                ..
            }
        ));
        assert!(!session.making_offer());
        assert!(signaling.sent().is_empty());

        // The session stays usable for the next round.
        session.negotiate().await.expect("second negotiate");
        assert_eq!(signaling.sent().len(), 1);
    }

    #[tokio::test]
    async fn close_resets_role_flags() {
        let transport = MockTransport::new("a");
        let (link, _peer) = LocalSignalingLink::pair(Duration::ZERO);
        let session = Session::new("a", transport.clone(), link);

        session.negotiate().await.expect("negotiate");
        session
            .handle_offer(SessionDescription::offer("v=0 b offer 1"))
            .await
            .expect("handle offer");
        assert!(session.ignore_offer());

        session.close().await.expect("close");
        assert!(!session.ignore_offer());
        assert!(!session.making_offer());
        assert_eq!(transport.signaling_state(), SignalingState::Closed);
    }
}
