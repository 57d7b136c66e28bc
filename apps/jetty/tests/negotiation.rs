use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use jetty::negotiation::{Session, router::SessionDriver};
use jetty::protocol::IceCandidate;
use jetty::signaling::LocalSignalingLink;
use jetty::transport::mock::MockTransport;
use jetty::transport::{ConnectionState, SignalingState, Transport};

const LINK_DELAY: Duration = Duration::from_millis(50);
const GLARE_APPLY_DELAY: Duration = Duration::from_millis(300);

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.2 5000 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

struct Peer {
    engine: Arc<MockTransport>,
    session: Arc<Session>,
    _driver: SessionDriver,
}

fn peer_pair(impolite_apply_delay: Duration) -> (Peer, Peer) {
    let engine_a = MockTransport::with_apply_latency("a", impolite_apply_delay);
    let engine_b = MockTransport::new("b");
    let (link_a, link_b) = LocalSignalingLink::pair(LINK_DELAY);

    let session_a = Session::new("a", engine_a.clone() as Arc<dyn Transport>, link_a);
    let session_b = Session::new("b", engine_b.clone() as Arc<dyn Transport>, link_b);
    let driver_a = SessionDriver::spawn(Arc::clone(&session_a)).expect("driver a");
    let driver_b = SessionDriver::spawn(Arc::clone(&session_b)).expect("driver b");

    (
        Peer {
            engine: engine_a,
            session: session_a,
            _driver: driver_a,
        },
        Peer {
            engine: engine_b,
            session: session_b,
            _driver: driver_b,
        },
    )
}

async fn wait_connected(peer: &Peer, label: &str) {
    timeout(Duration::from_secs(10), async {
        while peer.session.connection_state() != ConnectionState::Connected {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("peer {label} never connected"));
}

async fn wait_candidate_count(engine: &MockTransport, count: usize) {
    timeout(Duration::from_secs(5), async {
        while engine.applied_candidates().len() < count {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("candidate was never applied");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_offerer_establishes_cleanly() {
    init_tracing();
    let (a, b) = peer_pair(Duration::ZERO);

    a.session.negotiate().await.expect("initial offer");

    wait_connected(&a, "a").await;
    wait_connected(&b, "b").await;

    assert_eq!(a.engine.signaling_state(), SignalingState::Stable);
    assert_eq!(b.engine.signaling_state(), SignalingState::Stable);
    assert!(!a.session.making_offer());
    assert!(!b.session.making_offer());

    // No message was ignored or discarded on either side.
    assert_eq!(a.session.stats().ignored_offers, 0);
    assert_eq!(b.session.stats().ignored_offers, 0);
    assert_eq!(a.session.stats().stale_answers, 0);
    assert_eq!(b.session.stats().stale_answers, 0);
    assert_eq!(a.session.stats().rollbacks, 0);
    assert_eq!(b.session.stats().rollbacks, 0);

    // Candidates trickle both ways once descriptions are in place.
    a.engine.discover_candidate(candidate(1));
    b.engine.discover_candidate(candidate(2));
    wait_candidate_count(&b.engine, 1).await;
    wait_candidate_count(&a.engine, 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn simultaneous_offers_resolve_with_one_rollback_and_one_ignore() {
    init_tracing();
    // Peer a's engine applies descriptions slowly, so the colliding offer
    // lands inside a's offer window: a rolls back, b ignores.
    let (a, b) = peer_pair(GLARE_APPLY_DELAY);

    let (first, second) = tokio::join!(a.session.negotiate(), b.session.negotiate());
    first.expect("a offer");
    second.expect("b offer");

    wait_connected(&a, "a").await;
    wait_connected(&b, "b").await;

    assert_eq!(a.engine.signaling_state(), SignalingState::Stable);
    assert_eq!(b.engine.signaling_state(), SignalingState::Stable);

    let stats_a = a.session.stats();
    let stats_b = b.session.stats();
    // Exactly one side rolled back and exactly one offer was ignored; never
    // both, never neither.
    assert_eq!(stats_a.rollbacks, 1, "impolite side rolls back once");
    assert_eq!(stats_b.rollbacks, 0);
    assert_eq!(stats_b.ignored_offers, 1, "polite side ignores once");
    assert_eq!(stats_a.ignored_offers, 0);

    assert!(!a.session.making_offer());
    assert!(!b.session.making_offer());
}

#[tokio::test(flavor = "multi_thread")]
async fn candidate_for_ignored_offer_never_reaches_the_engine() {
    init_tracing();
    let (a, b) = peer_pair(GLARE_APPLY_DELAY);

    let (first, second) = tokio::join!(a.session.negotiate(), b.session.negotiate());
    first.expect("a offer");
    second.expect("b offer");
    wait_connected(&a, "a").await;
    wait_connected(&b, "b").await;

    // b ignored a's offer and is still gating its candidates.
    assert!(b.session.ignore_offer());
    let baseline = b.engine.applied_candidates().len();

    a.engine.discover_candidate(candidate(7));
    sleep(4 * LINK_DELAY).await;

    assert_eq!(b.engine.applied_candidates().len(), baseline);
    assert!(b.session.stats().dropped_candidates >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn gated_candidate_applies_for_a_subsequent_valid_offer() {
    init_tracing();
    let (a, b) = peer_pair(GLARE_APPLY_DELAY);

    let (first, second) = tokio::join!(a.session.negotiate(), b.session.negotiate());
    first.expect("a offer");
    second.expect("b offer");
    wait_connected(&a, "a").await;
    wait_connected(&b, "b").await;
    assert!(b.session.ignore_offer());

    // Dropped while the gate is closed.
    a.engine.discover_candidate(candidate(9));
    sleep(4 * LINK_DELAY).await;
    let baseline = b.engine.applied_candidates().len();
    assert_eq!(baseline, 0);

    // A fresh, uncontested offer from a reopens the gate at b.
    a.session.negotiate().await.expect("renegotiate");
    timeout(Duration::from_secs(5), async {
        while b.session.ignore_offer() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("gate never reopened");

    // The same candidate goes through now.
    a.engine.discover_candidate(candidate(9));
    wait_candidate_count(&b.engine, baseline + 1).await;
    assert_eq!(b.session.stats().dropped_candidates, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_session_connects_on_a_fresh_transport() {
    init_tracing();
    let (a, b) = peer_pair(Duration::ZERO);

    a.session.negotiate().await.expect("initial offer");
    wait_connected(&a, "a").await;
    wait_connected(&b, "b").await;

    a.session.close().await.expect("close a");
    b.session.close().await.expect("close b");
    assert_eq!(a.engine.signaling_state(), SignalingState::Closed);
    assert_eq!(b.engine.signaling_state(), SignalingState::Closed);

    // Restart binds fresh transports to fresh sessions; the old ones stay
    // closed for good.
    let (a, b) = peer_pair(Duration::ZERO);
    a.session.negotiate().await.expect("offer after restart");
    wait_connected(&a, "a restarted").await;
    wait_connected(&b, "b restarted").await;
    assert!(!a.session.making_offer());
    assert!(!b.session.making_offer());
    assert_eq!(a.session.stats().ignored_offers, 0);
    assert_eq!(b.session.stats().ignored_offers, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn renegotiation_request_from_the_engine_triggers_an_offer() {
    init_tracing();
    let (a, b) = peer_pair(Duration::ZERO);

    a.engine.request_renegotiation();

    wait_connected(&a, "a").await;
    wait_connected(&b, "b").await;
    assert_eq!(a.engine.signaling_state(), SignalingState::Stable);
    assert_eq!(b.engine.signaling_state(), SignalingState::Stable);
}
