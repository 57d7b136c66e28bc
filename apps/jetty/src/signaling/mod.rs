use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{Instant, sleep_until};

use crate::protocol::SignalEnvelope;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// The path that physically carries offer/answer/candidate envelopes between
/// the two peers. Delivery is per-envelope; nothing is assumed about relative
/// latency between the two directions.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;

    async fn recv(&self) -> Option<SignalEnvelope>;
}

/// One endpoint of an in-process signaling link with simulated latency.
/// Envelopes cross the link as JSON text, the same way a networked backend
/// would carry them; each one is delivered a fixed delay after it was sent,
/// FIFO per direction.
pub struct LocalSignalingLink {
    tx: mpsc::UnboundedSender<(Instant, String)>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    latency: Duration,
    _forwarders: Vec<tokio::task::JoinHandle<()>>,
}

impl LocalSignalingLink {
    /// Create a pair of connected endpoints. Must be called inside a tokio
    /// runtime; each direction runs its own delivery task.
    pub fn pair(latency: Duration) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_raw_rx) = mpsc::unbounded_channel();
        let (b_tx, b_raw_rx) = mpsc::unbounded_channel();
        let (a_deliver_tx, a_deliver_rx) = mpsc::unbounded_channel();
        let (b_deliver_tx, b_deliver_rx) = mpsc::unbounded_channel();

        // a_tx feeds b's inbox and vice versa.
        let forward_to_b = tokio::spawn(forward(a_raw_rx, b_deliver_tx));
        let forward_to_a = tokio::spawn(forward(b_raw_rx, a_deliver_tx));

        let a = Arc::new(Self {
            tx: a_tx,
            rx: AsyncMutex::new(a_deliver_rx),
            latency,
            _forwarders: vec![forward_to_b],
        });
        let b = Arc::new(Self {
            tx: b_tx,
            rx: AsyncMutex::new(b_deliver_rx),
            latency,
            _forwarders: vec![forward_to_a],
        });
        (a, b)
    }
}

async fn forward(
    mut raw_rx: mpsc::UnboundedReceiver<(Instant, String)>,
    deliver_tx: mpsc::UnboundedSender<String>,
) {
    while let Some((deliver_at, text)) = raw_rx.recv().await {
        sleep_until(deliver_at).await;
        if deliver_tx.send(text).is_err() {
            break;
        }
    }
}

#[async_trait]
impl SignalingChannel for LocalSignalingLink {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let text = serde_json::to_string(&envelope)
            .map_err(|err| SignalingError::Encode(err.to_string()))?;
        let deliver_at = Instant::now() + self.latency;
        self.tx
            .send((deliver_at, text))
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn recv(&self) -> Option<SignalEnvelope> {
        let mut rx = self.rx.lock().await;
        loop {
            let text = rx.recv().await?;
            match serde_json::from_str::<SignalEnvelope>(&text) {
                Ok(envelope) => return Some(envelope),
                Err(err) => {
                    tracing::warn!(
                        target = "signaling",
                        error = %err,
                        "dropping undecodable signaling payload"
                    );
                }
            }
        }
    }
}
