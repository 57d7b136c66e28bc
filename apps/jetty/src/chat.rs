use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat channel is not open yet")]
    NotOpen,
    #[error("chat channel closed")]
    Closed,
}

/// Text exchange over the established peer link. Available once the transport
/// reports the link up; sending earlier is an error, not a panic.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    fn send_text(&self, text: &str) -> Result<(), ChatError>;

    async fn recv_text(&self) -> Option<String>;
}

/// In-memory chat pair for tests and the glare demo, where no real data
/// channel exists.
pub struct LocalChatLink {
    tx: mpsc::UnboundedSender<String>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
}

impl LocalChatLink {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            tx: b_tx,
            rx: AsyncMutex::new(a_rx),
        });
        let b = Arc::new(Self {
            tx: a_tx,
            rx: AsyncMutex::new(b_rx),
        });
        (a, b)
    }
}

#[async_trait]
impl ChatChannel for LocalChatLink {
    fn send_text(&self, text: &str) -> Result<(), ChatError> {
        self.tx
            .send(text.to_string())
            .map_err(|_| ChatError::Closed)
    }

    async fn recv_text(&self) -> Option<String> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}
