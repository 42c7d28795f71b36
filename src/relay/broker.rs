use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

pub type PayloadStream = BoxStream<'static, Result<String, BrokerError>>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("broker publish failed: {0}")]
    Publish(String),
    #[error("broker subscription failed: {0}")]
    Subscribe(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// The external publish/subscribe transport shared by all nodes.
///
/// Delivery is assumed at-least-once and unordered; callers must not rely on
/// anything stronger.
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    fn publish(&self, payload: String) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Open a new subscription. Each call yields an independent stream.
    fn subscribe(&self) -> BoxFuture<'_, Result<PayloadStream, BrokerError>>;
}

/// In-process broker backed by a tokio broadcast channel.
///
/// Every clone shares the same channel, so several nodes living in one
/// process can talk through it.
#[derive(Clone)]
pub struct MemoryBroker {
    tx: broadcast::Sender<String>,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn publish(&self, payload: String) -> BoxFuture<'_, Result<(), BrokerError>> {
        // No subscribers means nobody to deliver to, which is not a failure
        let _ = self.tx.send(payload);
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<PayloadStream, BrokerError>> {
        let rx = self.tx.subscribe();
        Box::pin(async move {
            let stream = stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((Ok(payload), rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Memory broker subscriber lagged, {} payloads lost", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        })
    }
}
