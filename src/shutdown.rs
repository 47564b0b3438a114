use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Fans a single shutdown signal out to every long-running component.
#[derive(Clone)]
pub struct ShutdownManager {
    /// `None` once shutdown has been triggered.
    sender: Arc<RwLock<Option<broadcast::Sender<()>>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
        }
    }

    /// A receiver that fires once shutdown is triggered. Subscribing after the
    /// fact yields a receiver that fires immediately.
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        match self.sender.read().await.as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                let _ = sender.send(());
                receiver
            }
        }
    }

    /// Trigger shutdown. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let Some(sender) = self.sender.write().await.take() else {
            debug!("shutdown already triggered");
            return;
        };
        debug!(subscribers = sender.receiver_count(), "sending shutdown signal");
        // No receivers is fine.
        let _ = sender.send(());
        info!("shutdown signal sent");
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
