use async_trait::async_trait;

use crate::routing::Destination;
use crate::CourierResult;

/// Broker abstraction used by publishers and consumers.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish `body` to `destination`. Returns once the broker has accepted
    /// the message; a rejected or unconfirmed publish is `BrokerUnavailable`.
    async fn publish(&self, destination: &Destination, body: &[u8], priority: i32) -> CourierResult<()>;

    /// Consume from `destinations` with at most `prefetch` unacknowledged
    /// messages across all of them.
    async fn subscribe(
        &self,
        destinations: &[Destination],
        prefetch: u16,
    ) -> CourierResult<Box<dyn Subscription>>;

    /// Re-establish a lost connection. A no-op while the current connection
    /// is healthy, so callers sharing one broker never tear down each
    /// other's subscriptions.
    async fn reconnect(&self) -> CourierResult<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> CourierResult<()>;
}

/// Stream of deliveries from one subscription.
#[async_trait]
pub trait Subscription: Send {
    /// `None` when the subscription ended, usually because the connection dropped.
    async fn next(&mut self) -> Option<CourierResult<Delivery>>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> CourierResult<()>;
}

/// One message checked out from the broker.
pub struct Delivery {
    pub source: Destination,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(source: Destination, body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            source,
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledge and release the message. Consumes the delivery so it can
    /// only be settled once.
    pub async fn ack(self) -> CourierResult<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("source", &self.source)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
