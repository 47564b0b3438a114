use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_core::routing::Destination;
use courier_core::traits::{Acknowledger, Delivery, MessageBroker, Subscription};
use courier_core::{CourierError, CourierResult};
use futures::future::{select_all, BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// In-process broker built on tokio channels.
///
/// Mirrors the semantics the rest of the system relies on: FIFO per queue,
/// competing consumers on shared queues, one delivery per `next()` call, and
/// ephemeral queues that only exist while subscribed.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    queues: Mutex<HashMap<Destination, QueueChannels>>,
    available: AtomicBool,
    /// Bumped on every simulated disconnect; live subscriptions end.
    epoch: watch::Sender<u64>,
    published: AtomicU64,
    acked: AtomicU64,
}

impl Default for Inner {
    fn default() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            queues: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            epoch,
            published: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        }
    }
}

#[derive(Clone)]
struct QueueChannels {
    sender: mpsc::UnboundedSender<QueuedMessage>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedMessage>>>,
    pending: Arc<AtomicUsize>,
}

impl QueueChannels {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct QueuedMessage {
    body: Vec<u8>,
    redelivered: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the connection: publishes fail and every live
    /// subscription ends until [`MessageBroker::reconnect`] is called.
    pub fn disconnect(&self) {
        info!("in-memory broker disconnected");
        self.inner.available.store(false, Ordering::SeqCst);
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Put a message back on a queue flagged as redelivered, as the broker
    /// does when a consumer dies before acknowledging.
    pub fn redeliver(&self, destination: &Destination, body: &[u8]) -> CourierResult<()> {
        self.enqueue(destination, body.to_vec(), true)
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> u64 {
        self.inner.acked.load(Ordering::SeqCst)
    }

    /// Messages waiting on a queue, not counting one checked out by a consumer.
    pub fn queue_len(&self, destination: &Destination) -> usize {
        self.lock_queues()
            .get(destination)
            .map(|q| q.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<Destination, QueueChannels>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self, destination: &Destination) -> QueueChannels {
        self.lock_queues()
            .entry(destination.clone())
            .or_insert_with(QueueChannels::new)
            .clone()
    }

    fn enqueue(&self, destination: &Destination, body: Vec<u8>, redelivered: bool) -> CourierResult<()> {
        let queue = if destination.is_ephemeral() {
            match self.lock_queues().get(destination) {
                Some(queue) => queue.clone(),
                None => {
                    debug!(%destination, "no consumer for ephemeral queue, message dropped");
                    return Ok(());
                }
            }
        } else {
            self.queue(destination)
        };

        queue
            .sender
            .send(QueuedMessage { body, redelivered })
            .map_err(|_| CourierError::BrokerUnavailable(format!("queue {destination} is closed")))?;
        queue.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, destination: &Destination, body: &[u8], _priority: i32) -> CourierResult<()> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(CourierError::BrokerUnavailable("in-memory broker is disconnected".into()));
        }
        self.enqueue(destination, body.to_vec(), false)?;
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        debug!(%destination, "message published");
        Ok(())
    }

    async fn subscribe(&self, destinations: &[Destination], _prefetch: u16) -> CourierResult<Box<dyn Subscription>> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(CourierError::BrokerUnavailable("in-memory broker is disconnected".into()));
        }
        if destinations.is_empty() {
            return Err(CourierError::Internal("subscription without destinations".into()));
        }

        let queues = destinations
            .iter()
            .map(|destination| (destination.clone(), self.queue(destination)))
            .collect();

        Ok(Box::new(InMemorySubscription {
            broker: self.clone(),
            queues,
            epoch: self.inner.epoch.subscribe(),
        }))
    }

    async fn reconnect(&self) -> CourierResult<()> {
        self.inner.available.store(true, Ordering::SeqCst);
        info!("in-memory broker reconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    async fn close(&self) -> CourierResult<()> {
        self.disconnect();
        Ok(())
    }
}

struct InMemorySubscription {
    broker: InMemoryBroker,
    queues: Vec<(Destination, QueueChannels)>,
    epoch: watch::Receiver<u64>,
}

impl InMemorySubscription {
    fn receive(destination: Destination, queue: QueueChannels) -> BoxFuture<'static, Option<(Destination, QueuedMessage)>> {
        async move {
            let mut receiver = queue.receiver.lock().await;
            let message = receiver.recv().await?;
            queue.pending.fetch_sub(1, Ordering::SeqCst);
            Some((destination, message))
        }
        .boxed()
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<CourierResult<Delivery>> {
        let receivers = self
            .queues
            .iter()
            .map(|(destination, queue)| Self::receive(destination.clone(), queue.clone()));

        tokio::select! {
            _ = self.epoch.changed() => None,
            (received, _, _) = select_all(receivers) => {
                let (source, message) = received?;
                let acker = InMemoryAcker {
                    inner: Arc::clone(&self.broker.inner),
                };
                Some(Ok(Delivery::new(source, message.body, message.redelivered, Box::new(acker))))
            }
        }
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        let mut queues = self.broker.lock_queues();
        for (destination, _) in &self.queues {
            if destination.is_ephemeral() {
                queues.remove(destination);
            }
        }
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> CourierResult<()> {
        self.inner.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
