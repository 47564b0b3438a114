use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::config::BrokerConfig;
use courier_core::routing::{Destination, ExchangeClass};
use courier_core::traits::{Acknowledger, Delivery, MessageBroker, Subscription};
use courier_core::{CourierError, CourierResult};
use futures::stream::{self, BoxStream, StreamExt};
use lapin::{
    acker::Acker, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};

const EXCHANGE_CLASSES: [ExchangeClass; 4] = [
    ExchangeClass::AnyWorker,
    ExchangeClass::SpecificWorker,
    ExchangeClass::WorkerCommands,
    ExchangeClass::Scheduler,
];

fn broker_error(context: &str, e: lapin::Error) -> CourierError {
    CourierError::BrokerUnavailable(format!("{context}: {e}"))
}

struct Connected {
    connection: Connection,
    /// Confirm-mode channel used for every publish.
    publish_channel: Channel,
}

/// RabbitMQ broker.
///
/// One direct exchange per routing class. Durable task queues are declared
/// on first publish so work addressed to a worker that has not started yet
/// is kept; command and scheduler queues are exclusive and auto-deleting.
pub struct RabbitMqBroker {
    config: BrokerConfig,
    state: RwLock<Option<Arc<Connected>>>,
    declared: Mutex<HashSet<Destination>>,
}

impl RabbitMqBroker {
    pub async fn connect(config: BrokerConfig) -> CourierResult<Self> {
        let connected = Self::open(&config).await?;
        Ok(Self {
            config,
            state: RwLock::new(Some(Arc::new(connected))),
            declared: Mutex::new(HashSet::new()),
        })
    }

    async fn open(config: &BrokerConfig) -> CourierResult<Connected> {
        let timeout = Duration::from_secs(config.connection_timeout_seconds);
        let connection = tokio::time::timeout(
            timeout,
            Connection::connect(&config.url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| CourierError::BrokerUnavailable(format!("connecting to RabbitMQ timed out after {timeout:?}")))?
        .map_err(|e| broker_error("failed to connect to RabbitMQ", e))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| broker_error("failed to create channel", e))?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| broker_error("failed to enable publisher confirms", e))?;

        for class in EXCHANGE_CLASSES {
            let name = Self::exchange_name_for(&config.exchange_prefix, class);
            publish_channel
                .exchange_declare(
                    &name,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| broker_error(&format!("failed to declare exchange {name}"), e))?;
        }

        info!(prefix = %config.exchange_prefix, "connected to RabbitMQ");
        Ok(Connected {
            connection,
            publish_channel,
        })
    }

    fn exchange_name_for(prefix: &str, class: ExchangeClass) -> String {
        format!("{prefix}.{}", class.as_str())
    }

    pub fn exchange_name(&self, class: ExchangeClass) -> String {
        Self::exchange_name_for(&self.config.exchange_prefix, class)
    }

    pub fn queue_name(&self, destination: &Destination) -> String {
        format!("{}.{}", self.config.exchange_prefix, destination.queue_name())
    }

    fn current(&self) -> CourierResult<Arc<Connected>> {
        let state = self
            .state
            .read()
            .map_err(|_| CourierError::Internal("broker state lock poisoned".into()))?;
        match state.as_ref() {
            Some(connected) if connected.connection.status().connected() => Ok(Arc::clone(connected)),
            _ => Err(CourierError::BrokerUnavailable("not connected to RabbitMQ".into())),
        }
    }

    async fn declare_queue(&self, channel: &Channel, destination: &Destination) -> CourierResult<String> {
        let queue = self.queue_name(destination);
        let ephemeral = destination.is_ephemeral();
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: !ephemeral,
                    exclusive: ephemeral,
                    auto_delete: ephemeral,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error(&format!("failed to declare queue {queue}"), e))?;

        let exchange = self.exchange_name(destination.exchange_class());
        channel
            .queue_bind(
                &queue,
                &exchange,
                destination.routing_key(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error(&format!("failed to bind queue {queue}"), e))?;

        debug!(%queue, %exchange, routing_key = destination.routing_key(), "queue declared");
        Ok(queue)
    }

    fn is_declared(&self, destination: &Destination) -> bool {
        self.declared
            .lock()
            .map(|declared| declared.contains(destination))
            .unwrap_or(false)
    }

    fn mark_declared(&self, destination: &Destination) {
        if let Ok(mut declared) = self.declared.lock() {
            declared.insert(destination.clone());
        }
    }
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    async fn publish(&self, destination: &Destination, body: &[u8], priority: i32) -> CourierResult<()> {
        let connected = self.current()?;
        let channel = &connected.publish_channel;

        if !destination.is_ephemeral() && !self.is_declared(destination) {
            self.declare_queue(channel, destination).await?;
            self.mark_declared(destination);
        }

        let exchange = self.exchange_name(destination.exchange_class());
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_priority(priority.clamp(0, u8::MAX as i32) as u8)
            .with_content_type("application/json".into());

        let confirmation = channel
            .basic_publish(
                &exchange,
                destination.routing_key(),
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| broker_error(&format!("failed to publish to {destination}"), e))?
            .await
            .map_err(|e| broker_error("publisher confirm failed", e))?;

        if confirmation.is_nack() {
            return Err(CourierError::BrokerUnavailable(format!(
                "broker refused message for {destination}"
            )));
        }

        debug!(%destination, bytes = body.len(), "message confirmed");
        Ok(())
    }

    async fn subscribe(&self, destinations: &[Destination], prefetch: u16) -> CourierResult<Box<dyn Subscription>> {
        let connected = self.current()?;
        let channel = connected
            .connection
            .create_channel()
            .await
            .map_err(|e| broker_error("failed to create consumer channel", e))?;

        // Global: the limit covers every consumer on this channel together.
        channel
            .basic_qos(prefetch, BasicQosOptions { global: true })
            .await
            .map_err(|e| broker_error("failed to set prefetch", e))?;

        let mut streams: Vec<BoxStream<'static, (Destination, Result<lapin::message::Delivery, lapin::Error>)>> =
            Vec::with_capacity(destinations.len());
        for destination in destinations {
            let queue = self.declare_queue(&channel, destination).await?;
            let consumer = channel
                .basic_consume(
                    &queue,
                    "",
                    BasicConsumeOptions {
                        exclusive: destination.is_ephemeral(),
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| broker_error(&format!("failed to consume from {queue}"), e))?;

            let source = destination.clone();
            streams.push(consumer.map(move |delivery| (source.clone(), delivery)).boxed());
            info!(%queue, prefetch, "consuming");
        }

        Ok(Box::new(RabbitMqSubscription {
            _channel: channel,
            deliveries: stream::select_all(streams),
        }))
    }

    /// Components sharing this broker reconnect independently; whoever finds
    /// a healthy connection already in place keeps it.
    async fn reconnect(&self) -> CourierResult<()> {
        if self.current().is_ok() {
            debug!("connection already healthy, reconnect skipped");
            return Ok(());
        }

        let connected = Arc::new(Self::open(&self.config).await?);
        let (previous, spare) = {
            let mut state = self
                .state
                .write()
                .map_err(|_| CourierError::Internal("broker state lock poisoned".into()))?;
            match state.as_ref() {
                Some(current) if current.connection.status().connected() => (None, Some(connected)),
                _ => (state.replace(connected), None),
            }
        };

        if let Some(spare) = spare {
            debug!("another caller reconnected first, closing spare connection");
            if let Err(e) = spare.connection.close(200, "superseded").await {
                warn!("failed to close spare connection: {e}");
            }
            return Ok(());
        }

        if let Ok(mut declared) = self.declared.lock() {
            declared.clear();
        }
        if let Some(previous) = previous {
            if previous.connection.status().connected() {
                if let Err(e) = previous.connection.close(200, "reconnecting").await {
                    warn!("failed to close previous connection: {e}");
                }
            }
        }
        info!("reconnected to RabbitMQ");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current().is_ok()
    }

    async fn close(&self) -> CourierResult<()> {
        let connected = {
            let mut state = self
                .state
                .write()
                .map_err(|_| CourierError::Internal("broker state lock poisoned".into()))?;
            state.take()
        };
        if let Some(connected) = connected {
            connected
                .connection
                .close(200, "normal shutdown")
                .await
                .map_err(|e| broker_error("failed to close connection", e))?;
            info!("RabbitMQ connection closed");
        }
        Ok(())
    }
}

struct RabbitMqSubscription {
    _channel: Channel,
    deliveries: stream::SelectAll<BoxStream<'static, (Destination, Result<lapin::message::Delivery, lapin::Error>)>>,
}

#[async_trait]
impl Subscription for RabbitMqSubscription {
    async fn next(&mut self) -> Option<CourierResult<Delivery>> {
        let (source, delivery) = self.deliveries.next().await?;
        Some(
            delivery
                .map(|delivery| {
                    Delivery::new(
                        source,
                        delivery.data,
                        delivery.redelivered,
                        Box::new(RabbitMqAcker {
                            acker: delivery.acker,
                        }),
                    )
                })
                .map_err(|e| broker_error("consumer failed", e)),
        )
    }
}

struct RabbitMqAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for RabbitMqAcker {
    async fn ack(&self) -> CourierResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| broker_error("failed to ack delivery", e))
    }
}
