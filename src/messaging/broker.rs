use crate::config::MessageBrokerConfig;
use crate::error::Error;
use crate::messaging::consumer::{DeliveryAcker, DeliverySource, IncomingMessage, Subscription};
use crate::messaging::event::{
    EventEnvelope, RoutingAttributes, HEADER_DEVICE_ID, HEADER_EVENT_TYPE, HEADER_LOCATION_ID,
};
use anyhow::Result;
use async_trait::async_trait;
use deadpool_lapin::{Config, Manager, Pool};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ConnectionProperties, Consumer, ExchangeKind,
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Header RabbitMQ quorum queues use to count earlier delivery attempts
pub const HEADER_DELIVERY_COUNT: &str = "x-delivery-count";

/// Binding key matching every routing key of a topic exchange
const MATCH_ALL: &str = "#";

/// RabbitMQ message broker
pub struct MessageBroker {
    /// Connection pool
    pool: Pool,
    /// Configuration
    config: MessageBrokerConfig,
    /// Channel reused for publishing
    channel: Arc<Mutex<Option<Channel>>>,
}

impl MessageBroker {
    /// Create a new message broker and declare the event topology
    pub async fn new(config: MessageBrokerConfig) -> Result<Self> {
        let pool_config = Config {
            url: Some(config.uri.clone()),
            pool: Some(deadpool_lapin::PoolConfig {
                max_size: config.pool_size as usize,
                queue_mode: deadpool::managed::QueueMode::Fifo,
                timeouts: deadpool::managed::Timeouts {
                    wait: Some(Duration::from_millis(config.timeout_ms)),
                    create: Some(Duration::from_millis(config.timeout_ms)),
                    recycle: Some(Duration::from_millis(config.timeout_ms)),
                },
            }),
            connection_properties: ConnectionProperties::default(),
        };
        let pool = pool_config
            .create_pool(Some(deadpool_lapin::Runtime::Tokio1))
            .map_err(|e| Error::Queue(format!("Failed to create RabbitMQ pool: {}", e)))?;

        let broker = Self {
            pool,
            config,
            channel: Arc::new(Mutex::new(None)),
        };

        broker.init().await?;

        Ok(broker)
    }

    pub fn config(&self) -> &MessageBrokerConfig {
        &self.config
    }

    /// Declare exchanges and queues; safe to repeat against an existing topology
    async fn init(&self) -> Result<()> {
        let channel = self.open_channel().await?;

        for exchange in [&self.config.exchange, &self.config.dead_letter_exchange] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::Queue(format!("Failed to declare exchange {}: {}", exchange, e)))?;
        }

        self.declare_bound_queue(
            &channel,
            &self.config.dead_letter_queue,
            &self.config.dead_letter_exchange,
            FieldTable::default(),
        )
        .await?;

        self.declare_bound_queue(
            &channel,
            &self.config.queue,
            &self.config.exchange,
            event_queue_arguments(&self.config),
        )
        .await?;

        let mut default_channel = self.channel.lock().await;
        *default_channel = Some(channel);

        info!(
            "RabbitMQ topology ready: {} -> {} (dead letters: {} -> {})",
            self.config.exchange,
            self.config.queue,
            self.config.dead_letter_exchange,
            self.config.dead_letter_queue
        );

        Ok(())
    }

    async fn declare_bound_queue(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to declare queue {}: {}", queue, e)))?;

        channel
            .queue_bind(
                queue,
                exchange,
                MATCH_ALL,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to bind queue {}: {}", queue, e)))?;

        debug!("Declared queue {} bound to {}", queue, exchange);
        Ok(())
    }

    /// Get a connection from the pool with retry
    async fn get_connection(&self) -> Result<deadpool::managed::Object<Manager>> {
        let mut attempts = 0;
        let max_attempts = self.config.retry_attempts.max(1);

        loop {
            attempts += 1;
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    if attempts >= max_attempts {
                        return Err(Error::Queue(format!(
                            "Failed to get RabbitMQ connection after {} attempts: {}",
                            attempts, err
                        ))
                        .into());
                    }

                    warn!(
                        "Failed to get RabbitMQ connection (attempt {}/{}): {}",
                        attempts, max_attempts, err
                    );

                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    async fn open_channel(&self) -> Result<Channel> {
        let conn = self.get_connection().await?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| Error::Queue(format!("Failed to create RabbitMQ channel: {}", e)))?;
        Ok(channel)
    }

    /// Get the publishing channel or create a new one
    async fn get_channel(&self) -> Result<Channel> {
        let mut channel_guard = self.channel.lock().await;

        if let Some(channel) = &*channel_guard {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.open_channel().await?;
        *channel_guard = Some(channel.clone());

        Ok(channel)
    }

    /// Open a dedicated channel and subscribe to the event queue.
    ///
    /// Prefetch equals `max_in_flight`, so the broker never hands this
    /// consumer more unacknowledged deliveries than it may process at once.
    pub async fn consume(&self, consumer_tag: &str) -> Result<(Channel, Consumer)> {
        let channel = self.open_channel().await?;

        channel
            .basic_qos(self.config.max_in_flight, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Queue(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to create consumer: {}", e)))?;

        info!(
            "Consuming {} as {} (prefetch {})",
            self.config.queue, consumer_tag, self.config.max_in_flight
        );

        Ok((channel, consumer))
    }

    /// Publish an envelope with its routing attributes as headers
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<()> {
        let body = envelope
            .encode()
            .map_err(|e| Error::Serialization(format!("Failed to encode envelope: {}", e)))?;
        let attributes = envelope.routing_attributes();
        let routing_key = envelope.event_type.to_string();

        let properties = BasicProperties::default()
            .with_message_id(envelope.event_id.clone().into())
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_timestamp(envelope.timestamp.timestamp().max(0) as u64)
            .with_headers(routing_headers(&attributes));

        let channel = self.get_channel().await?;
        channel
            .basic_publish(
                &self.config.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to publish message: {}", e)))?;

        debug!(
            "Published event {} with routing key: {}",
            envelope.event_id, routing_key
        );

        Ok(())
    }

    /// Close the publishing channel and every pooled connection
    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close(200, "shutdown").await {
                debug!("Publishing channel already closed: {}", e);
            }
        }
        self.pool.close();
        info!("RabbitMQ connections closed");
    }
}

#[async_trait]
impl DeliverySource for MessageBroker {
    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription> {
        let (channel, consumer) = self.consume(consumer_tag).await?;
        let deliveries = consumer
            .map(|delivery| {
                delivery.map(IncomingMessage::from).map_err(|e| {
                    anyhow::Error::from(Error::Queue(format!("Failed to receive delivery: {}", e)))
                })
            })
            .boxed();

        Ok(Subscription {
            deliveries,
            channel: Some(channel),
        })
    }
}

impl From<Delivery> for IncomingMessage {
    fn from(delivery: Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            attributes: attributes_from_headers(delivery.properties.headers().as_ref()),
            attempt: delivery_attempt(&delivery.properties, delivery.redelivered),
            body: delivery.data,
            acker: Box::new(LapinAcker {
                acker: delivery.acker,
            }),
        }
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| Error::Queue(format!("Failed to ack message: {}", e)))?;
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
            .map_err(|e| Error::Queue(format!("Failed to requeue message: {}", e)))?;
        Ok(())
    }

    async fn dead_letter(&self) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| Error::Queue(format!("Failed to reject message: {}", e)))?;
        Ok(())
    }
}

/// Arguments of the event queue: dead-letter target and queue type
fn event_queue_arguments(config: &MessageBrokerConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(config.dead_letter_exchange.clone().into()),
    );
    if config.quorum_queue {
        args.insert("x-queue-type".into(), AMQPValue::LongString("quorum".to_string().into()));
    }
    args
}

/// Routing attributes as string-valued AMQP headers
pub fn routing_headers(attributes: &RoutingAttributes) -> FieldTable {
    let mut headers = FieldTable::default();
    for (name, value) in [
        (HEADER_EVENT_TYPE, &attributes.event_type),
        (HEADER_DEVICE_ID, &attributes.device_id),
        (HEADER_LOCATION_ID, &attributes.location_id),
    ] {
        if let Some(value) = value {
            headers.insert(name.into(), AMQPValue::LongString(value.clone().into()));
        }
    }
    headers
}

fn header<'a>(headers: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn header_string(headers: &FieldTable, name: &str) -> Option<String> {
    match header(headers, name)? {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

/// Read routing attributes without decoding the body
pub fn attributes_from_headers(headers: Option<&FieldTable>) -> RoutingAttributes {
    match headers {
        Some(headers) => RoutingAttributes {
            event_type: header_string(headers, HEADER_EVENT_TYPE),
            device_id: header_string(headers, HEADER_DEVICE_ID),
            location_id: header_string(headers, HEADER_LOCATION_ID),
        },
        None => RoutingAttributes::default(),
    }
}

/// Which delivery attempt this is, counting from 1.
///
/// `None` when the message was redelivered by a queue that does not count
/// deliveries, so the attempt number cannot be known.
pub fn delivery_attempt(properties: &BasicProperties, redelivered: bool) -> Option<u32> {
    let previous = properties
        .headers()
        .as_ref()
        .and_then(|headers| header(headers, HEADER_DELIVERY_COUNT))
        .and_then(|value| match value {
            AMQPValue::ShortShortUInt(n) => Some(u64::from(*n)),
            AMQPValue::ShortUInt(n) => Some(u64::from(*n)),
            AMQPValue::LongUInt(n) => Some(u64::from(*n)),
            AMQPValue::ShortShortInt(n) => u64::try_from(*n).ok(),
            AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
            _ => None,
        });

    match previous {
        Some(count) => Some(u32::try_from(count.saturating_add(1)).unwrap_or(u32::MAX)),
        None if redelivered => None,
        None => Some(1),
    }
}

/// Create a message broker service
pub async fn create_message_broker(config: MessageBrokerConfig) -> Result<Arc<MessageBroker>> {
    let broker = MessageBroker::new(config).await?;

    Ok(Arc::new(broker))
}
