use crate::config::MessageBrokerConfig;
use crate::messaging::broker::MessageBroker;
use crate::messaging::event::{DecodeError, RoutingAttributes};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::Channel;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a message could not be processed, by the stage that failed
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("raw archival failed: {0:#}")]
    Archive(anyhow::Error),

    #[error("device reconciliation failed: {0:#}")]
    Reconcile(anyhow::Error),
}

impl ProcessingError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Archive(_) => "archive",
            Self::Reconcile(_) => "reconcile",
        }
    }

    /// A failure that will repeat on every redelivery
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Processes one message body end to end
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        body: &[u8],
        attributes: &RoutingAttributes,
        arrived_at: DateTime<Utc>,
    ) -> Result<(), ProcessingError>;
}

/// What to tell the broker about a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

/// Decides between acknowledgement, redelivery and dead-lettering
#[derive(Debug, Clone, Copy)]
pub struct RedeliveryPolicy {
    max_delivery_attempts: u32,
}

impl RedeliveryPolicy {
    pub fn new(max_delivery_attempts: u32) -> Self {
        Self {
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }

    /// Only poison messages are dead-lettered, and only once their attempt
    /// count is known to have reached the limit. Everything else goes back
    /// to the queue.
    pub fn disposition(&self, outcome: &Result<(), ProcessingError>, attempt: Option<u32>) -> Disposition {
        match outcome {
            Ok(()) => Disposition::Ack,
            Err(e) if e.is_poison() => match attempt {
                Some(n) if n >= self.max_delivery_attempts => Disposition::DeadLetter,
                _ => Disposition::Requeue,
            },
            Err(_) => Disposition::Requeue,
        }
    }
}

/// Settles one delivery with the broker
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Hand the message back to the queue for redelivery
    async fn requeue(&self) -> Result<()>;

    /// Reject without requeue, routing the message to the dead-letter exchange
    async fn dead_letter(&self) -> Result<()>;
}

/// A received message, detached from the broker client
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub attributes: RoutingAttributes,
    /// Delivery attempt counting from 1; `None` when it cannot be known
    pub attempt: Option<u32>,
    pub acker: Box<dyn DeliveryAcker>,
}

/// An open subscription on the event queue
pub struct Subscription {
    pub deliveries: BoxStream<'static, Result<IncomingMessage>>,
    /// Channel to close when the subscription ends, returning unstarted prefetched deliveries
    pub channel: Option<Channel>,
}

/// Where the consumer gets its deliveries from
#[async_trait]
pub trait DeliverySource: Send + Sync {
    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription>;
}

/// Long-lived consumption loop over the event queue
pub struct QueueConsumer {
    source: Arc<dyn DeliverySource>,
    handler: Arc<dyn MessageHandler>,
    policy: RedeliveryPolicy,
    max_in_flight: usize,
    requeue_delay: Duration,
    retry_delay: Duration,
}

impl QueueConsumer {
    pub fn new(broker: Arc<MessageBroker>, handler: Arc<dyn MessageHandler>) -> Self {
        let config = broker.config().clone();
        Self::with_source(broker, handler, &config)
    }

    pub fn with_source(
        source: Arc<dyn DeliverySource>,
        handler: Arc<dyn MessageHandler>,
        config: &MessageBrokerConfig,
    ) -> Self {
        Self {
            source,
            handler,
            policy: RedeliveryPolicy::new(config.max_delivery_attempts),
            max_in_flight: usize::from(config.max_in_flight.max(1)),
            requeue_delay: Duration::from_millis(config.requeue_delay_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Consume until `token` is cancelled, re-subscribing whenever the
    /// delivery stream ends underneath us.
    ///
    /// On cancellation no new delivery is started; the ones in flight run
    /// to completion before this returns.
    pub async fn run(&self, token: CancellationToken) {
        let consumer_tag = format!("trap-telemetry-{}", Uuid::new_v4());

        while !token.is_cancelled() {
            let Subscription { deliveries, channel } = match self.source.subscribe(&consumer_tag).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!("Failed to subscribe to event queue: {:#}", e);
                    if self.pause(&token, self.retry_delay).await {
                        break;
                    }
                    continue;
                }
            };

            deliveries
                .take_until(token.cancelled())
                .for_each_concurrent(self.max_in_flight, |message| async move {
                    match message {
                        Ok(message) => self.process_delivery(message).await,
                        Err(e) => error!("Error receiving message: {:#}", e),
                    }
                })
                .await;

            if let Some(channel) = channel {
                if let Err(e) = channel.close(200, "consumer stopping").await {
                    debug!("Consumer channel already closed: {}", e);
                }
            }

            if token.is_cancelled() {
                break;
            }

            warn!(
                "Delivery stream ended, re-subscribing in {} ms",
                self.retry_delay.as_millis()
            );
            if self.pause(&token, self.retry_delay).await {
                break;
            }
        }

        info!("Queue consumer stopped");
    }

    /// Sleep unless cancelled first; `true` when cancelled
    async fn pause(&self, token: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn process_delivery(&self, message: IncomingMessage) {
        let arrived_at = Utc::now();
        let attributes = &message.attributes;

        debug!(
            "Received message {} (type: {:?}, device: {:?}, location: {:?}, attempt: {:?})",
            message.delivery_tag,
            attributes.event_type,
            attributes.device_id,
            attributes.location_id,
            message.attempt
        );

        let outcome = self.handler.handle(&message.body, attributes, arrived_at).await;

        let settled = match (&outcome, self.policy.disposition(&outcome, message.attempt)) {
            (Ok(()), _) => message.acker.ack().await,
            (Err(e), Disposition::DeadLetter) => {
                error!(
                    "Poison message from device {:?} after {:?} attempts, dead-lettering: {}",
                    attributes.device_id, message.attempt, e
                );
                message.acker.dead_letter().await
            }
            (Err(e), _) => {
                if e.is_poison() {
                    error!(
                        "Poison message candidate from device {:?} (attempt {:?}): {}",
                        attributes.device_id, message.attempt, e
                    );
                } else {
                    error!(
                        "Processing failed at {} stage for device {:?}, requeueing: {}",
                        e.stage(),
                        attributes.device_id,
                        e
                    );
                }

                tokio::time::sleep(self.requeue_delay).await;
                message.acker.requeue().await
            }
        };

        match settled {
            Ok(()) => debug!("Settled message {}", message.delivery_tag),
            Err(e) => error!("Failed to settle message {}: {:#}", message.delivery_tag, e),
        }
    }
}
