use crate::messaging::consumer::{MessageHandler, ProcessingError};
use crate::messaging::event::{EventEnvelope, RoutingAttributes};
use crate::storage::RawArchiver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, warn};

pub mod aggregator;
pub mod jobs;
pub mod reconciler;
pub mod supervisor;
pub mod transformer;

pub use aggregator::PeriodicAggregator;
pub use reconciler::DeviceStateReconciler;
pub use supervisor::PipelineSupervisor;
pub use transformer::EventTransformer;

/// Per-message workflow: decode, archive, transform, reconcile.
///
/// Decode, archive and reconcile failures are returned with their stage so
/// the consumer can leave the message on the queue. A processed record that
/// cannot be stored is logged and the message still reaches reconciliation.
pub struct EventPipeline {
    archiver: RawArchiver,
    transformer: EventTransformer,
    reconciler: DeviceStateReconciler,
}

impl EventPipeline {
    pub fn new(archiver: RawArchiver, transformer: EventTransformer, reconciler: DeviceStateReconciler) -> Self {
        Self {
            archiver,
            transformer,
            reconciler,
        }
    }

    pub async fn process(
        &self,
        body: &[u8],
        attributes: &RoutingAttributes,
        arrived_at: DateTime<Utc>,
    ) -> Result<EventEnvelope, ProcessingError> {
        let envelope = EventEnvelope::decode(body, arrived_at)?;

        if let Some(device_id) = &attributes.device_id {
            if *device_id != envelope.device_id {
                warn!(
                    "DeviceId header {} disagrees with body {} for event {}",
                    device_id, envelope.device_id, envelope.event_id
                );
            }
        }

        self.archiver
            .archive(&envelope.device_id, body, arrived_at)
            .await
            .map_err(ProcessingError::Archive)?;

        if let Err(e) = self.transformer.process(&envelope).await {
            error!(
                "Processed record for event {} from device {} was not stored: {:#}",
                envelope.event_id, envelope.device_id, e
            );
        }

        self.reconciler
            .reconcile(&envelope)
            .await
            .map_err(ProcessingError::Reconcile)?;

        Ok(envelope)
    }
}

#[async_trait]
impl MessageHandler for EventPipeline {
    async fn handle(
        &self,
        body: &[u8],
        attributes: &RoutingAttributes,
        arrived_at: DateTime<Utc>,
    ) -> Result<(), ProcessingError> {
        self.process(body, attributes, arrived_at).await.map(|_| ())
    }
}
