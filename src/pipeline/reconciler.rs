use crate::error::Error;
use crate::messaging::event::{EventEnvelope, EventType};
use crate::registry::{DeviceRecord, DeviceRegistry, DeviceStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;

use DeviceStatus::{Active, Alert, Inactive, LowBattery, Maintenance, Offline, Triggered};

/// Next device status, indexed by event type (rows, `EventType::KNOWN`
/// order) and current status (columns, `DeviceStatus::ALL` order).
///
/// Every row is idempotent: applying an event to the status it produces
/// yields that status again, so redelivered envelopes are harmless.
const TRANSITIONS: [[DeviceStatus; 7]; 7] = [
    //               Active      Inactive    Maintenance  Alert       Triggered   LowBattery  Offline
    /* Activation */ [Triggered, Triggered, Triggered, Triggered, Triggered, Triggered, Triggered],
    /* Capture    */ [Triggered, Triggered, Triggered, Triggered, Triggered, Triggered, Triggered],
    /* BatteryLow */ [LowBattery, LowBattery, LowBattery, LowBattery, LowBattery, LowBattery, LowBattery],
    /* Maintenance*/ [Active, Active, Active, Active, Active, Active, Active],
    /* Malfunction*/ [Alert, Alert, Alert, Alert, Alert, Alert, Alert],
    /* Reset      */ [Active, Active, Active, Active, Active, Active, Active],
    // Heartbeats never clear a special condition
    /* Heartbeat  */ [Active, Active, Maintenance, Alert, Triggered, LowBattery, Active],
];

/// Status after `event_type` hits a device in `current`; `None` for event
/// types the table does not cover
pub fn next_status(current: DeviceStatus, event_type: &EventType) -> Option<DeviceStatus> {
    let row = event_type.index()?;
    Some(TRANSITIONS[row][current as usize])
}

/// Apply an envelope to a device record.
///
/// Battery level and last communication are refreshed for every event,
/// including ones whose type leaves the status alone.
pub fn apply(record: &DeviceRecord, envelope: &EventEnvelope) -> DeviceRecord {
    let mut updated = record.clone();

    match next_status(record.status, &envelope.event_type) {
        Some(status) => updated.status = status,
        None => warn!(
            "Unknown event type {} for device {}, status left at {}",
            envelope.event_type, envelope.device_id, record.status
        ),
    }

    if envelope.event_type == EventType::Maintenance {
        updated.last_maintenance_date = Some(envelope.timestamp);
    }

    updated.battery_level = envelope.battery_level;
    updated.last_communication_date = Some(envelope.timestamp);
    updated
}

/// What reconciling one envelope did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The device record was written back
    Updated {
        previous: DeviceStatus,
        current: DeviceStatus,
    },
    /// The Registry has no such device; nothing to update
    DeviceNotFound,
}

/// Applies the status state machine and writes device records back
#[derive(Clone)]
pub struct DeviceStateReconciler {
    registry: Arc<dyn DeviceRegistry>,
}

impl DeviceStateReconciler {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Read the device, compute its next state and write it back.
    ///
    /// The write is conditional on the version that was read; a
    /// concurrent modification surfaces as `Error::Conflict` and the
    /// caller is expected to retry from a fresh read (redelivery).
    pub async fn reconcile(&self, envelope: &EventEnvelope) -> Result<ReconcileOutcome> {
        let outcome = match self
            .registry
            .get_device(&envelope.device_id)
            .await
            .with_context(|| format!("Failed to read device {}", envelope.device_id))?
        {
            Some(record) => {
                let updated = apply(&record, envelope);
                self.registry
                    .put_device(&envelope.device_id, &updated)
                    .await
                    .with_context(|| format!("Failed to write device {}", envelope.device_id))?;

                if updated.status != record.status {
                    info!(
                        "Device {} status {} -> {} ({} event {})",
                        envelope.device_id, record.status, updated.status, envelope.event_type, envelope.event_id
                    );
                } else {
                    debug!(
                        "Device {} status unchanged at {} ({} event {})",
                        envelope.device_id, updated.status, envelope.event_type, envelope.event_id
                    );
                }

                ReconcileOutcome::Updated {
                    previous: record.status,
                    current: updated.status,
                }
            }
            None => {
                warn!(
                    "Device {} not found in registry, skipping status update for event {}",
                    envelope.device_id, envelope.event_id
                );
                ReconcileOutcome::DeviceNotFound
            }
        };

        self.mark_event_processed(envelope).await;
        Ok(outcome)
    }

    /// Flag the Registry's copy of the event as processed. The device write
    /// has already landed, so a failure here only gets logged.
    async fn mark_event_processed(&self, envelope: &EventEnvelope) {
        let mut processed = envelope.clone();
        processed.mark_processed(Utc::now());

        match self.registry.put_event(&processed).await {
            Ok(()) => {}
            Err(e) if Error::is_not_found(&e) => {
                debug!("Event {} is not registered, nothing to flag", envelope.event_id);
            }
            Err(e) => warn!("Failed to flag event {} processed: {:#}", envelope.event_id, e),
        }
    }
}
