//! In-memory doubles for the storage, registry and analytics ports

use crate::db::models::{DailyAggregate, LocationRisk};
use crate::db::repositories::AnalyticsStore;
use crate::error::Error;
use crate::messaging::event::{EventEnvelope, EventType};
use crate::pipeline::transformer::ProcessedRecord;
use crate::registry::{DeviceRecord, DeviceRegistry};
use crate::storage::BlobStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Envelope with plausible defaults for the given device and type
pub fn envelope(device_id: &str, event_type: EventType) -> EventEnvelope {
    EventEnvelope {
        event_id: Uuid::new_v4().to_string(),
        device_id: device_id.to_string(),
        timestamp: Utc::now(),
        event_type,
        location_id: "LOC-SB-001".to_string(),
        location_name: "Springfield Bakery".to_string(),
        customer_name: "Springfield Foods".to_string(),
        battery_level: 80,
        additional_data: Value::Null,
        is_processed: false,
        processed_timestamp: None,
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail: AtomicBool,
}

impl MemoryBlobStore {
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("write to {} refused", path)).into());
        }
        self.blobs.lock().unwrap().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Registry double with version counters for compare-and-swap writes
#[derive(Default)]
pub struct InMemoryRegistry {
    devices: Mutex<HashMap<String, (DeviceRecord, u64)>>,
    events: Mutex<HashMap<String, EventEnvelope>>,
    conflicts: AtomicUsize,
    unavailable: AtomicBool,
    reject_events: AtomicBool,
    device_writes: AtomicUsize,
}

impl InMemoryRegistry {
    pub fn with_devices(devices: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let registry = Self::default();
        {
            let mut map = registry.devices.lock().unwrap();
            for device in devices {
                map.insert(device.device_id.clone(), (device, 1));
            }
        }
        registry
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.lock().unwrap().get(device_id).map(|(record, _)| record.clone())
    }

    pub fn register_event(&self, envelope: &EventEnvelope) {
        self.events
            .lock()
            .unwrap()
            .insert(envelope.event_id.clone(), envelope.clone());
    }

    pub fn event(&self, event_id: &str) -> Option<EventEnvelope> {
        self.events.lock().unwrap().get(event_id).cloned()
    }

    /// Make the next device write fail as a concurrent modification
    pub fn conflict_next_write(&self) {
        self.conflicts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Answer every event write with a client error
    pub fn reject_event_writes(&self, reject: bool) {
        self.reject_events.store(reject, Ordering::SeqCst);
    }

    pub fn device_writes(&self) -> usize {
        self.device_writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Registry("registry unavailable".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        self.check_available()?;
        Ok(self.devices.lock().unwrap().get(device_id).map(|(record, version)| {
            let mut record = record.clone();
            record.version = Some(version.to_string());
            record
        }))
    }

    async fn put_device(&self, device_id: &str, record: &DeviceRecord) -> Result<()> {
        self.check_available()?;
        if record.device_id != device_id {
            return Err(Error::BadRequest("ID mismatch".to_string()).into());
        }

        let pending = self.conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(Error::Conflict(format!("device {} was modified concurrently", device_id)).into());
        }

        let mut devices = self.devices.lock().unwrap();
        let (stored, version) = devices
            .get_mut(device_id)
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;

        if let Some(expected) = &record.version {
            if *expected != version.to_string() {
                return Err(Error::Conflict(format!("device {} was modified concurrently", device_id)).into());
            }
        }

        *stored = record.clone();
        stored.version = None;
        *version += 1;
        self.device_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.check_available()?;
        let mut devices: Vec<_> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .map(|(record, _)| record.clone())
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn put_event(&self, envelope: &EventEnvelope) -> Result<()> {
        self.check_available()?;
        if self.reject_events.load(Ordering::SeqCst) {
            return Err(Error::BadRequest(format!("event {} rejected", envelope.event_id)).into());
        }
        let mut events = self.events.lock().unwrap();
        match events.get_mut(&envelope.event_id) {
            Some(stored) => {
                *stored = envelope.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("event {}", envelope.event_id)).into()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryAnalyticsStore {
    processed: Mutex<BTreeMap<String, ProcessedRecord>>,
    aggregates: Mutex<Vec<DailyAggregate>>,
    risks: Mutex<Vec<LocationRisk>>,
    fail_reads: AtomicBool,
}

impl InMemoryAnalyticsStore {
    pub fn processed(&self) -> Vec<ProcessedRecord> {
        self.processed.lock().unwrap().values().cloned().collect()
    }

    pub fn aggregates(&self) -> Vec<DailyAggregate> {
        self.aggregates.lock().unwrap().clone()
    }

    pub fn risks(&self) -> Vec<LocationRisk> {
        self.risks.lock().unwrap().clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AnalyticsStore for InMemoryAnalyticsStore {
    async fn insert_processed(&self, record: &ProcessedRecord) -> Result<bool> {
        let mut processed = self.processed.lock().unwrap();
        if processed.contains_key(&record.event_id) {
            return Ok(false);
        }
        processed.insert(record.event_id.clone(), record.clone());
        Ok(true)
    }

    async fn processed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessedRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Database("analytics database unavailable".to_string()).into());
        }
        let mut records: Vec<_> = self
            .processed
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    async fn save_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<u64> {
        let mut stored = self.aggregates.lock().unwrap();
        for aggregate in aggregates {
            stored.retain(|a| {
                !(a.aggregate_date == aggregate.aggregate_date
                    && a.dimension == aggregate.dimension
                    && a.dimension_value == aggregate.dimension_value)
            });
            stored.push(aggregate.clone());
        }
        Ok(aggregates.len() as u64)
    }

    async fn save_location_risks(&self, risks: &[LocationRisk]) -> Result<u64> {
        let mut stored = self.risks.lock().unwrap();
        for risk in risks {
            stored.retain(|r| r.location_id != risk.location_id);
            stored.push(risk.clone());
        }
        Ok(risks.len() as u64)
    }
}
