use crate::db::repositories::AnalyticsStore;
use crate::messaging::event::EventEnvelope;
use crate::storage::{sanitize_segment, BlobStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::Arc;

/// Prefix keeping flattened `additionalData` keys apart from record fields
pub const DATA_PREFIX: &str = "data_";

/// Flattened analytics record derived from one envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub event_id: String,
    pub event_type: String,
    pub device_id: String,
    pub location_id: String,
    pub location_name: String,
    pub customer_name: String,
    pub battery_level: i32,
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    /// `data_<key>` fields flattened from `additionalData`
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Why `additionalData` could not be flattened
#[derive(Debug, thiserror::Error)]
pub enum AdditionalDataError {
    #[error("additionalData string is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("additionalData is a {0}, expected an object")]
    NotAnObject(&'static str),
}

/// Turn an envelope into its processed record.
///
/// A malformed `additionalData` never fails the transform; the record is
/// produced without `data_` fields and the problem is logged.
pub fn transform(envelope: &EventEnvelope, processed_at: DateTime<Utc>) -> ProcessedRecord {
    let data = match flatten_additional_data(&envelope.additional_data) {
        Ok(data) => data,
        Err(e) => {
            warn!(
                "Dropping additionalData of event {} from device {}: {}",
                envelope.event_id, envelope.device_id, e
            );
            Map::new()
        }
    };

    ProcessedRecord {
        event_id: envelope.event_id.clone(),
        event_type: envelope.event_type.to_string(),
        device_id: envelope.device_id.clone(),
        location_id: envelope.location_id.clone(),
        location_name: envelope.location_name.clone(),
        customer_name: envelope.customer_name.clone(),
        battery_level: i32::from(envelope.battery_level),
        timestamp: envelope.timestamp,
        processed_at,
        data,
    }
}

/// Flatten `additionalData` into `data_<key>` fields.
///
/// Producers send either a nested object or a string holding one.
pub fn flatten_additional_data(raw: &Value) -> Result<Map<String, Value>, AdditionalDataError> {
    let parsed;
    let object = match raw {
        Value::Null => return Ok(Map::new()),
        Value::Object(map) => map,
        Value::String(s) if s.trim().is_empty() => return Ok(Map::new()),
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s)?;
            match &parsed {
                Value::Object(map) => map,
                other => return Err(AdditionalDataError::NotAnObject(kind_of(other))),
            }
        }
        other => return Err(AdditionalDataError::NotAnObject(kind_of(other))),
    };

    Ok(object
        .iter()
        .map(|(key, value)| (format!("{}{}", DATA_PREFIX, key), flatten_value(value)))
        .collect())
}

/// string, bool and null pass through; integral numbers become i64,
/// other numbers f64; arrays and objects are stringified
fn flatten_value(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => value.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(Number::from(i))
            } else {
                n.as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(n.to_string()))
            }
        }
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `{eventType}/{yyyy}/{mm}/{dd}/{eventId}.json`, dated by the event itself
pub fn processed_path(record: &ProcessedRecord) -> String {
    format!(
        "{}/{}/{}.json",
        sanitize_segment(&record.event_type),
        record.timestamp.format("%Y/%m/%d"),
        sanitize_segment(&record.event_id)
    )
}

/// Transforms envelopes and persists the resulting processed records
#[derive(Clone)]
pub struct EventTransformer {
    processed_store: Arc<dyn BlobStore>,
    analytics: Arc<dyn AnalyticsStore>,
}

impl EventTransformer {
    pub fn new(processed_store: Arc<dyn BlobStore>, analytics: Arc<dyn AnalyticsStore>) -> Self {
        Self {
            processed_store,
            analytics,
        }
    }

    /// Transform an envelope and write the record to the processed store and
    /// the analytics table. A replayed event keeps its first analytics row.
    pub async fn process(&self, envelope: &EventEnvelope) -> Result<ProcessedRecord> {
        let record = transform(envelope, Utc::now());

        let body = serde_json::to_vec(&record).context("Failed to serialize processed record")?;
        let path = processed_path(&record);
        self.processed_store
            .put(&path, &body)
            .await
            .with_context(|| format!("Failed to store processed record for event {}", record.event_id))?;

        let inserted = self
            .analytics
            .insert_processed(&record)
            .await
            .with_context(|| format!("Failed to record event {} for analytics", record.event_id))?;

        if inserted {
            debug!("Stored processed {} event {} at {}", record.event_type, record.event_id, path);
        } else {
            debug!("Event {} already recorded for analytics, keeping first copy", record.event_id);
        }

        Ok(record)
    }
}
