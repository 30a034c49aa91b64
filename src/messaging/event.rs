use crate::utils::timestamp;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Header carrying the event type name
pub const HEADER_EVENT_TYPE: &str = "EventType";
/// Header carrying the device identifier
pub const HEADER_DEVICE_ID: &str = "DeviceId";
/// Header carrying the location identifier
pub const HEADER_LOCATION_ID: &str = "LocationId";

/// Event types emitted by field devices
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Activation,
    Capture,
    BatteryLow,
    Maintenance,
    Malfunction,
    Reset,
    Heartbeat,

    // Anything a newer producer sends that this pipeline does not know
    Unrecognized(String),
}

impl EventType {
    /// Every known event type, in table order
    pub const KNOWN: [EventType; 7] = [
        EventType::Activation,
        EventType::Capture,
        EventType::BatteryLow,
        EventType::Maintenance,
        EventType::Malfunction,
        EventType::Reset,
        EventType::Heartbeat,
    ];

    /// Position of a known event type in `KNOWN`
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Activation => Some(0),
            Self::Capture => Some(1),
            Self::BatteryLow => Some(2),
            Self::Maintenance => Some(3),
            Self::Malfunction => Some(4),
            Self::Reset => Some(5),
            Self::Heartbeat => Some(6),
            Self::Unrecognized(_) => None,
        }
    }

    /// Activation and capture both mean the trap fired
    pub fn is_capture(&self) -> bool {
        matches!(self, Self::Activation | Self::Capture)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Activation => "Activation",
            Self::Capture => "Capture",
            Self::BatteryLow => "BatteryLow",
            Self::Maintenance => "Maintenance",
            Self::Malfunction => "Malfunction",
            Self::Reset => "Reset",
            Self::Heartbeat => "Heartbeat",
            Self::Unrecognized(name) => name.as_str(),
        }
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "Activation" => Self::Activation,
            "Capture" => Self::Capture,
            "BatteryLow" => Self::BatteryLow,
            "Maintenance" => Self::Maintenance,
            "Malfunction" => Self::Malfunction,
            "Reset" => Self::Reset,
            "Heartbeat" => Self::Heartbeat,
            _ => Self::Unrecognized(name),
        }
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Unrecognized(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a message body could not be turned into an envelope
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope has no deviceId")]
    MissingDeviceId,
}

/// Telemetry event envelope as carried on the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub location_id: String,
    pub location_name: String,
    pub customer_name: String,
    pub battery_level: u8,
    /// Opaque, event-type-dependent document
    pub additional_data: serde_json::Value,
    pub is_processed: bool,
    pub processed_timestamp: Option<DateTime<Utc>>,
}

/// Lenient receive-side shape; producers send camelCase or PascalCase
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default, alias = "EventId")]
    event_id: Option<String>,
    #[serde(default, alias = "DeviceId")]
    device_id: Option<String>,
    #[serde(default, alias = "Timestamp", deserialize_with = "timestamp::lenient")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(alias = "EventType")]
    event_type: EventType,
    #[serde(default, alias = "LocationId")]
    location_id: Option<String>,
    #[serde(default, alias = "LocationName")]
    location_name: Option<String>,
    #[serde(default, alias = "CustomerName")]
    customer_name: Option<String>,
    #[serde(default, alias = "BatteryLevel")]
    battery_level: i64,
    #[serde(default, alias = "AdditionalData")]
    additional_data: serde_json::Value,
    #[serde(default, alias = "IsProcessed")]
    is_processed: bool,
    #[serde(default, alias = "ProcessedTimestamp", deserialize_with = "timestamp::lenient")]
    processed_timestamp: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    /// Decode a queue message body.
    ///
    /// An absent (or nil) event id is replaced with one derived from the
    /// body bytes, so every redelivery of the same message gets the same
    /// id. An absent timestamp becomes the arrival time.
    pub fn decode(body: &[u8], arrived_at: DateTime<Utc>) -> Result<Self, DecodeError> {
        let wire: WireEnvelope = serde_json::from_slice(body)?;

        let device_id = wire
            .device_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(DecodeError::MissingDeviceId)?;

        let event_id = match wire.event_id {
            Some(id) if !id.trim().is_empty() && !is_nil_uuid(&id) => id,
            _ => assigned_event_id(body).to_string(),
        };

        let battery_level = if (0..=100).contains(&wire.battery_level) {
            wire.battery_level as u8
        } else {
            warn!(
                "Battery level {} out of range for device {}, clamping",
                wire.battery_level, device_id
            );
            wire.battery_level.clamp(0, 100) as u8
        };

        Ok(Self {
            event_id,
            device_id,
            timestamp: wire.timestamp.unwrap_or(arrived_at),
            event_type: wire.event_type,
            location_id: wire.location_id.unwrap_or_default(),
            location_name: wire.location_name.unwrap_or_default(),
            customer_name: wire.customer_name.unwrap_or_default(),
            battery_level,
            additional_data: wire.additional_data,
            is_processed: wire.is_processed,
            processed_timestamp: wire.processed_timestamp,
        })
    }

    /// Encode the envelope in its wire form
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Routing attributes that accompany this envelope on the queue
    pub fn routing_attributes(&self) -> RoutingAttributes {
        RoutingAttributes {
            event_type: Some(self.event_type.to_string()),
            device_id: Some(self.device_id.clone()),
            location_id: Some(self.location_id.clone()),
        }
    }

    /// Stamp the envelope as handled by the pipeline
    pub fn mark_processed(&mut self, at: DateTime<Utc>) {
        self.is_processed = true;
        self.processed_timestamp = Some(at);
    }
}

/// Name-based (v5) id of a message body
pub fn assigned_event_id(body: &[u8]) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, body)
}

fn is_nil_uuid(id: &str) -> bool {
    Uuid::parse_str(id).map_or(false, |uuid| uuid.is_nil())
}

/// Redundant routing metadata readable without decoding the body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingAttributes {
    pub event_type: Option<String>,
    pub device_id: Option<String>,
    pub location_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn arrival() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap()
    }

    #[test]
    fn decode_then_encode_preserves_every_field() {
        let body = json!({
            "eventId": "5a0c8f3e-7d1f-4a8e-9a53-3b0a2d6c9e11",
            "deviceId": "TRAP-SB-001-01",
            "timestamp": "2024-03-05T14:12:09Z",
            "eventType": "Capture",
            "locationId": "LOC-SB-001",
            "locationName": "Starbucks Downtown",
            "customerName": "Starbucks",
            "batteryLevel": 64,
            "additionalData": {
                "trapType": "snap",
                "weight": 21.5,
                "count": 2,
                "armed": false,
                "notes": null,
                "sensors": { "ir": true }
            },
            "isProcessed": false,
            "processedTimestamp": null
        });
        let bytes = serde_json::to_vec(&body).unwrap();

        let envelope = EventEnvelope::decode(&bytes, arrival()).unwrap();
        assert_eq!(envelope.event_type, EventType::Capture);
        assert_eq!(envelope.battery_level, 64);

        let encoded: serde_json::Value =
            serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(encoded, body);
    }

    #[test]
    fn pascal_case_producer_payload_is_accepted() {
        let body = json!({
            "EventId": "5a0c8f3e-7d1f-4a8e-9a53-3b0a2d6c9e11",
            "DeviceId": "TRAP-MCD-002-03",
            "Timestamp": "2024-03-05T14:12:09.1234567",
            "EventType": "BatteryLow",
            "LocationId": "LOC-MCD-002",
            "BatteryLevel": 9,
            "AdditionalData": "{\"voltage\":2.1}",
            "IsProcessed": false,
            "ProcessedTimestamp": null
        });
        let envelope =
            EventEnvelope::decode(&serde_json::to_vec(&body).unwrap(), arrival()).unwrap();

        assert_eq!(envelope.device_id, "TRAP-MCD-002-03");
        assert_eq!(envelope.event_type, EventType::BatteryLow);
        assert_eq!(
            envelope.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 12, 9).unwrap()
                + chrono::Duration::nanoseconds(123_456_700)
        );
        assert_eq!(envelope.additional_data, json!("{\"voltage\":2.1}"));
    }

    #[test]
    fn missing_identity_is_assigned_on_receipt() {
        let body = br#"{"deviceId":"D1","eventType":"Heartbeat","batteryLevel":70}"#;
        let envelope = EventEnvelope::decode(body, arrival()).unwrap();

        assert!(Uuid::parse_str(&envelope.event_id).is_ok());
        assert_eq!(envelope.timestamp, arrival());
        assert_eq!(envelope.location_id, "");
        assert_eq!(envelope.additional_data, serde_json::Value::Null);
    }

    #[test]
    fn redelivered_body_without_id_keeps_its_assigned_id() {
        let body = br#"{"deviceId":"D1","eventType":"Capture","batteryLevel":70}"#;

        let first = EventEnvelope::decode(body, arrival()).unwrap();
        let again = EventEnvelope::decode(body, arrival() + chrono::Duration::minutes(5)).unwrap();
        assert_eq!(first.event_id, again.event_id);
        assert_eq!(first.event_id, assigned_event_id(body).to_string());

        let other = br#"{"deviceId":"D2","eventType":"Capture","batteryLevel":70}"#;
        assert_ne!(EventEnvelope::decode(other, arrival()).unwrap().event_id, first.event_id);
    }

    #[test]
    fn nil_event_id_is_replaced() {
        let body = br#"{"eventId":"00000000-0000-0000-0000-000000000000","deviceId":"D1","eventType":"Reset"}"#;
        let envelope = EventEnvelope::decode(body, arrival()).unwrap();
        assert_ne!(envelope.event_id, Uuid::nil().to_string());
    }

    #[test]
    fn unknown_event_type_survives_decoding() {
        let body = br#"{"deviceId":"D1","eventType":"DoorOpened","batteryLevel":50}"#;
        let envelope = EventEnvelope::decode(body, arrival()).unwrap();
        assert_eq!(envelope.event_type, EventType::Unrecognized("DoorOpened".into()));
        assert_eq!(envelope.event_type.index(), None);
        assert_eq!(envelope.event_type.to_string(), "DoorOpened");
    }

    #[test]
    fn battery_level_is_clamped() {
        let body = br#"{"deviceId":"D1","eventType":"Heartbeat","batteryLevel":140}"#;
        assert_eq!(EventEnvelope::decode(body, arrival()).unwrap().battery_level, 100);

        let body = br#"{"deviceId":"D1","eventType":"Heartbeat","batteryLevel":-3}"#;
        assert_eq!(EventEnvelope::decode(body, arrival()).unwrap().battery_level, 0);
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(matches!(
            EventEnvelope::decode(b"not json", arrival()),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            EventEnvelope::decode(br#"{"eventType":"Capture"}"#, arrival()),
            Err(DecodeError::MissingDeviceId)
        ));
        assert!(matches!(
            EventEnvelope::decode(br#"{"deviceId":"D1"}"#, arrival()),
            Err(DecodeError::Json(_))
        ));
        assert!(EventEnvelope::decode(
            br#"{"deviceId":"D1","eventType":"Capture","timestamp":"yesterday"}"#,
            arrival()
        )
        .is_err());
    }

    #[test]
    fn known_types_index_in_table_order() {
        for (position, event_type) in EventType::KNOWN.iter().enumerate() {
            assert_eq!(event_type.index(), Some(position));
            assert_eq!(EventType::from(event_type.to_string()), *event_type);
        }
    }

    #[test]
    fn routing_attributes_mirror_the_body() {
        let body = br#"{"deviceId":"D1","eventType":"Malfunction","locationId":"LOC-1"}"#;
        let attributes = EventEnvelope::decode(body, arrival()).unwrap().routing_attributes();
        assert_eq!(attributes.event_type.as_deref(), Some("Malfunction"));
        assert_eq!(attributes.device_id.as_deref(), Some("D1"));
        assert_eq!(attributes.location_id.as_deref(), Some("LOC-1"));
    }
}
