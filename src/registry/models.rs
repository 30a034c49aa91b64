use crate::utils::timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Operational status of a field device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "NameOrOrdinal")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
    Alert,
    Triggered,
    LowBattery,
    Offline,
}

impl DeviceStatus {
    /// Every status, in declaration (and ordinal) order
    pub const ALL: [DeviceStatus; 7] = [
        DeviceStatus::Active,
        DeviceStatus::Inactive,
        DeviceStatus::Maintenance,
        DeviceStatus::Alert,
        DeviceStatus::Triggered,
        DeviceStatus::LowBattery,
        DeviceStatus::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
            Self::Maintenance => "Maintenance",
            Self::Alert => "Alert",
            Self::Triggered => "Triggered",
            Self::LowBattery => "LowBattery",
            Self::Offline => "Offline",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == name)
    }
}

impl Display for DeviceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registries written against .NET defaults send enums as ordinals
#[derive(Deserialize)]
#[serde(untagged)]
enum NameOrOrdinal {
    Name(String),
    Ordinal(u64),
}

impl TryFrom<NameOrOrdinal> for DeviceStatus {
    type Error = String;

    fn try_from(value: NameOrOrdinal) -> Result<Self, Self::Error> {
        match value {
            NameOrOrdinal::Name(name) => {
                Self::from_name(&name).ok_or_else(|| format!("unknown device status: {}", name))
            }
            NameOrOrdinal::Ordinal(n) => Self::ALL
                .get(n as usize)
                .copied()
                .ok_or_else(|| format!("unknown device status ordinal: {}", n)),
        }
    }
}

/// Kind of field device; only consulted for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "NameOrOrdinal")]
pub enum DeviceType {
    MouseTrap,
    RatTrap,
    InsectMonitor,
    TemperatureSensor,
    HumiditySensor,
    #[default]
    Unknown,
}

impl DeviceType {
    const KNOWN: [DeviceType; 5] = [
        DeviceType::MouseTrap,
        DeviceType::RatTrap,
        DeviceType::InsectMonitor,
        DeviceType::TemperatureSensor,
        DeviceType::HumiditySensor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MouseTrap => "MouseTrap",
            Self::RatTrap => "RatTrap",
            Self::InsectMonitor => "InsectMonitor",
            Self::TemperatureSensor => "TemperatureSensor",
            Self::HumiditySensor => "HumiditySensor",
            Self::Unknown => "Unknown",
        }
    }
}

impl From<NameOrOrdinal> for DeviceType {
    fn from(value: NameOrOrdinal) -> Self {
        match value {
            NameOrOrdinal::Name(name) => Self::KNOWN
                .into_iter()
                .find(|kind| kind.as_str() == name)
                .unwrap_or(Self::Unknown),
            NameOrOrdinal::Ordinal(n) => Self::KNOWN.get(n as usize).copied().unwrap_or(Self::Unknown),
        }
    }
}

/// Device record as held by the Registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub location_id: String,
    #[serde(default)]
    pub location_name: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default, deserialize_with = "timestamp::lenient")]
    pub installation_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::lenient")]
    pub last_maintenance_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::lenient")]
    pub last_communication_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub battery_level: u8,
    pub status: DeviceStatus,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub is_active: bool,
    /// Registry version token (ETag) the record was read at
    #[serde(skip)]
    pub version: Option<String>,
    /// Fields this pipeline does not model, carried through write-back untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceRecord {
    /// A minimal record, mostly useful for seeding registries
    pub fn new(device_id: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: String::new(),
            device_type: DeviceType::Unknown,
            location_id: String::new(),
            location_name: String::new(),
            customer_name: String::new(),
            latitude: 0.0,
            longitude: 0.0,
            installation_date: None,
            last_maintenance_date: None,
            last_communication_date: None,
            battery_level: 0,
            status,
            firmware_version: String::new(),
            is_active: true,
            version: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_accepts_names_and_ordinals() {
        let by_name: DeviceStatus = serde_json::from_value(json!("LowBattery")).unwrap();
        let by_ordinal: DeviceStatus = serde_json::from_value(json!(5)).unwrap();
        assert_eq!(by_name, DeviceStatus::LowBattery);
        assert_eq!(by_ordinal, DeviceStatus::LowBattery);
        assert!(serde_json::from_value::<DeviceStatus>(json!("Sleeping")).is_err());
        assert!(serde_json::from_value::<DeviceStatus>(json!(7)).is_err());
        assert_eq!(serde_json::to_value(DeviceStatus::Alert).unwrap(), json!("Alert"));
    }

    #[test]
    fn registry_record_round_trips_unmodelled_fields() {
        let body = json!({
            "deviceId": "TRAP-SB-001-01",
            "deviceName": "Back door trap",
            "deviceType": 0,
            "locationId": "LOC-SB-001",
            "installationDate": "2023-01-10T00:00:00",
            "lastMaintenanceDate": "2024-02-01T09:00:00Z",
            "lastCommunicationDate": null,
            "batteryLevel": 80,
            "status": "Active",
            "isActive": true,
            "warrantyExpires": "2026-01-01"
        });

        let record: DeviceRecord = serde_json::from_value(body).unwrap();
        assert_eq!(record.device_type, DeviceType::MouseTrap);
        assert_eq!(record.status, DeviceStatus::Active);
        assert!(record.last_communication_date.is_none());
        assert_eq!(record.extra.get("warrantyExpires"), Some(&json!("2026-01-01")));

        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["warrantyExpires"], json!("2026-01-01"));
        assert_eq!(written["deviceType"], json!("MouseTrap"));
        assert!(written.get("version").is_none());
    }

    #[test]
    fn unknown_device_types_do_not_fail_decoding() {
        let kind: DeviceType = serde_json::from_value(json!("BirdFeeder")).unwrap();
        assert_eq!(kind, DeviceType::Unknown);
    }
}
