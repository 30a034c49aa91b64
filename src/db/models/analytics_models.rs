use crate::pipeline::transformer::ProcessedRecord;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row of the `processed_events` table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedEventDb {
    pub event_id: String,
    pub event_type: String,
    pub device_id: String,
    pub location_id: String,
    pub location_name: String,
    pub customer_name: String,
    pub battery_level: i32,
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub data: Value,
}

impl From<ProcessedEventDb> for ProcessedRecord {
    fn from(db: ProcessedEventDb) -> Self {
        let data = match db.data {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Self {
            event_id: db.event_id,
            event_type: db.event_type,
            device_id: db.device_id,
            location_id: db.location_id,
            location_name: db.location_name,
            customer_name: db.customer_name,
            battery_level: db.battery_level,
            timestamp: db.timestamp,
            processed_at: db.processed_at,
            data,
        }
    }
}

impl From<&ProcessedRecord> for ProcessedEventDb {
    fn from(r: &ProcessedRecord) -> Self {
        Self {
            event_id: r.event_id.clone(),
            event_type: r.event_type.clone(),
            device_id: r.device_id.clone(),
            location_id: r.location_id.clone(),
            location_name: r.location_name.clone(),
            customer_name: r.customer_name.clone(),
            battery_level: r.battery_level,
            timestamp: r.timestamp,
            processed_at: r.processed_at,
            data: Value::Object(r.data.clone()),
        }
    }
}

/// Dimension a daily aggregate row is grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateDimension {
    Location,
    DeviceType,
    EventType,
}

impl std::fmt::Display for AggregateDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateDimension::Location => write!(f, "location"),
            AggregateDimension::DeviceType => write!(f, "device_type"),
            AggregateDimension::EventType => write!(f, "event_type"),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for AggregateDimension {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("text")
    }
}

impl sqlx::Encode<'_, sqlx::Postgres> for AggregateDimension {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let s = self.to_string();
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&s.as_str(), buf)
    }
}

/// Event counts for one dimension value over a trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub aggregate_date: NaiveDate,
    pub dimension: AggregateDimension,
    pub dimension_value: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub event_count: i64,
    pub device_count: i64,
    pub capture_count: i64,
    pub average_battery_level: f64,
}

/// Risk band of a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Band a score: Low below half the threshold, High from the threshold up
    pub fn classify(score: f64, threshold: f64) -> Self {
        if score >= threshold {
            RiskLevel::High
        } else if score >= threshold / 2.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "Low"),
            RiskLevel::Medium => write!(f, "Medium"),
            RiskLevel::High => write!(f, "High"),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for RiskLevel {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("text")
    }
}

impl sqlx::Encode<'_, sqlx::Postgres> for RiskLevel {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let s = self.to_string();
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&s.as_str(), buf)
    }
}

/// Risk score of one location over the risk window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRisk {
    pub location_id: String,
    pub location_name: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub needs_attention: bool,
    pub device_count: i64,
    pub recent_activity: i64,
    pub older_activity: i64,
    pub malfunction_count: i64,
    pub window_start: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_bands_split_at_half_threshold() {
        assert_eq!(RiskLevel::classify(0.0, 3.0), RiskLevel::Low);
        assert_eq!(RiskLevel::classify(1.49, 3.0), RiskLevel::Low);
        assert_eq!(RiskLevel::classify(1.5, 3.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::classify(2.99, 3.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::classify(3.0, 3.0), RiskLevel::High);
    }

    #[test]
    fn dimension_names_match_stored_text() {
        assert_eq!(AggregateDimension::DeviceType.to_string(), "device_type");
        assert_eq!(
            serde_json::to_value(AggregateDimension::EventType).unwrap(),
            serde_json::json!("event_type")
        );
    }
}
