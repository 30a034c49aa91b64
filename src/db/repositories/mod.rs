use crate::db::models::{DailyAggregate, LocationRisk};
use crate::pipeline::transformer::ProcessedRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod analytics;

pub use analytics::AnalyticsRepository;

/// Analytics persistence used by the transformer and the periodic jobs
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Insert a processed record; `false` when the event was already stored
    async fn insert_processed(&self, record: &ProcessedRecord) -> Result<bool>;

    /// Processed records whose event timestamp is at or after `cutoff`
    async fn processed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessedRecord>>;

    /// Upsert daily aggregate rows, returning how many were written
    async fn save_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<u64>;

    /// Upsert location risk rows, returning how many were written
    async fn save_location_risks(&self, risks: &[LocationRisk]) -> Result<u64>;
}
