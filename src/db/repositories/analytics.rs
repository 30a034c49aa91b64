use crate::db::models::{DailyAggregate, LocationRisk, ProcessedEventDb};
use crate::db::repositories::AnalyticsStore;
use crate::error::Error;
use crate::pipeline::transformer::ProcessedRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use sqlx::PgPool;
use std::sync::Arc;

/// Analytics repository backed by PostgreSQL
#[derive(Clone)]
pub struct AnalyticsRepository {
    pool: Arc<PgPool>,
}

impl AnalyticsRepository {
    /// Create a new analytics repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalyticsStore for AnalyticsRepository {
    async fn insert_processed(&self, record: &ProcessedRecord) -> Result<bool> {
        let row = ProcessedEventDb::from(record);

        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (
                event_id, event_type, device_id, location_id, location_name, customer_name,
                battery_level, timestamp, processed_at, data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&row.event_id)
        .bind(&row.event_type)
        .bind(&row.device_id)
        .bind(&row.location_id)
        .bind(&row.location_name)
        .bind(&row.customer_name)
        .bind(row.battery_level)
        .bind(row.timestamp)
        .bind(row.processed_at)
        .bind(&row.data)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to insert processed event: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn processed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessedRecord>> {
        let rows = sqlx::query_as::<_, ProcessedEventDb>(
            r#"
            SELECT event_id, event_type, device_id, location_id, location_name, customer_name,
                   battery_level, timestamp, processed_at, data
            FROM processed_events
            WHERE timestamp >= $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get processed events: {}", e)))?;

        Ok(rows.into_iter().map(ProcessedRecord::from).collect())
    }

    async fn save_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to start transaction: {}", e)))?;

        let mut written = 0;
        for aggregate in aggregates {
            let result = sqlx::query(
                r#"
                INSERT INTO daily_aggregates (
                    aggregate_date, dimension, dimension_value, window_start, window_end,
                    event_count, device_count, capture_count, average_battery_level
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (aggregate_date, dimension, dimension_value) DO UPDATE SET
                    window_start = EXCLUDED.window_start,
                    window_end = EXCLUDED.window_end,
                    event_count = EXCLUDED.event_count,
                    device_count = EXCLUDED.device_count,
                    capture_count = EXCLUDED.capture_count,
                    average_battery_level = EXCLUDED.average_battery_level
                "#,
            )
            .bind(aggregate.aggregate_date)
            .bind(aggregate.dimension)
            .bind(&aggregate.dimension_value)
            .bind(aggregate.window_start)
            .bind(aggregate.window_end)
            .bind(aggregate.event_count)
            .bind(aggregate.device_count)
            .bind(aggregate.capture_count)
            .bind(aggregate.average_battery_level)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to save daily aggregate: {}", e)))?;

            written += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit daily aggregates: {}", e)))?;

        debug!("Saved {} daily aggregate rows", written);
        Ok(written)
    }

    async fn save_location_risks(&self, risks: &[LocationRisk]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to start transaction: {}", e)))?;

        let mut written = 0;
        for risk in risks {
            let result = sqlx::query(
                r#"
                INSERT INTO location_risk_scores (
                    location_id, location_name, risk_score, risk_level, needs_attention,
                    device_count, recent_activity, older_activity, malfunction_count,
                    window_start, computed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (location_id) DO UPDATE SET
                    location_name = EXCLUDED.location_name,
                    risk_score = EXCLUDED.risk_score,
                    risk_level = EXCLUDED.risk_level,
                    needs_attention = EXCLUDED.needs_attention,
                    device_count = EXCLUDED.device_count,
                    recent_activity = EXCLUDED.recent_activity,
                    older_activity = EXCLUDED.older_activity,
                    malfunction_count = EXCLUDED.malfunction_count,
                    window_start = EXCLUDED.window_start,
                    computed_at = EXCLUDED.computed_at
                "#,
            )
            .bind(&risk.location_id)
            .bind(&risk.location_name)
            .bind(risk.risk_score)
            .bind(risk.risk_level)
            .bind(risk.needs_attention)
            .bind(risk.device_count)
            .bind(risk.recent_activity)
            .bind(risk.older_activity)
            .bind(risk.malfunction_count)
            .bind(risk.window_start)
            .bind(risk.computed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to save location risk: {}", e)))?;

            written += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit location risks: {}", e)))?;

        debug!("Saved {} location risk rows", written);
        Ok(written)
    }
}
