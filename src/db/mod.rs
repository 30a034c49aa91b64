use crate::config::DatabaseConfig;
use crate::error::Error;
use anyhow::Result;
use log::{info, warn};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;

pub mod migrations;
pub mod models;
pub mod repositories;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Postgres pool behind the processed-event table and the aggregate tables
pub struct AnalyticsDatabase {
    pub pool: Arc<PgPool>,
}

impl AnalyticsDatabase {
    /// Open the pool and, when `auto_migrate` is set, bring the analytics
    /// schema up to date before anything writes to it.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let target = redact_url(&config.url);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect to analytics database {}: {}", target, e)))?;

        info!(
            "Analytics database {} ready ({} connections max)",
            target, config.max_connections
        );

        let database = Self { pool: Arc::new(pool) };
        if config.auto_migrate {
            database.migrate().await?;
        }

        Ok(database)
    }

    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Analytics schema migration failed: {}", e)))?;
        info!("Analytics schema up to date");
        Ok(())
    }

    /// Round-trip a trivial query; `false` when the server does not answer
    pub async fn ping(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&*self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Analytics database did not answer: {}", e);
                false
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Analytics database pool closed");
    }
}

/// Connection URL with any password masked, for log lines
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_masked() {
        assert_eq!(
            redact_url("postgres://postgres:s3cret@db:5432/telemetry"),
            "postgres://postgres:***@db:5432/telemetry"
        );
    }

    #[test]
    fn urls_without_password_are_unchanged() {
        for url in [
            "postgres://reader@db/telemetry",
            "postgres://db/telemetry",
            "not a url",
        ] {
            assert_eq!(redact_url(url), url);
        }
    }
}
