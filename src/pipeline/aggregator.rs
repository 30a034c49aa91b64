use crate::config::AggregationConfig;
use crate::db::repositories::AnalyticsStore;
use crate::pipeline::jobs::{AggregationJob, DailyAggregationJob, LocationRiskJob};
use crate::registry::DeviceRegistry;
use chrono::Utc;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs the aggregation jobs on a fixed interval, independent of message flow
pub struct PeriodicAggregator {
    jobs: Vec<Arc<dyn AggregationJob>>,
    interval: Duration,
    error_backoff: Duration,
}

impl PeriodicAggregator {
    /// Aggregator with the daily rollup and location risk jobs
    pub fn new(
        config: &AggregationConfig,
        analytics: Arc<dyn AnalyticsStore>,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Self {
        let jobs: Vec<Arc<dyn AggregationJob>> = vec![
            Arc::new(DailyAggregationJob::new(
                analytics.clone(),
                registry,
                config.daily_window_hours,
            )),
            Arc::new(LocationRiskJob::new(
                analytics,
                config.risk_window_hours,
                config.attention_threshold,
            )),
        ];

        Self::with_jobs(jobs, config.interval(), config.error_backoff())
    }

    pub fn with_jobs(jobs: Vec<Arc<dyn AggregationJob>>, interval: Duration, error_backoff: Duration) -> Self {
        Self {
            jobs,
            interval,
            error_backoff,
        }
    }

    /// Run every job once; `true` when at least one of them failed
    async fn run_round(&self, token: &CancellationToken) -> bool {
        let mut failed = false;

        for job in &self.jobs {
            if token.is_cancelled() {
                break;
            }

            debug!("Running {}", job.name());
            if let Err(e) = job.run(Utc::now()).await {
                error!("Error running {}: {:#}", job.name(), e);
                failed = true;
            }
        }

        failed
    }

    /// Run until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Starting periodic aggregator with {} jobs every {} seconds",
            self.jobs.len(),
            self.interval.as_secs()
        );

        while !token.is_cancelled() {
            let pause = if self.run_round(&token).await {
                info!("Aggregation round failed, retrying in {} seconds", self.error_backoff.as_secs());
                self.error_backoff
            } else {
                self.interval
            };

            if token.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Periodic aggregator stopped");
    }
}
