use crate::config::Config;
use crate::db::repositories::{AnalyticsRepository, AnalyticsStore};
use crate::db::AnalyticsDatabase;
use crate::error::Error;
use crate::messaging::broker::{create_message_broker, MessageBroker};
use crate::messaging::consumer::QueueConsumer;
use crate::pipeline::{
    DeviceStateReconciler, EventPipeline, EventTransformer, PeriodicAggregator,
};
use crate::registry::{DeviceRegistry, HttpDeviceRegistry};
use crate::storage::{BlobStore, FsBlobStore, RawArchiver};
use anyhow::Result;
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Owns the consumer and aggregator lifecycles and the resources they share
pub struct PipelineSupervisor {
    config: Config,
}

impl PipelineSupervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Acquire shared resources, run until `shutdown` resolves or a task
    /// dies, then drain and release everything.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let database = AnalyticsDatabase::connect(&self.config.database).await?;
        if !database.ping().await {
            warn!("Analytics database unreachable at startup, continuing");
        }

        let broker = match create_message_broker(self.config.message_broker.clone()).await {
            Ok(broker) => broker,
            Err(e) => {
                database.close().await;
                return Err(e);
            }
        };

        let result = self.supervise(&database, broker.clone(), shutdown).await;

        broker.close().await;
        database.close().await;

        result
    }

    async fn supervise<F>(&self, database: &AnalyticsDatabase, broker: Arc<MessageBroker>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let registry: Arc<dyn DeviceRegistry> = Arc::new(HttpDeviceRegistry::new(&self.config.registry)?);
        let analytics: Arc<dyn AnalyticsStore> = Arc::new(AnalyticsRepository::new(database.pool.clone()));
        let raw_store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&self.config.storage.raw_path));
        let processed_store: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::new(&self.config.storage.processed_path));

        let pipeline = Arc::new(EventPipeline::new(
            RawArchiver::new(raw_store),
            EventTransformer::new(processed_store, analytics.clone()),
            DeviceStateReconciler::new(registry.clone()),
        ));
        let consumer = QueueConsumer::new(broker, pipeline);

        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let consumer_token = token.clone();
        tasks.spawn(async move {
            consumer.run(consumer_token).await;
            "queue consumer"
        });

        if self.config.aggregation.enabled {
            let aggregator = PeriodicAggregator::new(&self.config.aggregation, analytics, registry);
            let aggregator_token = token.clone();
            tasks.spawn(async move {
                aggregator.run(aggregator_token).await;
                "periodic aggregator"
            });
        } else {
            info!("Periodic aggregation is disabled");
        }

        info!("Pipeline running");

        let grace = Duration::from_secs(self.config.pipeline.shutdown_grace_secs);
        wait_and_drain(tasks, token, shutdown, grace).await
    }
}

/// Wait for `shutdown` or the first task to exit, cancel the rest and give
/// them `grace` to finish. A task exiting before shutdown is an error.
pub async fn wait_and_drain<F>(
    mut tasks: JoinSet<&'static str>,
    token: CancellationToken,
    shutdown: F,
    grace: Duration,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let mut result = Ok(());

    tokio::select! {
        _ = shutdown => info!("Shutdown requested, draining in-flight work"),
        Some(exited) = tasks.join_next() => {
            let reason = match exited {
                Ok(name) => format!("{} exited unexpectedly", name),
                Err(e) => format!("pipeline task failed: {}", e),
            };
            error!("{}, shutting down", reason);
            result = Err(Error::Internal(reason).into());
        }
    }

    token.cancel();

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(name) => info!("{} stopped", name),
                Err(e) => error!("Pipeline task failed during shutdown: {}", e),
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            "Grace period of {} seconds elapsed, aborting remaining tasks",
            grace.as_secs()
        );
        tasks.shutdown().await;
    }

    result
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error setting up signal handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Error setting up SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received shutdown signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
