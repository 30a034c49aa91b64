pub mod config;
pub mod db;
pub mod error;
pub mod messaging;
pub mod pipeline;
pub mod registry;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main components for easier use
pub use error::Error;
pub use messaging::{EventEnvelope, EventType, QueueConsumer};
pub use pipeline::{
    DeviceStateReconciler, EventPipeline, EventTransformer, PeriodicAggregator, PipelineSupervisor,
};
pub use storage::RawArchiver;
