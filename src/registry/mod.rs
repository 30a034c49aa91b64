use crate::messaging::event::EventEnvelope;
use anyhow::Result;
use async_trait::async_trait;

pub mod http;
pub mod models;

pub use http::HttpDeviceRegistry;
pub use models::{DeviceRecord, DeviceStatus, DeviceType};

/// Request/response port onto the Device/Event Registry.
///
/// Writes are compare-and-swap: when a record carries a `version`, the
/// Registry must reject the write with `Error::Conflict` if the stored
/// record has moved on since it was read.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Fetch a device; `None` when the Registry does not know it
    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Replace a device record.
    ///
    /// Fails with `Error::BadRequest` when `record.device_id` differs from
    /// `device_id`, `Error::NotFound` for unknown devices and
    /// `Error::Conflict` on a concurrent modification.
    async fn put_device(&self, device_id: &str, record: &DeviceRecord) -> Result<()>;

    /// All registered devices
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Replace the Registry's copy of an event (used to flag it processed)
    async fn put_event(&self, envelope: &EventEnvelope) -> Result<()>;
}
