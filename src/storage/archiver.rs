use crate::storage::{sanitize_segment, BlobStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;
use uuid::Uuid;

/// Writes verbatim envelopes into hour-partitioned cold storage
#[derive(Clone)]
pub struct RawArchiver {
    store: Arc<dyn BlobStore>,
}

impl RawArchiver {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Archive the exact received payload and return the path it was stored under.
    ///
    /// Every call gets a fresh archive id, so a redelivered message lands
    /// next to its earlier copy instead of replacing it.
    pub async fn archive(
        &self,
        device_id: &str,
        payload: &[u8],
        arrived_at: DateTime<Utc>,
    ) -> Result<String> {
        let path = archive_path(arrived_at, device_id, Uuid::new_v4());

        self.store
            .put(&path, payload)
            .await
            .with_context(|| format!("Failed to archive raw envelope for device {}", device_id))?;

        debug!("Archived raw envelope for device {} at {}", device_id, path);
        Ok(path)
    }
}

/// `{yyyy}/{mm}/{dd}/{hh}/{deviceId}/{archiveId}.json`
pub fn archive_path(arrived_at: DateTime<Utc>, device_id: &str, archive_id: Uuid) -> String {
    format!(
        "{}/{}/{}.json",
        arrived_at.format("%Y/%m/%d/%H"),
        sanitize_segment(device_id),
        archive_id
    )
}
