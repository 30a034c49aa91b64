use crate::config::RegistryConfig;
use crate::error::Error;
use crate::messaging::event::EventEnvelope;
use crate::registry::{DeviceRecord, DeviceRegistry};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{ETAG, IF_MATCH};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

/// Registry client speaking the REST surface (`devices/{id}`, `events/{id}`)
#[derive(Clone)]
pub struct HttpDeviceRegistry {
    client: Client,
    base_url: Url,
}

impl HttpDeviceRegistry {
    /// Create a new registry client
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("Invalid registry base URL: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Registry(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    /// Build `{base}/{segments...}`, percent-encoding each segment
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("Registry URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Map a write response status onto the port's error contract
fn write_outcome(status: StatusCode, what: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }

    let err = match status {
        StatusCode::NOT_FOUND => Error::NotFound(what.to_string()),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            Error::Conflict(format!("{} was modified concurrently", what))
        }
        StatusCode::BAD_REQUEST => Error::BadRequest(format!("Registry rejected {}", what)),
        other => Error::Registry(format!("Writing {} returned {}", what, other)),
    };
    Err(err.into())
}

#[async_trait]
impl DeviceRegistry for HttpDeviceRegistry {
    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let url = self.endpoint(&["devices", device_id])?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Registry(format!("Failed to fetch device {}: {}", device_id, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(
                    Error::Registry(format!("Fetching device {} returned {}", device_id, status)).into(),
                )
            }
            _ => {}
        }

        let version = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut record: DeviceRecord = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Invalid device record for {}: {}", device_id, e)))?;
        record.version = version;

        Ok(Some(record))
    }

    async fn put_device(&self, device_id: &str, record: &DeviceRecord) -> Result<()> {
        if record.device_id != device_id {
            return Err(Error::BadRequest(format!(
                "ID mismatch: {} vs {}",
                device_id, record.device_id
            ))
            .into());
        }

        let url = self.endpoint(&["devices", device_id])?;
        let mut request = self.client.put(url).json(record);
        match &record.version {
            Some(version) => request = request.header(IF_MATCH, version.as_str()),
            None => debug!("Device {} has no version, writing unconditionally", device_id),
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Registry(format!("Failed to write device {}: {}", device_id, e)))?;

        write_outcome(response.status(), &format!("device {}", device_id))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let url = self.endpoint(&["devices"])?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Registry(format!("Failed to list devices: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Registry(format!("Listing devices returned {}", status)).into());
        }

        let devices: Vec<DeviceRecord> = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Invalid device list: {}", e)))?;

        Ok(devices)
    }

    async fn put_event(&self, envelope: &EventEnvelope) -> Result<()> {
        let url = self.endpoint(&["events", &envelope.event_id])?;

        let response = self
            .client
            .put(url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                Error::Registry(format!("Failed to write event {}: {}", envelope.event_id, e))
            })?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            warn!("Registry rejected event {} as malformed", envelope.event_id);
        }
        write_outcome(status, &format!("event {}", envelope.event_id))
    }
}
