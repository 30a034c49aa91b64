use crate::db::models::{AggregateDimension, DailyAggregate, LocationRisk, RiskLevel};
use crate::db::repositories::AnalyticsStore;
use crate::messaging::event::EventType;
use crate::pipeline::transformer::ProcessedRecord;
use crate::registry::{DeviceRegistry, DeviceType};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

const UNKNOWN: &str = "Unknown";

/// Weight of a capture inside the most recent 24 hours
const RECENT_WEIGHT: f64 = 1.0;
/// Weight of an older capture inside the risk window
const OLDER_WEIGHT: f64 = 0.5;
/// Weight of each malfunction inside the risk window
const MALFUNCTION_WEIGHT: f64 = 0.25;

/// One recurring batch job of the periodic aggregator
#[async_trait]
pub trait AggregationJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, now: DateTime<Utc>) -> Result<()>;
}

#[derive(Default)]
struct Tally {
    events: i64,
    devices: HashSet<String>,
    captures: i64,
    battery_total: i64,
}

/// Roll processed records up by location, device type and event type
pub fn daily_aggregates(
    records: &[ProcessedRecord],
    device_types: &HashMap<String, DeviceType>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<DailyAggregate> {
    let mut tallies: BTreeMap<(AggregateDimension, String), Tally> = BTreeMap::new();

    for record in records
        .iter()
        .filter(|r| r.timestamp >= window_start && r.timestamp <= window_end)
    {
        let location = if record.location_id.is_empty() {
            UNKNOWN.to_string()
        } else {
            record.location_id.clone()
        };
        let device_type = device_types
            .get(&record.device_id)
            .copied()
            .unwrap_or_default()
            .as_str()
            .to_string();
        let is_capture = EventType::from(record.event_type.clone()).is_capture();

        for key in [
            (AggregateDimension::Location, location),
            (AggregateDimension::DeviceType, device_type),
            (AggregateDimension::EventType, record.event_type.clone()),
        ] {
            let tally = tallies.entry(key).or_default();
            tally.events += 1;
            tally.devices.insert(record.device_id.clone());
            tally.battery_total += i64::from(record.battery_level);
            if is_capture {
                tally.captures += 1;
            }
        }
    }

    tallies
        .into_iter()
        .map(|((dimension, dimension_value), tally)| DailyAggregate {
            aggregate_date: window_end.date_naive(),
            dimension,
            dimension_value,
            window_start,
            window_end,
            event_count: tally.events,
            device_count: tally.devices.len() as i64,
            capture_count: tally.captures,
            average_battery_level: tally.battery_total as f64 / tally.events as f64,
        })
        .collect()
}

#[derive(Default)]
struct LocationActivity {
    name: String,
    devices: HashSet<String>,
    recent: i64,
    older: i64,
    malfunctions: i64,
}

/// Score every location that reported inside the risk window.
///
/// Captures and activations of the last 24 hours count fully, older ones
/// half, malfunctions a quarter; the sum is spread over the devices that
/// reported from the location.
pub fn location_risks(
    records: &[ProcessedRecord],
    now: DateTime<Utc>,
    window_start: DateTime<Utc>,
    attention_threshold: f64,
) -> Vec<LocationRisk> {
    let recent_cutoff = now - Duration::hours(24);
    let mut locations: BTreeMap<String, LocationActivity> = BTreeMap::new();

    for record in records
        .iter()
        .filter(|r| r.timestamp >= window_start && r.timestamp <= now)
    {
        if record.location_id.is_empty() {
            continue;
        }

        let activity = locations.entry(record.location_id.clone()).or_default();
        if !record.location_name.is_empty() {
            activity.name = record.location_name.clone();
        }
        activity.devices.insert(record.device_id.clone());

        let event_type = EventType::from(record.event_type.clone());
        if event_type.is_capture() {
            if record.timestamp >= recent_cutoff {
                activity.recent += 1;
            } else {
                activity.older += 1;
            }
        } else if event_type == EventType::Malfunction {
            activity.malfunctions += 1;
        }
    }

    locations
        .into_iter()
        .map(|(location_id, activity)| {
            let weighted = activity.recent as f64 * RECENT_WEIGHT
                + activity.older as f64 * OLDER_WEIGHT
                + activity.malfunctions as f64 * MALFUNCTION_WEIGHT;
            let risk_score = weighted / activity.devices.len() as f64;
            let risk_level = RiskLevel::classify(risk_score, attention_threshold);

            LocationRisk {
                location_id,
                location_name: activity.name,
                risk_score,
                risk_level,
                needs_attention: risk_level == RiskLevel::High,
                device_count: activity.devices.len() as i64,
                recent_activity: activity.recent,
                older_activity: activity.older,
                malfunction_count: activity.malfunctions,
                window_start,
                computed_at: now,
            }
        })
        .collect()
}

/// Trailing-window rollup of processed events
pub struct DailyAggregationJob {
    analytics: Arc<dyn AnalyticsStore>,
    registry: Arc<dyn DeviceRegistry>,
    window: Duration,
}

impl DailyAggregationJob {
    pub fn new(analytics: Arc<dyn AnalyticsStore>, registry: Arc<dyn DeviceRegistry>, window_hours: i64) -> Self {
        Self {
            analytics,
            registry,
            window: Duration::hours(window_hours),
        }
    }
}

#[async_trait]
impl AggregationJob for DailyAggregationJob {
    fn name(&self) -> &'static str {
        "daily aggregation"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        let window_start = now - self.window;
        let records = self.analytics.processed_since(window_start).await?;

        // Device types only label the rollup; a registry outage must not void it
        let device_types: HashMap<String, DeviceType> = match self.registry.list_devices().await {
            Ok(devices) => devices
                .into_iter()
                .map(|device| (device.device_id, device.device_type))
                .collect(),
            Err(e) => {
                warn!("Could not list devices, device types reported as {}: {}", UNKNOWN, e);
                HashMap::new()
            }
        };

        let aggregates = daily_aggregates(&records, &device_types, window_start, now);
        let saved = self.analytics.save_daily_aggregates(&aggregates).await?;

        info!(
            "Daily aggregation covered {} events, saved {} aggregate rows",
            records.len(),
            saved
        );
        Ok(())
    }
}

/// Per-location risk scoring
pub struct LocationRiskJob {
    analytics: Arc<dyn AnalyticsStore>,
    window: Duration,
    attention_threshold: f64,
}

impl LocationRiskJob {
    pub fn new(analytics: Arc<dyn AnalyticsStore>, window_hours: i64, attention_threshold: f64) -> Self {
        Self {
            analytics,
            window: Duration::hours(window_hours),
            attention_threshold,
        }
    }
}

#[async_trait]
impl AggregationJob for LocationRiskJob {
    fn name(&self) -> &'static str {
        "location risk analysis"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        let window_start = now - self.window;
        let records = self.analytics.processed_since(window_start).await?;

        let risks = location_risks(&records, now, window_start, self.attention_threshold);
        for risk in risks.iter().filter(|r| r.needs_attention) {
            warn!(
                "Location {} ({}) needs attention: risk score {:.2}",
                risk.location_id, risk.location_name, risk.risk_score
            );
        }

        let saved = self.analytics.save_location_risks(&risks).await?;
        info!("Location risk analysis scored {} locations", saved);
        Ok(())
    }
}
