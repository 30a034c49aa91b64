pub mod analytics_models;

pub use analytics_models::{AggregateDimension, DailyAggregate, LocationRisk, ProcessedEventDb, RiskLevel};
