use anyhow::Result;
use log::info;
use sqlx::{Executor, PgPool};

/// Embedded migration scripts; every script is safe to re-run
const MIGRATIONS: &[(&str, &str)] = &[
    ("add_indexes.sql", include_str!("sql/add_indexes.sql")),
    ("001_processed_events.sql", include_str!("sql/001_processed_events.sql")),
    ("002_daily_aggregates.sql", include_str!("sql/002_daily_aggregates.sql")),
    ("003_location_risk_scores.sql", include_str!("sql/003_location_risk_scores.sql")),
];

/// Numbered scripts run in numeric order, index scripts after all tables
fn order_value(name: &str) -> usize {
    if name.starts_with("add_indexes") {
        return 2000;
    }
    name.split('_')
        .next()
        .and_then(|prefix| prefix.parse::<usize>().ok())
        .unwrap_or(usize::MAX)
}

fn ordered() -> Vec<(&'static str, &'static str)> {
    let mut scripts = MIGRATIONS.to_vec();
    scripts.sort_by_key(|(name, _)| order_value(name));
    scripts
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for (name, sql) in ordered() {
        pool.execute(sql).await?;
        info!("Applied migration: {}", name);
    }

    Ok(())
}
