//! Dashboard query runner
//!
//! Loads one site's events from SQLite, applies segments and tab selections,
//! waits for the engine to settle and prints the snapshot as JSON.
//!
//! Usage:
//!   cargo run --bin dashboard -- --site <SITE_ID> [--hours 24]
//!       [--segment country=US] [--segment property:plan=pro]
//!       [--tab entry_pages] [--property plan]
//!
//! Environment variables:
//!   ANALYTICS_DB_PATH - SQLite database path (default: data/analytics.db)
//!   ANALYTICS_SCHEMA_DIR - schema directory (default: sql)
//!   BREAKDOWN_ROW_LIMIT, FLOW_MIN_TRANSITIONS, FLOW_MAX_EDGES,
//!   HOURLY_GRAIN_MAX_HOURS, ENGINE_COMMAND_BUFFER

use chrono::Utc;
use rusqlite::Connection;
use sitepulse::engine::{
    run_schema_migrations, BreakdownTab, DatasetSelection, EngineStatus, Orchestrator,
    RawDataSource, Segment, SqliteDataSource, TimeRange,
};
use sitepulse::EngineConfig;
use std::sync::Arc;

#[derive(Debug)]
struct DashboardArgs {
    site_id: String,
    hours: i64,
    segments: Vec<Segment>,
    tabs: Vec<BreakdownTab>,
    property: Option<String>,
}

/// Values following every occurrence of `flag`
fn flag_values(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}

/// `kind=value`, or `property:key=value` for custom properties
fn parse_segment(raw: &str) -> Result<Segment, Box<dyn std::error::Error>> {
    let (kind, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid segment '{}', expected kind=value", raw))?;

    match kind.strip_prefix("property:") {
        Some(key) => Ok(Segment::property(key, value)),
        None => Ok(Segment::new(kind, value)),
    }
}

impl DashboardArgs {
    fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = std::env::args().collect();

        let site_id = flag_values(&args, "--site")
            .pop()
            .ok_or("Missing --site argument. Usage: dashboard --site <SITE_ID>")?;

        let hours = match flag_values(&args, "--hours").pop() {
            Some(raw) => raw
                .parse()
                .map_err(|_| format!("Invalid --hours value: {}", raw))?,
            None => 24,
        };

        let segments = flag_values(&args, "--segment")
            .iter()
            .map(|raw| parse_segment(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let tabs = flag_values(&args, "--tab")
            .iter()
            .map(|raw| raw.parse::<BreakdownTab>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            site_id,
            hours,
            segments,
            tabs,
            property: flag_values(&args, "--property").pop(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let config = EngineConfig::from_env();
    let args = DashboardArgs::from_args()?;

    log::info!("🚀 Dashboard query");
    log::info!("   ├─ Database: {}", config.db_path);
    log::info!("   ├─ Site: {} (last {}h)", args.site_id, args.hours);
    log::info!("   └─ Segments: {}", args.segments.len());

    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    let source: Arc<dyn RawDataSource> = Arc::new(SqliteDataSource::from_connection(conn));

    let selection = DatasetSelection::new(&args.site_id, TimeRange::last_hours(Utc::now(), args.hours));
    let (handle, task) = Orchestrator::spawn(source, &config, Some(selection));

    for segment in args.segments {
        handle.add_segment(segment).await?;
    }
    for tab in args.tabs {
        handle.select_tab(tab).await?;
    }
    if let Some(key) = args.property {
        handle.select_property(key).await?;
    }

    let snapshot = handle.wait_for_idle().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    handle.shutdown().await?;
    task.await?;

    if snapshot.status == EngineStatus::Error {
        log::error!(
            "❌ Engine finished with error: {}",
            snapshot.error.as_deref().unwrap_or("unknown")
        );
        std::process::exit(1);
    }

    log::info!("✅ Done");
    Ok(())
}
