//! Engine configuration from environment variables

use crate::engine::flow::FlowLimits;
use std::env;

/// Configuration for the engine runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `.sql` schema files
    pub schema_dir: String,

    /// Rows kept per breakdown card
    pub breakdown_row_limit: usize,

    /// Flow edges seen fewer times than this are dropped
    pub flow_min_transitions: usize,

    pub flow_max_edges: usize,

    /// Ranges up to this many hours chart by hour, longer ones by day
    pub hourly_grain_max_hours: i64,

    /// Command channel buffer size
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/analytics.db".to_string(),
            schema_dir: "sql".to_string(),
            breakdown_row_limit: 10,
            flow_min_transitions: 2,
            flow_max_edges: 50,
            hourly_grain_max_hours: 24,
            command_buffer: 64,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ANALYTICS_DB_PATH` (default: data/analytics.db)
    /// - `ANALYTICS_SCHEMA_DIR` (default: sql)
    /// - `BREAKDOWN_ROW_LIMIT` (default: 10)
    /// - `FLOW_MIN_TRANSITIONS` (default: 2)
    /// - `FLOW_MAX_EDGES` (default: 50)
    /// - `HOURLY_GRAIN_MAX_HOURS` (default: 24)
    /// - `ENGINE_COMMAND_BUFFER` (default: 64)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: env::var("ANALYTICS_DB_PATH").unwrap_or(defaults.db_path),

            schema_dir: env::var("ANALYTICS_SCHEMA_DIR").unwrap_or(defaults.schema_dir),

            breakdown_row_limit: env::var("BREAKDOWN_ROW_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.breakdown_row_limit),

            flow_min_transitions: env::var("FLOW_MIN_TRANSITIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.flow_min_transitions),

            flow_max_edges: env::var("FLOW_MAX_EDGES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.flow_max_edges),

            hourly_grain_max_hours: env::var("HOURLY_GRAIN_MAX_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.hourly_grain_max_hours),

            command_buffer: env::var("ENGINE_COMMAND_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.command_buffer),
        }
    }

    pub fn flow_limits(&self) -> FlowLimits {
        FlowLimits {
            min_transitions: self.flow_min_transitions,
            max_edges: self.flow_max_edges,
        }
    }
}
