//! Core data types for the hydration and aggregation engine
//!
//! Two raw tiers arrive from storage:
//! - `RawInitialEvent` - first event of a session, carries the session context
//! - `RawDeltaEvent` - every later event, event-scoped fields only
//!
//! Hydration joins them into `HydratedEvent` rows that all point at one shared
//! `SessionContext` per session.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Event name used for page views
pub const PAGE_VIEW: &str = "page_view";

/// String-keyed attribute map (session context, custom properties)
pub type AttributeMap = BTreeMap<String, Value>;

/// First event of a session, carrying every session-scoped attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInitialEvent {
    pub event: String,
    pub pathname: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: AttributeMap,
    /// Session-scoped context (geo, device, referrer, screen, campaign)
    #[serde(default)]
    pub context: AttributeMap,
}

/// Any later event of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDeltaEvent {
    pub event: String,
    pub pathname: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: AttributeMap,
}

/// Session-scoped column names actually present in a deployment
///
/// Privacy tiers strip some columns (e.g. no `city`), so nothing downstream
/// assumes a fixed set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub session_attributes: Vec<String>,
}

impl AttributeSchema {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            session_attributes: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has(&self, column: &str) -> bool {
        self.session_attributes.iter().any(|c| c == column)
    }
}

/// Result of a raw data fetch for one (site, range) pair
#[derive(Debug, Clone, Default)]
pub struct RawDataset {
    pub initial_events: Vec<RawInitialEvent>,
    pub delta_events: Vec<RawDeltaEvent>,
    pub schema: AttributeSchema,
}

/// Session-scoped attributes shared by every row of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionContext {
    pub session_id: String,
    pub attributes: AttributeMap,
    /// Pathname of the first page_view in the session
    pub entry_page: Option<String>,
    /// Pathname of the last page_view in the session
    pub exit_page: Option<String>,
}

/// One fully-populated logical event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HydratedEvent {
    pub event: String,
    pub pathname: String,
    pub timestamp: DateTime<Utc>,
    pub properties: AttributeMap,
    /// True for the row derived from the session's initial event
    pub is_initial: bool,
    pub session: Arc<SessionContext>,
}

impl HydratedEvent {
    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn is_page_view(&self) -> bool {
        self.event == PAGE_VIEW
    }

    /// Look up a column by name, event-scoped columns first
    ///
    /// Returns `None` when the column is absent from this deployment's schema;
    /// `Some(Value::Null)` is a present-but-empty attribute.
    pub fn column(&self, name: &str) -> Option<Value> {
        match name {
            "event" => Some(Value::String(self.event.clone())),
            "pathname" | "page" => Some(Value::String(self.pathname.clone())),
            "session_id" => Some(Value::String(self.session.session_id.clone())),
            "timestamp" => Some(Value::String(self.timestamp.to_rfc3339())),
            "entry_page" => Some(opt_string(&self.session.entry_page)),
            "exit_page" => Some(opt_string(&self.session.exit_page)),
            other => self.session.attributes.get(other).cloned(),
        }
    }

    /// Column rendered as text, `None` for absent or null
    pub fn column_text(&self, name: &str) -> Option<String> {
        self.column(name).as_ref().and_then(value_text)
    }

    /// Custom property rendered as text
    pub fn property_text(&self, key: &str) -> Option<String> {
        self.properties.get(key).and_then(value_text)
    }
}

fn opt_string(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

/// Render a JSON value the way it is compared and displayed
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => {
            // 1920.0 and 1920 must both read "1920"
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    return Some(format!("{}", f as i64));
                }
            }
            Some(n.to_string())
        }
        other => Some(other.to_string()),
    }
}

/// Output of the hydration join
#[derive(Debug, Clone, Default)]
pub struct HydratedTable {
    pub rows: Vec<HydratedEvent>,
    pub report: HydrationReport,
}

/// Upstream inconsistencies observed while hydrating
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HydrationReport {
    pub sessions: usize,
    pub rows: usize,
    /// Sessions that only had delta events (dropped)
    pub orphan_sessions: usize,
    /// Delta events belonging to orphan sessions (dropped)
    pub orphan_events: usize,
    /// Extra initial events for an already-seen session (dropped)
    pub duplicate_initial_events: usize,
}

/// Half-open instant range `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Range ending at `to` and covering the preceding `hours`
    pub fn last_hours(to: DateTime<Utc>, hours: i64) -> Self {
        Self {
            from: to - Duration::hours(hours),
            to,
        }
    }

    pub fn span(&self) -> Duration {
        self.to - self.from
    }

    pub fn is_valid(&self) -> bool {
        self.from <= self.to
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts < self.to
    }
}

/// Identity of the dataset the engine is looking at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetSelection {
    pub site_id: String,
    pub range: TimeRange,
}

impl DatasetSelection {
    pub fn new(site_id: impl Into<String>, range: TimeRange) -> Self {
        Self {
            site_id: site_id.into(),
            range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_row(context: AttributeMap) -> HydratedEvent {
        HydratedEvent {
            event: PAGE_VIEW.to_string(),
            pathname: "/pricing".to_string(),
            timestamp: Utc::now(),
            properties: AttributeMap::new(),
            is_initial: true,
            session: Arc::new(SessionContext {
                session_id: "s1".to_string(),
                attributes: context,
                entry_page: Some("/".to_string()),
                exit_page: None,
            }),
        }
    }

    #[test]
    fn test_column_lookup_distinguishes_absent_and_null() {
        let mut ctx = AttributeMap::new();
        ctx.insert("country".to_string(), json!("US"));
        ctx.insert("region".to_string(), Value::Null);
        let row = make_row(ctx);

        assert_eq!(row.column_text("country"), Some("US".to_string()));
        assert_eq!(row.column("region"), Some(Value::Null));
        assert_eq!(row.column_text("region"), None);
        assert_eq!(row.column("city"), None);
        assert_eq!(row.column_text("pathname"), Some("/pricing".to_string()));
        assert_eq!(row.column_text("entry_page"), Some("/".to_string()));
        assert_eq!(row.column("exit_page"), Some(Value::Null));
    }

    #[test]
    fn test_hydrated_row_serializes_session_inline() {
        let mut ctx = AttributeMap::new();
        ctx.insert("country".to_string(), json!("DE"));
        let value = serde_json::to_value(make_row(ctx)).unwrap();

        assert_eq!(value["session"]["session_id"], "s1");
        assert_eq!(value["session"]["attributes"]["country"], "DE");
        assert_eq!(value["session"]["entry_page"], "/");
        assert_eq!(value["pathname"], "/pricing");
    }

    #[test]
    fn test_value_text_integral_floats() {
        assert_eq!(value_text(&json!(1920.0)), Some("1920".to_string()));
        assert_eq!(value_text(&json!(1080)), Some("1080".to_string()));
        assert_eq!(value_text(&json!(1.5)), Some("1.5".to_string()));
        assert_eq!(value_text(&json!(true)), Some("true".to_string()));
        assert_eq!(value_text(&Value::Null), None);
    }

    #[test]
    fn test_time_range_helpers() {
        let to = Utc::now();
        let range = TimeRange::last_hours(to, 24);
        assert_eq!(range.span(), Duration::hours(24));
        assert!(range.is_valid());
        assert!(range.contains(to - Duration::hours(1)));
        assert!(!range.contains(to));
    }
}
