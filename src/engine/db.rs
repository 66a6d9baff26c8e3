//! SQLite storage for the two raw event tiers
//!
//! Tables (see `/sql/` directory):
//! - `initial_events` - one row per session, base columns plus context columns
//! - `delta_events` - every later event, base columns only
//!
//! Context columns are discovered at fetch time with `PRAGMA table_info`, so a
//! deployment that drops `city` (or anything else) simply reports a smaller
//! `AttributeSchema`.

use super::error::EngineError;
use super::source::RawDataSource;
use super::types::{
    AttributeMap, AttributeSchema, RawDataset, RawDeltaEvent, RawInitialEvent, TimeRange,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Columns every event row carries; anything else on `initial_events` is context
const BASE_COLUMNS: [&str; 7] = [
    "id",
    "site_id",
    "session_id",
    "event",
    "pathname",
    "timestamp_ms",
    "properties",
];

/// Run schema migrations from SQL files
///
/// Reads every `.sql` file in `schema_dir` in file-name order (00_, 01_, ...)
/// and executes it. Files must use `IF NOT EXISTS` so reruns are no-ops.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), EngineError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Schema directory not found: {}", schema_dir),
        )));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().to_string();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// SQLite implementation of `RawDataSource`
pub struct SqliteDataSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDataSource {
    /// Open a database file
    ///
    /// Does NOT create the schema; run `run_schema_migrations` first.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let conn = Connection::open(db_path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Fetch("SQLite connection lock poisoned".to_string()))
    }

    /// Insert a session's initial event
    ///
    /// Context keys without a matching column are skipped; that is how a
    /// stripped-down deployment stores less.
    pub fn insert_initial(&self, site_id: &str, event: &RawInitialEvent) -> Result<(), EngineError> {
        let conn = self.lock()?;
        let columns = discover_context_columns(&conn)?;

        let mut names: Vec<String> = vec![
            "site_id".to_string(),
            "session_id".to_string(),
            "event".to_string(),
            "pathname".to_string(),
            "timestamp_ms".to_string(),
            "properties".to_string(),
        ];
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Text(site_id.to_string()),
            SqlValue::Text(event.session_id.clone()),
            SqlValue::Text(event.event.clone()),
            SqlValue::Text(event.pathname.clone()),
            SqlValue::Integer(event.timestamp.timestamp_millis()),
            SqlValue::Text(serde_json::to_string(&event.properties)?),
        ];

        for (key, value) in &event.context {
            if columns.iter().any(|c| c == key) {
                names.push(quote_ident(key));
                values.push(json_to_sql(value));
            } else {
                log::debug!("Skipping context key '{}' (no column)", key);
            }
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO initial_events ({}) VALUES ({})",
            names.join(", "),
            placeholders
        );
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    pub fn insert_delta(&self, site_id: &str, event: &RawDeltaEvent) -> Result<(), EngineError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO delta_events (site_id, session_id, event, pathname, timestamp_ms, properties)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                site_id,
                event.session_id,
                event.event,
                event.pathname,
                event.timestamp.timestamp_millis(),
                serde_json::to_string(&event.properties)?,
            ],
        )?;
        Ok(())
    }

    fn read_dataset(&self, site_id: &str, range: &TimeRange) -> Result<RawDataset, EngineError> {
        let conn = self.lock()?;
        let columns = discover_context_columns(&conn)?;
        let from_ms = range.from.timestamp_millis();
        let to_ms = range.to.timestamp_millis();

        let mut select = String::from("SELECT session_id, event, pathname, timestamp_ms, properties");
        for column in &columns {
            select.push_str(", ");
            select.push_str(&quote_ident(column));
        }
        select.push_str(
            " FROM initial_events WHERE site_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3
              ORDER BY timestamp_ms, id",
        );

        let mut stmt = conn.prepare(&select)?;
        let mut rows = stmt.query(params![site_id, from_ms, to_ms])?;
        let mut initial_events = Vec::new();
        while let Some(row) = rows.next()? {
            let mut context = AttributeMap::new();
            for (i, column) in columns.iter().enumerate() {
                context.insert(column.clone(), sql_to_json(row.get_ref(5 + i)?));
            }
            initial_events.push(RawInitialEvent {
                session_id: row.get(0)?,
                event: row.get(1)?,
                pathname: row.get(2)?,
                timestamp: timestamp_from_ms(row.get(3)?)?,
                properties: properties_from_row(row, 4)?,
                context,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT session_id, event, pathname, timestamp_ms, properties
             FROM delta_events
             WHERE site_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3
             ORDER BY timestamp_ms, id",
        )?;
        let mut rows = stmt.query(params![site_id, from_ms, to_ms])?;
        let mut delta_events = Vec::new();
        while let Some(row) = rows.next()? {
            delta_events.push(RawDeltaEvent {
                session_id: row.get(0)?,
                event: row.get(1)?,
                pathname: row.get(2)?,
                timestamp: timestamp_from_ms(row.get(3)?)?,
                properties: properties_from_row(row, 4)?,
            });
        }

        Ok(RawDataset {
            initial_events,
            delta_events,
            schema: AttributeSchema::new(columns),
        })
    }
}

#[async_trait]
impl RawDataSource for SqliteDataSource {
    async fn fetch(&self, site_id: &str, range: &TimeRange) -> Result<RawDataset, EngineError> {
        let dataset = self.read_dataset(site_id, range)?;
        log::debug!(
            "📥 Fetched {} initial / {} delta events for site {}",
            dataset.initial_events.len(),
            dataset.delta_events.len(),
            site_id
        );
        Ok(dataset)
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

fn discover_context_columns(conn: &Connection) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare("PRAGMA table_info(initial_events)")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;

    if names.is_empty() {
        return Err(EngineError::DataShape(
            "initial_events table is missing".to_string(),
        ));
    }

    Ok(names
        .into_iter()
        .filter(|name| !BASE_COLUMNS.contains(&name.as_str()))
        .collect())
}

/// Column names come from `PRAGMA table_info`; quoting keeps odd names intact
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn timestamp_from_ms(ms: i64) -> Result<DateTime<Utc>, EngineError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| EngineError::DataShape(format!("timestamp out of range: {}", ms)))
}

fn properties_from_row(row: &Row<'_>, idx: usize) -> Result<AttributeMap, EngineError> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(text) if !text.trim().is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(AttributeMap::new()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).to_string()),
        ValueRef::Blob(_) => Value::Null,
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
