//! Filter compiler: active segments -> one composable predicate
//!
//! The predicate is a typed tree rather than a query string. The in-memory
//! views evaluate it with `Predicate::matches`; another backend can walk the
//! same tree and translate each clause (column, value) into its own dialect.

use super::channel::{classify_channel, referrer_label, screen_size_label, source_label};
use super::segments::{kinds, Segment, SegmentSet};
use super::types::HydratedEvent;
use serde::Serialize;

/// Compiled filter clause
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    /// Empty filter set
    Always,
    /// Unrecognized or unusable segment
    Never,
    /// `row[column] == value`
    ColumnEquals { column: String, value: String },
    /// `"{screen_width}x{screen_height}" == value`
    ScreenSize(String),
    /// Channel bucket label equality
    Channel(String),
    /// Normalized referrer domain equality
    Source(String),
    /// Normalized referrer (host + path) equality
    Referrer(String),
    /// `properties[key] == value`, key already sanitized
    Property { key: String, value: String },
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, row: &HydratedEvent) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Never => false,
            Predicate::ColumnEquals { column, value } => {
                row.column_text(column).as_deref() == Some(value.as_str())
            }
            Predicate::ScreenSize(value) => screen_size_label(row).as_deref() == Some(value.as_str()),
            Predicate::Channel(label) => classify_channel(row).label() == label,
            Predicate::Source(value) => source_label(row).as_deref() == Some(value.as_str()),
            Predicate::Referrer(value) => referrer_label(row).as_deref() == Some(value.as_str()),
            Predicate::Property { key, value } => {
                row.property_text(key).as_deref() == Some(value.as_str())
            }
            Predicate::And(clauses) => clauses.iter().all(|c| c.matches(row)),
        }
    }
}

/// Keep only `[A-Za-z0-9_]` from a property key
pub fn sanitize_property_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Compile the active segment set into one predicate
///
/// Empty set compiles to `Always`; a single segment compiles to its clause;
/// more compile to `And` in segment order.
pub fn compile(segments: &SegmentSet) -> Predicate {
    let mut clauses: Vec<Predicate> = segments.iter().map(compile_segment).collect();
    match clauses.len() {
        0 => Predicate::Always,
        1 => clauses.remove(0),
        _ => Predicate::And(clauses),
    }
}

/// Compile a single segment
pub fn compile_segment(segment: &Segment) -> Predicate {
    let value = segment.operand().to_string();

    match segment.kind.as_str() {
        kinds::SCREEN_SIZE => Predicate::ScreenSize(value),
        kinds::CHANNEL => Predicate::Channel(value),
        kinds::SOURCE => Predicate::Source(normalize_operand(&value)),
        kinds::REFERRER => Predicate::Referrer(normalize_operand(&value)),
        kinds::PROPERTY => {
            let raw_key = segment.column.as_deref().unwrap_or_default();
            let key = sanitize_property_key(raw_key);
            if key.is_empty() {
                log::warn!(
                    "⚠️  Property segment '{}' has no usable key ({:?}) - matching nothing",
                    segment.label,
                    raw_key
                );
                return Predicate::Never;
            }
            Predicate::Property { key, value }
        }
        kind => match default_column(kind) {
            Some(default) => Predicate::ColumnEquals {
                column: segment.column.clone().unwrap_or_else(|| default.to_string()),
                value,
            },
            None => match segment.column.as_deref() {
                // Unknown kind with an explicit column is still a plain equality
                Some(column) => Predicate::ColumnEquals {
                    column: column.to_string(),
                    value,
                },
                None => {
                    log::warn!(
                        "⚠️  Unrecognized segment kind '{}' (value: {}) - matching nothing",
                        kind,
                        segment.value
                    );
                    Predicate::Never
                }
            },
        },
    }
}

/// Default column for direct-equality kinds
fn default_column(kind: &str) -> Option<&'static str> {
    let column = match kind {
        kinds::PAGE => "pathname",
        kinds::ENTRY_PAGE => "entry_page",
        kinds::EXIT_PAGE => "exit_page",
        kinds::EVENT => "event",
        kinds::CAMPAIGN => "utm_campaign",
        kinds::COUNTRY => "country",
        kinds::REGION => "region",
        kinds::CITY => "city",
        kinds::BROWSER => "browser",
        kinds::OS => "os",
        kinds::DEVICE_TYPE => "device_type",
        kinds::LANGUAGE => "language",
        kinds::UTM_SOURCE => "utm_source",
        kinds::UTM_MEDIUM => "utm_medium",
        kinds::UTM_TERM => "utm_term",
        kinds::UTM_CONTENT => "utm_content",
        _ => return None,
    };
    Some(column)
}

fn normalize_operand(value: &str) -> String {
    super::channel::normalize_domain(value)
}
