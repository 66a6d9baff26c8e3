//! Hydration join: initial + delta events -> one fully-populated table
//!
//! ```text
//! RawInitialEvent (1 per session) ─┐
//!                                  ├─ group by session_id ─→ HydratedEvent rows
//! RawDeltaEvent   (0..n)          ─┘
//! ```
//!
//! Every row of a session shares one `Arc<SessionContext>`, so the
//! session-scoped attributes are identical across the session by construction.
//! Delta-only sessions are dropped and counted in the `HydrationReport`.
//! Schema columns a session did not report are filled with null, so an
//! empty attribute stays distinguishable from a column the deployment lacks.

use super::types::{
    HydratedEvent, HydratedTable, HydrationReport, RawDataset, RawDeltaEvent, RawInitialEvent,
    SessionContext,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Join both raw collections into a hydrated table
///
/// Single pass over each collection for grouping, then one pass per session
/// to emit rows. Rows are ordered by timestamp within a session, initial row
/// first; there is no global ordering.
pub fn hydrate(dataset: RawDataset) -> HydratedTable {
    let RawDataset {
        initial_events,
        delta_events,
        schema,
    } = dataset;

    let mut report = HydrationReport::default();

    // Group initial events; first (earliest) initial wins
    let mut initials: HashMap<String, RawInitialEvent> = HashMap::with_capacity(initial_events.len());
    for initial in initial_events {
        match initials.get(&initial.session_id) {
            Some(existing) if existing.timestamp <= initial.timestamp => {
                report.duplicate_initial_events += 1;
            }
            Some(_) => {
                report.duplicate_initial_events += 1;
                initials.insert(initial.session_id.clone(), initial);
            }
            None => {
                initials.insert(initial.session_id.clone(), initial);
            }
        }
    }

    // Group delta events by session
    let mut deltas: HashMap<String, Vec<RawDeltaEvent>> = HashMap::new();
    for delta in delta_events {
        deltas.entry(delta.session_id.clone()).or_default().push(delta);
    }

    // Delta-only sessions indicate an ordering/ingestion problem upstream
    deltas.retain(|session_id, events| {
        if initials.contains_key(session_id) {
            true
        } else {
            report.orphan_sessions += 1;
            report.orphan_events += events.len();
            false
        }
    });

    let mut rows = Vec::with_capacity(initials.len() + deltas.values().map(Vec::len).sum::<usize>());

    for (session_id, initial) in initials {
        let mut session_deltas = deltas.remove(&session_id).unwrap_or_default();
        session_deltas.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let (entry_page, exit_page) = entry_exit_pages(&initial, &session_deltas);

        let RawInitialEvent {
            event,
            pathname,
            session_id,
            timestamp,
            properties,
            mut context,
        } = initial;
        for column in &schema.session_attributes {
            context.entry(column.clone()).or_insert(Value::Null);
        }

        let session = Arc::new(SessionContext {
            session_id,
            attributes: context,
            entry_page,
            exit_page,
        });

        rows.push(HydratedEvent {
            event,
            pathname,
            timestamp,
            properties,
            is_initial: true,
            session: Arc::clone(&session),
        });

        for delta in session_deltas {
            rows.push(HydratedEvent {
                event: delta.event,
                pathname: delta.pathname,
                timestamp: delta.timestamp,
                properties: delta.properties,
                is_initial: false,
                session: Arc::clone(&session),
            });
        }

        report.sessions += 1;
    }

    report.rows = rows.len();

    if report.orphan_sessions > 0 {
        log::warn!(
            "⚠️  Hydration dropped {} delta-only sessions ({} events) - initial events missing upstream",
            report.orphan_sessions,
            report.orphan_events
        );
    }
    if report.duplicate_initial_events > 0 {
        log::warn!(
            "⚠️  Hydration ignored {} duplicate initial events",
            report.duplicate_initial_events
        );
    }
    log::debug!(
        "Hydrated {} sessions into {} rows",
        report.sessions,
        report.rows
    );

    HydratedTable { rows, report }
}

/// First and last page_view pathname, initial row first
fn entry_exit_pages(
    initial: &RawInitialEvent,
    sorted_deltas: &[RawDeltaEvent],
) -> (Option<String>, Option<String>) {
    let pages = std::iter::once((initial.event.as_str(), initial.pathname.as_str())).chain(
        sorted_deltas
            .iter()
            .map(|d| (d.event.as_str(), d.pathname.as_str())),
    );

    let mut entry = None;
    let mut exit = None;
    for (event, pathname) in pages {
        if event == super::types::PAGE_VIEW {
            if entry.is_none() {
                entry = Some(pathname.to_string());
            }
            exit = Some(pathname.to_string());
        }
    }
    (entry, exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::channel::{classify_channel, Channel};
    use crate::engine::types::{AttributeMap, AttributeSchema, PAGE_VIEW};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn make_initial(session: &str, secs: i64, country: &str) -> RawInitialEvent {
        let mut context = AttributeMap::new();
        context.insert("country".to_string(), json!(country));
        context.insert("browser".to_string(), json!("Firefox"));
        RawInitialEvent {
            event: PAGE_VIEW.to_string(),
            pathname: "/".to_string(),
            session_id: session.to_string(),
            timestamp: ts(secs),
            properties: AttributeMap::new(),
            context,
        }
    }

    fn make_delta(session: &str, secs: i64, event: &str, pathname: &str) -> RawDeltaEvent {
        RawDeltaEvent {
            event: event.to_string(),
            pathname: pathname.to_string(),
            session_id: session.to_string(),
            timestamp: ts(secs),
            properties: AttributeMap::new(),
        }
    }

    #[test]
    fn test_session_attributes_copied_to_every_row() {
        let dataset = RawDataset {
            initial_events: vec![make_initial("a", 0, "US"), make_initial("b", 5, "DE")],
            delta_events: vec![
                make_delta("a", 30, PAGE_VIEW, "/pricing"),
                make_delta("a", 10, "signup_click", "/"),
                make_delta("b", 20, PAGE_VIEW, "/docs"),
            ],
            schema: AttributeSchema::new(["country", "browser"]),
        };

        let table = hydrate(dataset);
        assert_eq!(table.rows.len(), 5);
        assert_eq!(table.report.sessions, 2);
        assert_eq!(table.report.orphan_sessions, 0);

        for row in &table.rows {
            let expected = if row.session_id() == "a" { "US" } else { "DE" };
            assert_eq!(row.column_text("country").as_deref(), Some(expected));
            assert_eq!(row.column_text("browser").as_deref(), Some("Firefox"));
        }

        // Exactly one initial row per session, first in the session
        let a_rows: Vec<_> = table.rows.iter().filter(|r| r.session_id() == "a").collect();
        assert_eq!(a_rows.iter().filter(|r| r.is_initial).count(), 1);
        assert!(a_rows[0].is_initial);
        assert!(a_rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(a_rows[1].event, "signup_click");
    }

    #[test]
    fn test_missing_schema_columns_read_as_null() {
        let mut initial = make_initial("a", 0, "US");
        initial.context.remove("browser");
        let dataset = RawDataset {
            initial_events: vec![initial],
            delta_events: vec![],
            schema: AttributeSchema::new(["country", "browser", "referrer"]),
        };

        let table = hydrate(dataset);
        let row = &table.rows[0];
        assert_eq!(row.column("browser"), Some(json!(null)));
        assert_eq!(row.column("referrer"), Some(json!(null)));
        assert_eq!(row.column("city"), None);
        // Declared but empty referrer is a direct visit, not an unknown one
        assert_eq!(classify_channel(row), Channel::Direct);
    }

    #[test]
    fn test_delta_only_sessions_are_dropped_and_counted() {
        let dataset = RawDataset {
            initial_events: vec![make_initial("a", 0, "US")],
            delta_events: vec![
                make_delta("ghost", 10, PAGE_VIEW, "/x"),
                make_delta("ghost", 20, PAGE_VIEW, "/y"),
                make_delta("a", 30, PAGE_VIEW, "/z"),
            ],
            schema: AttributeSchema::default(),
        };

        let table = hydrate(dataset);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.report.orphan_sessions, 1);
        assert_eq!(table.report.orphan_events, 2);
        assert!(table.rows.iter().all(|r| r.session_id() == "a"));
    }

    #[test]
    fn test_duplicate_initial_keeps_earliest() {
        let dataset = RawDataset {
            initial_events: vec![make_initial("a", 50, "FR"), make_initial("a", 0, "US")],
            delta_events: vec![],
            schema: AttributeSchema::default(),
        };

        let table = hydrate(dataset);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.report.duplicate_initial_events, 1);
        assert_eq!(table.rows[0].column_text("country").as_deref(), Some("US"));
    }

    #[test]
    fn test_entry_and_exit_pages_derived() {
        let dataset = RawDataset {
            initial_events: vec![make_initial("a", 0, "US")],
            delta_events: vec![
                make_delta("a", 10, PAGE_VIEW, "/pricing"),
                make_delta("a", 20, "outbound_click", "/pricing"),
                make_delta("a", 30, PAGE_VIEW, "/checkout"),
            ],
            schema: AttributeSchema::default(),
        };

        let table = hydrate(dataset);
        let session = &table.rows[0].session;
        assert_eq!(session.entry_page.as_deref(), Some("/"));
        assert_eq!(session.exit_page.as_deref(), Some("/checkout"));
    }

    #[test]
    fn test_empty_dataset() {
        let table = hydrate(RawDataset::default());
        assert!(table.rows.is_empty());
        assert_eq!(table.report, HydrationReport::default());
    }
}
