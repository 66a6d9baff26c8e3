//! Integration tests: SQLite → hydration → orchestrator → views
//!
//! Key integration points tested:
//! - Schema migrations and context column discovery
//! - Orphan deltas counted, not fatal
//! - Clicking a breakdown row filters to exactly that row
//! - Tab switches and segment removal through the public handle

#[cfg(test)]
mod engine_integration_tests {
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use rusqlite::Connection;
    use serde_json::json;
    use sitepulse::engine::views::BreakdownRow;
    use sitepulse::engine::{
        kinds, run_schema_migrations, AttributeMap, BreakdownTab, Card, DatasetSelection,
        EngineHandle, EngineSnapshot, EngineStatus, Orchestrator, RawDeltaEvent, RawInitialEvent,
        Segment, SqliteDataSource, TimeRange,
    };
    use sitepulse::EngineConfig;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tokio::time::{timeout, Duration};

    fn base_time() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        base_time() + ChronoDuration::seconds(secs)
    }

    fn initial(session: &str, pathname: &str, context: serde_json::Value) -> RawInitialEvent {
        let context: AttributeMap = serde_json::from_value(context).unwrap();
        RawInitialEvent {
            event: "page_view".to_string(),
            pathname: pathname.to_string(),
            session_id: session.to_string(),
            timestamp: base_time(),
            properties: AttributeMap::new(),
            context,
        }
    }

    fn delta(session: &str, event: &str, pathname: &str, secs: i64) -> RawDeltaEvent {
        RawDeltaEvent {
            event: event.to_string(),
            pathname: pathname.to_string(),
            session_id: session.to_string(),
            timestamp: at(secs),
            properties: AttributeMap::new(),
        }
    }

    /// Three sessions plus one orphan delta and one event outside the range
    fn seed_database() -> (SqliteDataSource, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();
        run_schema_migrations(&mut conn, &format!("{}/sql", env!("CARGO_MANIFEST_DIR"))).unwrap();
        let source = SqliteDataSource::from_connection(conn);

        source
            .insert_initial(
                "site",
                &initial(
                    "s1",
                    "/",
                    json!({
                        "country": "US",
                        "browser": "Chrome",
                        "referrer": "https://www.google.com/search?q=analytics",
                        "screen_width": 390,
                        "screen_height": 844
                    }),
                ),
            )
            .unwrap();
        source.insert_delta("site", &delta("s1", "page_view", "/pricing", 65)).unwrap();
        let mut signup = delta("s1", "signup", "/pricing", 70);
        signup.properties.insert("plan".to_string(), json!("pro"));
        source.insert_delta("site", &signup).unwrap();

        source
            .insert_initial(
                "site",
                &initial("s2", "/", json!({"country": "US", "browser": "Firefox", "referrer": ""})),
            )
            .unwrap();

        source
            .insert_initial(
                "site",
                &initial(
                    "s3",
                    "/blog",
                    json!({"country": "DE", "browser": "Firefox", "referrer": "https://twitter.com/someone"}),
                ),
            )
            .unwrap();
        source.insert_delta("site", &delta("s3", "page_view", "/pricing", 30)).unwrap();
        source.insert_delta("site", &delta("s3", "page_view", "/", 60)).unwrap();

        // Delta whose initial event never arrived
        source.insert_delta("site", &delta("ghost", "page_view", "/", 10)).unwrap();
        // Outside the selected range
        source.insert_delta("site", &delta("s2", "page_view", "/late", 10 * 3600)).unwrap();

        (source, temp_file)
    }

    fn selection() -> DatasetSelection {
        DatasetSelection::new(
            "site",
            TimeRange::new(base_time() - ChronoDuration::hours(1), base_time() + ChronoDuration::hours(1)),
        )
    }

    fn spawn_engine(config: EngineConfig) -> (EngineHandle, NamedTempFile) {
        let (source, temp_file) = seed_database();
        let (handle, _task) = Orchestrator::spawn(Arc::new(source), &config, Some(selection()));
        (handle, temp_file)
    }

    async fn settle(handle: &EngineHandle) -> EngineSnapshot {
        timeout(Duration::from_secs(5), handle.wait_for_idle())
            .await
            .expect("engine did not settle")
            .unwrap()
    }

    fn card_rows(snapshot: &EngineSnapshot, card: Card) -> &[BreakdownRow] {
        &snapshot.results.breakdowns[&card].value.rows
    }

    fn row<'a>(rows: &'a [BreakdownRow], value: &str) -> &'a BreakdownRow {
        rows.iter()
            .find(|r| r.value == value)
            .unwrap_or_else(|| panic!("no row {}", value))
    }

    #[tokio::test]
    async fn test_end_to_end_dashboard() {
        let (handle, _db) = spawn_engine(EngineConfig::default());
        let snapshot = settle(&handle).await;

        assert_eq!(snapshot.status, EngineStatus::Idle);
        let report = snapshot.hydration.as_ref().unwrap();
        assert_eq!(report.sessions, 3);
        assert_eq!(report.orphan_sessions, 1);
        assert_eq!(report.orphan_events, 1);

        let stats = &snapshot.results.stats.as_ref().unwrap().value;
        assert_eq!(stats.unique_visitors, 3);
        assert_eq!(stats.total_pageviews, 6);
        assert_eq!(stats.views_per_visit, "2.00");
        assert!((stats.bounce_rate - 100.0 / 3.0).abs() < 1e-9);
        // s1 lasts 70s, s3 lasts 60s; s2 has a single row
        assert_eq!(stats.visit_duration, "1m 5s");

        let sources = card_rows(&snapshot, Card::Sources);
        assert_eq!(sources.len(), 3);
        assert_eq!(row(sources, "google.com").visitors, 1);
        assert_eq!(row(sources, "Direct").visitors, 1);
        assert_eq!(row(sources, "twitter.com").visitors, 1);

        let pages = card_rows(&snapshot, Card::Pages);
        assert_eq!(pages[0].value, "/");
        assert_eq!(pages[0].visitors, 3);
        assert_eq!(pages[0].occurrences, Some(3));

        let devices = card_rows(&snapshot, Card::Devices);
        assert_eq!(devices[0].value, "Firefox");
        assert_eq!(devices[0].visitors, 2);

        let events = &snapshot.results.events.as_ref().unwrap().value;
        assert_eq!(row(events, "signup").occurrences, Some(1));

        assert_eq!(snapshot.selected_property.as_deref(), Some("plan"));
        let plan = &snapshot.results.property_values.as_ref().unwrap().value;
        assert_eq!(plan.rows[0].value, "pro");

        // No transition is shared by two sessions
        assert!(snapshot.results.flow.as_ref().unwrap().value.edges.is_empty());
    }

    #[tokio::test]
    async fn test_clicking_rows_filters_to_that_row() {
        let (handle, _db) = spawn_engine(EngineConfig::default());
        let snapshot = settle(&handle).await;

        for source_row in card_rows(&snapshot, Card::Sources) {
            handle.add_segment(source_row.segment.clone()).await.unwrap();
            let filtered = settle(&handle).await;
            let stats = &filtered.results.stats.as_ref().unwrap().value;
            assert_eq!(stats.unique_visitors, source_row.visitors, "source {}", source_row.value);

            handle.remove_segment(source_row.segment.clone()).await.unwrap();
            let restored = settle(&handle).await;
            assert_eq!(restored.results.stats.as_ref().unwrap().value.unique_visitors, 3);
        }
    }

    #[tokio::test]
    async fn test_segments_combine_with_and() {
        let (handle, _db) = spawn_engine(EngineConfig::default());
        settle(&handle).await;

        handle.add_segment(Segment::new(kinds::COUNTRY, "US")).await.unwrap();
        handle.add_segment(Segment::new(kinds::BROWSER, "Firefox")).await.unwrap();
        let snapshot = settle(&handle).await;

        assert_eq!(snapshot.segments.len(), 2);
        let stats = &snapshot.results.stats.as_ref().unwrap().value;
        assert_eq!(stats.unique_visitors, 1);
        assert_eq!(stats.bounce_rate, 100.0);
        assert_eq!(stats.visit_duration, "N/A");
    }

    #[tokio::test]
    async fn test_tab_switches_and_channels() {
        let (handle, _db) = spawn_engine(EngineConfig::default());
        settle(&handle).await;

        handle.select_tab(BreakdownTab::Channels).await.unwrap();
        handle.select_tab(BreakdownTab::EntryPages).await.unwrap();
        let snapshot = settle(&handle).await;

        let channels = card_rows(&snapshot, Card::Sources);
        assert_eq!(snapshot.results.breakdowns[&Card::Sources].value.tab, BreakdownTab::Channels);
        assert_eq!(row(channels, "Organic Search").visitors, 1);
        assert_eq!(row(channels, "Direct").visitors, 1);
        assert_eq!(row(channels, "Social").visitors, 1);

        let entry = card_rows(&snapshot, Card::Pages);
        assert_eq!(row(entry, "/").visitors, 2);
        assert_eq!(row(entry, "/blog").visitors, 1);

        // Entry page segment matches the session's true entry page
        handle.add_segment(row(entry, "/blog").segment.clone()).await.unwrap();
        let filtered = settle(&handle).await;
        assert_eq!(filtered.results.stats.as_ref().unwrap().value.unique_visitors, 1);
        assert_eq!(filtered.results.stats.as_ref().unwrap().value.total_pageviews, 3);
        // Tab choice survives the re-aggregation
        assert_eq!(filtered.results.breakdowns[&Card::Pages].value.tab, BreakdownTab::EntryPages);
    }

    #[tokio::test]
    async fn test_flow_with_low_threshold() {
        let config = EngineConfig {
            flow_min_transitions: 1,
            ..EngineConfig::default()
        };
        let (handle, _db) = spawn_engine(config);
        let snapshot = settle(&handle).await;

        let flow = &snapshot.results.flow.as_ref().unwrap().value;
        assert_eq!(flow.edges.len(), 4);
        assert!(flow
            .edges
            .iter()
            .any(|e| e.source == "/pricing#2" && e.target == "signup#3"));
        assert!(flow.nodes.iter().any(|n| n.label == "/blog" && n.step == 1));
    }
}
