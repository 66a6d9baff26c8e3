//! Raw data source seam
//!
//! The engine never talks to storage directly. A `RawDataSource` returns the
//! two raw tiers for a `(site_id, range)` pair together with the attribute
//! schema the deployment actually carries. Timeouts and retries are the
//! source's business.

use super::error::EngineError;
use super::types::{AttributeSchema, RawDataset, RawDeltaEvent, RawInitialEvent, TimeRange};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Duration;

#[async_trait]
pub trait RawDataSource: Send + Sync {
    /// Fetch both raw tiers for one site and range
    async fn fetch(&self, site_id: &str, range: &TimeRange) -> Result<RawDataset, EngineError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// In-memory source, used by tests and demos
///
/// Filters stored events by site and range on every fetch.
pub struct InMemoryDataSource {
    sites: Mutex<HashMap<String, RawDataset>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self {
            sites: Mutex::new(HashMap::new()),
            delay: None,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Simulate fetch latency
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace a site's data
    pub fn insert_site(&self, site_id: &str, dataset: RawDataset) {
        if let Ok(mut sites) = self.sites.lock() {
            sites.insert(site_id.to_string(), dataset);
        }
    }

    pub fn push_initial(&self, site_id: &str, event: RawInitialEvent) {
        if let Ok(mut sites) = self.sites.lock() {
            sites.entry(site_id.to_string()).or_default().initial_events.push(event);
        }
    }

    pub fn push_delta(&self, site_id: &str, event: RawDeltaEvent) {
        if let Ok(mut sites) = self.sites.lock() {
            sites.entry(site_id.to_string()).or_default().delta_events.push(event);
        }
    }

    pub fn set_schema(&self, site_id: &str, schema: AttributeSchema) {
        if let Ok(mut sites) = self.sites.lock() {
            sites.entry(site_id.to_string()).or_default().schema = schema;
        }
    }

    /// Number of fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RawDataSource for InMemoryDataSource {
    async fn fetch(&self, site_id: &str, range: &TimeRange) -> Result<RawDataset, EngineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let sites = self
            .sites
            .lock()
            .map_err(|_| EngineError::Fetch("in-memory source lock poisoned".to_string()))?;
        let dataset = sites
            .get(site_id)
            .ok_or_else(|| EngineError::Fetch(format!("unknown site: {}", site_id)))?;

        Ok(RawDataset {
            initial_events: dataset
                .initial_events
                .iter()
                .filter(|e| range.contains(e.timestamp))
                .cloned()
                .collect(),
            delta_events: dataset
                .delta_events
                .iter()
                .filter(|e| range.contains(e.timestamp))
                .cloned()
                .collect(),
            schema: dataset.schema.clone(),
        })
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{AttributeMap, PAGE_VIEW};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn make_initial(session: &str, secs: i64) -> RawInitialEvent {
        RawInitialEvent {
            event: PAGE_VIEW.to_string(),
            pathname: "/".to_string(),
            session_id: session.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            properties: AttributeMap::new(),
            context: AttributeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_fetch_filters_by_range() {
        let source = InMemoryDataSource::new();
        source.push_initial("site", make_initial("in", 10));
        source.push_initial("site", make_initial("out", 100_000));
        source.set_schema("site", AttributeSchema::new(["country"]));

        let from = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let range = TimeRange::new(from, from + ChronoDuration::hours(1));
        let dataset = source.fetch("site", &range).await.unwrap();

        assert_eq!(dataset.initial_events.len(), 1);
        assert_eq!(dataset.initial_events[0].session_id, "in");
        assert!(dataset.schema.has("country"));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_site_is_fetch_error() {
        let source = InMemoryDataSource::new();
        let range = TimeRange::last_hours(Utc::now(), 1);
        match source.fetch("missing", &range).await {
            Err(EngineError::Fetch(msg)) => assert!(msg.contains("missing")),
            other => panic!("expected fetch error, got {:?}", other.map(|d| d.initial_events.len())),
        }
    }
}
