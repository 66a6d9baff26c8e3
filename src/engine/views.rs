//! Aggregation library: pure views over the hydrated table
//!
//! Every view takes `(rows, predicate)` plus its own parameters and returns a
//! typed result. Views never see each other's output; the orchestrator is the
//! only place that sequences them.
//!
//! | View | Counts |
//! |------|--------|
//! | `compute_stats` | visitors, visits, pageviews, bounce rate, median duration |
//! | `compute_time_series` | pageviews + visitors per hour/day bucket |
//! | `compute_breakdown` | distinct sessions per key (Sources, Pages, Regions, Devices) |
//! | `compute_events` | distinct sessions + occurrences per event name |
//! | `compute_property_keys` | distinct sessions per custom property key |
//! | `compute_property_values` | distinct sessions + occurrences per value of one key |

use super::channel::{classify_channel, screen_size_label, source_label};
use super::error::EngineError;
use super::filter::Predicate;
use super::segments::{kinds, Segment};
use super::types::{HydratedEvent, TimeRange};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

/// Placeholder for ratios and durations that have no data
pub const NOT_AVAILABLE: &str = "N/A";

/// `(partial / total) * 100`, zero when total is zero
pub fn percentage(partial: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (partial as f64 / total as f64) * 100.0
}

/// `Xm Ys` from one minute up, `Ys` below
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

fn matching<'a>(
    rows: &'a [HydratedEvent],
    predicate: &'a Predicate,
) -> impl Iterator<Item = &'a HydratedEvent> + 'a {
    rows.iter().filter(move |row| predicate.matches(row))
}

fn distinct_sessions<'a, I>(rows: I) -> usize
where
    I: Iterator<Item = &'a HydratedEvent>,
{
    rows.map(|r| r.session_id()).collect::<HashSet<_>>().len()
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Summary card
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    pub unique_visitors: usize,
    pub total_visits: usize,
    pub total_pageviews: usize,
    /// Pageviews per visit, two decimals, "N/A" without visits
    pub views_per_visit: String,
    /// Percentage of sessions with exactly one pageview
    pub bounce_rate: f64,
    /// Median session length for sessions with 2+ events
    pub visit_duration: String,
    pub median_duration_secs: Option<i64>,
}

#[derive(Default)]
struct SessionTally {
    rows: usize,
    pageviews: usize,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

pub fn compute_stats(rows: &[HydratedEvent], predicate: &Predicate) -> StatsSummary {
    let mut sessions: HashMap<&str, SessionTally> = HashMap::new();
    let mut total_pageviews = 0;

    for row in matching(rows, predicate) {
        let tally = sessions.entry(row.session_id()).or_default();
        tally.rows += 1;
        if row.is_page_view() {
            tally.pageviews += 1;
            total_pageviews += 1;
        }
        tally.first = Some(tally.first.map_or(row.timestamp, |t| t.min(row.timestamp)));
        tally.last = Some(tally.last.map_or(row.timestamp, |t| t.max(row.timestamp)));
    }

    let visits = sessions.len();
    let bounced = sessions.values().filter(|t| t.pageviews == 1).count();

    let mut durations: Vec<i64> = sessions
        .values()
        .filter(|t| t.rows >= 2)
        .filter_map(|t| match (t.first, t.last) {
            (Some(first), Some(last)) => Some((last - first).num_seconds()),
            _ => None,
        })
        .collect();
    durations.sort_unstable();
    let median_duration_secs = median(&durations);

    StatsSummary {
        unique_visitors: visits,
        total_visits: visits,
        total_pageviews,
        views_per_visit: if visits == 0 {
            NOT_AVAILABLE.to_string()
        } else {
            format!("{:.2}", total_pageviews as f64 / visits as f64)
        },
        bounce_rate: percentage(bounced, visits),
        visit_duration: median_duration_secs
            .map(format_duration)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        median_duration_secs,
    }
}

/// Median of sorted values; even counts average the middle pair
fn median(sorted: &[i64]) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2)
    }
}

// ---------------------------------------------------------------------------
// Time series
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeGrain {
    Hour,
    Day,
}

impl TimeGrain {
    /// Hourly up to `hourly_max_hours`, daily beyond
    pub fn for_range(range: &TimeRange, hourly_max_hours: i64) -> Self {
        if range.span() <= Duration::hours(hourly_max_hours) {
            TimeGrain::Hour
        } else {
            TimeGrain::Day
        }
    }

    pub fn step(&self) -> Duration {
        match self {
            TimeGrain::Hour => Duration::hours(1),
            TimeGrain::Day => Duration::days(1),
        }
    }

    /// Truncate a timestamp to the start of its bucket (UTC)
    pub fn truncate(&self, ts: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
        ts.duration_trunc(self.step())
            .map_err(|e| EngineError::InvalidRange(format!("cannot truncate {}: {}", ts, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    pub bucket: DateTime<Utc>,
    pub pageviews: usize,
    pub visitors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    pub grain: TimeGrain,
    pub points: Vec<TimeSeriesPoint>,
}

/// Pageviews per bucket, zero-filled across the selected range
pub fn compute_time_series(
    rows: &[HydratedEvent],
    predicate: &Predicate,
    range: &TimeRange,
    hourly_max_hours: i64,
) -> Result<TimeSeries, EngineError> {
    if !range.is_valid() {
        return Err(EngineError::InvalidRange(format!(
            "{} is after {}",
            range.from, range.to
        )));
    }

    let grain = TimeGrain::for_range(range, hourly_max_hours);
    let mut buckets: BTreeMap<DateTime<Utc>, (usize, HashSet<&str>)> = BTreeMap::new();

    let mut cursor = grain.truncate(range.from)?;
    while cursor < range.to {
        buckets.entry(cursor).or_default();
        cursor += grain.step();
    }

    for row in matching(rows, predicate).filter(|r| r.is_page_view()) {
        let bucket = grain.truncate(row.timestamp)?;
        let entry = buckets.entry(bucket).or_default();
        entry.0 += 1;
        entry.1.insert(row.session_id());
    }

    let points = buckets
        .into_iter()
        .map(|(bucket, (pageviews, sessions))| TimeSeriesPoint {
            bucket,
            pageviews,
            visitors: sessions.len(),
        })
        .collect();

    Ok(TimeSeries { grain, points })
}

// ---------------------------------------------------------------------------
// Breakdown cards
// ---------------------------------------------------------------------------

/// Breakdown cards with selectable tabs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Card {
    Sources,
    Pages,
    Regions,
    Devices,
}

impl Card {
    pub fn all() -> [Card; 4] {
        [Card::Sources, Card::Pages, Card::Regions, Card::Devices]
    }

    pub fn tabs(&self) -> &'static [BreakdownTab] {
        match self {
            Card::Sources => &[
                BreakdownTab::Sources,
                BreakdownTab::Channels,
                BreakdownTab::Campaigns,
            ],
            Card::Pages => &[
                BreakdownTab::TopPages,
                BreakdownTab::EntryPages,
                BreakdownTab::ExitPages,
            ],
            Card::Regions => &[
                BreakdownTab::Countries,
                BreakdownTab::Regions,
                BreakdownTab::Cities,
            ],
            Card::Devices => &[
                BreakdownTab::Browsers,
                BreakdownTab::OperatingSystems,
                BreakdownTab::ScreenSizes,
            ],
        }
    }

    pub fn default_tab(&self) -> BreakdownTab {
        self.tabs()[0]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Card::Sources => "sources",
            Card::Pages => "pages",
            Card::Regions => "regions",
            Card::Devices => "devices",
        }
    }
}

/// One sub-breakdown of a card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BreakdownTab {
    Sources,
    Channels,
    Campaigns,
    TopPages,
    EntryPages,
    ExitPages,
    Countries,
    Regions,
    Cities,
    Browsers,
    OperatingSystems,
    ScreenSizes,
}

impl BreakdownTab {
    pub fn card(&self) -> Card {
        match self {
            BreakdownTab::Sources | BreakdownTab::Channels | BreakdownTab::Campaigns => {
                Card::Sources
            }
            BreakdownTab::TopPages | BreakdownTab::EntryPages | BreakdownTab::ExitPages => {
                Card::Pages
            }
            BreakdownTab::Countries | BreakdownTab::Regions | BreakdownTab::Cities => {
                Card::Regions
            }
            BreakdownTab::Browsers
            | BreakdownTab::OperatingSystems
            | BreakdownTab::ScreenSizes => Card::Devices,
        }
    }

    /// Segment kind a click on one of this tab's rows creates
    pub fn segment_kind(&self) -> &'static str {
        match self {
            BreakdownTab::Sources => kinds::SOURCE,
            BreakdownTab::Channels => kinds::CHANNEL,
            BreakdownTab::Campaigns => kinds::CAMPAIGN,
            BreakdownTab::TopPages => kinds::PAGE,
            BreakdownTab::EntryPages => kinds::ENTRY_PAGE,
            BreakdownTab::ExitPages => kinds::EXIT_PAGE,
            BreakdownTab::Countries => kinds::COUNTRY,
            BreakdownTab::Regions => kinds::REGION,
            BreakdownTab::Cities => kinds::CITY,
            BreakdownTab::Browsers => kinds::BROWSER,
            BreakdownTab::OperatingSystems => kinds::OS,
            BreakdownTab::ScreenSizes => kinds::SCREEN_SIZE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakdownTab::Sources => "sources",
            BreakdownTab::Channels => "channels",
            BreakdownTab::Campaigns => "campaigns",
            BreakdownTab::TopPages => "top_pages",
            BreakdownTab::EntryPages => "entry_pages",
            BreakdownTab::ExitPages => "exit_pages",
            BreakdownTab::Countries => "countries",
            BreakdownTab::Regions => "regions",
            BreakdownTab::Cities => "cities",
            BreakdownTab::Browsers => "browsers",
            BreakdownTab::OperatingSystems => "operating_systems",
            BreakdownTab::ScreenSizes => "screen_sizes",
        }
    }

    /// Grouping key of a row-level tab
    fn row_key(&self, row: &HydratedEvent) -> Option<String> {
        let key = match self {
            BreakdownTab::Sources => source_label(row),
            BreakdownTab::Channels => Some(classify_channel(row).label().to_string()),
            BreakdownTab::Campaigns => row.column_text("utm_campaign"),
            BreakdownTab::TopPages => {
                if row.is_page_view() {
                    Some(row.pathname.clone())
                } else {
                    None
                }
            }
            BreakdownTab::Countries => row.column_text("country"),
            BreakdownTab::Regions => row.column_text("region"),
            BreakdownTab::Cities => row.column_text("city"),
            BreakdownTab::Browsers => row.column_text("browser"),
            BreakdownTab::OperatingSystems => row.column_text("os"),
            BreakdownTab::ScreenSizes => screen_size_label(row),
            // Whole-session pages, the same values the entry/exit segments compare
            BreakdownTab::EntryPages => row.session.entry_page.clone(),
            BreakdownTab::ExitPages => row.session.exit_page.clone(),
        };
        key.filter(|k| !k.trim().is_empty())
    }
}

impl FromStr for BreakdownTab {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Card::all()
            .iter()
            .flat_map(|c| c.tabs().iter())
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown tab: {}", s))
    }
}

/// One row of a breakdown card
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownRow {
    pub value: String,
    /// Distinct sessions
    pub visitors: usize,
    /// Raw occurrences, for cards that report them
    pub occurrences: Option<usize>,
    /// Share of all distinct sessions in scope
    pub percentage: f64,
    /// Segment a click on this row adds
    pub segment: Segment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownResult {
    pub tab: BreakdownTab,
    pub rows: Vec<BreakdownRow>,
}

#[derive(Default)]
struct Group<'a> {
    sessions: HashSet<&'a str>,
    occurrences: usize,
}

type Groups<'a> = HashMap<String, Group<'a>>;

fn add_to_group<'a>(groups: &mut Groups<'a>, key: String, row: &'a HydratedEvent) {
    let group = groups.entry(key).or_default();
    group.sessions.insert(row.session_id());
    group.occurrences += 1;
}

/// Sort by visitors desc, occurrences desc, then value; cap at `limit`
fn finish_rows<F>(
    groups: Groups<'_>,
    total_sessions: usize,
    limit: usize,
    with_occurrences: bool,
    make_segment: F,
) -> Vec<BreakdownRow>
where
    F: Fn(&str) -> Segment,
{
    let mut rows: Vec<BreakdownRow> = groups
        .into_iter()
        .map(|(value, group)| BreakdownRow {
            segment: make_segment(&value),
            visitors: group.sessions.len(),
            occurrences: with_occurrences.then_some(group.occurrences),
            percentage: percentage(group.sessions.len(), total_sessions),
            value,
        })
        .collect();

    rows.sort_by(|a, b| {
        b.visitors
            .cmp(&a.visitors)
            .then_with(|| b.occurrences.cmp(&a.occurrences))
            .then_with(|| a.value.cmp(&b.value))
    });
    rows.truncate(limit);
    rows
}

/// Compute one tab of a breakdown card
pub fn compute_breakdown(
    rows: &[HydratedEvent],
    predicate: &Predicate,
    tab: BreakdownTab,
    limit: usize,
) -> BreakdownResult {
    let scoped: Vec<&HydratedEvent> = matching(rows, predicate).collect();
    let total_sessions = distinct_sessions(scoped.iter().copied());
    let mut groups: Groups<'_> = HashMap::new();

    for &row in &scoped {
        if let Some(key) = tab.row_key(row) {
            add_to_group(&mut groups, key, row);
        }
    }

    let with_occurrences = tab == BreakdownTab::TopPages;
    let kind = tab.segment_kind();
    BreakdownResult {
        tab,
        rows: finish_rows(groups, total_sessions, limit, with_occurrences, |value| {
            Segment::new(kind, value)
        }),
    }
}

/// Events card: every event name with sessions and occurrences
pub fn compute_events(rows: &[HydratedEvent], predicate: &Predicate, limit: usize) -> Vec<BreakdownRow> {
    let scoped: Vec<&HydratedEvent> = matching(rows, predicate).collect();
    let total_sessions = distinct_sessions(scoped.iter().copied());
    let mut groups: Groups<'_> = HashMap::new();
    for &row in &scoped {
        add_to_group(&mut groups, row.event.clone(), row);
    }
    finish_rows(groups, total_sessions, limit, true, |value| {
        Segment::new(kinds::EVENT, value)
    })
}

// ---------------------------------------------------------------------------
// Custom properties
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyKey {
    pub key: String,
    pub visitors: usize,
}

/// Custom property keys present in scope, most common first
pub fn compute_property_keys(rows: &[HydratedEvent], predicate: &Predicate) -> Vec<PropertyKey> {
    let mut keys: HashMap<&str, HashSet<&str>> = HashMap::new();
    for row in matching(rows, predicate) {
        for key in row.properties.keys() {
            keys.entry(key.as_str()).or_default().insert(row.session_id());
        }
    }

    let mut out: Vec<PropertyKey> = keys
        .into_iter()
        .map(|(key, sessions)| PropertyKey {
            key: key.to_string(),
            visitors: sessions.len(),
        })
        .collect();
    out.sort_by(|a, b| b.visitors.cmp(&a.visitors).then_with(|| a.key.cmp(&b.key)));
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyBreakdown {
    pub key: String,
    pub rows: Vec<BreakdownRow>,
}

/// Values of one custom property with sessions and occurrences
pub fn compute_property_values(
    rows: &[HydratedEvent],
    predicate: &Predicate,
    key: &str,
    limit: usize,
) -> PropertyBreakdown {
    let scoped: Vec<&HydratedEvent> = matching(rows, predicate).collect();
    let total_sessions = distinct_sessions(scoped.iter().copied());
    let mut groups: Groups<'_> = HashMap::new();
    for &row in &scoped {
        if let Some(value) = row.property_text(key) {
            add_to_group(&mut groups, value, row);
        }
    }

    PropertyBreakdown {
        key: key.to_string(),
        rows: finish_rows(groups, total_sessions, limit, true, |value| {
            Segment::property(key, value)
        }),
    }
}

/// Keep the previous key if still available, else the first, else none
pub fn select_property_key(previous: Option<&str>, available: &[PropertyKey]) -> Option<String> {
    if let Some(prev) = previous {
        if available.iter().any(|k| k.key == prev) {
            return Some(prev.to_string());
        }
    }
    available.first().map(|k| k.key.clone())
}
