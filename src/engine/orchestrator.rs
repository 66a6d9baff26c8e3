//! Orchestrator: owns the dataset and drives load / aggregate cycles
//!
//! ## Architecture
//!
//! ```text
//! EngineHandle ──EngineCommand──▶ Orchestrator (actor task)
//!      ▲                              │  owns EngineState, Arc<HydratedTable>
//!      │                              │
//!      └──── watch<EngineSnapshot> ◀──┤
//!                                     │ spawns
//!                                     ▼
//!        load task: fetch → hydrate ──CycleMessage──▶ actor
//!        aggregate task:
//!            JoinSet [stats, time series, 4 cards, events, property keys]
//!                ↓ barrier
//!            JoinSet [flow, property values(selected key)]
//!                ↓
//!            Finished ──CycleMessage──▶ actor
//! ```
//!
//! ## State machine
//!
//! `initializing` (cold start) / `loading_data` → `hydrating` → `aggregating`
//! → `idle`. `aggregating_tab` recomputes one card. `error` is reachable from
//! any state and keeps prior results.
//!
//! Every full load or aggregate gets a new cycle id. Messages from other
//! cycles are discarded. Requests arriving while busy are dropped, not
//! queued; when a cycle settles `reconcile` compares current state with what
//! the results were computed for and starts whatever is out of date.

use super::error::EngineError;
use super::filter::{compile, Predicate};
use super::flow::{compute_flow, FlowGraph, FlowLimits};
use super::hydration::hydrate;
use super::segments::{Segment, SegmentSet};
use super::source::RawDataSource;
use super::types::{DatasetSelection, HydratedTable, HydrationReport, TimeRange};
use super::views::{
    compute_breakdown, compute_events, compute_property_keys, compute_property_values,
    compute_stats, compute_time_series, select_property_key, BreakdownResult, BreakdownRow,
    BreakdownTab, Card, PropertyBreakdown, PropertyKey, StatsSummary, TimeSeries,
};
use crate::config::EngineConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

/// View whose failure fails the whole cycle (dependent steps need it)
const PROPERTY_KEYS_VIEW: &str = "property_keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Initializing,
    Idle,
    LoadingData,
    Hydrating,
    Aggregating,
    AggregatingTab,
    Error,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Initializing => "initializing",
            EngineStatus::Idle => "idle",
            EngineStatus::LoadingData => "loading_data",
            EngineStatus::Hydrating => "hydrating",
            EngineStatus::Aggregating => "aggregating",
            EngineStatus::AggregatingTab => "aggregating_tab",
            EngineStatus::Error => "error",
        }
    }

    fn is_loading(&self) -> bool {
        matches!(
            self,
            EngineStatus::Initializing | EngineStatus::LoadingData | EngineStatus::Hydrating
        )
    }

    /// Nothing in flight
    pub fn is_settled(&self) -> bool {
        matches!(self, EngineStatus::Idle | EngineStatus::Error)
    }
}

/// A view result tagged with the cycle that produced it
///
/// `revision` is bumped on every store, so a consumer can tell which views
/// were recomputed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Computed<T> {
    pub cycle: u64,
    pub revision: u64,
    pub value: T,
}

/// Latest result per view, each consumable independently
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewResults {
    pub stats: Option<Computed<StatsSummary>>,
    pub time_series: Option<Computed<TimeSeries>>,
    pub breakdowns: BTreeMap<Card, Computed<BreakdownResult>>,
    pub events: Option<Computed<Vec<BreakdownRow>>>,
    pub property_keys: Option<Computed<Vec<PropertyKey>>>,
    pub property_values: Option<Computed<PropertyBreakdown>>,
    pub flow: Option<Computed<FlowGraph>>,
}

/// Published after every command and cycle message
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub status: EngineStatus,
    pub error: Option<String>,
    pub cycle_id: u64,
    /// Dataset the user asked for
    pub selection: Option<DatasetSelection>,
    /// Dataset the current table holds
    pub loaded: Option<DatasetSelection>,
    pub segments: SegmentSet,
    pub selected_tabs: BTreeMap<Card, BreakdownTab>,
    pub selected_property: Option<String>,
    pub hydration: Option<HydrationReport>,
    pub results: ViewResults,
    /// Per-view failures of the latest attempt, keyed by view name
    pub view_errors: BTreeMap<String, String>,
    #[serde(skip)]
    commands_seen: u64,
}

enum EngineCommand {
    SelectDataset(DatasetSelection),
    Refresh,
    AddSegment(Segment),
    RemoveSegment(Segment),
    ClearSegments,
    SelectTab(BreakdownTab),
    SelectProperty(String),
    Shutdown,
}

/// Work units the aggregation tasks run
#[derive(Debug, Clone, PartialEq)]
enum ViewJob {
    Stats,
    TimeSeries,
    Breakdown(BreakdownTab),
    Events,
    PropertyKeys,
    Flow,
    PropertyValues(String),
}

impl ViewJob {
    fn name(&self) -> String {
        match self {
            ViewJob::Stats => "stats".to_string(),
            ViewJob::TimeSeries => "time_series".to_string(),
            ViewJob::Breakdown(tab) => breakdown_view_name(tab.card()),
            ViewJob::Events => "events".to_string(),
            ViewJob::PropertyKeys => PROPERTY_KEYS_VIEW.to_string(),
            ViewJob::Flow => "flow".to_string(),
            ViewJob::PropertyValues(_) => "property_values".to_string(),
        }
    }
}

fn breakdown_view_name(card: Card) -> String {
    format!("breakdown:{}", card.as_str())
}

#[derive(Debug)]
enum ViewOutput {
    Stats(StatsSummary),
    TimeSeries(TimeSeries),
    Breakdown(Card, BreakdownResult),
    Events(Vec<BreakdownRow>),
    PropertyKeys(Vec<PropertyKey>),
    PropertyValues(PropertyBreakdown),
    Flow(FlowGraph),
}

impl ViewOutput {
    fn name(&self) -> String {
        match self {
            ViewOutput::Stats(_) => "stats".to_string(),
            ViewOutput::TimeSeries(_) => "time_series".to_string(),
            ViewOutput::Breakdown(card, _) => breakdown_view_name(*card),
            ViewOutput::Events(_) => "events".to_string(),
            ViewOutput::PropertyKeys(_) => PROPERTY_KEYS_VIEW.to_string(),
            ViewOutput::PropertyValues(_) => "property_values".to_string(),
            ViewOutput::Flow(_) => "flow".to_string(),
        }
    }
}

/// Read-only inputs shared by every view task of one cycle
struct ViewContext {
    table: Arc<HydratedTable>,
    predicate: Predicate,
    range: TimeRange,
    row_limit: usize,
    hourly_grain_max_hours: i64,
    flow_limits: FlowLimits,
}

impl ViewContext {
    fn compute(&self, view: &ViewJob) -> Result<ViewOutput, EngineError> {
        let rows = &self.table.rows;
        let predicate = &self.predicate;
        let output = match view {
            ViewJob::Stats => ViewOutput::Stats(compute_stats(rows, predicate)),
            ViewJob::TimeSeries => ViewOutput::TimeSeries(compute_time_series(
                rows,
                predicate,
                &self.range,
                self.hourly_grain_max_hours,
            )?),
            ViewJob::Breakdown(tab) => ViewOutput::Breakdown(
                tab.card(),
                compute_breakdown(rows, predicate, *tab, self.row_limit),
            ),
            ViewJob::Events => ViewOutput::Events(compute_events(rows, predicate, self.row_limit)),
            ViewJob::PropertyKeys => ViewOutput::PropertyKeys(compute_property_keys(rows, predicate)),
            ViewJob::Flow => ViewOutput::Flow(compute_flow(rows, predicate, self.flow_limits)),
            ViewJob::PropertyValues(key) => ViewOutput::PropertyValues(compute_property_values(
                rows,
                predicate,
                key,
                self.row_limit,
            )),
        };
        Ok(output)
    }
}

/// Run one view, turning a panic into a view error
fn run_view(ctx: &ViewContext, view: &ViewJob) -> Result<ViewOutput, EngineError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| ctx.compute(view))) {
        Ok(result) => result,
        Err(_) => Err(EngineError::View {
            view: view.name(),
            message: "aggregation panicked".to_string(),
        }),
    }
}

/// Messages from spawned tasks back to the actor
#[derive(Debug)]
enum CycleMessage {
    Fetched {
        cycle: u64,
    },
    Loaded {
        cycle: u64,
        selection: DatasetSelection,
        table: HydratedTable,
    },
    LoadFailed {
        cycle: u64,
        message: String,
    },
    View {
        cycle: u64,
        output: ViewOutput,
    },
    ViewFailed {
        cycle: u64,
        view: String,
        message: String,
    },
    /// A load-bearing view failed; dependent steps were skipped
    Failed {
        cycle: u64,
        generation: u64,
        message: String,
    },
    Finished {
        cycle: u64,
        generation: u64,
        previous_property: Option<String>,
        property_key: Option<String>,
    },
    TabReady {
        cycle: u64,
        output: ViewOutput,
    },
    TabFailed {
        cycle: u64,
        view: String,
        message: String,
    },
}

impl CycleMessage {
    fn cycle(&self) -> u64 {
        match self {
            CycleMessage::Fetched { cycle }
            | CycleMessage::Loaded { cycle, .. }
            | CycleMessage::LoadFailed { cycle, .. }
            | CycleMessage::View { cycle, .. }
            | CycleMessage::ViewFailed { cycle, .. }
            | CycleMessage::Failed { cycle, .. }
            | CycleMessage::Finished { cycle, .. }
            | CycleMessage::TabReady { cycle, .. }
            | CycleMessage::TabFailed { cycle, .. } => *cycle,
        }
    }
}

struct EngineState {
    status: EngineStatus,
    error: Option<String>,
    cycle_id: u64,
    revision: u64,
    commands_seen: u64,
    /// First load has completed (or failed)
    initialized: bool,

    desired: Option<DatasetSelection>,
    /// Last selection a load was started for
    attempted: Option<DatasetSelection>,
    loaded: Option<DatasetSelection>,

    segments: SegmentSet,
    /// Bumped on every effective filter change
    filter_generation: u64,
    aggregated_generation: Option<u64>,

    selected_tabs: BTreeMap<Card, BreakdownTab>,
    /// Cards whose selected tab has not been computed yet
    pending_tabs: BTreeSet<Card>,
    selected_property: Option<String>,
    pending_property: bool,

    hydration: Option<HydrationReport>,
    results: ViewResults,
    view_errors: BTreeMap<String, String>,
    /// Views that failed in the running full cycle
    failed_views: BTreeSet<String>,
}

impl EngineState {
    fn new(initial: Option<DatasetSelection>) -> Self {
        Self {
            status: if initial.is_some() {
                EngineStatus::Initializing
            } else {
                EngineStatus::Idle
            },
            error: None,
            cycle_id: 0,
            revision: 0,
            commands_seen: 0,
            initialized: false,
            desired: initial,
            attempted: None,
            loaded: None,
            segments: SegmentSet::new(),
            filter_generation: 0,
            aggregated_generation: None,
            selected_tabs: default_tabs(),
            pending_tabs: BTreeSet::new(),
            selected_property: None,
            pending_property: false,
            hydration: None,
            results: ViewResults::default(),
            view_errors: BTreeMap::new(),
            failed_views: BTreeSet::new(),
        }
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            status: self.status,
            error: self.error.clone(),
            cycle_id: self.cycle_id,
            selection: self.desired.clone(),
            loaded: self.loaded.clone(),
            segments: self.segments.clone(),
            selected_tabs: self.selected_tabs.clone(),
            selected_property: self.selected_property.clone(),
            hydration: self.hydration.clone(),
            results: self.results.clone(),
            view_errors: self.view_errors.clone(),
            commands_seen: self.commands_seen,
        }
    }
}

fn default_tabs() -> BTreeMap<Card, BreakdownTab> {
    Card::all()
        .iter()
        .map(|card| (*card, card.default_tab()))
        .collect()
}

/// Client side of the orchestrator
///
/// Cheap to clone. Every method only enqueues a command; use
/// `wait_for_idle` to observe the outcome.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    snapshots: watch::Receiver<EngineSnapshot>,
    sent: Arc<AtomicU64>,
}

impl EngineHandle {
    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Switch site or range; resets segments, tabs and results
    pub async fn select_dataset(&self, selection: DatasetSelection) -> Result<(), EngineError> {
        self.send(EngineCommand::SelectDataset(selection)).await
    }

    /// Reload the current selection, keeping segments and prior results
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Refresh).await
    }

    pub async fn add_segment(&self, segment: Segment) -> Result<(), EngineError> {
        self.send(EngineCommand::AddSegment(segment)).await
    }

    pub async fn remove_segment(&self, segment: Segment) -> Result<(), EngineError> {
        self.send(EngineCommand::RemoveSegment(segment)).await
    }

    pub async fn clear_segments(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::ClearSegments).await
    }

    /// Select a card tab; the card is implied by the tab
    pub async fn select_tab(&self, tab: BreakdownTab) -> Result<(), EngineError> {
        self.send(EngineCommand::SelectTab(tab)).await
    }

    /// Select the custom property shown on the properties card
    pub async fn select_property(&self, key: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::SelectProperty(key.into())).await
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Shutdown).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until every command sent so far is processed and nothing is in flight
    pub async fn wait_for_idle(&self) -> Result<EngineSnapshot, EngineError> {
        let target = self.sent.load(Ordering::SeqCst);
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| s.commands_seen >= target && s.status.is_settled())
            .await
            .map_err(|_| EngineError::Closed)?;
        Ok(snapshot.clone())
    }
}

/// Actor owning the engine state and the data source handle
pub struct Orchestrator {
    source: Arc<dyn RawDataSource>,
    config: EngineConfig,
    state: EngineState,
    table: Option<Arc<HydratedTable>>,
    commands: mpsc::Receiver<EngineCommand>,
    cycle_tx: mpsc::UnboundedSender<CycleMessage>,
    cycle_rx: mpsc::UnboundedReceiver<CycleMessage>,
    snapshots: watch::Sender<EngineSnapshot>,
    cycle_started: Option<Instant>,
}

impl Orchestrator {
    /// Build the actor and its handle without starting it
    pub fn new(
        source: Arc<dyn RawDataSource>,
        config: &EngineConfig,
        initial: Option<DatasetSelection>,
    ) -> (Self, EngineHandle) {
        let state = EngineState::new(initial);
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (cycle_tx, cycle_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());

        let handle = EngineHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            sent: Arc::new(AtomicU64::new(0)),
        };

        let orchestrator = Self {
            source,
            config: config.clone(),
            state,
            table: None,
            commands: command_rx,
            cycle_tx,
            cycle_rx,
            snapshots: snapshot_tx,
            cycle_started: None,
        };

        (orchestrator, handle)
    }

    /// Spawn the actor on the current tokio runtime
    pub fn spawn(
        source: Arc<dyn RawDataSource>,
        config: &EngineConfig,
        initial: Option<DatasetSelection>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Self::new(source, config, initial);
        let task = tokio::spawn(orchestrator.run());
        (handle, task)
    }

    /// Actor loop; returns on shutdown or when every handle is dropped
    pub async fn run(mut self) {
        log::info!(
            "🚀 Engine orchestrator started (source: {})",
            self.source.backend_type()
        );
        log::info!(
            "   ├─ Row limit: {}, flow: min {} / max {} edges",
            self.config.breakdown_row_limit,
            self.config.flow_min_transitions,
            self.config.flow_max_edges
        );
        log::info!("   └─ Hourly grain up to {}h", self.config.hourly_grain_max_hours);

        if self.state.desired.is_some() {
            self.start_load();
        }
        self.publish();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = self.cycle_rx.recv() => self.handle_cycle_message(message),
            }
            self.publish();
        }

        log::info!(
            "🛑 Engine orchestrator stopped after {} cycle(s)",
            self.state.cycle_id
        );
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.state.snapshot());
    }

    fn handle_command(&mut self, command: EngineCommand) {
        self.state.commands_seen += 1;

        match command {
            EngineCommand::SelectDataset(selection) => {
                log::info!(
                    "🎯 Dataset selected: site {} ({} → {})",
                    selection.site_id,
                    selection.range.from,
                    selection.range.to
                );
                self.reset_for_dataset(selection);
                if self.state.status.is_loading() {
                    log::debug!("Load already in flight - new selection picked up on settle");
                } else {
                    self.start_load();
                }
                return;
            }
            EngineCommand::Refresh => {
                self.state.attempted = None;
                if self.state.status.is_loading() {
                    log::debug!("Load already in flight - refresh picked up on settle");
                } else {
                    self.start_load();
                }
                return;
            }
            EngineCommand::AddSegment(segment) => {
                if self.state.segments.add(segment) {
                    self.state.filter_generation += 1;
                }
            }
            EngineCommand::RemoveSegment(segment) => {
                if self.state.segments.remove(&segment) {
                    self.state.filter_generation += 1;
                }
            }
            EngineCommand::ClearSegments => {
                if self.state.segments.clear() {
                    self.state.filter_generation += 1;
                }
            }
            EngineCommand::SelectTab(tab) => {
                let card = tab.card();
                self.state.selected_tabs.insert(card, tab);
                let computed = self.state.results.breakdowns.get(&card).map(|c| c.value.tab);
                if computed == Some(tab) {
                    self.state.pending_tabs.remove(&card);
                } else {
                    self.state.pending_tabs.insert(card);
                }
            }
            EngineCommand::SelectProperty(key) => {
                let computed = self
                    .state
                    .results
                    .property_values
                    .as_ref()
                    .map(|c| c.value.key.as_str());
                self.state.pending_property = computed != Some(key.as_str());
                self.state.selected_property = Some(key);
            }
            EngineCommand::Shutdown => return,
        }

        if self.state.status.is_settled() {
            self.reconcile();
        } else {
            log::debug!(
                "Busy ({}) - request deferred to settle",
                self.state.status.as_str()
            );
        }
    }

    /// Replace everything tied to the previous dataset
    fn reset_for_dataset(&mut self, selection: DatasetSelection) {
        let state = &mut self.state;
        state.desired = Some(selection);
        state.loaded = None;
        state.segments.clear();
        state.filter_generation += 1;
        state.aggregated_generation = None;
        state.selected_tabs = default_tabs();
        state.pending_tabs.clear();
        state.selected_property = None;
        state.pending_property = false;
        state.hydration = None;
        state.results = ViewResults::default();
        state.view_errors.clear();
        state.failed_views.clear();
        state.error = None;
        self.table = None;
    }

    /// Start whatever is out of date, most expensive first
    fn reconcile(&mut self) {
        if self.state.desired.is_some() && self.state.desired != self.state.attempted {
            self.start_load();
            return;
        }

        if self.table.is_none() || self.state.loaded != self.state.desired {
            return;
        }

        if self.state.aggregated_generation != Some(self.state.filter_generation) {
            self.start_aggregate();
            return;
        }

        if let Some(card) = self.state.pending_tabs.pop_first() {
            self.start_tab_job(card);
            return;
        }

        if std::mem::take(&mut self.state.pending_property) {
            if let Some(key) = self.state.selected_property.clone() {
                if let Some(ctx) = self.view_context() {
                    self.spawn_tab_job(ViewJob::PropertyValues(key), ctx);
                }
            }
        }
    }

    fn start_load(&mut self) {
        let Some(selection) = self.state.desired.clone() else {
            return;
        };
        self.state.attempted = Some(selection.clone());

        if !selection.range.is_valid() {
            let err = EngineError::InvalidRange(format!(
                "{} is after {}",
                selection.range.from, selection.range.to
            ));
            log::error!("❌ {}", err);
            self.state.initialized = true;
            self.state.status = EngineStatus::Error;
            self.state.error = Some(err.to_string());
            return;
        }

        self.state.cycle_id += 1;
        let cycle = self.state.cycle_id;
        self.state.status = if self.state.initialized {
            EngineStatus::LoadingData
        } else {
            EngineStatus::Initializing
        };
        self.state.error = None;
        self.cycle_started = Some(Instant::now());

        log::info!(
            "📥 Cycle {}: loading site {} via {}",
            cycle,
            selection.site_id,
            self.source.backend_type()
        );

        let source = Arc::clone(&self.source);
        let tx = self.cycle_tx.clone();
        tokio::spawn(async move {
            let fetched = source.fetch(&selection.site_id, &selection.range).await;
            drop(source);
            match fetched {
                Ok(dataset) => {
                    let _ = tx.send(CycleMessage::Fetched { cycle });
                    match tokio::task::spawn_blocking(move || hydrate(dataset)).await {
                        Ok(table) => {
                            let _ = tx.send(CycleMessage::Loaded {
                                cycle,
                                selection,
                                table,
                            });
                        }
                        Err(e) => {
                            let _ = tx.send(CycleMessage::LoadFailed {
                                cycle,
                                message: format!("Hydration task failed: {}", e),
                            });
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(CycleMessage::LoadFailed {
                        cycle,
                        message: failure_message(err),
                    });
                }
            }
        });
    }

    fn view_context(&self) -> Option<Arc<ViewContext>> {
        let table = self.table.as_ref()?;
        let selection = self.state.loaded.as_ref()?;
        Some(Arc::new(ViewContext {
            table: Arc::clone(table),
            predicate: compile(&self.state.segments),
            range: selection.range,
            row_limit: self.config.breakdown_row_limit,
            hourly_grain_max_hours: self.config.hourly_grain_max_hours,
            flow_limits: self.config.flow_limits(),
        }))
    }

    fn start_aggregate(&mut self) {
        let Some(ctx) = self.view_context() else {
            return;
        };

        self.state.cycle_id += 1;
        self.state.status = EngineStatus::Aggregating;
        self.state.error = None;
        self.state.pending_tabs.clear();
        self.state.pending_property = false;
        self.state.failed_views.clear();
        self.cycle_started = Some(Instant::now());

        let job = AggregateJob {
            cycle: self.state.cycle_id,
            generation: self.state.filter_generation,
            tabs: self.state.selected_tabs.values().copied().collect(),
            previous_property: self.state.selected_property.clone(),
            ctx,
        };

        log::info!(
            "📊 Cycle {}: aggregating {} rows with {} segment(s)",
            job.cycle,
            job.ctx.table.rows.len(),
            self.state.segments.len()
        );

        tokio::spawn(run_aggregate_cycle(job, self.cycle_tx.clone()));
    }

    fn start_tab_job(&mut self, card: Card) {
        let tab = self
            .state
            .selected_tabs
            .get(&card)
            .copied()
            .unwrap_or_else(|| card.default_tab());
        if let Some(ctx) = self.view_context() {
            self.spawn_tab_job(ViewJob::Breakdown(tab), ctx);
        }
    }

    /// Recompute one view under the current cycle id
    fn spawn_tab_job(&mut self, view: ViewJob, ctx: Arc<ViewContext>) {
        self.state.status = EngineStatus::AggregatingTab;
        let cycle = self.state.cycle_id;
        let tx = self.cycle_tx.clone();
        log::debug!("🔄 Cycle {}: recomputing {}", cycle, view.name());

        tokio::spawn(async move {
            let name = view.name();
            let joined = tokio::task::spawn_blocking(move || run_view(&ctx, &view)).await;
            let message = match joined {
                Ok(Ok(output)) => CycleMessage::TabReady { cycle, output },
                Ok(Err(err)) => CycleMessage::TabFailed {
                    cycle,
                    view: name,
                    message: err.to_string(),
                },
                Err(err) => CycleMessage::TabFailed {
                    cycle,
                    view: name,
                    message: format!("Aggregation task failed: {}", err),
                },
            };
            let _ = tx.send(message);
        });
    }

    fn handle_cycle_message(&mut self, message: CycleMessage) {
        if message.cycle() != self.state.cycle_id {
            log::debug!(
                "Discarding message from stale cycle {} (current {})",
                message.cycle(),
                self.state.cycle_id
            );
            return;
        }

        match message {
            CycleMessage::Fetched { .. } => {
                self.state.status = EngineStatus::Hydrating;
            }
            CycleMessage::Loaded {
                cycle,
                selection,
                table,
            } => {
                log::info!(
                    "✅ Cycle {}: hydrated {} rows across {} sessions",
                    cycle,
                    table.report.rows,
                    table.report.sessions
                );
                self.state.initialized = true;
                self.state.hydration = Some(table.report.clone());
                self.state.loaded = Some(selection);
                self.state.aggregated_generation = None;
                self.table = Some(Arc::new(table));
                self.state.status = EngineStatus::Idle;
                self.reconcile();
            }
            CycleMessage::LoadFailed { cycle, message } => {
                log::error!("❌ Cycle {}: load failed: {}", cycle, message);
                self.state.initialized = true;
                self.state.status = EngineStatus::Error;
                self.state.error = Some(message);
                self.reconcile();
            }
            CycleMessage::View { cycle, output } => {
                self.store(cycle, output);
            }
            CycleMessage::ViewFailed {
                cycle,
                view,
                message,
            } => {
                log::error!("❌ Cycle {}: view {} failed: {}", cycle, view, message);
                self.state.failed_views.insert(view.clone());
                self.state.view_errors.insert(view, message);
            }
            CycleMessage::Failed {
                cycle,
                generation,
                message,
            } => {
                log::error!("❌ Cycle {}: aggregation failed: {}", cycle, message);
                self.state.aggregated_generation = Some(generation);
                self.state.status = EngineStatus::Error;
                self.state.error = Some(message);
                self.reconcile();
            }
            CycleMessage::Finished {
                cycle,
                generation,
                previous_property,
                property_key,
            } => {
                self.state.aggregated_generation = Some(generation);
                // A key picked by the user mid-cycle wins over the cycle's choice
                if self.state.selected_property == previous_property {
                    self.state.selected_property = property_key.clone();
                }
                if property_key.is_none() {
                    self.state.results.property_values = None;
                }

                let elapsed = self
                    .cycle_started
                    .map(|t| t.elapsed().as_millis())
                    .unwrap_or_default();
                if self.state.failed_views.is_empty() {
                    self.state.status = EngineStatus::Idle;
                    log::info!("✅ Cycle {} complete in {}ms", cycle, elapsed);
                } else {
                    let failed: Vec<&str> =
                        self.state.failed_views.iter().map(String::as_str).collect();
                    let message = format!("Aggregation failed for: {}", failed.join(", "));
                    log::error!("❌ Cycle {} finished in {}ms: {}", cycle, elapsed, message);
                    self.state.status = EngineStatus::Error;
                    self.state.error = Some(message);
                }

                self.reconcile();
            }
            CycleMessage::TabReady { cycle, output } => {
                self.store(cycle, output);
                self.state.status = self.settled_status();
                self.reconcile();
            }
            CycleMessage::TabFailed {
                cycle,
                view,
                message,
            } => {
                log::error!("❌ Cycle {}: view {} failed: {}", cycle, view, message);
                self.state.view_errors.insert(view, message);
                self.state.status = self.settled_status();
                self.reconcile();
            }
        }
    }

    /// A tab job never clears an error left by the cycle it runs after
    fn settled_status(&self) -> EngineStatus {
        if self.state.error.is_some() {
            EngineStatus::Error
        } else {
            EngineStatus::Idle
        }
    }

    fn store(&mut self, cycle: u64, output: ViewOutput) {
        let revision = self.state.next_revision();
        self.state.view_errors.remove(&output.name());

        let results = &mut self.state.results;
        match output {
            ViewOutput::Stats(value) => {
                results.stats = Some(Computed { cycle, revision, value })
            }
            ViewOutput::TimeSeries(value) => {
                results.time_series = Some(Computed { cycle, revision, value })
            }
            ViewOutput::Breakdown(card, value) => {
                results
                    .breakdowns
                    .insert(card, Computed { cycle, revision, value });
            }
            ViewOutput::Events(value) => {
                results.events = Some(Computed { cycle, revision, value })
            }
            ViewOutput::PropertyKeys(value) => {
                results.property_keys = Some(Computed { cycle, revision, value })
            }
            ViewOutput::PropertyValues(value) => {
                results.property_values = Some(Computed { cycle, revision, value })
            }
            ViewOutput::Flow(value) => results.flow = Some(Computed { cycle, revision, value }),
        }
    }
}

/// Fetch errors surface with the source's own message
fn failure_message(err: EngineError) -> String {
    match err {
        EngineError::Fetch(message) => message,
        other => other.to_string(),
    }
}

struct AggregateJob {
    cycle: u64,
    generation: u64,
    tabs: Vec<BreakdownTab>,
    previous_property: Option<String>,
    ctx: Arc<ViewContext>,
}

/// Independent views concurrently, barrier, then the dependent steps
async fn run_aggregate_cycle(job: AggregateJob, tx: mpsc::UnboundedSender<CycleMessage>) {
    let cycle = job.cycle;

    let mut independent_views = vec![ViewJob::Stats, ViewJob::TimeSeries];
    independent_views.extend(job.tabs.iter().map(|tab| ViewJob::Breakdown(*tab)));
    independent_views.push(ViewJob::Events);
    independent_views.push(ViewJob::PropertyKeys);

    let mut independent = JoinSet::new();
    for view in independent_views {
        let ctx = Arc::clone(&job.ctx);
        independent.spawn_blocking(move || (view.name(), run_view(&ctx, &view)));
    }

    let mut property_keys: Option<Vec<PropertyKey>> = None;
    let mut hard_failure: Option<String> = None;

    while let Some(joined) = independent.join_next().await {
        match joined {
            Ok((_, Ok(output))) => {
                if let ViewOutput::PropertyKeys(keys) = &output {
                    property_keys = Some(keys.clone());
                }
                let _ = tx.send(CycleMessage::View { cycle, output });
            }
            Ok((view, Err(err))) if view == PROPERTY_KEYS_VIEW => {
                hard_failure = Some(err.to_string());
            }
            Ok((view, Err(err))) => {
                let _ = tx.send(CycleMessage::ViewFailed {
                    cycle,
                    view,
                    message: err.to_string(),
                });
            }
            Err(err) => {
                hard_failure.get_or_insert(format!("Aggregation task failed: {}", err));
            }
        }
    }

    let keys = match (property_keys, hard_failure) {
        (Some(keys), None) => keys,
        (_, failure) => {
            let _ = tx.send(CycleMessage::Failed {
                cycle,
                generation: job.generation,
                message: failure.unwrap_or_else(|| "Property keys unavailable".to_string()),
            });
            return;
        }
    };

    let property_key = select_property_key(job.previous_property.as_deref(), &keys);

    let mut dependent = JoinSet::new();
    let mut dependent_views = vec![ViewJob::Flow];
    if let Some(key) = &property_key {
        dependent_views.push(ViewJob::PropertyValues(key.clone()));
    }
    for view in dependent_views {
        let ctx = Arc::clone(&job.ctx);
        dependent.spawn_blocking(move || (view.name(), run_view(&ctx, &view)));
    }

    while let Some(joined) = dependent.join_next().await {
        let message = match joined {
            Ok((_, Ok(output))) => CycleMessage::View { cycle, output },
            Ok((view, Err(err))) => CycleMessage::ViewFailed {
                cycle,
                view,
                message: err.to_string(),
            },
            Err(err) => CycleMessage::ViewFailed {
                cycle,
                view: "dependent".to_string(),
                message: format!("Aggregation task failed: {}", err),
            },
        };
        let _ = tx.send(message);
    }

    let _ = tx.send(CycleMessage::Finished {
        cycle,
        generation: job.generation,
        previous_property: job.previous_property,
        property_key,
    });
}
