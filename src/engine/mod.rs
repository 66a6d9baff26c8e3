//! Engine - session hydration and filtered aggregation
//!
//! Turns two-tier raw analytics events into a fully-populated event table and
//! recomputes every dashboard view whenever the filter set changes.
//!
//! # Architecture
//!
//! ```text
//! RawDataSource (SQLite / in-memory)
//!     ↓ initial_events + delta_events + AttributeSchema
//! hydrate() → HydratedTable (rows share one Arc<SessionContext> per session)
//!     ↓
//! SegmentSet → compile() → Predicate
//!     ↓
//! views: stats, time series, breakdown cards, events, property keys
//!     ↓ barrier
//! flow graph, property values
//!     ↓
//! Orchestrator → EngineSnapshot (watch channel)
//! ```

pub mod channel;
pub mod db;
pub mod error;
pub mod filter;
pub mod flow;
pub mod hydration;
pub mod orchestrator;
pub mod segments;
pub mod source;
pub mod types;
pub mod views;

pub use db::{run_schema_migrations, SqliteDataSource};
pub use error::EngineError;
pub use filter::{compile, Predicate};
pub use flow::{FlowGraph, FlowLimits};
pub use hydration::hydrate;
pub use orchestrator::{EngineHandle, EngineSnapshot, EngineStatus, Orchestrator, ViewResults};
pub use segments::{kinds, Segment, SegmentSet};
pub use source::{InMemoryDataSource, RawDataSource};
pub use types::{
    AttributeMap, AttributeSchema, DatasetSelection, HydratedEvent, HydratedTable, RawDataset,
    RawDeltaEvent, RawInitialEvent, TimeRange,
};
pub use views::{BreakdownTab, Card};
