//! Flow-path builder: session paths -> deduplicated transition graph
//!
//! ```text
//! session rows (by timestamp)
//!     ↓ label: page_view → pathname, other → event name
//!     ↓ collapse consecutive duplicate labels
//!     ↓ number steps: "/#1" → "/pricing#2" → "signup#3"
//!     ↓ count (step_n → step_n+1) across sessions
//!     ↓ drop < min_transitions, sort desc, cap at max_edges
//! FlowGraph { nodes, edges }
//! ```
//!
//! Shares only the predicate and the hydrated table with the other views.

use super::filter::Predicate;
use super::types::HydratedEvent;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Separator between a node label and its step number
const STEP_SEPARATOR: char = '#';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLimits {
    /// Edges seen fewer times than this are dropped
    pub min_transitions: usize,
    /// Maximum number of edges returned
    pub max_edges: usize,
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self {
            min_transitions: 2,
            max_edges: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowNode {
    /// Internal id, `label#step`
    pub id: String,
    /// Display label without the step suffix
    pub label: String,
    pub step: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEdge {
    pub source: String,
    pub target: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowGraph {
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

fn node_label(row: &HydratedEvent) -> &str {
    if row.is_page_view() {
        &row.pathname
    } else {
        &row.event
    }
}

fn node_id(label: &str, step: usize) -> String {
    format!("{}{}{}", label, STEP_SEPARATOR, step)
}

/// Split `label#step` back into its parts
///
/// Splits on the last separator so labels containing `#` survive.
pub fn split_node_id(id: &str) -> (&str, usize) {
    match id.rsplit_once(STEP_SEPARATOR) {
        Some((label, step)) => match step.parse() {
            Ok(step) => (label, step),
            Err(_) => (id, 0),
        },
        None => (id, 0),
    }
}

/// Collapse consecutive duplicate labels of one session
fn session_path<'a>(rows: &[&'a HydratedEvent]) -> Vec<&'a str> {
    let mut path: Vec<&str> = Vec::with_capacity(rows.len());
    for &row in rows {
        let label = node_label(row);
        if path.last() != Some(&label) {
            path.push(label);
        }
    }
    path
}

/// Build the flow graph for sessions with at least one matching row
pub fn compute_flow(rows: &[HydratedEvent], predicate: &Predicate, limits: FlowLimits) -> FlowGraph {
    let matching_sessions: HashSet<&str> = rows
        .iter()
        .filter(|row| predicate.matches(row))
        .map(|row| row.session_id())
        .collect();

    if matching_sessions.is_empty() {
        return FlowGraph::default();
    }

    // Full sequences of matching sessions
    let mut sessions: HashMap<&str, Vec<&HydratedEvent>> = HashMap::new();
    for row in rows {
        if matching_sessions.contains(row.session_id()) {
            sessions.entry(row.session_id()).or_default().push(row);
        }
    }

    let mut transitions: HashMap<(String, String), usize> = HashMap::new();
    for session_rows in sessions.values_mut() {
        // Initial row first, then by timestamp
        session_rows.sort_by(|a, b| {
            b.is_initial
                .cmp(&a.is_initial)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        let path = session_path(session_rows.as_slice());
        for (step, pair) in path.windows(2).enumerate() {
            let source = node_id(pair[0], step + 1);
            let target = node_id(pair[1], step + 2);
            *transitions.entry((source, target)).or_insert(0) += 1;
        }
    }

    let mut edges: Vec<FlowEdge> = transitions
        .into_iter()
        .filter(|(_, count)| *count >= limits.min_transitions)
        .map(|((source, target), count)| FlowEdge {
            source,
            target,
            count,
        })
        .collect();

    edges.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.target.cmp(&b.target))
    });
    edges.truncate(limits.max_edges);

    let endpoint_ids: BTreeSet<&str> = edges
        .iter()
        .flat_map(|e| [e.source.as_str(), e.target.as_str()])
        .collect();

    let mut nodes: Vec<FlowNode> = endpoint_ids
        .into_iter()
        .map(|id| {
            let (label, step) = split_node_id(id);
            FlowNode {
                id: id.to_string(),
                label: label.to_string(),
                step,
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.step.cmp(&b.step).then_with(|| a.label.cmp(&b.label)));

    log::debug!(
        "Flow graph: {} sessions → {} nodes, {} edges",
        sessions.len(),
        nodes.len(),
        edges.len()
    );

    FlowGraph { nodes, edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::segments::{kinds, Segment, SegmentSet};
    use crate::engine::types::{AttributeMap, SessionContext, PAGE_VIEW};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn session(id: &str, country: &str, events: &[(&str, &str)]) -> Vec<HydratedEvent> {
        let mut attributes = AttributeMap::new();
        attributes.insert("country".to_string(), json!(country));
        let ctx = Arc::new(SessionContext {
            session_id: id.to_string(),
            attributes,
            entry_page: None,
            exit_page: None,
        });
        events
            .iter()
            .enumerate()
            .map(|(i, (event, pathname))| HydratedEvent {
                event: event.to_string(),
                pathname: pathname.to_string(),
                timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 10, 0).unwrap(),
                properties: AttributeMap::new(),
                is_initial: i == 0,
                session: Arc::clone(&ctx),
            })
            .collect()
    }

    fn no_threshold() -> FlowLimits {
        FlowLimits {
            min_transitions: 1,
            max_edges: 100,
        }
    }

    #[test]
    fn test_consecutive_duplicates_collapse() {
        let rows = session(
            "a",
            "US",
            &[(PAGE_VIEW, "/"), (PAGE_VIEW, "/"), ("click", "/"), (PAGE_VIEW, "/pricing")],
        );
        let graph = compute_flow(&rows, &Predicate::Always, no_threshold());

        let pairs: Vec<(&str, &str)> = graph
            .edges
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&("/#1", "click#2")));
        assert!(pairs.contains(&("click#2", "/pricing#3")));
    }

    #[test]
    fn test_revisits_are_distinct_steps_not_self_loops() {
        let rows = session("a", "US", &[(PAGE_VIEW, "/"), (PAGE_VIEW, "/a"), (PAGE_VIEW, "/")]);
        let graph = compute_flow(&rows, &Predicate::Always, no_threshold());
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.nodes.iter().filter(|n| n.label == "/").count(), 2);
        for edge in &graph.edges {
            assert_ne!(edge.source, edge.target);
        }
    }

    #[test]
    fn test_counts_threshold_and_cap() {
        let mut rows = Vec::new();
        for i in 0..3 {
            rows.extend(session(&format!("s{}", i), "US", &[(PAGE_VIEW, "/"), (PAGE_VIEW, "/pricing")]));
        }
        rows.extend(session("rare", "US", &[(PAGE_VIEW, "/"), (PAGE_VIEW, "/jobs")]));

        let graph = compute_flow(
            &rows,
            &Predicate::Always,
            FlowLimits {
                min_transitions: 2,
                max_edges: 10,
            },
        );
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].count, 3);
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.nodes.iter().all(|n| !n.label.contains('#')));

        let capped = compute_flow(
            &rows,
            &Predicate::Always,
            FlowLimits {
                min_transitions: 1,
                max_edges: 1,
            },
        );
        assert_eq!(capped.edges.len(), 1);
        assert_eq!(capped.edges[0].target, "/pricing#2");
    }

    #[test]
    fn test_every_node_is_an_edge_endpoint() {
        let mut rows = session("a", "US", &[(PAGE_VIEW, "/"), (PAGE_VIEW, "/a"), (PAGE_VIEW, "/b")]);
        rows.extend(session("b", "US", &[(PAGE_VIEW, "/"), (PAGE_VIEW, "/a")]));
        let graph = compute_flow(&rows, &Predicate::Always, FlowLimits { min_transitions: 2, max_edges: 10 });

        for node in &graph.nodes {
            assert!(graph
                .edges
                .iter()
                .any(|e| e.source == node.id || e.target == node.id));
        }
        assert!(!graph.nodes.iter().any(|n| n.id == "/b#3"));
    }

    #[test]
    fn test_predicate_selects_sessions_full_paths() {
        let mut rows = session("a", "US", &[(PAGE_VIEW, "/"), (PAGE_VIEW, "/us-only")]);
        rows.extend(session("b", "DE", &[(PAGE_VIEW, "/"), (PAGE_VIEW, "/de-only")]));

        let mut set = SegmentSet::new();
        set.add(Segment::new(kinds::PAGE, "/us-only"));
        let predicate = crate::engine::filter::compile(&set);

        // Session "a" matches on one row but contributes its whole path
        let graph = compute_flow(&rows, &predicate, no_threshold());
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].source, "/#1");
        assert_eq!(graph.edges[0].target, "/us-only#2");
    }

    #[test]
    fn test_split_node_id() {
        assert_eq!(split_node_id("/docs#3"), ("/docs", 3));
        assert_eq!(split_node_id("/faq#anchor#2"), ("/faq#anchor", 2));
        assert_eq!(split_node_id("plain"), ("plain", 0));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(compute_flow(&[], &Predicate::Always, FlowLimits::default()), FlowGraph::default());
    }
}
