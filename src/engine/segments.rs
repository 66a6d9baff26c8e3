//! Segments: user-selected filter clauses
//!
//! A segment is created by clicking a breakdown row. The active set is ordered,
//! unique on `(kind, value)`, and AND-combined by the filter compiler.

use serde::{Deserialize, Serialize};

/// Well-known segment kinds produced by the breakdown cards
pub mod kinds {
    pub const PAGE: &str = "page";
    pub const ENTRY_PAGE: &str = "entry_page";
    pub const EXIT_PAGE: &str = "exit_page";
    pub const EVENT: &str = "event";
    pub const SOURCE: &str = "source";
    pub const REFERRER: &str = "referrer";
    pub const CHANNEL: &str = "channel";
    pub const CAMPAIGN: &str = "campaign";
    pub const COUNTRY: &str = "country";
    pub const REGION: &str = "region";
    pub const CITY: &str = "city";
    pub const BROWSER: &str = "browser";
    pub const OS: &str = "os";
    pub const DEVICE_TYPE: &str = "device_type";
    pub const SCREEN_SIZE: &str = "screen_size";
    pub const LANGUAGE: &str = "language";
    pub const UTM_SOURCE: &str = "utm_source";
    pub const UTM_MEDIUM: &str = "utm_medium";
    pub const UTM_TERM: &str = "utm_term";
    pub const UTM_CONTENT: &str = "utm_content";
    /// Custom property; the property key travels in `column`
    pub const PROPERTY: &str = "property";
}

/// One active filter clause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: String,
    pub value: String,
    pub label: String,
    /// Column to compare instead of the kind's default column
    #[serde(default)]
    pub column: Option<String>,
    /// Value to compare instead of `value`
    #[serde(default)]
    pub compare_value: Option<String>,
}

impl Segment {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            kind: kind.into(),
            label: value.clone(),
            value,
            column: None,
            compare_value: None,
        }
    }

    /// Segment on a custom property `key == value`
    pub fn property(key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        Self {
            kind: kinds::PROPERTY.to_string(),
            label: format!("{}: {}", key, value),
            value,
            column: Some(key),
            compare_value: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn with_compare_value(mut self, value: impl Into<String>) -> Self {
        self.compare_value = Some(value.into());
        self
    }

    /// Value the predicate compares against
    pub fn operand(&self) -> &str {
        self.compare_value.as_deref().unwrap_or(&self.value)
    }

    fn same_identity(&self, kind: &str, value: &str) -> bool {
        self.kind == kind && self.value == value
    }
}

/// Ordered, duplicate-free set of active segments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SegmentSet {
    segments: Vec<Segment>,
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a segment; returns false (and changes nothing) for a duplicate
    ///
    /// Property segments with the same value but different keys are distinct
    /// filters, so the key is part of their identity.
    pub fn add(&mut self, segment: Segment) -> bool {
        if self.contains(&segment) {
            log::debug!(
                "Ignoring duplicate segment {}={}",
                segment.kind,
                segment.value
            );
            return false;
        }
        self.segments.push(segment);
        true
    }

    /// Remove the segment with the same identity; returns true if removed
    pub fn remove(&mut self, segment: &Segment) -> bool {
        let before = self.segments.len();
        self.segments.retain(|s| !Self::same_filter(s, segment));
        before != self.segments.len()
    }

    /// Remove all segments; returns true if anything was removed
    pub fn clear(&mut self) -> bool {
        let changed = !self.segments.is_empty();
        self.segments.clear();
        changed
    }

    pub fn contains(&self, segment: &Segment) -> bool {
        self.segments.iter().any(|s| Self::same_filter(s, segment))
    }

    fn same_filter(a: &Segment, b: &Segment) -> bool {
        a.same_identity(&b.kind, &b.value) && (a.kind != kinds::PROPERTY || a.column == b.column)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }
}
