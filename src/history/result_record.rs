//! Result Record - one stored item measurement within a run

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MetricMap, RunId};

/// Database identifier of a result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultId(i64);

impl ResultId {
    /// Wrap a raw row id.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Get the raw row id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Historical statistics attached to a result.
///
/// The four values are set together or not at all: a result either had
/// enough history to be compared against, or it carries no enrichment.
/// `std_dev_from_mean` may be `+∞` when the history had zero spread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    /// Mean of the item's historical composite scores.
    pub historical_mean: f64,
    /// Sample standard deviation of those scores.
    pub historical_std_dev: f64,
    /// Signed distance from the mean in standard deviations.
    pub std_dev_from_mean: f64,
    /// Whether the deviation exceeded the anomaly threshold.
    pub is_anomaly: bool,
}

/// Sparse update of a result's derived fields.
///
/// Only the populated fields are written. The enrichment quad is always
/// written as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnrichmentUpdate {
    /// New composite score, clamped to [0, 100] on write.
    pub composite_score: Option<f64>,
    /// New enrichment quad.
    pub enrichment: Option<Enrichment>,
}

impl EnrichmentUpdate {
    /// Whether the update would change nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.composite_score.is_none() && self.enrichment.is_none()
    }
}

/// A stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub(crate) result_id: ResultId,
    pub(crate) run_id: RunId,
    pub(crate) item_key: String,
    pub(crate) group_key: Option<String>,
    pub(crate) primary_difference: f64,
    pub(crate) metrics: MetricMap,
    pub(crate) composite_score: Option<f64>,
    pub(crate) enrichment: Option<Enrichment>,
}

impl ResultRecord {
    /// Get the result ID.
    #[must_use]
    pub const fn result_id(&self) -> ResultId {
        self.result_id
    }

    /// Get the owning run ID.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Get the item key.
    #[must_use]
    pub fn item_key(&self) -> &str {
        &self.item_key
    }

    /// Get the grouping key, if any.
    #[must_use]
    pub fn group_key(&self) -> Option<&str> {
        self.group_key.as_deref()
    }

    /// Get the primary difference percentage.
    #[must_use]
    pub const fn primary_difference(&self) -> f64 {
        self.primary_difference
    }

    /// Get the stored metric map.
    #[must_use]
    pub const fn metrics(&self) -> &MetricMap {
        &self.metrics
    }

    /// Get the composite score, if scored.
    #[must_use]
    pub const fn composite_score(&self) -> Option<f64> {
        self.composite_score
    }

    /// Get the enrichment quad, if present.
    #[must_use]
    pub const fn enrichment(&self) -> Option<&Enrichment> {
        self.enrichment.as_ref()
    }

    /// Whether the result is flagged anomalous.
    #[must_use]
    pub fn is_anomaly(&self) -> bool {
        self.enrichment.is_some_and(|e| e.is_anomaly)
    }
}

/// A result together with the run it belongs to, as returned by per-item
/// history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub(crate) result: ResultRecord,
    pub(crate) build_id: String,
    pub(crate) timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Get the result.
    #[must_use]
    pub const fn result(&self) -> &ResultRecord {
        &self.result
    }

    /// Get the build identifier of the owning run.
    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Get the timestamp of the owning run.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Shortcut for the result's composite score.
    #[must_use]
    pub const fn composite_score(&self) -> Option<f64> {
        self.result.composite_score
    }
}
