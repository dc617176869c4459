//! Run Record - one measurement batch and its aggregates

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Measurement;

/// Database identifier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(i64);

impl RunId {
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

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate statistics of a run, computed from its measurements.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Number of measured items.
    pub total_items: u64,
    /// Mean primary difference across items (0 for an empty run).
    pub avg_difference: f64,
    /// Maximum primary difference across items (0 for an empty run).
    pub max_difference: f64,
}

impl RunStats {
    /// Compute aggregates from a batch of measurements.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_measurements(results: &[Measurement]) -> Self {
        if results.is_empty() {
            return Self::default();
        }

        let total = results.len();
        let sum: f64 = results.iter().map(Measurement::primary_difference).sum();
        let max = results
            .iter()
            .map(Measurement::primary_difference)
            .fold(f64::NEG_INFINITY, f64::max);

        Self {
            total_items: total as u64,
            avg_difference: sum / total as f64,
            max_difference: max,
        }
    }
}

/// Caller-supplied description of a run: where the data came from and
/// which settings produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    build_id: String,
    timestamp: Option<DateTime<Utc>>,
    pub(crate) base_dir: Option<String>,
    pub(crate) new_dir: Option<String>,
    pub(crate) known_good_dir: Option<String>,
    pub(crate) config_snapshot: serde_json::Value,
}

impl RunContext {
    /// Create a context for the given build identifier, timestamped at insert time.
    #[must_use]
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            timestamp: None,
            base_dir: None,
            new_dir: None,
            known_good_dir: None,
            config_snapshot: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Set an explicit run timestamp (imports, backfills, tests).
    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the base directory the run was executed against.
    #[must_use]
    pub fn base_dir(mut self, base_dir: impl Into<String>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Set the directory holding the new outputs.
    #[must_use]
    pub fn new_dir(mut self, new_dir: impl Into<String>) -> Self {
        self.new_dir = Some(new_dir.into());
        self
    }

    /// Set the directory holding the known-good references.
    #[must_use]
    pub fn known_good_dir(mut self, known_good_dir: impl Into<String>) -> Self {
        self.known_good_dir = Some(known_good_dir.into());
        self
    }

    /// Attach a snapshot of the settings used for this run.
    #[must_use]
    pub fn config_snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.config_snapshot = snapshot;
        self
    }

    /// Get the build identifier.
    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Get the explicit timestamp, if one was set.
    #[must_use]
    pub const fn explicit_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// Everything needed to insert a run row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub(crate) context: RunContext,
    pub(crate) stats: RunStats,
    pub(crate) notes: Option<String>,
}

impl NewRun {
    /// Combine a context with precomputed aggregates.
    #[must_use]
    pub const fn new(context: RunContext, stats: RunStats) -> Self {
        Self {
            context,
            stats,
            notes: None,
        }
    }

    /// Attach free-text notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Get the run context.
    #[must_use]
    pub const fn context(&self) -> &RunContext {
        &self.context
    }

    /// Get the aggregates.
    #[must_use]
    pub const fn stats(&self) -> RunStats {
        self.stats
    }
}

/// A stored run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub(crate) run_id: RunId,
    pub(crate) build_id: String,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) base_dir: Option<String>,
    pub(crate) new_dir: Option<String>,
    pub(crate) known_good_dir: Option<String>,
    pub(crate) config_snapshot: serde_json::Value,
    pub(crate) stats: RunStats,
    pub(crate) notes: Option<String>,
}

impl RunRecord {
    /// Get the run ID.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Get the build identifier.
    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Get the run timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Get the base directory, if recorded.
    #[must_use]
    pub fn base_dir(&self) -> Option<&str> {
        self.base_dir.as_deref()
    }

    /// Get the new-output directory, if recorded.
    #[must_use]
    pub fn new_dir(&self) -> Option<&str> {
        self.new_dir.as_deref()
    }

    /// Get the known-good directory, if recorded.
    #[must_use]
    pub fn known_good_dir(&self) -> Option<&str> {
        self.known_good_dir.as_deref()
    }

    /// Get the settings snapshot.
    #[must_use]
    pub const fn config_snapshot(&self) -> &serde_json::Value {
        &self.config_snapshot
    }

    /// Get the aggregates.
    #[must_use]
    pub const fn stats(&self) -> RunStats {
        self.stats
    }

    /// Get the notes, if any.
    #[must_use]
    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_stats_empty() {
        let stats = RunStats::from_measurements(&[]);
        assert_eq!(stats.total_items, 0);
        assert!(stats.avg_difference.abs() < f64::EPSILON);
        assert!(stats.max_difference.abs() < f64::EPSILON);
    }

    #[test]
    fn test_run_stats_aggregates() {
        let results = vec![
            Measurement::new("a.png", 2.0),
            Measurement::new("b.png", 6.0),
            Measurement::new("c.png", 4.0),
        ];
        let stats = RunStats::from_measurements(&results);
        assert_eq!(stats.total_items, 3);
        assert!((stats.avg_difference - 4.0).abs() < 1e-12);
        assert!((stats.max_difference - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_run_context_builder() {
        let ctx = RunContext::new("build-42")
            .base_dir("/project")
            .new_dir("new")
            .known_good_dir("known_good")
            .config_snapshot(serde_json::json!({"ssim_threshold": 0.95}));

        assert_eq!(ctx.build_id(), "build-42");
        assert!(ctx.explicit_timestamp().is_none());
        assert_eq!(ctx.base_dir.as_deref(), Some("/project"));
        assert_eq!(ctx.config_snapshot["ssim_threshold"], 0.95);
    }

    #[test]
    fn test_run_id_display() {
        assert_eq!(RunId::new(17).to_string(), "17");
        assert!(RunId::new(1) < RunId::new(2));
    }
}
