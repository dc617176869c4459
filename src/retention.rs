//! Retention policy evaluation and eviction sweep
//!
//! Decides which runs may be removed from the store and removes them one at
//! a time. Runs holding audit evidence (annotated or anomalous results) are
//! never deleted while the matching protect flag is on.
//!
//! ## Algorithm
//!
//! 1. `keep_all` short-circuits: nothing is eligible, every run is protected.
//! 2. **Eligible** = oldest runs beyond `max_runs` ∪ runs older than
//!    `max_age_days` (timestamp ascending, run id breaking ties).
//! 3. **Protected** = eligible runs with an annotated result (when
//!    `keep_annotated`) ∪ eligible runs with an anomalous result (when
//!    `keep_anomalies`).
//! 4. **Deletable** = eligible − protected; each is deleted in its own
//!    transaction. A failed deletion is logged and recorded, the sweep
//!    carries on.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, Level};

use crate::history::RunId;
use crate::store::{MetricStore, StoreStatistics};
use crate::Result;

/// Retention policy.
///
/// The default keeps everything and protects annotated and anomalous runs
/// once count or age limits are switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionPolicy {
    /// Never delete anything.
    pub keep_all: bool,
    /// Keep at most this many of the newest runs.
    pub max_runs: Option<u32>,
    /// Keep runs no older than this many days.
    pub max_age_days: Option<u32>,
    /// Never delete a run with an annotated result.
    pub keep_annotated: bool,
    /// Never delete a run with an anomalous result.
    pub keep_anomalies: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_all: true,
            max_runs: None,
            max_age_days: None,
            keep_annotated: true,
            keep_anomalies: true,
        }
    }
}

impl RetentionPolicy {
    /// Policy keeping at most `max_runs` runs (protect flags on).
    #[must_use]
    pub fn max_runs(max_runs: u32) -> Self {
        Self {
            keep_all: false,
            max_runs: Some(max_runs),
            ..Self::default()
        }
    }

    /// Policy keeping runs younger than `days` (protect flags on).
    #[must_use]
    pub fn max_age_days(days: u32) -> Self {
        Self {
            keep_all: false,
            max_age_days: Some(days),
            ..Self::default()
        }
    }
}

/// Sparse change to the stored retention policy.
///
/// `None` leaves a field untouched; `Some(None)` clears an optional limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicyUpdate {
    /// New `keep_all` flag.
    pub keep_all: Option<bool>,
    /// New run-count limit.
    pub max_runs: Option<Option<u32>>,
    /// New age limit.
    pub max_age_days: Option<Option<u32>>,
    /// New `keep_annotated` flag.
    pub keep_annotated: Option<bool>,
    /// New `keep_anomalies` flag.
    pub keep_anomalies: Option<bool>,
}

impl RetentionPolicyUpdate {
    /// Whether the update would change nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.keep_all.is_none()
            && self.max_runs.is_none()
            && self.max_age_days.is_none()
            && self.keep_annotated.is_none()
            && self.keep_anomalies.is_none()
    }

    /// Update that replaces every field with `policy`'s values.
    #[must_use]
    pub const fn replace_with(policy: &RetentionPolicy) -> Self {
        Self {
            keep_all: Some(policy.keep_all),
            max_runs: Some(policy.max_runs),
            max_age_days: Some(policy.max_age_days),
            keep_annotated: Some(policy.keep_annotated),
            keep_anomalies: Some(policy.keep_anomalies),
        }
    }
}

/// Outcome of one retention evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Number of runs in the store when evaluation started.
    pub evaluated: usize,
    /// Runs matching a count or age limit, oldest first.
    pub eligible: Vec<RunId>,
    /// Runs kept by a protect flag (all runs under `keep_all`).
    pub protected: Vec<RunId>,
    /// Eligible runs that are not protected.
    pub deletable: Vec<RunId>,
    /// Runs actually deleted (empty on a dry run).
    pub deleted: Vec<RunId>,
    /// Deletable runs whose deletion failed.
    pub failed: Vec<RunId>,
    /// Whether deletion was skipped.
    pub dry_run: bool,
}

/// Lifecycle classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Stored, no result scored yet.
    Created,
    /// At least one result carries a composite score.
    Scored,
    /// Holds evidence shielded by the policy's protect flags.
    Protected,
    /// No longer in the store.
    Deleted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Scored => "scored",
            Self::Protected => "protected",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Runs matching the policy's count or age limits.
///
/// `timeline` must be ordered oldest first; the result keeps that order.
/// `keep_all` yields nothing.
#[must_use]
pub fn eligible_runs(
    timeline: &[(RunId, DateTime<Utc>)],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<RunId> {
    if policy.keep_all {
        return Vec::new();
    }

    let over_count = policy
        .max_runs
        .map_or(0, |max| timeline.len().saturating_sub(max as usize));

    let cutoff = policy
        .max_age_days
        .and_then(|days| now.checked_sub_signed(Duration::days(i64::from(days))));

    timeline
        .iter()
        .enumerate()
        .filter(|(idx, (_, ts))| *idx < over_count || cutoff.is_some_and(|c| *ts < c))
        .map(|(_, (run_id, _))| *run_id)
        .collect()
}

/// Applies retention policies to a [`MetricStore`].
#[derive(Debug, Clone)]
pub struct RetentionManager {
    store: MetricStore,
}

impl RetentionManager {
    /// Create a manager over `store`.
    #[must_use]
    pub const fn new(store: MetricStore) -> Self {
        Self { store }
    }

    /// Evaluate `policy` against the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the run timeline or protection queries fail.
    /// Individual deletion failures are reported in [`RetentionReport::failed`].
    pub fn evaluate(&self, policy: &RetentionPolicy, dry_run: bool) -> Result<RetentionReport> {
        self.evaluate_at(policy, dry_run, Utc::now())
    }

    /// Evaluate the policy stored in the database.
    ///
    /// # Errors
    ///
    /// See [`RetentionManager::evaluate`].
    pub fn apply_stored_policy(&self, dry_run: bool) -> Result<RetentionReport> {
        let policy = self.store.retention_policy()?;
        self.evaluate(&policy, dry_run)
    }

    /// Evaluate `policy` with an explicit "now" for age limits.
    ///
    /// # Errors
    ///
    /// See [`RetentionManager::evaluate`].
    pub fn evaluate_at(
        &self,
        policy: &RetentionPolicy,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        let timeline = self.store.run_timeline()?;
        let mut report = RetentionReport {
            evaluated: timeline.len(),
            dry_run,
            ..RetentionReport::default()
        };

        if policy.keep_all {
            info!(runs = report.evaluated, "retention: keep_all set, skipping cleanup");
            report.protected = timeline.iter().map(|(id, _)| *id).collect();
            return Ok(report);
        }

        report.eligible = eligible_runs(&timeline, policy, now);
        let protected = self.protected_runs(&report.eligible, policy)?;
        report.protected = report
            .eligible
            .iter()
            .copied()
            .filter(|id| protected.contains(id))
            .collect();
        report.deletable = report
            .eligible
            .iter()
            .copied()
            .filter(|id| !protected.contains(id))
            .collect();

        info!(
            evaluated = report.evaluated,
            eligible = report.eligible.len(),
            protected = report.protected.len(),
            deletable = report.deletable.len(),
            dry_run,
            "retention analysis"
        );

        if dry_run {
            return Ok(report);
        }

        for &run_id in &report.deletable {
            match self.store.delete_run(run_id) {
                Ok(()) => report.deleted.push(run_id),
                Err(e) => {
                    error!(%run_id, error = %e, "retention: failed to delete run");
                    report.failed.push(run_id);
                }
            }
        }
        info!(deleted = report.deleted.len(), failed = report.failed.len(), "retention sweep finished");
        Ok(report)
    }

    /// Lifecycle state of a run under `policy`.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn run_state(&self, run_id: RunId, policy: &RetentionPolicy) -> Result<RunState> {
        if self.store.get_run(run_id)?.is_none() {
            return Ok(RunState::Deleted);
        }
        if !self.protected_runs(&[run_id], policy)?.is_empty() {
            return Ok(RunState::Protected);
        }
        if self.store.scored_count_for_run(run_id)? > 0 {
            Ok(RunState::Scored)
        } else {
            Ok(RunState::Created)
        }
    }

    /// Store-wide counts.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn statistics(&self) -> Result<StoreStatistics> {
        self.store.statistics()
    }

    fn protected_runs(&self, candidates: &[RunId], policy: &RetentionPolicy) -> Result<HashSet<RunId>> {
        let mut protected = HashSet::new();
        if candidates.is_empty() {
            return Ok(protected);
        }
        if policy.keep_annotated {
            protected.extend(self.store.runs_with_annotations(candidates)?);
        }
        if policy.keep_anomalies {
            protected.extend(self.store.runs_with_anomalies(candidates)?);
        }

        if tracing::enabled!(Level::DEBUG) {
            for &run_id in &protected {
                debug!(
                    %run_id,
                    annotations = ?self.store.annotation_count_for_run(run_id).ok(),
                    anomalies = ?self.store.anomaly_count_for_run(run_id).ok(),
                    "retention: run protected"
                );
            }
        }
        Ok(protected)
    }
}
