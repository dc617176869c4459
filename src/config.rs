//! Engine configuration
//!
//! `HistoryConfig` gathers every tunable of the engine in one serde
//! structure, loadable from JSON. All fields have defaults, so `{}` is a
//! valid configuration.
//!
//! ```json
//! {
//!   "db_path": "history/comparison_history.db",
//!   "busy_timeout_ms": 30000,
//!   "composite_weights": {"pixel_diff": 0.4, "ssim": 0.3, "color_distance": 0.2, "histogram": 0.1},
//!   "anomaly_threshold": 2.5,
//!   "min_runs_for_stats": 5,
//!   "retention": {"keep_all": false, "max_runs": 200}
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anomaly::{
    AnomalyDetector, DEFAULT_ANOMALY_THRESHOLD, DEFAULT_MIN_RUNS_FOR_STATS, DEFAULT_ZERO_VARIANCE_TOLERANCE,
};
use crate::history::{RunRecorder, DEFAULT_HISTORY_LIMIT};
use crate::retention::{RetentionPolicy, RetentionPolicyUpdate};
use crate::scoring::{CompositeConfig, CompositeScorer, CompositeWeights, NormalizationRanges};
use crate::store::{MetricStore, StoreOptions, DEFAULT_BUSY_TIMEOUT};
use crate::{Error, Result};

/// Database location used when `db_path` is not set, relative to the base directory.
pub const DEFAULT_DB_RELATIVE_PATH: &str = ".metric_history/history.db";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    /// Database file; relative paths are resolved against the base directory.
    pub db_path: Option<PathBuf>,
    /// Lock wait before a busy error, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Weights to make active; `None` keeps whatever the store has active.
    pub composite_weights: Option<CompositeWeights>,
    /// Axis normalization ranges.
    pub normalization: NormalizationRanges,
    /// Z-score threshold.
    pub anomaly_threshold: f64,
    /// Minimum history length before statistics apply.
    pub min_runs_for_stats: usize,
    /// Tolerance for zero-spread histories.
    pub zero_variance_tolerance: f64,
    /// Historical results consulted per item.
    pub history_limit: usize,
    /// Retention policy.
    pub retention: RetentionPolicy,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: u64::try_from(DEFAULT_BUSY_TIMEOUT.as_millis()).unwrap_or(30_000),
            composite_weights: None,
            normalization: NormalizationRanges::default(),
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            min_runs_for_stats: DEFAULT_MIN_RUNS_FOR_STATS,
            zero_variance_tolerance: DEFAULT_ZERO_VARIANCE_TOLERANCE,
            history_limit: DEFAULT_HISTORY_LIMIT,
            retention: RetentionPolicy::default(),
        }
    }
}

impl HistoryConfig {
    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON or unknown keys,
    /// and [`Error::Validation`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`HistoryConfig::from_json_str`].
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.busy_timeout_ms == 0 {
            return Err(Error::Validation(
                "busy_timeout_ms must be positive".to_string(),
            ));
        }
        if self.history_limit == 0 {
            return Err(Error::Validation(
                "history_limit must be at least 1".to_string(),
            ));
        }
        if let Some(weights) = &self.composite_weights {
            weights.validate()?;
        }
        self.normalization.validate()?;
        self.detector()?;
        Ok(())
    }

    /// Resolve the database path against `base_dir`.
    #[must_use]
    pub fn db_path_or_default(&self, base_dir: &Path) -> PathBuf {
        match &self.db_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => base_dir.join(path),
            None => base_dir.join(DEFAULT_DB_RELATIVE_PATH),
        }
    }

    /// Store options derived from this configuration.
    #[must_use]
    pub const fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }

    /// Open the configured store.
    ///
    /// # Errors
    ///
    /// See [`MetricStore::open_with`].
    pub fn open_store(&self, base_dir: &Path) -> Result<MetricStore> {
        MetricStore::open_with(self.db_path_or_default(base_dir), self.store_options())
    }

    /// Validated anomaly detector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a bad threshold, history length or tolerance.
    pub fn detector(&self) -> Result<AnomalyDetector> {
        AnomalyDetector::new(self.anomaly_threshold, self.min_runs_for_stats)?
            .with_zero_variance_tolerance(self.zero_variance_tolerance)
    }

    /// Validated scorer for the configured weights (defaults when unset).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for bad weights or ranges.
    pub fn scorer(&self) -> Result<CompositeScorer> {
        CompositeScorer::new(self.composite_weights.unwrap_or_default())?
            .with_normalization(self.normalization)
    }

    /// Recorder over `store` using this configuration's detector, ranges and
    /// history limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for bad detector settings or ranges.
    pub fn recorder(&self, store: MetricStore) -> Result<RunRecorder> {
        Ok(RunRecorder::new(store)
            .with_detector(self.detector()?)
            .with_normalization(self.normalization)?
            .with_history_limit(self.history_limit))
    }

    /// Make the configured weights the store's active composite version.
    ///
    /// Creates a new version only when the weights differ from the active
    /// one; returns the active configuration either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn sync_composite_config(&self, store: &MetricStore) -> Result<CompositeConfig> {
        let active = store.active_composite_config()?;
        match self.composite_weights {
            Some(weights) if weights != active.weights => {
                let created = store.create_composite_config(&weights, Some("from configuration"))?;
                info!(version = created.version, "configured composite weights activated");
                Ok(created)
            }
            _ => Ok(active),
        }
    }

    /// Write the configured retention policy to the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn sync_retention_policy(&self, store: &MetricStore) -> Result<RetentionPolicy> {
        store.update_retention_policy(&RetentionPolicyUpdate::replace_with(&self.retention))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config = HistoryConfig::from_json_str("{}").unwrap();
        assert_eq!(config, HistoryConfig::default());
        assert_eq!(config.busy_timeout_ms, 30_000);
        assert!(config.retention.keep_all);
    }

    #[test]
    fn test_parse_full_config() {
        let config = HistoryConfig::from_json_str(
            r#"{
                "db_path": "db/history.db",
                "busy_timeout_ms": 500,
                "composite_weights": {"pixel_diff": 0.4, "ssim": 0.3, "color_distance": 0.2, "histogram": 0.1},
                "anomaly_threshold": 2.5,
                "min_runs_for_stats": 5,
                "retention": {"keep_all": false, "max_runs": 20}
            }"#,
        )
        .unwrap();
        assert_eq!(config.store_options().busy_timeout, Duration::from_millis(500));
        assert_eq!(config.retention.max_runs, Some(20));
        let detector = config.detector().unwrap();
        assert!((detector.threshold() - 2.5).abs() < f64::EPSILON);
        assert_eq!(detector.min_runs(), 5);
        assert!((config.scorer().unwrap().weights().pixel_diff - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = HistoryConfig::from_json_str(r#"{"anomaly_treshold": 3.0}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_validation_errors() {
        for json in [
            r#"{"anomaly_threshold": -1.0}"#,
            r#"{"min_runs_for_stats": 0}"#,
            r#"{"zero_variance_tolerance": -0.1}"#,
            r#"{"busy_timeout_ms": 0}"#,
            r#"{"history_limit": 0}"#,
            r#"{"composite_weights": {"pixel_diff": -1, "ssim": 0, "color_distance": 0, "histogram": 1}}"#,
            r#"{"normalization": {"pixel_diff_max": 0}}"#,
        ] {
            let err = HistoryConfig::from_json_str(json).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{json} gave {err}");
        }
    }

    #[test]
    fn test_db_path_resolution() {
        let base = Path::new("/project");
        let mut config = HistoryConfig::default();
        assert_eq!(
            config.db_path_or_default(base),
            PathBuf::from("/project/.metric_history/history.db")
        );
        config.db_path = Some(PathBuf::from("data/h.db"));
        assert_eq!(config.db_path_or_default(base), PathBuf::from("/project/data/h.db"));
        config.db_path = Some(PathBuf::from("/abs/h.db"));
        assert_eq!(config.db_path_or_default(base), PathBuf::from("/abs/h.db"));
    }

    #[test]
    fn test_from_path_and_sync() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("history.json");
        std::fs::write(
            &config_path,
            r#"{"composite_weights": {"pixel_diff": 1, "ssim": 0, "color_distance": 0, "histogram": 0},
                "retention": {"keep_all": false, "max_age_days": 30}}"#,
        )
        .unwrap();
        let config = HistoryConfig::from_path(&config_path).unwrap();
        let store = config.open_store(dir.path()).unwrap();

        let synced = config.sync_composite_config(&store).unwrap();
        assert_eq!(synced.version, 2);
        // unchanged weights do not create another version
        assert_eq!(config.sync_composite_config(&store).unwrap().version, 2);

        let policy = config.sync_retention_policy(&store).unwrap();
        assert_eq!(policy, config.retention);
        assert_eq!(store.retention_policy().unwrap().max_age_days, Some(30));

        let recorder = config.recorder(store).unwrap();
        assert_eq!(recorder.detector().min_runs(), 3);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = HistoryConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
