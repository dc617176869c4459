//! Anomaly detection
//!
//! Compares a current composite score against the item's own history:
//!
//! - **Baseline**: mean and sample standard deviation of the historical
//!   scores, once at least `min_runs_for_stats` of them exist
//! - **Classification**: z-score against the baseline; anomalous when
//!   `|z| > threshold`. A zero-spread history flags any value further than
//!   `zero_variance_tolerance` from the mean with an infinite deviation
//! - **Trend**: least-squares slope over a chronological series, compared
//!   against 5% of the series mean
//!
//! All functions here are pure.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::history::{Enrichment, Measurement};
use crate::{Error, Result};

/// Default z-score threshold (≈95% two-sided).
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 2.0;
/// Default minimum number of historical scores before statistics apply.
pub const DEFAULT_MIN_RUNS_FOR_STATS: usize = 3;
/// Default tolerance used when the history has zero spread.
pub const DEFAULT_ZERO_VARIANCE_TOLERANCE: f64 = 0.01;
/// Fraction of the series mean below which a slope counts as stable.
pub const TREND_RELATIVE_THRESHOLD: f64 = 0.05;
/// Number of entries in [`AnomalySummary::top_deviations`].
pub const TOP_DEVIATIONS: usize = 10;

/// Mean and spread of an item's historical scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Arithmetic mean.
    pub mean: f64,
    /// Sample standard deviation (0 for a single sample).
    pub std_dev: f64,
    /// Number of scores the baseline was computed from.
    pub samples: usize,
}

/// Result of comparing one score against a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Whether the score is anomalous.
    pub is_anomaly: bool,
    /// Signed deviation in standard deviations (`+∞` for a zero-spread miss).
    pub deviation: f64,
}

/// Direction of a score series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    /// Scores are rising (items drifting further from reference).
    Increasing,
    /// Scores are falling.
    Decreasing,
    /// No meaningful slope.
    Stable,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Increasing => "increasing",
            Self::Decreasing => "decreasing",
            Self::Stable => "stable",
        };
        f.write_str(name)
    }
}

/// One entry of the worst-deviation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationEntry {
    /// Item key.
    pub item_key: String,
    /// Signed deviation in standard deviations.
    pub deviation: f64,
    /// Composite score of the item.
    pub composite_score: Option<f64>,
}

/// Batch-level anomaly summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySummary {
    /// Number of measurements inspected.
    pub total_results: usize,
    /// Measurements that had enough history to be enriched.
    pub results_with_statistics: usize,
    /// Measurements flagged anomalous.
    pub total_anomalies: usize,
    /// `total_anomalies / results_with_statistics` (0 when nothing was enriched).
    pub anomaly_rate: f64,
    /// Largest absolute deviations, worst first.
    pub top_deviations: Vec<DeviationEntry>,
    /// Threshold used for classification.
    pub anomaly_threshold: f64,
    /// Minimum history length used for statistics.
    pub min_runs_required: usize,
}

/// Z-score anomaly detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyDetector {
    threshold: f64,
    min_runs: usize,
    zero_variance_tolerance: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ANOMALY_THRESHOLD,
            min_runs: DEFAULT_MIN_RUNS_FOR_STATS,
            zero_variance_tolerance: DEFAULT_ZERO_VARIANCE_TOLERANCE,
        }
    }
}

impl AnomalyDetector {
    /// Create a detector.
    ///
    /// # Arguments
    ///
    /// * `threshold` - Deviation (in standard deviations) above which a score is anomalous
    /// * `min_runs` - Minimum number of historical scores required for a baseline
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a negative or non-finite threshold
    /// or a zero `min_runs`.
    pub fn new(threshold: f64, min_runs: usize) -> Result<Self> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(Error::Validation(format!(
                "anomaly threshold must be a non-negative number, got {threshold}"
            )));
        }
        if min_runs == 0 {
            return Err(Error::Validation(
                "min_runs_for_stats must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            threshold,
            min_runs,
            zero_variance_tolerance: DEFAULT_ZERO_VARIANCE_TOLERANCE,
        })
    }

    /// Replace the zero-spread tolerance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a negative or non-finite tolerance.
    pub fn with_zero_variance_tolerance(mut self, tolerance: f64) -> Result<Self> {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(Error::Validation(format!(
                "zero_variance_tolerance must be a non-negative number, got {tolerance}"
            )));
        }
        self.zero_variance_tolerance = tolerance;
        Ok(self)
    }

    /// Anomaly threshold.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Minimum history length.
    #[must_use]
    pub const fn min_runs(&self) -> usize {
        self.min_runs
    }

    /// Zero-spread tolerance.
    #[must_use]
    pub const fn zero_variance_tolerance(&self) -> f64 {
        self.zero_variance_tolerance
    }

    /// Baseline of `scores`, or `None` when there are fewer than `min_runs`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn baseline(&self, scores: &[f64]) -> Option<Baseline> {
        if scores.is_empty() || scores.len() < self.min_runs {
            return None;
        }
        let n = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let std_dev = if scores.len() < 2 {
            0.0
        } else {
            let sum_sq: f64 = scores.iter().map(|s| (s - mean).powi(2)).sum();
            (sum_sq / (n - 1.0)).sqrt()
        };
        Some(Baseline {
            mean,
            std_dev,
            samples: scores.len(),
        })
    }

    /// Classify `current` against a baseline.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn classify(&self, current: f64, mean: f64, std_dev: f64) -> Classification {
        if std_dev == 0.0 {
            let is_anomaly = (current - mean).abs() > self.zero_variance_tolerance;
            return Classification {
                is_anomaly,
                deviation: if is_anomaly { f64::INFINITY } else { 0.0 },
            };
        }
        let deviation = (current - mean) / std_dev;
        Classification {
            is_anomaly: deviation.abs() > self.threshold,
            deviation,
        }
    }

    /// Enrichment quad for `current` given its history, or `None` when the
    /// history is too short.
    #[must_use]
    pub fn enrich(&self, current: f64, history: &[f64]) -> Option<Enrichment> {
        let baseline = self.baseline(history)?;
        let classification = self.classify(current, baseline.mean, baseline.std_dev);
        Some(Enrichment {
            historical_mean: baseline.mean,
            historical_std_dev: baseline.std_dev,
            std_dev_from_mean: classification.deviation,
            is_anomaly: classification.is_anomaly,
        })
    }

    /// Set the enrichment of a scored measurement from its history.
    ///
    /// Unscored measurements and short histories leave the measurement
    /// without enrichment.
    pub fn enrich_measurement(&self, measurement: &mut Measurement, history: &[f64]) {
        let enrichment = measurement
            .composite_score()
            .and_then(|score| self.enrich(score, history));
        measurement.set_enrichment(enrichment);
    }

    /// Summarize the anomalies of an enriched batch.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summarize(&self, results: &[Measurement]) -> AnomalySummary {
        let with_stats = results.iter().filter(|m| m.enrichment().is_some()).count();
        let anomalies = results.iter().filter(|m| m.is_anomaly()).count();

        let mut top_deviations: Vec<DeviationEntry> = results
            .iter()
            .filter_map(|m| {
                m.enrichment().map(|e| DeviationEntry {
                    item_key: m.item_key().to_string(),
                    deviation: e.std_dev_from_mean,
                    composite_score: m.composite_score(),
                })
            })
            .collect();
        top_deviations.sort_by(|a, b| b.deviation.abs().total_cmp(&a.deviation.abs()));
        top_deviations.truncate(TOP_DEVIATIONS);

        AnomalySummary {
            total_results: results.len(),
            results_with_statistics: with_stats,
            total_anomalies: anomalies,
            anomaly_rate: if with_stats > 0 {
                anomalies as f64 / with_stats as f64
            } else {
                0.0
            },
            top_deviations,
            anomaly_threshold: self.threshold,
            min_runs_required: self.min_runs,
        }
    }
}

/// Measurements flagged anomalous (or, with `invert`, enriched but normal).
#[must_use]
pub fn filter_anomalies(results: &[Measurement], invert: bool) -> Vec<&Measurement> {
    results
        .iter()
        .filter(|m| {
            if invert {
                m.enrichment().is_some() && !m.is_anomaly()
            } else {
                m.is_anomaly()
            }
        })
        .collect()
}

/// Trend of a chronological (oldest first) score series.
///
/// Returns `None` when fewer than `min_samples` scores are given. A slope of
/// exactly zero, or one smaller than 5% of the series mean in magnitude, is
/// [`Trend::Stable`].
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::float_cmp)]
pub fn trend(scores: &[f64], min_samples: usize) -> Option<Trend> {
    if scores.is_empty() || scores.len() < min_samples {
        return None;
    }
    let n = scores.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = scores.iter().sum::<f64>() / n;

    let (numerator, denominator) = scores
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - x_mean;
            (dx.mul_add(y - y_mean, num), dx.mul_add(dx, den))
        });

    if denominator == 0.0 {
        return Some(Trend::Stable);
    }
    let slope = numerator / denominator;
    let threshold = y_mean.abs() * TREND_RELATIVE_THRESHOLD;

    if slope == 0.0 || slope.abs() < threshold {
        Some(Trend::Stable)
    } else if slope > 0.0 {
        Some(Trend::Increasing)
    } else {
        Some(Trend::Decreasing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HISTORY: [f64; 5] = [10.0, 12.0, 11.0, 13.0, 10.5];

    #[test]
    fn test_baseline_requires_min_runs() {
        let detector = AnomalyDetector::default();
        assert!(detector.baseline(&[]).is_none());
        assert!(detector.baseline(&[1.0, 2.0]).is_none());
        assert!(detector.baseline(&[1.0, 2.0, 3.0]).is_some());
    }

    #[test]
    fn test_baseline_sample_std_dev() {
        let baseline = AnomalyDetector::default().baseline(&HISTORY).unwrap();
        assert!((baseline.mean - 11.3).abs() < 1e-9);
        // sqrt(5.8 / 4)
        assert!((baseline.std_dev - 1.204_159_457_879_229_4).abs() < 1e-9);
        assert_eq!(baseline.samples, 5);
    }

    #[test]
    fn test_single_sample_baseline_has_zero_spread() {
        let detector = AnomalyDetector::new(2.0, 1).unwrap();
        let baseline = detector.baseline(&[7.0]).unwrap();
        assert!((baseline.mean - 7.0).abs() < 1e-12);
        assert!(baseline.std_dev.abs() < 1e-12);
    }

    #[test]
    fn test_classify_history_scenario() {
        let detector = AnomalyDetector::default();
        let baseline = detector.baseline(&HISTORY).unwrap();

        let normal = detector.classify(11.5, baseline.mean, baseline.std_dev);
        assert!(!normal.is_anomaly);
        assert!(normal.deviation.abs() < 0.2);

        let spike = detector.classify(50.0, baseline.mean, baseline.std_dev);
        assert!(spike.is_anomaly);
        assert!((spike.deviation - 32.138).abs() < 0.01);
    }

    #[test]
    fn test_classify_threshold_boundary() {
        let detector = AnomalyDetector::default();
        assert!(!detector.classify(10.0, 10.0, 1.0).is_anomaly);
        assert!(!detector.classify(12.0, 10.0, 1.0).is_anomaly);
        assert!(detector.classify(12.001, 10.0, 1.0).is_anomaly);
        assert!(detector.classify(7.9, 10.0, 1.0).is_anomaly);
        assert!(detector.classify(7.9, 10.0, 1.0).deviation < 0.0);
    }

    #[test]
    fn test_classify_zero_spread() {
        let detector = AnomalyDetector::default();
        let same = detector.classify(10.005, 10.0, 0.0);
        assert!(!same.is_anomaly);
        assert!(same.deviation.abs() < f64::EPSILON);

        let moved = detector.classify(10.5, 10.0, 0.0);
        assert!(moved.is_anomaly);
        assert!(moved.deviation.is_infinite() && moved.deviation > 0.0);

        let strict = AnomalyDetector::default().with_zero_variance_tolerance(0.0).unwrap();
        assert!(strict.classify(10.005, 10.0, 0.0).is_anomaly);
    }

    #[test]
    fn test_detector_validation() {
        assert!(AnomalyDetector::new(-1.0, 3).is_err());
        assert!(AnomalyDetector::new(f64::NAN, 3).is_err());
        assert!(AnomalyDetector::new(2.0, 0).is_err());
        assert!(AnomalyDetector::default().with_zero_variance_tolerance(-0.5).is_err());
    }

    #[test]
    fn test_enrich_measurement() {
        let detector = AnomalyDetector::default();
        let mut m = Measurement::builder("a.png", 0.0).composite_score(50.0).build();
        detector.enrich_measurement(&mut m, &HISTORY);
        let e = m.enrichment().unwrap();
        assert!(e.is_anomaly);
        assert!((e.historical_mean - 11.3).abs() < 1e-9);

        detector.enrich_measurement(&mut m, &HISTORY[..2]);
        assert!(m.enrichment().is_none());

        let mut unscored = Measurement::new("b.png", 0.0);
        detector.enrich_measurement(&mut unscored, &HISTORY);
        assert!(unscored.enrichment().is_none());
    }

    #[test]
    fn test_trend() {
        assert_eq!(trend(&[10.0, 15.0, 20.0, 25.0, 30.0], 3), Some(Trend::Increasing));
        assert_eq!(trend(&[30.0, 25.0, 20.0, 15.0, 10.0], 3), Some(Trend::Decreasing));
        assert_eq!(trend(&[10.0, 10.5, 10.2, 10.3, 10.1], 3), Some(Trend::Stable));
        assert_eq!(trend(&[0.0, 0.0, 0.0], 3), Some(Trend::Stable));
        assert_eq!(trend(&[1.0, 2.0], 3), None);
        assert_eq!(trend(&[5.0], 1), Some(Trend::Stable));
        assert_eq!(Trend::Increasing.to_string(), "increasing");
    }

    #[test]
    fn test_summarize_and_filter() {
        let detector = AnomalyDetector::default();
        let mut batch: Vec<Measurement> = [50.0, 11.5, 5.0]
            .iter()
            .enumerate()
            .map(|(i, s)| Measurement::builder(format!("{i}.png"), 0.0).composite_score(*s).build())
            .collect();
        batch.push(Measurement::new("unscored.png", 0.0));
        for m in &mut batch {
            detector.enrich_measurement(m, &HISTORY);
        }

        let summary = detector.summarize(&batch);
        assert_eq!(summary.total_results, 4);
        assert_eq!(summary.results_with_statistics, 3);
        assert_eq!(summary.total_anomalies, 2);
        assert!((summary.anomaly_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(summary.top_deviations[0].item_key, "0.png");
        assert_eq!(summary.top_deviations.len(), 3);

        assert_eq!(filter_anomalies(&batch, false).len(), 2);
        let normal = filter_anomalies(&batch, true);
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].item_key(), "1.png");
    }
}
