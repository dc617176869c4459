//! Composite scoring
//!
//! Collapses the four metric axes of a measurement into one number on a
//! 0-100 scale (0 = identical, 100 = maximally different):
//!
//! | Axis             | Source metric                                         | Range      |
//! |------------------|-------------------------------------------------------|------------|
//! | `pixel_diff`     | `Pixel Difference / percent_different`                | 0..100     |
//! | `ssim`           | `1 - Structural Similarity / ssim_score`              | 0..1       |
//! | `color_distance` | `Color Difference / mean_color_distance`              | 0..441.67  |
//! | `histogram`      | mean of `Histogram Analysis / {rgb}_histogram_chi_square` | 0..2   |
//!
//! Each axis is min-max normalized into [0, 1], combined with the configured
//! weights (always re-normalized to sum to 1.0) and multiplied by 100.
//! Scoring never fails: missing or non-finite metrics fall back to the
//! "no difference" value of their axis.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::history::{Measurement, MetricMap};
use crate::{Error, Result};

/// Category holding the pixel difference percentage.
pub const PIXEL_DIFF_CATEGORY: &str = "Pixel Difference";
/// Pixel difference percentage metric.
pub const PIXEL_DIFF_METRIC: &str = "percent_different";
/// Category holding the structural similarity score.
pub const SSIM_CATEGORY: &str = "Structural Similarity";
/// Structural similarity metric (1.0 = identical).
pub const SSIM_METRIC: &str = "ssim_score";
/// Category holding the color distance.
pub const COLOR_CATEGORY: &str = "Color Difference";
/// Mean per-pixel RGB distance metric.
pub const COLOR_METRIC: &str = "mean_color_distance";
/// Category holding the histogram comparisons.
pub const HISTOGRAM_CATEGORY: &str = "Histogram Analysis";
/// Per-channel chi-square metrics, averaged into the histogram axis.
pub const HISTOGRAM_CHANNEL_METRICS: [&str; 3] = [
    "red_histogram_chi_square",
    "green_histogram_chi_square",
    "blue_histogram_chi_square",
];

/// Weight-sum drift tolerated without a warning.
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Names accepted as weight keys, in axis order.
pub const WEIGHT_KEYS: [&str; 4] = ["pixel_diff", "ssim", "color_distance", "histogram"];

/// Normalize `value` into [0, 1] against `[min, max]`.
///
/// Values outside the range are clamped. A degenerate range (`min >= max`)
/// and NaN both yield 0.
#[must_use]
pub fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max <= min || value.is_nan() {
        return 0.0;
    }
    ((value - min) / (max - min)).clamp(0.0, 1.0)
}

/// Per-axis weights of the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositeWeights {
    /// Weight of the pixel difference axis.
    pub pixel_diff: f64,
    /// Weight of the inverted SSIM axis.
    pub ssim: f64,
    /// Weight of the color distance axis.
    pub color_distance: f64,
    /// Weight of the histogram axis.
    pub histogram: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            pixel_diff: 0.25,
            ssim: 0.25,
            color_distance: 0.25,
            histogram: 0.25,
        }
    }
}

impl CompositeWeights {
    /// Create a weight set.
    #[must_use]
    pub const fn new(pixel_diff: f64, ssim: f64, color_distance: f64, histogram: f64) -> Self {
        Self {
            pixel_diff,
            ssim,
            color_distance,
            histogram,
        }
    }

    /// Build weights from a name → weight map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a key is missing or unknown.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Result<Self> {
        if let Some(unknown) = map.keys().find(|k| !WEIGHT_KEYS.contains(&k.as_str())) {
            return Err(Error::Validation(format!(
                "unknown weight key '{unknown}' (expected one of {WEIGHT_KEYS:?})"
            )));
        }
        let get = |key: &str| {
            map.get(key)
                .copied()
                .ok_or_else(|| Error::Validation(format!("missing weight key '{key}'")))
        };
        Ok(Self {
            pixel_diff: get("pixel_diff")?,
            ssim: get("ssim")?,
            color_distance: get("color_distance")?,
            histogram: get("histogram")?,
        })
    }

    /// Weights in axis order.
    #[must_use]
    pub const fn as_array(&self) -> [f64; 4] {
        [self.pixel_diff, self.ssim, self.color_distance, self.histogram]
    }

    /// Sum of all weights.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// Check every weight is finite and non-negative and at least one is positive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the offending weight.
    pub fn validate(&self) -> Result<()> {
        for (key, weight) in WEIGHT_KEYS.iter().zip(self.as_array()) {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Validation(format!(
                    "weight '{key}' must be a non-negative number, got {weight}"
                )));
            }
        }
        if self.sum() <= 0.0 {
            return Err(Error::Validation(
                "at least one weight must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate and scale the weights so they sum to 1.0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the weights are invalid.
    pub fn normalized(&self) -> Result<Self> {
        self.validate()?;
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            warn!(weight_sum = sum, "composite weights do not sum to 1.0, normalizing");
        }
        Ok(Self {
            pixel_diff: self.pixel_diff / sum,
            ssim: self.ssim / sum,
            color_distance: self.color_distance / sum,
            histogram: self.histogram / sum,
        })
    }
}

/// Canonical ranges used to normalize each axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizationRanges {
    /// Upper bound of the pixel difference percentage.
    pub pixel_diff_max: f64,
    /// Lower bound of the inverted SSIM.
    pub ssim_min: f64,
    /// Upper bound of the inverted SSIM.
    pub ssim_max: f64,
    /// Upper bound of the mean color distance (`sqrt(3 * 255^2)`).
    pub color_distance_max: f64,
    /// Upper bound of the averaged histogram chi-square.
    pub histogram_chi_square_max: f64,
}

impl Default for NormalizationRanges {
    fn default() -> Self {
        Self {
            pixel_diff_max: 100.0,
            ssim_min: 0.0,
            ssim_max: 1.0,
            color_distance_max: 441.67,
            histogram_chi_square_max: 2.0,
        }
    }
}

impl NormalizationRanges {
    /// Check each range is finite and non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a degenerate range.
    pub fn validate(&self) -> Result<()> {
        let ranges = [
            ("pixel_diff", 0.0, self.pixel_diff_max),
            ("ssim", self.ssim_min, self.ssim_max),
            ("color_distance", 0.0, self.color_distance_max),
            ("histogram_chi_square", 0.0, self.histogram_chi_square_max),
        ];
        for (axis, min, max) in ranges {
            if !min.is_finite() || !max.is_finite() || max <= min {
                return Err(Error::Validation(format!(
                    "normalization range for '{axis}' must satisfy min < max, got [{min}, {max}]"
                )));
            }
        }
        Ok(())
    }
}

/// A versioned weight set as stored in the database.
///
/// Versions are immutable once created; exactly one is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeConfig {
    /// Monotonic version number.
    pub version: u32,
    /// Weights as stored (not re-normalized).
    pub weights: CompositeWeights,
    /// Free-text description.
    pub description: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether this version is the active one.
    pub is_active: bool,
}

/// Normalized per-axis values of one measurement, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AxisValues {
    /// Normalized pixel difference.
    pub pixel_diff: f64,
    /// Normalized `1 - ssim`.
    pub ssim: f64,
    /// Normalized mean color distance.
    pub color_distance: f64,
    /// Normalized mean histogram chi-square.
    pub histogram: f64,
}

/// Weighted composite scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeScorer {
    weights: CompositeWeights,
    ranges: NormalizationRanges,
}

impl Default for CompositeScorer {
    fn default() -> Self {
        Self {
            weights: CompositeWeights::default(),
            ranges: NormalizationRanges::default(),
        }
    }
}

impl CompositeScorer {
    /// Create a scorer with the given weights and default ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the weights are invalid.
    pub fn new(weights: CompositeWeights) -> Result<Self> {
        Ok(Self {
            weights: weights.normalized()?,
            ranges: NormalizationRanges::default(),
        })
    }

    /// Create a scorer from a stored configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the stored weights are invalid.
    pub fn from_config(config: &CompositeConfig) -> Result<Self> {
        Self::new(config.weights)
    }

    /// Replace the normalization ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a degenerate range.
    pub fn with_normalization(mut self, ranges: NormalizationRanges) -> Result<Self> {
        ranges.validate()?;
        self.ranges = ranges;
        Ok(self)
    }

    /// Effective weights (sum to 1.0).
    #[must_use]
    pub const fn weights(&self) -> &CompositeWeights {
        &self.weights
    }

    /// Normalization ranges in use.
    #[must_use]
    pub const fn ranges(&self) -> &NormalizationRanges {
        &self.ranges
    }

    /// Extract and normalize the four axes.
    #[must_use]
    pub fn axes(&self, metrics: &MetricMap) -> AxisValues {
        let r = &self.ranges;

        let pixel_diff = metric_or(metrics, PIXEL_DIFF_CATEGORY, PIXEL_DIFF_METRIC, 0.0);
        let ssim = metric_or(metrics, SSIM_CATEGORY, SSIM_METRIC, 1.0);
        let color = metric_or(metrics, COLOR_CATEGORY, COLOR_METRIC, 0.0);
        // missing channels count as zero, the mean is always over three
        let histogram = HISTOGRAM_CHANNEL_METRICS
            .iter()
            .map(|name| metric_or(metrics, HISTOGRAM_CATEGORY, name, 0.0))
            .sum::<f64>()
            / 3.0;

        AxisValues {
            pixel_diff: normalize(pixel_diff, 0.0, r.pixel_diff_max),
            ssim: normalize(1.0 - ssim, r.ssim_min, r.ssim_max),
            color_distance: normalize(color, 0.0, r.color_distance_max),
            histogram: normalize(histogram, 0.0, r.histogram_chi_square_max),
        }
    }

    /// Composite score of a metric map, in [0, 100].
    #[must_use]
    pub fn score(&self, metrics: &MetricMap) -> f64 {
        let axes = self.axes(metrics);
        let w = &self.weights;
        let combined = axes.histogram.mul_add(
            w.histogram,
            axes.color_distance.mul_add(
                w.color_distance,
                axes.ssim.mul_add(w.ssim, axes.pixel_diff * w.pixel_diff),
            ),
        );
        (combined * 100.0).clamp(0.0, 100.0)
    }

    /// Score every measurement in place.
    pub fn score_measurements(&self, measurements: &mut [Measurement]) {
        for measurement in measurements {
            let score = self.score(measurement.metrics());
            measurement.set_composite_score(score);
        }
    }
}

fn metric_or(metrics: &MetricMap, category: &str, name: &str, default: f64) -> f64 {
    metrics
        .get(category)
        .and_then(|values| values.get(name))
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
