//! Measurement - one item's metrics as produced by the upstream pipeline

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Enrichment;

/// Nested metric map: category → metric name → value.
///
/// Example: `{"Pixel Difference": {"percent_different": 4.2}}`.
pub type MetricMap = BTreeMap<String, BTreeMap<String, f64>>;

/// A single item's measurement within a batch.
///
/// Carries the upstream metric map plus the values derived from history:
/// the composite score and the enrichment quad. Both start out unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    item_key: String,
    group_key: Option<String>,
    metrics: MetricMap,
    primary_difference: f64,
    composite_score: Option<f64>,
    enrichment: Option<Enrichment>,
}

impl Measurement {
    /// Create a measurement with no metrics and no grouping key.
    ///
    /// # Arguments
    ///
    /// * `item_key` - Stable identifier of the measured item (e.g. a filename)
    /// * `primary_difference` - Headline difference percentage used for run aggregates
    #[must_use]
    pub fn new(item_key: impl Into<String>, primary_difference: f64) -> Self {
        Self {
            item_key: item_key.into(),
            group_key: None,
            metrics: MetricMap::new(),
            primary_difference,
            composite_score: None,
            enrichment: None,
        }
    }

    /// Create a builder for constructing a measurement with optional fields.
    #[must_use]
    pub fn builder(item_key: impl Into<String>, primary_difference: f64) -> MeasurementBuilder {
        MeasurementBuilder::new(item_key, primary_difference)
    }

    /// Get the item key.
    #[must_use]
    pub fn item_key(&self) -> &str {
        &self.item_key
    }

    /// Get the grouping key (e.g. a subdirectory), if any.
    #[must_use]
    pub fn group_key(&self) -> Option<&str> {
        self.group_key.as_deref()
    }

    /// Get the full metric map.
    #[must_use]
    pub const fn metrics(&self) -> &MetricMap {
        &self.metrics
    }

    /// Look up a single metric value.
    #[must_use]
    pub fn metric(&self, category: &str, name: &str) -> Option<f64> {
        self.metrics.get(category)?.get(name).copied()
    }

    /// Get the primary difference percentage.
    #[must_use]
    pub const fn primary_difference(&self) -> f64 {
        self.primary_difference
    }

    /// Get the composite score, if it has been computed.
    #[must_use]
    pub const fn composite_score(&self) -> Option<f64> {
        self.composite_score
    }

    /// Get the historical enrichment, if enough history existed.
    #[must_use]
    pub const fn enrichment(&self) -> Option<&Enrichment> {
        self.enrichment.as_ref()
    }

    /// Whether this measurement was flagged as anomalous (false when unenriched).
    #[must_use]
    pub fn is_anomaly(&self) -> bool {
        self.enrichment.is_some_and(|e| e.is_anomaly)
    }

    /// Set the composite score.
    pub fn set_composite_score(&mut self, score: f64) {
        self.composite_score = Some(score);
    }

    /// Replace the enrichment quad as a whole.
    pub fn set_enrichment(&mut self, enrichment: Option<Enrichment>) {
        self.enrichment = enrichment;
    }
}

/// Builder for `Measurement`.
#[derive(Debug)]
pub struct MeasurementBuilder {
    item_key: String,
    group_key: Option<String>,
    metrics: MetricMap,
    primary_difference: f64,
    composite_score: Option<f64>,
    enrichment: Option<Enrichment>,
}

impl MeasurementBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(item_key: impl Into<String>, primary_difference: f64) -> Self {
        Self {
            item_key: item_key.into(),
            group_key: None,
            metrics: MetricMap::new(),
            primary_difference,
            composite_score: None,
            enrichment: None,
        }
    }

    /// Set the grouping key.
    #[must_use]
    pub fn group_key(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    /// Add a single metric value.
    #[must_use]
    pub fn metric(mut self, category: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        self.metrics
            .entry(category.into())
            .or_default()
            .insert(name.into(), value);
        self
    }

    /// Replace the whole metric map.
    #[must_use]
    pub fn metrics(mut self, metrics: MetricMap) -> Self {
        self.metrics = metrics;
        self
    }

    /// Pre-set a composite score (e.g. when importing already-scored data).
    #[must_use]
    pub const fn composite_score(mut self, score: f64) -> Self {
        self.composite_score = Some(score);
        self
    }

    /// Pre-set the enrichment quad.
    #[must_use]
    pub const fn enrichment(mut self, enrichment: Enrichment) -> Self {
        self.enrichment = Some(enrichment);
        self
    }

    /// Build the `Measurement`.
    #[must_use]
    pub fn build(self) -> Measurement {
        Measurement {
            item_key: self.item_key,
            group_key: self.group_key,
            metrics: self.metrics,
            primary_difference: self.primary_difference,
            composite_score: self.composite_score,
            enrichment: self.enrichment,
        }
    }
}
