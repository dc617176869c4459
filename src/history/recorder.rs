//! Run Recorder - save a batch, then enrich it with each item's history

use tracing::{debug, error, info};

use super::{EnrichmentUpdate, HistoryEntry, Measurement, NewRun, RunContext, RunId, RunStats};
use crate::anomaly::{self, AnomalyDetector, AnomalySummary, Trend};
use crate::scoring::{CompositeConfig, CompositeScorer, NormalizationRanges};
use crate::store::MetricStore;
use crate::{Error, Result};

/// Default number of historical results consulted per item.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Orchestrates persistence, scoring and anomaly detection for runs.
///
/// The active composite configuration is fetched once per
/// [`record_run`](Self::record_run) and passed down explicitly.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    store: MetricStore,
    detector: AnomalyDetector,
    normalization: NormalizationRanges,
    history_limit: usize,
}

impl RunRecorder {
    /// Create a recorder with the default detector and normalization ranges.
    #[must_use]
    pub fn new(store: MetricStore) -> Self {
        Self {
            store,
            detector: AnomalyDetector::default(),
            normalization: NormalizationRanges::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Use a custom anomaly detector.
    #[must_use]
    pub const fn with_detector(mut self, detector: AnomalyDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Use custom normalization ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a degenerate range.
    pub fn with_normalization(mut self, ranges: NormalizationRanges) -> Result<Self> {
        ranges.validate()?;
        self.normalization = ranges;
        Ok(self)
    }

    /// Limit how many historical results are consulted per item.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &MetricStore {
        &self.store
    }

    /// The anomaly detector in use.
    #[must_use]
    pub const fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Persist a batch as a new run.
    ///
    /// Aggregates are computed from `primary_difference` (zeros for an empty
    /// batch). The run and all of its results are committed together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if the insert fails; nothing is stored.
    pub fn save_run(&self, results: &[Measurement], context: &RunContext, notes: Option<&str>) -> Result<RunId> {
        let mut run = NewRun::new(context.clone(), RunStats::from_measurements(results));
        if let Some(notes) = notes {
            run = run.with_notes(notes);
        }
        let (run_id, count) = self.store.insert_run_with_results(&run, results)?;
        info!(%run_id, build_id = context.build_id(), results = count, "saved run");
        Ok(run_id)
    }

    /// Per-item history, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn history_for_item(
        &self,
        item_key: &str,
        group_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        self.store.history_for_item(item_key, group_key, limit)
    }

    /// Score `results`, compare each against its history and write the
    /// derived fields back to the stored rows of `run_id`.
    ///
    /// History excludes `run_id` itself and unscored rows. Enrichment is best
    /// effort: on any failure the error is logged and the input is returned
    /// unchanged.
    #[must_use]
    pub fn enrich_with_history(
        &self,
        run_id: RunId,
        results: Vec<Measurement>,
        config: &CompositeConfig,
    ) -> Vec<Measurement> {
        match self.try_enrich(run_id, &results, config) {
            Ok(enriched) => enriched,
            Err(e) => {
                error!(%run_id, error = %e, "history enrichment failed, returning unenriched results");
                results
            }
        }
    }

    /// Save a batch and enrich it with the active composite configuration.
    ///
    /// Returns the new run's ID and the enriched measurements.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or the run cannot
    /// be saved. Enrichment failures do not fail the call.
    pub fn record_run(
        &self,
        results: Vec<Measurement>,
        context: &RunContext,
        notes: Option<&str>,
    ) -> Result<(RunId, Vec<Measurement>)> {
        let config = self.store.active_composite_config()?;
        let run_id = self.save_run(&results, context, notes)?;
        let enriched = self.enrich_with_history(run_id, results, &config);
        Ok((run_id, enriched))
    }

    /// Scored history of an item in chronological order (oldest first).
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn recent_scores_for_item(
        &self,
        item_key: &str,
        group_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<f64>> {
        let mut scores = self.store.scored_history_for_item(item_key, group_key, limit, None)?;
        scores.reverse();
        Ok(scores.into_iter().map(|(_, score)| score).collect())
    }

    /// Trend of an item's recent scores.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn trend_for_item(
        &self,
        item_key: &str,
        group_key: Option<&str>,
        limit: usize,
        min_samples: usize,
    ) -> Result<Option<Trend>> {
        let scores = self.recent_scores_for_item(item_key, group_key, limit)?;
        Ok(anomaly::trend(&scores, min_samples))
    }

    /// Anomaly summary of an enriched batch.
    #[must_use]
    pub fn summarize(&self, results: &[Measurement]) -> AnomalySummary {
        self.detector.summarize(results)
    }

    fn try_enrich(&self, run_id: RunId, results: &[Measurement], config: &CompositeConfig) -> Result<Vec<Measurement>> {
        let scorer = CompositeScorer::from_config(config)?.with_normalization(self.normalization)?;

        let mut enriched = results.to_vec();
        scorer.score_measurements(&mut enriched);

        for measurement in &mut enriched {
            let history: Vec<f64> = self
                .store
                .scored_history_for_item(
                    measurement.item_key(),
                    measurement.group_key(),
                    self.history_limit,
                    Some(run_id),
                )?
                .into_iter()
                .map(|(_, score)| score)
                .collect();
            self.detector.enrich_measurement(measurement, &history);
            debug!(
                item_key = measurement.item_key(),
                history = history.len(),
                score = measurement.composite_score(),
                anomaly = measurement.is_anomaly(),
                "scored measurement"
            );
        }

        let stored = self.store.result_keys_for_run(run_id)?;
        if stored.len() != enriched.len() {
            return Err(Error::Validation(format!(
                "run {run_id} holds {} results but {} were supplied",
                stored.len(),
                enriched.len()
            )));
        }

        let mut updates = Vec::with_capacity(stored.len());
        for ((result_id, item_key, group_key), measurement) in stored.into_iter().zip(&enriched) {
            if item_key != measurement.item_key() || group_key.as_deref() != measurement.group_key() {
                return Err(Error::Validation(format!(
                    "result {result_id} of run {run_id} is '{item_key}', expected '{}'",
                    measurement.item_key()
                )));
            }
            updates.push((
                result_id,
                EnrichmentUpdate {
                    composite_score: measurement.composite_score(),
                    enrichment: measurement.enrichment().copied(),
                },
            ));
        }
        self.store.update_enrichment_batch(&updates)?;

        let anomalies = enriched.iter().filter(|m| m.is_anomaly()).count();
        info!(%run_id, results = enriched.len(), anomalies, config_version = config.version, "enriched run with history");
        Ok(enriched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{CompositeWeights, PIXEL_DIFF_CATEGORY, PIXEL_DIFF_METRIC};
    use tempfile::TempDir;

    fn recorder() -> (TempDir, RunRecorder) {
        let dir = TempDir::new().unwrap();
        let store = MetricStore::open(dir.path().join("history.db")).unwrap();
        (dir, RunRecorder::new(store))
    }

    fn pixel(item: &str, value: f64) -> Measurement {
        Measurement::builder(item, value)
            .metric(PIXEL_DIFF_CATEGORY, PIXEL_DIFF_METRIC, value)
            .build()
    }

    #[test]
    fn test_save_run_computes_aggregates() {
        let (_dir, recorder) = recorder();
        let results = vec![pixel("a.png", 2.0), pixel("b.png", 8.0)];
        let run_id = recorder
            .save_run(&results, &RunContext::new("build-1"), Some("first"))
            .unwrap();

        let run = recorder.store().get_run(run_id).unwrap().unwrap();
        assert_eq!(run.stats().total_items, 2);
        assert!((run.stats().avg_difference - 5.0).abs() < 1e-12);
        assert!((run.stats().max_difference - 8.0).abs() < 1e-12);
        assert_eq!(run.notes(), Some("first"));
    }

    #[test]
    fn test_save_empty_run() {
        let (_dir, recorder) = recorder();
        let run_id = recorder.save_run(&[], &RunContext::new("empty"), None).unwrap();
        let run = recorder.store().get_run(run_id).unwrap().unwrap();
        assert_eq!(run.stats(), RunStats::default());
    }

    #[test]
    fn test_first_run_is_scored_but_not_enriched() {
        let (_dir, recorder) = recorder();
        let (run_id, enriched) = recorder
            .record_run(vec![pixel("a.png", 40.0)], &RunContext::new("b1"), None)
            .unwrap();
        assert!((enriched[0].composite_score().unwrap() - 10.0).abs() < 1e-9);
        assert!(enriched[0].enrichment().is_none());

        let stored = recorder.store().results_for_run(run_id).unwrap();
        assert!((stored[0].composite_score().unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_enrichment_failure_returns_input() {
        let (_dir, recorder) = recorder();
        let config = recorder.store().active_composite_config().unwrap();
        let input = vec![pixel("a.png", 1.0)];
        // run 99 does not exist, so the write-back cannot match
        let output = recorder.enrich_with_history(RunId::new(99), input.clone(), &config);
        assert_eq!(output, input);
    }

    #[test]
    fn test_invalid_config_returns_input() {
        let (_dir, recorder) = recorder();
        let mut config = recorder.store().active_composite_config().unwrap();
        config.weights = CompositeWeights::new(0.0, 0.0, 0.0, 0.0);
        let input = vec![pixel("a.png", 1.0)];
        let run_id = recorder.save_run(&input, &RunContext::new("b"), None).unwrap();
        let output = recorder.enrich_with_history(run_id, input.clone(), &config);
        assert_eq!(output, input);
    }

    #[test]
    fn test_scores_chronological_and_trend() {
        let (_dir, recorder) = recorder();
        for (i, value) in [40.0, 60.0, 80.0, 100.0].iter().enumerate() {
            recorder
                .record_run(vec![pixel("a.png", *value)], &RunContext::new(format!("b{i}")), None)
                .unwrap();
        }
        let scores = recorder.recent_scores_for_item("a.png", None, 100).unwrap();
        assert_eq!(scores.len(), 4);
        assert!(scores[0] < scores[3]);
        assert_eq!(
            recorder.trend_for_item("a.png", None, 100, 3).unwrap(),
            Some(Trend::Increasing)
        );
        assert_eq!(recorder.trend_for_item("missing.png", None, 100, 3).unwrap(), None);
    }
}
