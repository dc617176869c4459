//! Run recorder integration tests
//!
//! End-to-end: save runs, score them, enrich against history, read back.

use chrono::{Duration, Utc};
use metric_history::anomaly::{AnomalyDetector, Trend};
use metric_history::history::{Measurement, RunContext, RunRecorder};
use metric_history::logging::init_tracing;
use metric_history::scoring::{
    CompositeWeights, COLOR_CATEGORY, COLOR_METRIC, PIXEL_DIFF_CATEGORY, PIXEL_DIFF_METRIC, SSIM_CATEGORY,
    SSIM_METRIC,
};
use metric_history::store::MetricStore;
use metric_history::Error;
use tempfile::TempDir;

fn setup() -> (TempDir, RunRecorder) {
    let _ = init_tracing(false);
    let dir = TempDir::new().expect("temp dir");
    let store = MetricStore::open(dir.path().join("history.db")).expect("open store");
    (dir, RunRecorder::new(store))
}

/// Measurement whose composite score equals `value` under pixel-only weights.
fn pixel(item: &str, value: f64) -> Measurement {
    Measurement::builder(item, value)
        .metric(PIXEL_DIFF_CATEGORY, PIXEL_DIFF_METRIC, value)
        .metric(SSIM_CATEGORY, SSIM_METRIC, 1.0)
        .build()
}

fn context(build: usize, days_ago: i64) -> RunContext {
    RunContext::new(format!("build-{build}")).timestamp(Utc::now() - Duration::days(days_ago))
}

// =============================================================================
// Anomaly scenario
// =============================================================================

#[test]
fn test_only_variable_item_flagged() {
    let (_dir, recorder) = setup();
    recorder
        .store()
        .create_composite_config(&CompositeWeights::new(1.0, 0.0, 0.0, 0.0), Some("pixel only"))
        .unwrap();

    let stable = [10.0, 11.0, 12.0, 10.5, 11.5];
    let variable = [20.0, 28.0, 22.0, 26.0, 24.0];
    for (i, (s, v)) in stable.iter().zip(variable.iter()).enumerate() {
        let days_ago = 10 - i64::try_from(i).unwrap();
        let (_, enriched) = recorder
            .record_run(
                vec![pixel("stable_image.png", *s), pixel("variable_image.png", *v)],
                &context(i, days_ago),
                None,
            )
            .unwrap();
        assert!(enriched.iter().all(|m| !m.is_anomaly()), "history run {i} flagged");
    }

    let (run_id, enriched) = recorder
        .record_run(
            vec![pixel("stable_image.png", 11.0), pixel("variable_image.png", 80.0)],
            &context(99, 0),
            Some("current"),
        )
        .unwrap();

    let stable_now = enriched.iter().find(|m| m.item_key() == "stable_image.png").unwrap();
    let variable_now = enriched.iter().find(|m| m.item_key() == "variable_image.png").unwrap();

    assert!(!stable_now.is_anomaly());
    let e = variable_now.enrichment().unwrap();
    assert!(e.is_anomaly);
    assert!((e.historical_mean - 24.0).abs() < 1e-9);
    assert!((e.historical_std_dev - 10.0_f64.sqrt()).abs() < 1e-9);
    assert!(e.std_dev_from_mean > 17.0);

    // write-back reached the database
    let stored = recorder.store().results_for_run(run_id).unwrap();
    assert_eq!(stored[0].item_key(), "variable_image.png");
    assert!(stored[0].is_anomaly());
    assert!(!stored[1].is_anomaly());
    assert!((stored[0].composite_score().unwrap() - 80.0).abs() < 1e-9);
    assert_eq!(recorder.store().anomaly_count_for_run(run_id).unwrap(), 1);

    let summary = recorder.summarize(&enriched);
    assert_eq!(summary.total_anomalies, 1);
    assert_eq!(summary.top_deviations[0].item_key, "variable_image.png");
}

#[test]
fn test_default_weights_scenario() {
    let (_dir, recorder) = setup();
    let item = |pd: f64, ssim: f64, color: f64| {
        Measurement::builder("scene.png", pd)
            .metric(PIXEL_DIFF_CATEGORY, PIXEL_DIFF_METRIC, pd)
            .metric(SSIM_CATEGORY, SSIM_METRIC, ssim)
            .metric(COLOR_CATEGORY, COLOR_METRIC, color)
            .build()
    };

    for (i, pd) in [2.0, 2.5, 3.0, 2.2].iter().enumerate() {
        recorder
            .record_run(vec![item(*pd, 0.98, 5.0)], &context(i, 5 - i64::try_from(i).unwrap()), None)
            .unwrap();
    }
    let (_, enriched) = recorder
        .record_run(vec![item(60.0, 0.4, 200.0)], &context(9, 0), None)
        .unwrap();
    assert!(enriched[0].is_anomaly());
    assert!(enriched[0].composite_score().unwrap() > 30.0);
}

#[test]
fn test_non_finite_difference_rejects_batch_by_item() {
    let (_dir, recorder) = setup();
    let err = recorder
        .record_run(
            vec![Measurement::new("a.png", f64::NAN), Measurement::new("b.png", 1.0)],
            &context(0, 0),
            None,
        )
        .unwrap_err();
    match err {
        Error::Validation(msg) => assert!(msg.contains("a.png"), "{msg}"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(recorder.store().run_count().unwrap(), 0);
}

// =============================================================================
// Enrichment rules
// =============================================================================

#[test]
fn test_short_history_is_not_enriched() {
    let (_dir, recorder) = setup();
    for i in 0..3 {
        let (_, enriched) = recorder
            .record_run(vec![pixel("a.png", 10.0)], &context(i, 5), None)
            .unwrap();
        assert!(enriched[0].enrichment().is_none(), "run {i} has only {i} prior scores");
    }
    let (_, enriched) = recorder
        .record_run(vec![pixel("a.png", 10.0)], &context(3, 4), None)
        .unwrap();
    assert!(enriched[0].enrichment().is_some());
}

#[test]
fn test_zero_spread_history_flags_any_change() {
    let (_dir, recorder) = setup();
    for i in 0..3 {
        recorder.record_run(vec![pixel("flat.png", 20.0)], &context(i, 9), None).unwrap();
    }
    let (_, enriched) = recorder
        .record_run(vec![pixel("flat.png", 24.0)], &context(3, 1), None)
        .unwrap();
    let e = enriched[0].enrichment().unwrap();
    assert!(e.is_anomaly);
    assert!(e.std_dev_from_mean.is_infinite());
    assert!(e.historical_std_dev.abs() < f64::EPSILON);
}

#[test]
fn test_group_keys_separate_histories() {
    let (_dir, recorder) = setup();
    for i in 0..3 {
        let batch = vec![
            Measurement::builder("same.png", 4.0)
                .group_key("ui")
                .metric(PIXEL_DIFF_CATEGORY, PIXEL_DIFF_METRIC, 4.0)
                .build(),
            Measurement::builder("same.png", 40.0)
                .group_key("renders")
                .metric(PIXEL_DIFF_CATEGORY, PIXEL_DIFF_METRIC, 40.0 + f64::from(i))
                .build(),
        ];
        recorder.record_run(batch, &context(usize::try_from(i).unwrap(), 5), None).unwrap();
    }

    let ui_history = recorder.history_for_item("same.png", Some("ui"), 100).unwrap();
    assert_eq!(ui_history.len(), 3);
    assert!(ui_history.iter().all(|h| h.result().group_key() == Some("ui")));
    assert_eq!(recorder.history_for_item("same.png", None, 100).unwrap().len(), 6);
}

#[test]
fn test_custom_detector_threshold() {
    let (_dir, base) = setup();
    let recorder = base.with_detector(AnomalyDetector::new(50.0, 2).unwrap());
    for (i, v) in [10.0, 14.0].iter().enumerate() {
        recorder.record_run(vec![pixel("a.png", *v)], &context(i, 5), None).unwrap();
    }
    let (_, enriched) = recorder
        .record_run(vec![pixel("a.png", 40.0)], &context(5, 1), None)
        .unwrap();
    // 2 prior samples are enough, and 40 is within 50 sigma
    assert!(enriched[0].enrichment().is_some());
    assert!(!enriched[0].is_anomaly());
}

// =============================================================================
// Trend
// =============================================================================

#[test]
fn test_trend_for_item() {
    let (_dir, recorder) = setup();
    for (i, v) in [10.0, 15.0, 20.0, 25.0, 30.0].iter().enumerate() {
        recorder
            .record_run(vec![pixel("drift.png", *v)], &context(i, 10 - i64::try_from(i).unwrap()), None)
            .unwrap();
    }
    let scores = recorder.recent_scores_for_item("drift.png", None, 100).unwrap();
    assert_eq!(scores.len(), 5);
    assert!(scores.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(
        recorder.trend_for_item("drift.png", None, 100, 3).unwrap(),
        Some(Trend::Increasing)
    );
}
