//! Historical run tracking
//!
//! Data types for runs and their per-item results, plus the [`RunRecorder`]
//! that persists a batch and enriches it with each item's history.
//!
//! ## Schema Overview
//!
//! ```text
//! RunRecord (1) ──< ResultRecord (N) ──< annotation (N) [external]
//!                        │
//!                        ├── composite_score   [0, 100]
//!                        └── Enrichment        {mean, std_dev, deviation, is_anomaly}
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use metric_history::history::{Measurement, RunContext, RunRecorder};
//! use metric_history::store::MetricStore;
//!
//! # fn main() -> metric_history::Result<()> {
//! let store = MetricStore::open("history/comparison_history.db")?;
//! let recorder = RunRecorder::new(store);
//!
//! let results = vec![
//!     Measurement::builder("scene1.png", 2.5)
//!         .metric("Pixel Difference", "percent_different", 2.5)
//!         .metric("Structural Similarity", "ssim_score", 0.98)
//!         .build(),
//! ];
//!
//! let (run_id, enriched) = recorder.record_run(results, &RunContext::new("build-101"), None)?;
//! for m in &enriched {
//!     println!("{run_id} {}: anomaly={}", m.item_key(), m.is_anomaly());
//! }
//! # Ok(())
//! # }
//! ```

mod measurement;
mod recorder;
mod result_record;
mod run_record;

pub use measurement::{Measurement, MeasurementBuilder, MetricMap};
pub use recorder::{RunRecorder, DEFAULT_HISTORY_LIMIT};
pub use result_record::{Enrichment, EnrichmentUpdate, HistoryEntry, ResultId, ResultRecord};
pub use run_record::{NewRun, RunContext, RunId, RunRecord, RunStats};
