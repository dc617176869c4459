//! # metric-history: Historical Metrics Tracking & Anomaly Detection
//!
//! **Version**: 0.1.0
//!
//! Tracks a composite quality score for named items across repeated
//! measurement runs, flags results that deviate from each item's own
//! history, and prunes old runs without ever discarding audit evidence.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: A run is committed with all of its results or not at all
//! - **Poka-Yoke safety**: Schema `CHECK`s keep scores in [0, 100] and the
//!   enrichment quad all-or-nothing
//! - **Genchi Genbutsu**: Each item is judged against its own history, not a
//!   global threshold
//! - **Kaizen**: Composite weights are versioned, never edited in place
//!
//! ## Components
//!
//! | Module        | Role                                              |
//! |---------------|---------------------------------------------------|
//! | [`store`]     | SQLite persistence, migrations, queries           |
//! | [`scoring`]   | Weighted composite score over four metric axes    |
//! | [`anomaly`]   | Baseline, z-score classification, trend           |
//! | [`history`]   | Run/result model and the [`history::RunRecorder`] |
//! | [`retention`] | Policy evaluation and eviction sweep              |
//! | [`config`]    | JSON configuration                                |
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use metric_history::config::HistoryConfig;
//! use metric_history::history::{Measurement, RunContext};
//! use metric_history::retention::RetentionManager;
//!
//! # fn main() -> metric_history::Result<()> {
//! let config = HistoryConfig::from_json_str(r#"{"min_runs_for_stats": 3}"#)?;
//! let store = config.open_store(std::path::Path::new("."))?;
//! let recorder = config.recorder(store.clone())?;
//!
//! let batch = vec![Measurement::builder("scene1.png", 2.5)
//!     .metric("Pixel Difference", "percent_different", 2.5)
//!     .build()];
//! let (run_id, enriched) = recorder.record_run(batch, &RunContext::new("build-7"), None)?;
//! println!("run {run_id}: {} anomalies", recorder.summarize(&enriched).total_anomalies);
//!
//! let report = RetentionManager::new(store).evaluate(&config.retention, true)?;
//! println!("{} runs would be deleted", report.deletable.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod anomaly;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod retention;
pub mod scoring;
pub mod store;

pub use error::{Error, Result};
