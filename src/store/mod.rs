//! Metric store (SQLite)
//!
//! Durable, transactional persistence for runs, results, composite metric
//! configurations, annotations and the retention policy.
//!
//! **Connection discipline**:
//! - One connection per operation; the store itself only holds the path,
//!   so it is cheap to clone and safe to share across threads
//! - WAL journal: many concurrent readers, commits serialized by SQLite
//! - Every connection waits at most `busy_timeout` (30 s default) for a lock,
//!   then fails with [`Error::Busy`](crate::Error::Busy)
//! - Multi-row writes run in one `IMMEDIATE` transaction that rolls back on
//!   drop, so no partial run is ever visible to readers
//!
//! ## Example
//!
//! ```rust,no_run
//! use metric_history::history::{Measurement, NewRun, RunContext, RunStats};
//! use metric_history::store::MetricStore;
//!
//! # fn main() -> metric_history::Result<()> {
//! let store = MetricStore::open("history.db")?;
//! let results = vec![Measurement::new("scene1.png", 1.5)];
//! let run = NewRun::new(RunContext::new("build-7"), RunStats::from_measurements(&results));
//!
//! let (run_id, inserted) = store.insert_run_with_results(&run, &results)?;
//! assert_eq!(inserted, 1);
//! assert_eq!(store.results_for_run(run_id)?.len(), 1);
//! # Ok(())
//! # }
//! ```

mod config_rows;
pub(crate) mod migrations;
mod update;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::history::{
    Enrichment, EnrichmentUpdate, HistoryEntry, Measurement, MetricMap, NewRun, ResultId,
    ResultRecord, RunId, RunRecord, RunStats,
};
use crate::{Error, Result};
use update::SparseUpdate;

/// Default wait for a contended lock before failing with a busy error.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on bound parameters per `IN (...)` query.
const IN_CLAUSE_CHUNK: usize = 500;

const RUN_COLUMNS: &str = "run_id, build_id, timestamp, base_dir, new_dir, known_good_dir, \
     config_snapshot, total_items, avg_difference, max_difference, notes";

const RESULT_COLUMNS: &str = "r.result_id, r.run_id, r.item_key, r.group_key, \
     r.primary_difference, r.metrics_json, r.composite_score, r.historical_mean, \
     r.historical_std_dev, r.std_dev_from_mean, r.is_anomaly";

/// Store tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long a connection waits for a lock before failing.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Store-wide counts used by retention reporting.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStatistics {
    /// Number of runs.
    pub total_runs: u64,
    /// Number of results across all runs.
    pub total_results: u64,
    /// Runs with at least one annotated result.
    pub annotated_runs: u64,
    /// Runs with at least one anomalous result.
    pub anomalous_runs: u64,
    /// Timestamp of the oldest run.
    pub oldest_run: Option<DateTime<Utc>>,
    /// Timestamp of the newest run.
    pub newest_run: Option<DateTime<Utc>>,
}

/// Durable store of runs and results backed by a single SQLite file.
#[derive(Debug, Clone)]
pub struct MetricStore {
    path: PathBuf,
    options: StoreOptions,
}

impl MetricStore {
    /// Open (or create) the store at `path` with default options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if migrations cannot be applied or the
    /// integrity check fails; the store must not be used in that case.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open (or create) the store at `path`.
    ///
    /// Creates missing parent directories, switches the journal to WAL,
    /// applies pending migrations and runs the consistency checks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be opened, a migration
    /// script is missing or fails, the schema is newer than this build, or
    /// the integrity check fails.
    pub fn open_with<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { path, options };
        let mut conn = store.connection()?;

        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(path = %store.path.display(), mode = %mode, "WAL journal mode unavailable");
        }

        let version = migrations::apply(&mut conn, migrations::MIGRATIONS)?;
        migrations::verify_integrity(&conn)?;

        info!(path = %store.path.display(), schema_version = version, "metric store ready");
        Ok(store)
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Options this store was opened with.
    #[must_use]
    pub const fn options(&self) -> StoreOptions {
        self.options
    }

    /// Open a fresh connection with the busy timeout and foreign keys set.
    pub(crate) fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            Error::Storage(format!("failed to open {}: {e}", self.path.display()))
        })?;
        conn.busy_timeout(self.options.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Run `work` inside one `IMMEDIATE` transaction.
    ///
    /// Commits on success; on error the transaction is dropped (rolled back)
    /// and the error is re-raised as [`Error::Transaction`].
    fn write_transaction<T>(
        &self,
        context: &str,
        work: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::rolled_back(context, e.into()))?;
        let value = work(&tx).map_err(|e| Error::rolled_back(context, e))?;
        tx.commit().map_err(|e| Error::rolled_back(context, e.into()))?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a run row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails or the snapshot cannot be encoded.
    pub fn insert_run(&self, run: &NewRun) -> Result<RunId> {
        check_run_stats(run)?;
        let conn = self.connection()?;
        let run_id = insert_run_row(&conn, run)?;
        debug!(%run_id, build_id = run.context().build_id(), "inserted run");
        Ok(run_id)
    }

    /// Insert all `rows` for `run_id` in one transaction.
    ///
    /// Either every row is committed or none is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first item with a non-finite
    /// primary difference (nothing is written), or [`Error::Transaction`] if
    /// any row fails (the batch is rolled back).
    pub fn insert_results_batch(&self, run_id: RunId, rows: &[Measurement]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        check_primary_differences(rows)?;
        let count = self.write_transaction("result batch insert", |tx| {
            insert_result_rows(tx, run_id, rows)
        })?;
        debug!(%run_id, count, "inserted results");
        Ok(count)
    }

    /// Insert a run and its results in one transaction.
    ///
    /// A run is never visible without its full result set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a non-finite primary difference or
    /// run aggregate before anything is written, and [`Error::Transaction`]
    /// if the insert itself fails (nothing is committed).
    pub fn insert_run_with_results(&self, run: &NewRun, rows: &[Measurement]) -> Result<(RunId, usize)> {
        check_primary_differences(rows)?;
        check_run_stats(run)?;
        let (run_id, count) = self.write_transaction("run insert", |tx| {
            let run_id = insert_run_row(tx, run)?;
            let count = insert_result_rows(tx, run_id, rows)?;
            Ok((run_id, count))
        })?;
        debug!(%run_id, count, build_id = run.context().build_id(), "inserted run with results");
        Ok((run_id, count))
    }

    /// Update a result's composite score and/or enrichment quad.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the result does not exist and
    /// [`Error::Validation`] for a non-finite score.
    pub fn update_result_enrichment(&self, result_id: ResultId, update: &EnrichmentUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let conn = self.connection()?;
        if apply_enrichment(&conn, result_id, update)? == 0 {
            return Err(Error::not_found("result", result_id));
        }
        Ok(())
    }

    /// Apply many enrichment updates in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if any update fails or targets a
    /// missing result (nothing is committed).
    pub fn update_enrichment_batch(&self, updates: &[(ResultId, EnrichmentUpdate)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        self.write_transaction("enrichment write-back", |tx| {
            let mut changed = 0;
            for (result_id, update) in updates {
                if update.is_empty() {
                    continue;
                }
                if apply_enrichment(tx, *result_id, update)? == 0 {
                    return Err(Error::not_found("result", result_id));
                }
                changed += 1;
            }
            Ok(changed)
        })
    }

    /// Delete a run; its results and their annotations cascade in the same
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the run does not exist.
    pub fn delete_run(&self, run_id: RunId) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.get()])?;
        if deleted == 0 {
            return Err(Error::not_found("run", run_id));
        }
        tx.commit()?;
        info!(%run_id, "deleted run");
        Ok(())
    }

    /// Attach an annotation to a result.
    ///
    /// Annotation content is owned by external tooling; the store only keeps
    /// enough to answer "is this result annotated".
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the result does not exist.
    pub fn record_annotation(&self, result_id: ResultId, kind: &str, label: Option<&str>) -> Result<i64> {
        let conn = self.connection()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM results WHERE result_id = ?1)",
            params![result_id.get()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::not_found("result", result_id));
        }
        conn.execute(
            "INSERT INTO annotations (result_id, annotation_type, label, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![result_id.get(), kind, label, encode_timestamp(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Get a run by ID.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure; a missing run is `Ok(None)`.
    pub fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let conn = self.connection()?;
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
        let run = conn
            .query_row(&sql, params![run_id.get()], run_from_row)
            .optional()?;
        Ok(run)
    }

    /// Get the most recent run with the given build identifier.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure; no match is `Ok(None)`.
    pub fn get_run_by_build_id(&self, build_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE build_id = ?1 \
             ORDER BY timestamp DESC, run_id DESC LIMIT 1"
        );
        let run = conn.query_row(&sql, params![build_id], run_from_row).optional()?;
        Ok(run)
    }

    /// Most recent runs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY timestamp DESC, run_id DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params![sql_limit(limit)], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Every run's ID and timestamp, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn run_timeline(&self) -> Result<Vec<(RunId, DateTime<Utc>)>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT run_id, timestamp FROM runs ORDER BY timestamp ASC, run_id ASC")?;
        let timeline = stmt
            .query_map([], |row| {
                Ok((RunId::new(row.get(0)?), decode_timestamp(row, 1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(timeline)
    }

    /// All results of a run, highest composite score first (unscored last).
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn results_for_run(&self, run_id: RunId) -> Result<Vec<ResultRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {RESULT_COLUMNS} FROM results r WHERE r.run_id = ?1 \
             ORDER BY r.composite_score IS NULL, r.composite_score DESC, r.result_id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let results = stmt
            .query_map(params![run_id.get()], result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    /// Result IDs and keys of a run in insertion order.
    pub(crate) fn result_keys_for_run(&self, run_id: RunId) -> Result<Vec<(ResultId, String, Option<String>)>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT result_id, item_key, group_key FROM results WHERE run_id = ?1 ORDER BY result_id ASC",
        )?;
        let keys = stmt
            .query_map(params![run_id.get()], |row| {
                Ok((ResultId::new(row.get(0)?), row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// Per-item history across runs, newest first.
    ///
    /// With `group_key = None` results from every group are included.
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
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {RESULT_COLUMNS}, runs.build_id, runs.timestamp \
             FROM results r JOIN runs ON r.run_id = runs.run_id \
             WHERE r.item_key = ?1 AND (?2 IS NULL OR r.group_key = ?2) \
             ORDER BY runs.timestamp DESC, runs.run_id DESC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let history = stmt
            .query_map(params![item_key, group_key, sql_limit(limit)], |row| {
                Ok(HistoryEntry {
                    result: result_from_row(row)?,
                    build_id: row.get(11)?,
                    timestamp: decode_timestamp(row, 12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(history)
    }

    /// Scored history of an item, newest first, optionally skipping one run.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn scored_history_for_item(
        &self,
        item_key: &str,
        group_key: Option<&str>,
        limit: usize,
        exclude_run: Option<RunId>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(
            "SELECT runs.timestamp, r.composite_score \
             FROM results r JOIN runs ON r.run_id = runs.run_id \
             WHERE r.item_key = ?1 AND (?2 IS NULL OR r.group_key = ?2) \
               AND r.composite_score IS NOT NULL \
               AND (?3 IS NULL OR r.run_id != ?3) \
             ORDER BY runs.timestamp DESC, runs.run_id DESC LIMIT ?4",
        )?;
        let scores = stmt
            .query_map(
                params![item_key, group_key, exclude_run.map(RunId::get), sql_limit(limit)],
                |row| Ok((decode_timestamp(row, 0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(scores)
    }

    /// Number of runs.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn run_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM runs", [])
    }

    /// Number of results across all runs.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn result_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM results", [])
    }

    /// Number of annotations on a run's results.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn annotation_count_for_run(&self, run_id: RunId) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM annotations a JOIN results r ON a.result_id = r.result_id \
             WHERE r.run_id = ?1",
            [run_id.get()],
        )
    }

    /// Number of anomalous results in a run.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn anomaly_count_for_run(&self, run_id: RunId) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM results WHERE run_id = ?1 AND is_anomaly = 1",
            [run_id.get()],
        )
    }

    /// Number of scored results in a run.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn scored_count_for_run(&self, run_id: RunId) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM results WHERE run_id = ?1 AND composite_score IS NOT NULL",
            [run_id.get()],
        )
    }

    /// Subset of `run_ids` owning at least one annotated result.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn runs_with_annotations(&self, run_ids: &[RunId]) -> Result<HashSet<RunId>> {
        self.filter_runs(
            "SELECT DISTINCT r.run_id FROM results r \
             JOIN annotations a ON r.result_id = a.result_id WHERE r.run_id IN",
            run_ids,
        )
    }

    /// Subset of `run_ids` owning at least one anomalous result.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn runs_with_anomalies(&self, run_ids: &[RunId]) -> Result<HashSet<RunId>> {
        self.filter_runs(
            "SELECT DISTINCT r.run_id FROM results r WHERE r.is_anomaly = 1 AND r.run_id IN",
            run_ids,
        )
    }

    /// Store-wide counts and date range.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn statistics(&self) -> Result<StoreStatistics> {
        let conn = self.connection()?;
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        };

        let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM runs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(StoreStatistics {
            total_runs: count("SELECT COUNT(*) FROM runs")?,
            total_results: count("SELECT COUNT(*) FROM results")?,
            annotated_runs: count(
                "SELECT COUNT(DISTINCT r.run_id) FROM results r \
                 JOIN annotations a ON r.result_id = a.result_id",
            )?,
            anomalous_runs: count("SELECT COUNT(DISTINCT run_id) FROM results WHERE is_anomaly = 1")?,
            oldest_run: oldest.as_deref().and_then(parse_timestamp),
            newest_run: newest.as_deref().and_then(parse_timestamp),
        })
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Schema version recorded in the database.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn schema_version(&self) -> Result<u32> {
        migrations::current_version(&self.connection()?)
    }

    /// Names of all user tables.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Reclaim space after large deletions.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn vacuum(&self) -> Result<()> {
        self.connection()?.execute_batch("VACUUM")?;
        info!(path = %self.path.display(), "vacuumed metric store");
        Ok(())
    }

    /// Write a consistent copy of the database to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` already exists or the copy fails.
    pub fn backup_to<P: AsRef<Path>>(&self, target: P) -> Result<()> {
        let target = target.as_ref();
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let target_str = target.to_str().ok_or_else(|| {
            Error::Validation(format!("backup path is not valid UTF-8: {}", target.display()))
        })?;
        self.connection()?
            .execute("VACUUM INTO ?1", params![target_str])?;
        info!(target = %target.display(), "backed up metric store");
        Ok(())
    }

    fn count<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<u64> {
        let conn = self.connection()?;
        let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    fn filter_runs(&self, prefix: &str, run_ids: &[RunId]) -> Result<HashSet<RunId>> {
        let mut found = HashSet::new();
        if run_ids.is_empty() {
            return Ok(found);
        }
        let conn = self.connection()?;
        for chunk in run_ids.chunks(IN_CLAUSE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("{prefix} ({placeholders})");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter().map(|id| id.get())), |row| {
                row.get::<_, i64>(0)
            })?;
            for row in rows {
                found.insert(RunId::new(row?));
            }
        }
        Ok(found)
    }
}

// ----------------------------------------------------------------------
// Row helpers
// ----------------------------------------------------------------------

/// Canonical timestamp text: fixed-width RFC 3339 UTC, so lexical order is
/// chronological order.
pub(crate) fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn decode_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let total_items: i64 = row.get(7)?;
    Ok(RunRecord {
        run_id: RunId::new(row.get(0)?),
        build_id: row.get(1)?,
        timestamp: decode_timestamp(row, 2)?,
        base_dir: row.get(3)?,
        new_dir: row.get(4)?,
        known_good_dir: row.get(5)?,
        config_snapshot: decode_json(row, 6)?,
        stats: RunStats {
            total_items: u64::try_from(total_items).unwrap_or(0),
            avg_difference: row.get(8)?,
            max_difference: row.get(9)?,
        },
        notes: row.get(10)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ResultRecord> {
    let metrics: MetricMap = decode_json(row, 5)?;
    let mean: Option<f64> = row.get(7)?;
    let std_dev: Option<f64> = row.get(8)?;
    let deviation: Option<f64> = row.get(9)?;
    let is_anomaly: bool = row.get(10)?;

    let enrichment = match (mean, std_dev, deviation) {
        (Some(historical_mean), Some(historical_std_dev), Some(std_dev_from_mean)) => Some(Enrichment {
            historical_mean,
            historical_std_dev,
            std_dev_from_mean,
            is_anomaly,
        }),
        _ => None,
    };

    Ok(ResultRecord {
        result_id: ResultId::new(row.get(0)?),
        run_id: RunId::new(row.get(1)?),
        item_key: row.get(2)?,
        group_key: row.get(3)?,
        primary_difference: row.get(4)?,
        metrics,
        composite_score: row.get(6)?,
        enrichment,
    })
}

/// Validate and clamp a composite score before it reaches the database.
fn checked_score(score: f64) -> Result<f64> {
    if score.is_finite() {
        Ok(score.clamp(0.0, 100.0))
    } else {
        Err(Error::Validation(format!(
            "composite score must be finite, got {score}"
        )))
    }
}

fn check_enrichment(enrichment: &Enrichment) -> Result<()> {
    // +inf deviation is legal (zero-spread history); NaN would be stored as NULL
    if enrichment.historical_mean.is_finite()
        && enrichment.historical_std_dev.is_finite()
        && !enrichment.std_dev_from_mean.is_nan()
    {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "enrichment values must be numeric: {enrichment:?}"
        )))
    }
}

/// Reject rows whose primary difference cannot be stored.
fn check_primary_differences(rows: &[Measurement]) -> Result<()> {
    match rows.iter().find(|m| !m.primary_difference().is_finite()) {
        Some(bad) => Err(Error::Validation(format!(
            "primary difference for '{}' must be finite, got {}",
            bad.item_key(),
            bad.primary_difference()
        ))),
        None => Ok(()),
    }
}

fn check_run_stats(run: &NewRun) -> Result<()> {
    let stats = run.stats();
    if stats.avg_difference.is_finite() && stats.max_difference.is_finite() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "run aggregates must be finite: {stats:?}"
        )))
    }
}

fn insert_run_row(conn: &Connection, run: &NewRun) -> Result<RunId> {
    let context = run.context();
    let timestamp = context.explicit_timestamp().unwrap_or_else(Utc::now);
    let snapshot = serde_json::to_string(&context.config_snapshot)?;
    let stats = run.stats();

    conn.prepare_cached(
        "INSERT INTO runs (build_id, timestamp, base_dir, new_dir, known_good_dir, \
         config_snapshot, total_items, avg_difference, max_difference, notes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?
    .execute(params![
        context.build_id(),
        encode_timestamp(timestamp),
        context.base_dir,
        context.new_dir,
        context.known_good_dir,
        snapshot,
        i64::try_from(stats.total_items).unwrap_or(i64::MAX),
        stats.avg_difference,
        stats.max_difference,
        run.notes,
    ])?;
    Ok(RunId::new(conn.last_insert_rowid()))
}

fn insert_result_rows(conn: &Connection, run_id: RunId, rows: &[Measurement]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO results (run_id, item_key, group_key, primary_difference, metrics_json, \
         composite_score, historical_mean, historical_std_dev, std_dev_from_mean, is_anomaly) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;

    for measurement in rows {
        let score = measurement.composite_score().map(checked_score).transpose()?;
        let enrichment = measurement.enrichment().copied();
        if let Some(e) = &enrichment {
            check_enrichment(e)?;
        }
        stmt.execute(params![
            run_id.get(),
            measurement.item_key(),
            measurement.group_key(),
            measurement.primary_difference(),
            serde_json::to_string(measurement.metrics())?,
            score,
            enrichment.map(|e| e.historical_mean),
            enrichment.map(|e| e.historical_std_dev),
            enrichment.map(|e| e.std_dev_from_mean),
            enrichment.is_some_and(|e| e.is_anomaly),
        ])?;
    }
    Ok(rows.len())
}

fn apply_enrichment(conn: &Connection, result_id: ResultId, update: &EnrichmentUpdate) -> Result<usize> {
    let mut sparse = SparseUpdate::new("results");
    if let Some(score) = update.composite_score {
        sparse.set("composite_score", checked_score(score)?);
    }
    if let Some(enrichment) = &update.enrichment {
        check_enrichment(enrichment)?;
        sparse
            .set("historical_mean", enrichment.historical_mean)
            .set("historical_std_dev", enrichment.historical_std_dev)
            .set("std_dev_from_mean", enrichment.std_dev_from_mean)
            .set("is_anomaly", enrichment.is_anomaly);
    }
    sparse.execute(conn, "result_id", result_id.get())
}
