//! Ordered, idempotent schema migrations and the open-time consistency check.
//!
//! Each script is embedded at compile time and applied at most once; the
//! applied versions are tracked in `schema_migrations`. Scripts only use
//! `IF NOT EXISTS` / `INSERT OR IGNORE`, so re-running one is harmless.

use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info};

use super::encode_timestamp;
use crate::{Error, Result};

/// One embedded schema script.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// All migrations known to this build, in application order.
pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: include_str!("../../migrations/v1_initial_schema.sql"),
    },
    Migration {
        version: 2,
        name: "lookup_indexes",
        sql: include_str!("../../migrations/v2_lookup_indexes.sql"),
    },
];

/// Latest schema version this build can produce.
#[must_use]
pub(crate) fn latest_version(migrations: &[Migration]) -> u32 {
    migrations.last().map_or(0, |m| m.version)
}

/// Reject a migration list with gaps or out-of-order versions.
fn check_sequence(migrations: &[Migration]) -> Result<()> {
    for (expected, migration) in (1u32..).zip(migrations) {
        if migration.version != expected {
            return Err(Error::Storage(format!(
                "migration script v{expected} is missing (found v{} '{}' in its place)",
                migration.version, migration.name
            )));
        }
        if migration.sql.trim().is_empty() {
            return Err(Error::Storage(format!(
                "migration script v{} '{}' is empty",
                migration.version, migration.name
            )));
        }
    }
    Ok(())
}

const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
     version    INTEGER PRIMARY KEY,
     name       TEXT NOT NULL,
     applied_at TEXT NOT NULL
 )";

/// Current schema version recorded in the database.
///
/// Read-only: a file without a `schema_migrations` table reports 0.
pub(crate) fn current_version(conn: &Connection) -> Result<u32> {
    let tracked: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
        [],
        |row| row.get(0),
    )?;
    if !tracked {
        return Ok(0);
    }
    let version: u32 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;
    Ok(version)
}

/// Apply every pending migration, each in its own transaction.
///
/// Returns the schema version after the call.
///
/// # Errors
///
/// Returns [`Error::Storage`] when the list has a gap, when the database was
/// written by a newer build, or when a script fails.
pub(crate) fn apply(conn: &mut Connection, migrations: &[Migration]) -> Result<u32> {
    check_sequence(migrations)?;

    conn.execute_batch(CREATE_MIGRATIONS_TABLE)?;
    let current = current_version(conn)?;
    let latest = latest_version(migrations);
    if current > latest {
        return Err(Error::Storage(format!(
            "database schema v{current} is newer than the supported v{latest}"
        )));
    }

    for migration in migrations.iter().filter(|m| m.version > current) {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(migration.sql).map_err(|e| {
            Error::Storage(format!(
                "migration v{} '{}' failed: {e}",
                migration.version, migration.name
            ))
        })?;
        // OR IGNORE: a concurrent opener may have recorded it first
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, encode_timestamp(Utc::now())],
        )?;
        tx.commit()?;
        info!(version = migration.version, name = migration.name, "applied schema migration");
    }

    Ok(latest)
}

/// Run SQLite's integrity and foreign-key checks.
///
/// # Errors
///
/// Returns [`Error::Storage`] describing the first problems reported.
pub(crate) fn verify_integrity(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let report: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    if report.first().map(String::as_str) != Some("ok") {
        return Err(Error::Storage(format!(
            "integrity check failed: {}",
            report.join("; ")
        )));
    }

    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let violations: Vec<String> = stmt
        .query_map([], |row| {
            let table: String = row.get(0)?;
            let rowid: Option<i64> = row.get(1)?;
            let parent: String = row.get(2)?;
            Ok(format!("{table} row {} references missing {parent}", rowid.unwrap_or(-1)))
        })?
        .collect::<rusqlite::Result<_>>()?;
    if !violations.is_empty() {
        return Err(Error::Storage(format!(
            "foreign key check failed: {}",
            violations.join("; ")
        )));
    }

    debug!("integrity check passed");
    Ok(())
}
