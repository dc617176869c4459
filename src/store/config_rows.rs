//! Versioned composite configurations and the retention policy row.
//!
//! Both are "one active row" tables. Callers fetch the active record once
//! per operation and pass it along; nothing here is cached.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use super::update::SparseUpdate;
use super::{decode_timestamp, encode_timestamp, MetricStore};
use crate::retention::{RetentionPolicy, RetentionPolicyUpdate};
use crate::scoring::{CompositeConfig, CompositeWeights};
use crate::{Error, Result};

const CONFIG_COLUMNS: &str = "version, weight_pixel_diff, weight_ssim, weight_color_distance, \
     weight_histogram, description, created_at, is_active";

impl MetricStore {
    /// The active composite configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if no version is active (the schema seeds
    /// version 1, so this means the file was tampered with).
    pub fn active_composite_config(&self) -> Result<CompositeConfig> {
        let conn = self.connection()?;
        active_config(&conn)?
            .ok_or_else(|| Error::Storage("no active composite metric configuration".to_string()))
    }

    /// A composite configuration by version.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure; an unknown version is `Ok(None)`.
    pub fn composite_config(&self, version: u32) -> Result<Option<CompositeConfig>> {
        let conn = self.connection()?;
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM composite_metric_config WHERE version = ?1");
        let config = conn.query_row(&sql, params![version], config_from_row).optional()?;
        Ok(config)
    }

    /// All composite configurations, newest version first.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn list_composite_configs(&self) -> Result<Vec<CompositeConfig>> {
        let conn = self.connection()?;
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM composite_metric_config ORDER BY version DESC");
        let mut stmt = conn.prepare(&sql)?;
        let configs = stmt
            .query_map([], config_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(configs)
    }

    /// Store `weights` as a new version and make it the active one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for invalid weights, or
    /// [`Error::Transaction`] if the write fails (the previous version stays
    /// active).
    pub fn create_composite_config(
        &self,
        weights: &CompositeWeights,
        description: Option<&str>,
    ) -> Result<CompositeConfig> {
        weights.validate()?;
        let config = self.write_transaction("composite config create", |tx| {
            let version: u32 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM composite_metric_config",
                [],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE composite_metric_config SET is_active = 0 WHERE is_active = 1",
                [],
            )?;
            tx.execute(
                "INSERT INTO composite_metric_config (version, weight_pixel_diff, weight_ssim, \
                 weight_color_distance, weight_histogram, description, created_at, is_active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                params![
                    version,
                    weights.pixel_diff,
                    weights.ssim,
                    weights.color_distance,
                    weights.histogram,
                    description,
                    encode_timestamp(Utc::now()),
                ],
            )?;
            active_config(tx)?
                .ok_or_else(|| Error::Storage("composite configuration vanished after insert".to_string()))
        })?;
        info!(version = config.version, "activated new composite configuration");
        Ok(config)
    }

    /// Make an existing version the active one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown version.
    pub fn activate_composite_config(&self, version: u32) -> Result<CompositeConfig> {
        if self.composite_config(version)?.is_none() {
            return Err(Error::not_found("composite config", version));
        }
        let config = self.write_transaction("composite config activate", |tx| {
            tx.execute(
                "UPDATE composite_metric_config SET is_active = 0 WHERE is_active = 1",
                [],
            )?;
            tx.execute(
                "UPDATE composite_metric_config SET is_active = 1 WHERE version = ?1",
                params![version],
            )?;
            active_config(tx)?
                .ok_or_else(|| Error::not_found("composite config", version))
        })?;
        info!(version, "activated composite configuration");
        Ok(config)
    }

    /// The stored retention policy (the default policy if no row is active).
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn retention_policy(&self) -> Result<RetentionPolicy> {
        let conn = self.connection()?;
        Ok(active_policy(&conn)?.map_or_else(RetentionPolicy::default, |(_, policy)| policy))
    }

    /// Apply a sparse change to the stored retention policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if the write fails and
    /// [`Error::Storage`] if no policy row exists.
    pub fn update_retention_policy(&self, update: &RetentionPolicyUpdate) -> Result<RetentionPolicy> {
        if update.is_empty() {
            return self.retention_policy();
        }
        let policy = self.write_transaction("retention policy update", |tx| {
            let (policy_id, _) = active_policy(tx)?
                .ok_or_else(|| Error::Storage("no active retention policy row".to_string()))?;

            let mut sparse = SparseUpdate::new("retention_policy");
            if let Some(keep_all) = update.keep_all {
                sparse.set("keep_all_runs", keep_all);
            }
            if let Some(max_runs) = update.max_runs {
                sparse.set("max_runs_to_keep", max_runs);
            }
            if let Some(max_age_days) = update.max_age_days {
                sparse.set("max_age_days", max_age_days);
            }
            if let Some(keep_annotated) = update.keep_annotated {
                sparse.set("keep_annotated", keep_annotated);
            }
            if let Some(keep_anomalies) = update.keep_anomalies {
                sparse.set("keep_anomalies", keep_anomalies);
            }
            sparse.set("updated_at", encode_timestamp(Utc::now()));
            sparse.execute(tx, "policy_id", policy_id)?;

            active_policy(tx)?
                .map(|(_, policy)| policy)
                .ok_or_else(|| Error::Storage("retention policy vanished after update".to_string()))
        })?;
        info!(?policy, "updated retention policy");
        Ok(policy)
    }
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<CompositeConfig> {
    Ok(CompositeConfig {
        version: row.get(0)?,
        weights: CompositeWeights::new(row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
        description: row.get(5)?,
        created_at: decode_timestamp(row, 6)?,
        is_active: row.get(7)?,
    })
}

fn active_config(conn: &Connection) -> Result<Option<CompositeConfig>> {
    let sql = format!("SELECT {CONFIG_COLUMNS} FROM composite_metric_config WHERE is_active = 1");
    Ok(conn.query_row(&sql, [], config_from_row).optional()?)
}

fn active_policy(conn: &Connection) -> Result<Option<(i64, RetentionPolicy)>> {
    let policy = conn
        .query_row(
            "SELECT policy_id, keep_all_runs, max_runs_to_keep, max_age_days, keep_annotated, \
             keep_anomalies FROM retention_policy WHERE is_active = 1 \
             ORDER BY policy_id DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    RetentionPolicy {
                        keep_all: row.get(1)?,
                        max_runs: row.get(2)?,
                        max_age_days: row.get(3)?,
                        keep_annotated: row.get(4)?,
                        keep_anomalies: row.get(5)?,
                    },
                ))
            },
        )
        .optional()?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, MetricStore) {
        let dir = TempDir::new().unwrap();
        let store = MetricStore::open(dir.path().join("history.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_default_config_seeded() {
        let (_dir, store) = temp_store();
        let config = store.active_composite_config().unwrap();
        assert_eq!(config.version, 1);
        assert!(config.is_active);
        assert_eq!(config.weights, CompositeWeights::default());
    }

    #[test]
    fn test_create_config_activates_new_version() {
        let (_dir, store) = temp_store();
        let weights = CompositeWeights::new(0.4, 0.3, 0.2, 0.1);
        let created = store.create_composite_config(&weights, Some("pixel heavy")).unwrap();
        assert_eq!(created.version, 2);
        assert_eq!(created.description.as_deref(), Some("pixel heavy"));

        let active = store.active_composite_config().unwrap();
        assert_eq!(active.version, 2);
        let all = store.list_composite_configs().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|c| c.is_active).count(), 1);
        assert!(!store.composite_config(1).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_create_config_rejects_invalid_weights() {
        let (_dir, store) = temp_store();
        let err = store
            .create_composite_config(&CompositeWeights::new(-1.0, 0.5, 0.5, 0.5), None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.list_composite_configs().unwrap().len(), 1);
    }

    #[test]
    fn test_activate_config() {
        let (_dir, store) = temp_store();
        store
            .create_composite_config(&CompositeWeights::new(1.0, 0.0, 0.0, 0.0), None)
            .unwrap();
        let active = store.activate_composite_config(1).unwrap();
        assert_eq!(active.version, 1);
        assert_eq!(store.active_composite_config().unwrap().version, 1);

        let err = store.activate_composite_config(9).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(store.active_composite_config().unwrap().version, 1);
    }

    #[test]
    fn test_retention_policy_row() {
        let (_dir, store) = temp_store();
        assert_eq!(store.retention_policy().unwrap(), RetentionPolicy::default());

        let updated = store
            .update_retention_policy(&RetentionPolicyUpdate {
                keep_all: Some(false),
                max_runs: Some(Some(10)),
                ..RetentionPolicyUpdate::default()
            })
            .unwrap();
        assert!(!updated.keep_all);
        assert_eq!(updated.max_runs, Some(10));
        assert!(updated.keep_anomalies);

        let cleared = store
            .update_retention_policy(&RetentionPolicyUpdate {
                max_runs: Some(None),
                ..RetentionPolicyUpdate::default()
            })
            .unwrap();
        assert_eq!(cleared.max_runs, None);
        assert!(!cleared.keep_all);
        assert_eq!(store.retention_policy().unwrap(), cleared);
    }
}
