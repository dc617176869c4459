//! Sparse single-row updates.
//!
//! Collects the columns a caller actually supplied and emits one
//! parameterized `UPDATE`. Column names are `&'static str` from the
//! store's own whitelist, never caller input.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::Result;

#[derive(Debug)]
pub(crate) struct SparseUpdate {
    table: &'static str,
    assignments: Vec<(&'static str, Value)>,
}

impl SparseUpdate {
    pub(crate) const fn new(table: &'static str) -> Self {
        Self {
            table,
            assignments: Vec::new(),
        }
    }

    pub(crate) fn set(&mut self, column: &'static str, value: impl Into<Value>) -> &mut Self {
        self.assignments.push((column, value.into()));
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    fn sql(&self, key_column: &'static str) -> String {
        let set_clause = self
            .assignments
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {} SET {set_clause} WHERE {key_column} = ?",
            self.table
        )
    }

    /// Execute against the row identified by `key_column = key`.
    ///
    /// Returns the number of rows changed (0 when the row does not exist or
    /// nothing was supplied).
    pub(crate) fn execute(&self, conn: &Connection, key_column: &'static str, key: i64) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let values = self
            .assignments
            .iter()
            .map(|(_, value)| value.clone())
            .chain(std::iter::once(Value::Integer(key)));
        let changed = conn
            .prepare_cached(&self.sql(key_column))?
            .execute(params_from_iter(values))?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_lists_only_supplied_columns() {
        let mut update = SparseUpdate::new("retention_policy");
        update.set("keep_all_runs", false).set("max_runs_to_keep", Some(10_i64));
        assert_eq!(
            update.sql("policy_id"),
            "UPDATE retention_policy SET keep_all_runs = ?, max_runs_to_keep = ? WHERE policy_id = ?"
        );
    }

    #[test]
    fn test_execute_updates_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, a INTEGER, b TEXT); INSERT INTO t VALUES (1, 0, 'x');")
            .unwrap();

        let mut update = SparseUpdate::new("t");
        update.set("b", "y".to_string());
        assert_eq!(update.execute(&conn, "id", 1).unwrap(), 1);
        assert_eq!(update.execute(&conn, "id", 2).unwrap(), 0);

        let (a, b): (i64, String) = conn
            .query_row("SELECT a, b FROM t WHERE id = 1", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, "y");
    }

    #[test]
    fn test_empty_update_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        let update = SparseUpdate::new("missing_table");
        assert_eq!(update.execute(&conn, "id", 1).unwrap(), 0);
    }
}
