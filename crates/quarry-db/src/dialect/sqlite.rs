//! SQLite dialect.

use std::sync::Arc;

use quarry_types::Value;

use super::{CommonDialect, Dialect};
use crate::details::{ConnectionDetails, SQLITE3};
use crate::error::{DbError, Result};
use crate::pool::SqliteStore;
use crate::store::{count_is_positive, Store};

/// SQLite 3, backed by the bundled pooled store.
#[derive(Debug, Clone)]
pub struct Sqlite {
    common: CommonDialect,
}

impl Sqlite {
    /// Binds the dialect to `details`.
    pub fn new(details: ConnectionDetails) -> Self {
        Self {
            common: CommonDialect::new(details),
        }
    }
}

impl Dialect for Sqlite {
    fn common(&self) -> &CommonDialect {
        &self.common
    }

    fn name(&self) -> &'static str {
        SQLITE3
    }

    fn url(&self) -> String {
        self.details().database.clone()
    }

    // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
    fn limit_and_offset_sql(&self, limit: Option<&Value>, offset: Option<&Value>) -> String {
        let limit = limit.and_then(CommonDialect::non_negative);
        let offset = offset.and_then(CommonDialect::non_negative);
        match (limit, offset) {
            (Some(l), Some(o)) => format!(" LIMIT {l} OFFSET {o}"),
            (Some(l), None) => format!(" LIMIT {l}"),
            (None, Some(o)) => format!(" LIMIT -1 OFFSET {o}"),
            (None, None) => String::new(),
        }
    }

    fn current_database(&self, store: &dyn Store) -> Result<String> {
        let row = store.get("PRAGMA database_list", &[])?;
        Ok(row.get_opt_string("name")?.unwrap_or_default())
    }

    fn has_table(&self, store: &dyn Store, table: &str) -> Result<bool> {
        count_is_positive(
            store,
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[Value::from(table)],
        )
    }

    fn has_column(&self, store: &dyn Store, table: &str, column: &str) -> Result<bool> {
        count_is_positive(
            store,
            "SELECT count(*) FROM pragma_table_info(?) WHERE name = ?",
            &[Value::from(table), Value::from(column)],
        )
    }

    fn has_index(&self, store: &dyn Store, table: &str, index: &str) -> Result<bool> {
        count_is_positive(
            store,
            "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND name = ?",
            &[Value::from(table), Value::from(index)],
        )
    }

    fn modify_column(
        &self,
        _store: &dyn Store,
        _table: &str,
        _column: &str,
        _typ: &str,
    ) -> Result<()> {
        Err(DbError::Unsupported {
            dialect: SQLITE3,
            operation: "modify_column",
        })
    }

    /// Retries the unit while SQLite reports the database as busy or locked,
    /// up to `retry_limit` times with `retry_sleep` between attempts.
    fn lock(&self, unit: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let limit = self.details().retry_limit();
        let pause = self.details().retry_sleep();
        let mut attempt = 0;
        loop {
            match unit() {
                Err(e) if e.is_busy() && attempt < limit => {
                    attempt += 1;
                    tracing::debug!(attempt, limit, "database busy, retrying unit of work");
                    std::thread::sleep(pause);
                }
                other => return other,
            }
        }
    }

    fn create_migration_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {table} (version TEXT NOT NULL, name TEXT NULL);\n\
             CREATE UNIQUE INDEX {table}_version_idx ON {table} (version);"
        )
    }

    fn open_store(&self) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(SqliteStore::open(self.details())?))
    }
}
