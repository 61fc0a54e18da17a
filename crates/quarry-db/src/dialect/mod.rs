//! SQL dialects.
//!
//! A [`Dialect`] turns engine intent into family-specific SQL: placeholder
//! style, identifier quoting, statement shapes, `LIMIT`/`OFFSET` placement
//! and introspection queries. [`CommonDialect`] carries the defaults; the
//! family dialects hold one by composition and override only what differs.

mod common;
mod mysql;
mod postgres;
mod sqlite;

use std::fmt;
use std::sync::Arc;

use quarry_types::Value;

use crate::columns::Columns;
use crate::details::ConnectionDetails;
use crate::error::{DbError, Result};
use crate::store::{count_is_positive, Store};

pub use common::CommonDialect;
pub use mysql::MySql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

/// Dialect-specific SQL generation and introspection.
///
/// Every method has a default routed through [`Dialect::common`]; family
/// dialects override the handful that differ.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// The shared default implementation this dialect is composed over.
    fn common(&self) -> &CommonDialect;

    /// Canonical dialect name.
    fn name(&self) -> &'static str;

    /// The details this dialect was built for.
    fn details(&self) -> &ConnectionDetails {
        &self.common().details
    }

    /// Connection string for the driver.
    fn url(&self) -> String {
        self.details().url.clone()
    }

    /// Placeholder for the 1-based argument position `i`.
    fn bind_var(&self, _i: usize) -> String {
        "?".to_string()
    }

    /// Quotes an identifier.
    fn quote(&self, ident: &str) -> String {
        format!("\"{ident}\"")
    }

    /// Final rewrite applied to every compiled statement.
    fn translate_sql(&self, sql: &str) -> String {
        sql.to_string()
    }

    /// Longest identifier the database accepts, if it enforces one.
    fn max_identifier_len(&self) -> Option<usize> {
        None
    }

    /// `INSERT` with one `:column` parameter per column.
    fn create_stmt(&self, table: &str, columns: &Columns) -> String {
        if columns.is_empty() {
            return format!("INSERT INTO {table} {}", self.default_value_str());
        }
        format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.names().join(", "),
            columns.param_string()
        )
    }

    /// `UPDATE` of the given columns restricted by `where_id`.
    fn update_stmt(&self, table: &str, columns: &Columns, where_id: &str) -> String {
        format!(
            "UPDATE {table} SET {} WHERE {where_id}",
            columns.update_string()
        )
    }

    /// `DELETE` restricted by `where_id`.
    fn delete_stmt(&self, table: &str, where_id: &str) -> String {
        format!("DELETE FROM {table} WHERE {where_id}")
    }

    /// Wraps `query` so it returns a single `row_count` column.
    fn count_stmt(&self, field: &str, query: &str) -> String {
        format!("SELECT COUNT({field}) AS row_count FROM ({query}) AS count_query")
    }

    /// `LIMIT`/`OFFSET` fragment with a leading space.
    ///
    /// Each part is emitted only when it parses as a non-negative integer.
    fn limit_and_offset_sql(&self, limit: Option<&Value>, offset: Option<&Value>) -> String {
        let mut sql = String::new();
        if let Some(limit) = limit.and_then(CommonDialect::non_negative) {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset.and_then(CommonDialect::non_negative) {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    /// Suffix appended to inserts so they return the new identifier.
    fn last_insert_id_returning_suffix(&self, _table: &str, _column: &str) -> String {
        String::new()
    }

    /// Insert fragment used when there are no columns to write.
    fn default_value_str(&self) -> &'static str {
        "DEFAULT VALUES"
    }

    /// Name of the database the store is connected to.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn current_database(&self, store: &dyn Store) -> Result<String> {
        let row = store.get(&self.translate_sql("SELECT DATABASE()"), &[])?;
        Ok(row.value(0).map(ToString::to_string).unwrap_or_default())
    }

    /// Whether `table` exists. `schema.table` names pick the schema.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn has_table(&self, store: &dyn Store, table: &str) -> Result<bool> {
        let (schema, table) = self.schema_and_table(store, table)?;
        count_is_positive(
            store,
            &self.translate_sql(
                "SELECT count(*) FROM INFORMATION_SCHEMA.TABLES WHERE table_schema = ? AND table_name = ?",
            ),
            &[Value::Text(schema), Value::from(table)],
        )
    }

    /// Whether `table` has a column called `column`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn has_column(&self, store: &dyn Store, table: &str, column: &str) -> Result<bool> {
        let (schema, table) = self.schema_and_table(store, table)?;
        count_is_positive(
            store,
            &self.translate_sql(
                "SELECT count(*) FROM INFORMATION_SCHEMA.COLUMNS WHERE table_schema = ? AND table_name = ? AND column_name = ?",
            ),
            &[Value::Text(schema), Value::from(table), Value::from(column)],
        )
    }

    /// Whether `table` has an index called `index`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn has_index(&self, store: &dyn Store, table: &str, index: &str) -> Result<bool> {
        let (schema, table) = self.schema_and_table(store, table)?;
        count_is_positive(
            store,
            &self.translate_sql(
                "SELECT count(*) FROM INFORMATION_SCHEMA.STATISTICS WHERE table_schema = ? AND table_name = ? AND index_name = ?",
            ),
            &[Value::Text(schema), Value::from(table), Value::from(index)],
        )
    }

    /// Whether `table` has a foreign key called `name`. The default dialect
    /// cannot tell and answers `false`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn has_foreign_key(&self, _store: &dyn Store, _table: &str, _name: &str) -> Result<bool> {
        Ok(false)
    }

    /// Drops an index.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn remove_index(&self, store: &dyn Store, _table: &str, index: &str) -> Result<()> {
        store.exec(&format!("DROP INDEX {index}"), &[]).map(|_| ())
    }

    /// Changes the type of a column.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn modify_column(&self, store: &dyn Store, table: &str, column: &str, typ: &str) -> Result<()> {
        store
            .exec(&format!("ALTER TABLE {table} ALTER COLUMN {column} TYPE {typ}"), &[])
            .map(|_| ())
    }

    /// Deterministic name for an index or foreign key.
    ///
    /// Names over [`Dialect::max_identifier_len`] are shortened to a prefix
    /// of the first field plus a content hash.
    fn build_key_name(&self, kind: &str, table: &str, fields: &[&str]) -> String {
        let name = CommonDialect::key_name(kind, table, fields);
        match self.max_identifier_len() {
            Some(cap) if name.chars().count() > cap => {
                CommonDialect::hashed_key_name(&name, fields.first().copied().unwrap_or(table), cap)
            }
            _ => name,
        }
    }

    /// Runs a unit of work under the dialect's serialization policy.
    ///
    /// # Errors
    ///
    /// Returns whatever the unit returns.
    fn lock(&self, unit: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        unit()
    }

    /// DDL for the migration tracking table.
    fn create_migration_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {table} (version VARCHAR(14) NOT NULL, name VARCHAR(255) NULL);\n\
             CREATE UNIQUE INDEX {table}_version_idx ON {table} (version);"
        )
    }

    /// Opens a pooled store for these details.
    ///
    /// # Errors
    ///
    /// Dialects without a bundled driver return `DbError::DriverUnavailable`.
    fn open_store(&self) -> Result<Arc<dyn Store>> {
        Err(DbError::DriverUnavailable(self.name().to_string()))
    }

    /// Splits `schema.table`, asking the store for the current database when
    /// no schema is given.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn schema_and_table(&self, store: &dyn Store, table: &str) -> Result<(String, String)> {
        match table.split_once('.') {
            Some((schema, table)) => Ok((schema.to_string(), table.to_string())),
            None => Ok((self.current_database(store)?, table.to_string())),
        }
    }
}

/// Constructor stored in the registry for one dialect family.
pub type DialectFactory = fn(ConnectionDetails) -> Arc<dyn Dialect>;
