//! PostgreSQL dialect.

use quarry_types::Value;

use super::{CommonDialect, Dialect};
use crate::details::{ConnectionDetails, POSTGRES};
use crate::error::Result;
use crate::store::{count_is_positive, Store};

/// PostgreSQL and wire-compatible servers.
#[derive(Debug, Clone)]
pub struct Postgres {
    common: CommonDialect,
}

impl Postgres {
    /// Binds the dialect to `details`.
    pub fn new(details: ConnectionDetails) -> Self {
        Self {
            common: CommonDialect::new(details),
        }
    }

    fn schema(table: &str) -> (Option<&str>, &str) {
        match table.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, table),
        }
    }
}

impl Dialect for Postgres {
    fn common(&self) -> &CommonDialect {
        &self.common
    }

    fn name(&self) -> &'static str {
        POSTGRES
    }

    fn url(&self) -> String {
        let d = self.details();
        if !d.url.is_empty() {
            return d.url.clone();
        }
        let mut url = format!(
            "postgres://{}:{}@{}:{}/{}",
            d.user, d.password, d.host, d.port, d.database
        );
        if let Some(mode) = d.option("sslmode") {
            url.push_str(&format!("?sslmode={mode}"));
        }
        url
    }

    fn bind_var(&self, i: usize) -> String {
        format!("${i}")
    }

    fn max_identifier_len(&self) -> Option<usize> {
        Some(63)
    }

    /// Rewrites `?` placeholders to `$1, $2, ...`, leaving quoted text alone.
    fn translate_sql(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len() + 8);
        let mut position = 0;
        let mut quote: Option<char> = None;
        for c in sql.chars() {
            match (quote, c) {
                (Some(q), c) if c == q => {
                    quote = None;
                    out.push(c);
                }
                (Some(_), c) => out.push(c),
                (None, '\'' | '"') => {
                    quote = Some(c);
                    out.push(c);
                }
                (None, '?') => {
                    position += 1;
                    out.push_str(&self.bind_var(position));
                }
                (None, c) => out.push(c),
            }
        }
        out
    }

    fn last_insert_id_returning_suffix(&self, _table: &str, column: &str) -> String {
        format!(" RETURNING {column}")
    }

    fn current_database(&self, store: &dyn Store) -> Result<String> {
        let row = store.get("SELECT current_database()", &[])?;
        Ok(row.value(0).map(ToString::to_string).unwrap_or_default())
    }

    fn has_table(&self, store: &dyn Store, table: &str) -> Result<bool> {
        let (schema, table) = Self::schema(table);
        count_is_positive(
            store,
            "SELECT count(*) FROM INFORMATION_SCHEMA.TABLES WHERE table_schema = COALESCE($1, CURRENT_SCHEMA()) AND table_name = $2",
            &[Value::from(schema), Value::from(table)],
        )
    }

    fn has_column(&self, store: &dyn Store, table: &str, column: &str) -> Result<bool> {
        let (schema, table) = Self::schema(table);
        count_is_positive(
            store,
            "SELECT count(*) FROM INFORMATION_SCHEMA.COLUMNS WHERE table_schema = COALESCE($1, CURRENT_SCHEMA()) AND table_name = $2 AND column_name = $3",
            &[Value::from(schema), Value::from(table), Value::from(column)],
        )
    }

    fn has_index(&self, store: &dyn Store, table: &str, index: &str) -> Result<bool> {
        let (schema, table) = Self::schema(table);
        count_is_positive(
            store,
            "SELECT count(*) FROM pg_indexes WHERE schemaname = COALESCE($1, CURRENT_SCHEMA()) AND tablename = $2 AND indexname = $3",
            &[Value::from(schema), Value::from(table), Value::from(index)],
        )
    }

    fn has_foreign_key(&self, store: &dyn Store, table: &str, name: &str) -> Result<bool> {
        let (_, table) = Self::schema(table);
        count_is_positive(
            store,
            "SELECT count(con.conname) FROM pg_constraint con WHERE $1::regclass::oid = con.conrelid AND con.conname = $2 AND con.contype = 'f'",
            &[Value::from(table), Value::from(name)],
        )
    }

    fn create_migration_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {table} (version VARCHAR(14) NOT NULL, name VARCHAR(255) NULL);\n\
             CREATE UNIQUE INDEX {table}_version_idx ON {table} (version);"
        )
    }
}
