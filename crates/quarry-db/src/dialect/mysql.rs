//! MySQL dialect.

use quarry_types::Value;

use super::{CommonDialect, Dialect};
use crate::details::{ConnectionDetails, MYSQL};
use crate::error::Result;
use crate::store::{count_is_positive, Store};

/// MySQL and MariaDB.
#[derive(Debug, Clone)]
pub struct MySql {
    common: CommonDialect,
}

impl MySql {
    /// Binds the dialect to `details`.
    pub fn new(details: ConnectionDetails) -> Self {
        Self {
            common: CommonDialect::new(details),
        }
    }
}

impl Dialect for MySql {
    fn common(&self) -> &CommonDialect {
        &self.common
    }

    fn name(&self) -> &'static str {
        MYSQL
    }

    fn url(&self) -> String {
        let d = self.details();
        if !d.url.is_empty() {
            return d.url.trim_start_matches("mysql://").to_string();
        }
        format!(
            "{}:{}@({}:{})/{}?parseTime=true&multiStatements=true&readTimeout=1s",
            d.user, d.password, d.host, d.port, d.database
        )
    }

    fn quote(&self, ident: &str) -> String {
        format!("`{ident}`")
    }

    fn max_identifier_len(&self) -> Option<usize> {
        Some(64)
    }

    fn default_value_str(&self) -> &'static str {
        "VALUES()"
    }

    // OFFSET is only valid after a LIMIT.
    fn limit_and_offset_sql(&self, limit: Option<&Value>, offset: Option<&Value>) -> String {
        let Some(limit) = limit.and_then(CommonDialect::non_negative) else {
            return String::new();
        };
        let mut sql = format!(" LIMIT {limit}");
        if let Some(offset) = offset.and_then(CommonDialect::non_negative) {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    fn has_foreign_key(&self, store: &dyn Store, table: &str, name: &str) -> Result<bool> {
        let (schema, table) = self.schema_and_table(store, table)?;
        count_is_positive(
            store,
            "SELECT count(*) FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS WHERE CONSTRAINT_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = ? AND CONSTRAINT_TYPE = 'FOREIGN KEY'",
            &[Value::Text(schema), Value::from(table), Value::from(name)],
        )
    }

    fn remove_index(&self, store: &dyn Store, table: &str, index: &str) -> Result<()> {
        store
            .exec(&format!("DROP INDEX {index} ON {}", self.quote(table)), &[])
            .map(|_| ())
    }

    fn modify_column(&self, store: &dyn Store, table: &str, column: &str, typ: &str) -> Result<()> {
        store
            .exec(&format!("ALTER TABLE {table} MODIFY COLUMN {column} {typ}"), &[])
            .map(|_| ())
    }

    fn create_migration_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {table} (version NVARCHAR(14) NOT NULL, name NVARCHAR(255) NULL, \
             UNIQUE INDEX {table}_version_idx (version ASC));"
        )
    }
}
