//! The store capability: the seam between the engine and a concrete driver.
//!
//! Everything above this module speaks in SQL text plus [`Value`] arguments
//! and reads back [`Row`]s. A store is either a pooled handle or a
//! transaction handle. Both satisfy the same trait so a transaction-bound
//! connection runs the exact same code paths as a pooled one.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use quarry_types::Value;

use crate::error::{DbError, Result};

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Number of rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// Driver-assigned identifier of the last inserted row, if any.
    pub last_insert_id: Option<i64>,
}

/// One result row: column names and their values, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Builds a row from parallel column and value lists.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` for a row without columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at position `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the column called `name`.
    ///
    /// Qualified names (`users.name`) fall back to the unqualified part.
    ///
    /// # Errors
    ///
    /// Returns `DbError::MissingColumn` if no such column exists.
    pub fn get(&self, name: &str) -> Result<&Value> {
        let position = self
            .columns
            .iter()
            .position(|c| c == name)
            .or_else(|| {
                let bare = name.rsplit_once('.').map(|(_, b)| b)?;
                self.columns.iter().position(|c| c == bare)
            })
            .ok_or_else(|| DbError::MissingColumn(name.to_string()))?;
        Ok(&self.values[position])
    }

    /// Reads an integer column. Booleans are accepted as 0/1.
    ///
    /// # Errors
    ///
    /// Fails if the column is missing or not an integer.
    pub fn get_i64(&self, name: &str) -> Result<i64> {
        let value = self.get(name)?;
        value
            .as_i64()
            .ok_or_else(|| mismatch(name, "int", value))
    }

    /// Reads a nullable integer column.
    ///
    /// # Errors
    ///
    /// Fails if the column is missing or holds a non-integer value.
    pub fn get_opt_i64(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name)? {
            Value::Null => Ok(None),
            _ => self.get_i64(name).map(Some),
        }
    }

    /// Reads a float column, widening integers.
    ///
    /// # Errors
    ///
    /// Fails if the column is missing or not numeric.
    pub fn get_f64(&self, name: &str) -> Result<f64> {
        match self.get(name)? {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(mismatch(name, "float", other)),
        }
    }

    /// Reads a boolean column stored either natively or as an integer.
    ///
    /// # Errors
    ///
    /// Fails if the column is missing or not boolean-like.
    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.get(name)? {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            other => Err(mismatch(name, "bool", other)),
        }
    }

    /// Reads a text column.
    ///
    /// # Errors
    ///
    /// Fails if the column is missing or not text.
    pub fn get_string(&self, name: &str) -> Result<String> {
        match self.get(name)? {
            Value::Text(s) => Ok(s.clone()),
            other => Err(mismatch(name, "text", other)),
        }
    }

    /// Reads a nullable text column.
    ///
    /// # Errors
    ///
    /// Fails if the column is missing or holds a non-text value.
    pub fn get_opt_string(&self, name: &str) -> Result<Option<String>> {
        match self.get(name)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            other => Err(mismatch(name, "text", other)),
        }
    }

    /// Reads a timestamp column.
    ///
    /// Text is accepted in RFC 3339 or `YYYY-MM-DD HH:MM:SS[.f]` form, the
    /// latter interpreted as UTC.
    ///
    /// # Errors
    ///
    /// Fails if the column is missing or not a recognizable timestamp.
    pub fn get_timestamp(&self, name: &str) -> Result<DateTime<Utc>> {
        match self.get(name)? {
            Value::Timestamp(t) => Ok(*t),
            Value::Text(s) => parse_timestamp(s).ok_or_else(|| DbError::ColumnType {
                column: name.to_string(),
                expected: "timestamp",
                found: "text",
            }),
            other => Err(mismatch(name, "timestamp", other)),
        }
    }
}

fn mismatch(column: &str, expected: &'static str, found: &Value) -> DbError {
    DbError::ColumnType {
        column: column.to_string(),
        expected,
        found: found.kind(),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Row-query, statement-exec and transaction operations over a database handle.
///
/// Positional placeholders are whatever the active dialect emits. Named
/// statements use `:name` placeholders; implementations bind only the names
/// that appear in the statement.
pub trait Store: Send + Sync {
    /// Runs a query and returns its first row, if any.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn query_row(&self, sql: &str, args: &[Value]) -> Result<Option<Row>>;

    /// Runs a query and returns every row.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn select(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>>;

    /// Runs a query that must return at least one row.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NoRows` when the result is empty.
    fn get(&self, sql: &str, args: &[Value]) -> Result<Row> {
        self.query_row(sql, args)?.ok_or(DbError::NoRows)
    }

    /// Executes a statement with positional arguments.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult>;

    /// Executes a statement with `:name` parameters.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn named_exec(&self, sql: &str, params: &[(&str, Value)]) -> Result<ExecResult>;

    /// Runs a `:name` parameterized statement that returns a row, such as an
    /// insert with a `RETURNING` clause.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn named_query_row(&self, sql: &str, params: &[(&str, Value)]) -> Result<Option<Row>>;

    /// Executes several `;`-separated statements without arguments.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn exec_script(&self, sql: &str) -> Result<()>;

    /// Starts a transaction and returns a store bound to it.
    ///
    /// A store that is already a transaction returns itself.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn begin(self: Arc<Self>) -> Result<Arc<dyn Store>>;

    /// Commits the transaction. A no-op on pooled handles.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn commit(&self) -> Result<()>;

    /// Rolls the transaction back. A no-op on pooled handles.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn rollback(&self) -> Result<()>;

    /// Releases the handle. A no-op on transaction handles.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn close(&self) -> Result<()>;

    /// Verifies the database is reachable.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    fn ping(&self) -> Result<()> {
        self.query_row("SELECT 1", &[]).map(|_| ())
    }

    /// Returns `true` for transaction handles.
    fn is_transaction(&self) -> bool;
}

/// Reads a `count(*)`-style scalar and reports whether it is positive.
pub(crate) fn count_is_positive(store: &dyn Store, sql: &str, args: &[Value]) -> Result<bool> {
    let count = match store.query_row(sql, args)? {
        Some(row) => row.value(0).and_then(Value::as_i64).unwrap_or(0),
        None => 0,
    };
    Ok(count > 0)
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-memory store that records every statement it receives.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// One recorded call.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Call {
        pub sql: String,
        pub args: Vec<Value>,
    }

    /// Records statements and replays queued rows.
    #[derive(Default)]
    pub struct RecordingStore {
        pub calls: Mutex<Vec<Call>>,
        pub rows: Mutex<VecDeque<Vec<Row>>>,
        pub in_tx: bool,
    }

    impl RecordingStore {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queues the rows returned by the next query.
        pub fn push_rows(&self, rows: Vec<Row>) {
            self.rows.lock().expect("rows lock").push_back(rows);
        }

        /// Queues a single-column count result.
        pub fn push_count(&self, n: i64) {
            self.push_rows(vec![Row::new(vec!["row_count".into()], vec![Value::Int(n)])]);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("calls lock").clone()
        }

        pub fn last_sql(&self) -> String {
            self.calls().last().map(|c| c.sql.clone()).unwrap_or_default()
        }

        fn record(&self, sql: &str, args: Vec<Value>) {
            self.calls.lock().expect("calls lock").push(Call {
                sql: sql.to_string(),
                args,
            });
        }

        fn next_rows(&self) -> Vec<Row> {
            self.rows
                .lock()
                .expect("rows lock")
                .pop_front()
                .unwrap_or_default()
        }
    }

    impl Store for RecordingStore {
        fn query_row(&self, sql: &str, args: &[Value]) -> Result<Option<Row>> {
            self.record(sql, args.to_vec());
            Ok(self.next_rows().into_iter().next())
        }

        fn select(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
            self.record(sql, args.to_vec());
            Ok(self.next_rows())
        }

        fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
            self.record(sql, args.to_vec());
            Ok(ExecResult {
                rows_affected: 1,
                last_insert_id: Some(1),
            })
        }

        fn named_exec(&self, sql: &str, params: &[(&str, Value)]) -> Result<ExecResult> {
            self.exec(sql, &params.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>())
        }

        fn named_query_row(&self, sql: &str, params: &[(&str, Value)]) -> Result<Option<Row>> {
            self.query_row(sql, &params.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>())
        }

        fn exec_script(&self, sql: &str) -> Result<()> {
            self.record(sql, Vec::new());
            Ok(())
        }

        fn begin(self: Arc<Self>) -> Result<Arc<dyn Store>> {
            self.record("BEGIN", Vec::new());
            Ok(Arc::new(RecordingTx { parent: self }))
        }

        fn commit(&self) -> Result<()> {
            Ok(())
        }

        fn rollback(&self) -> Result<()> {
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_transaction(&self) -> bool {
            self.in_tx
        }
    }

    /// Transaction view over a [`RecordingStore`] that shares its log.
    pub struct RecordingTx {
        pub parent: Arc<RecordingStore>,
    }

    impl Store for RecordingTx {
        fn query_row(&self, sql: &str, args: &[Value]) -> Result<Option<Row>> {
            self.parent.query_row(sql, args)
        }

        fn select(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
            self.parent.select(sql, args)
        }

        fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
            self.parent.exec(sql, args)
        }

        fn named_exec(&self, sql: &str, params: &[(&str, Value)]) -> Result<ExecResult> {
            self.parent.named_exec(sql, params)
        }

        fn named_query_row(&self, sql: &str, params: &[(&str, Value)]) -> Result<Option<Row>> {
            self.parent.named_query_row(sql, params)
        }

        fn exec_script(&self, sql: &str) -> Result<()> {
            self.parent.exec_script(sql)
        }

        fn begin(self: Arc<Self>) -> Result<Arc<dyn Store>> {
            Ok(self)
        }

        fn commit(&self) -> Result<()> {
            self.parent.record("COMMIT", Vec::new());
            Ok(())
        }

        fn rollback(&self) -> Result<()> {
            self.parent.record("ROLLBACK", Vec::new());
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_transaction(&self) -> bool {
            true
        }
    }
}
