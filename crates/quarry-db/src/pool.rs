//! Pooled SQLite store.
//!
//! [`SqliteStore`] is the bundled [`Store`] implementation. The pooled form
//! checks a connection out per statement; the transaction form pins one
//! connection for the life of the transaction and rolls it back on drop if
//! it was never finished.

use std::sync::{Arc, Mutex, MutexGuard};

use quarry_types::Value;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::OpenFlags;

use crate::details::ConnectionDetails;
use crate::error::{DbError, Result};
use crate::store::{ExecResult, Row, Store};

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// Connections the pool keeps open while idle.
    pub min_idle: Option<u32>,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            min_idle: None,
        }
    }
}

impl DbRuntimeSettings {
    /// Derives settings from connection details.
    ///
    /// `pool` and `idle_pool` size the pool (zero keeps the default) and the
    /// `busy_timeout` option sets the busy timeout in milliseconds.
    pub fn from_details(details: &ConnectionDetails) -> Self {
        let defaults = Self::default();
        let pool_max_size = if is_memory(&details.database) {
            1
        } else if details.pool > 0 {
            details.pool
        } else {
            defaults.pool_max_size
        };
        let min_idle = (details.idle_pool > 0).then(|| details.idle_pool.min(pool_max_size));
        let busy_timeout_ms = details
            .option("busy_timeout")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.busy_timeout_ms);
        Self {
            busy_timeout_ms,
            pool_max_size,
            min_idle,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

type DbConn = PooledConnection<SqliteConnectionManager>;

// Every pooled connection to ":memory:" would otherwise be its own database.
fn is_memory(path: &str) -> bool {
    path == ":memory:" || path.contains("mode=memory")
}

/// Creates a new SQLite connection pool with WAL mode and foreign keys enabled.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. Use `:memory:` for an
///   in-memory database (useful for testing).
///
/// # Errors
///
/// Returns `DbError::Pool` if the connection pool cannot be created.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // In-memory databases report "memory", which is acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))
        });

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .min_idle(settings.min_idle)
        .build(manager)?;

    Ok(pool)
}

enum Handle {
    Pool(DbPool),
    Tx(Mutex<Option<DbConn>>),
}

/// [`Store`] over an `r2d2` pool of SQLite connections.
pub struct SqliteStore {
    handle: Handle,
}

impl SqliteStore {
    /// Opens a pool for `details.database`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Pool` if the pool cannot be built.
    pub fn open(details: &ConnectionDetails) -> Result<Self> {
        let settings = DbRuntimeSettings::from_details(details);
        tracing::debug!(
            database = %details.database,
            pool_max_size = settings.pool_max_size,
            "opening sqlite pool"
        );
        Ok(Self::from_pool(create_pool(&details.database, settings)?))
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: DbPool) -> Self {
        Self {
            handle: Handle::Pool(pool),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        match &self.handle {
            Handle::Pool(pool) => {
                let conn = pool.get()?;
                f(&conn)
            }
            Handle::Tx(slot) => {
                let guard = lock_slot(slot)?;
                let conn = guard
                    .as_ref()
                    .ok_or_else(|| DbError::custom("transaction has already been finished"))?;
                f(conn)
            }
        }
    }

    fn finish(&self, statement: &str) -> Result<()> {
        let Handle::Tx(slot) = &self.handle else {
            return Ok(());
        };
        let conn = lock_slot(slot)?
            .take()
            .ok_or_else(|| DbError::custom("transaction has already been finished"))?;
        if let Err(e) = conn.execute_batch(statement) {
            // The connection goes back to the pool; it must not stay mid-transaction.
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        Ok(())
    }
}

fn lock_slot(slot: &Mutex<Option<DbConn>>) -> Result<MutexGuard<'_, Option<DbConn>>> {
    slot.lock()
        .map_err(|_| DbError::custom("transaction handle lock poisoned"))
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Handle::Tx(slot) = &self.handle {
            if let Ok(mut guard) = slot.lock() {
                if let Some(conn) = guard.take() {
                    tracing::warn!("transaction dropped without commit or rollback, rolling back");
                    if let Err(e) = conn.execute_batch("ROLLBACK") {
                        tracing::error!(error = %e, "failed to roll back abandoned transaction");
                    }
                }
            }
        }
    }
}

fn to_sql_value(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Timestamp(t) => SqlValue::Text(t.to_rfc3339()),
        Value::List(_) => {
            return Err(DbError::Bind(
                "list arguments must be expanded into an IN (?) placeholder".to_string(),
            ))
        }
    })
}

fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn to_sql_values(args: &[Value]) -> Result<Vec<SqlValue>> {
    args.iter().map(to_sql_value).collect()
}

fn collect_rows(stmt: &mut rusqlite::Statement<'_>, limit: Option<usize>) -> Result<Vec<Row>> {
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(from_sql_ref(row.get_ref(i)?));
        }
        out.push(Row::new(columns.clone(), values));
        if limit.is_some_and(|n| out.len() >= n) {
            break;
        }
    }
    Ok(out)
}

fn bind_positional(stmt: &mut rusqlite::Statement<'_>, args: &[Value]) -> Result<()> {
    for (i, value) in to_sql_values(args)?.into_iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, value)?;
    }
    Ok(())
}

// Only names that appear in the statement are bound.
fn bind_named(stmt: &mut rusqlite::Statement<'_>, params: &[(&str, Value)]) -> Result<()> {
    for (name, value) in params {
        let key = if name.starts_with(':') {
            (*name).to_string()
        } else {
            format!(":{name}")
        };
        if let Some(index) = stmt.parameter_index(&key)? {
            stmt.raw_bind_parameter(index, to_sql_value(value)?)?;
        }
    }
    Ok(())
}

fn exec_result(conn: &rusqlite::Connection, changed: usize) -> ExecResult {
    let last = conn.last_insert_rowid();
    ExecResult {
        rows_affected: changed as u64,
        last_insert_id: (last != 0).then_some(last),
    }
}

impl Store for SqliteStore {
    fn query_row(&self, sql: &str, args: &[Value]) -> Result<Option<Row>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            bind_positional(&mut stmt, args)?;
            Ok(collect_rows(&mut stmt, Some(1))?.into_iter().next())
        })
    }

    fn select(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            bind_positional(&mut stmt, args)?;
            collect_rows(&mut stmt, None)
        })
    }

    fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            bind_positional(&mut stmt, args)?;
            let changed = stmt.raw_execute()?;
            Ok(exec_result(conn, changed))
        })
    }

    fn named_exec(&self, sql: &str, params: &[(&str, Value)]) -> Result<ExecResult> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            bind_named(&mut stmt, params)?;
            let changed = stmt.raw_execute()?;
            Ok(exec_result(conn, changed))
        })
    }

    fn named_query_row(&self, sql: &str, params: &[(&str, Value)]) -> Result<Option<Row>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            bind_named(&mut stmt, params)?;
            Ok(collect_rows(&mut stmt, Some(1))?.into_iter().next())
        })
    }

    fn exec_script(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    fn begin(self: Arc<Self>) -> Result<Arc<dyn Store>> {
        let conn = match &self.handle {
            Handle::Tx(_) => None,
            Handle::Pool(pool) => Some(pool.get()?),
        };
        let Some(conn) = conn else {
            return Ok(self);
        };
        conn.execute_batch("BEGIN")?;
        Ok(Arc::new(SqliteStore {
            handle: Handle::Tx(Mutex::new(Some(conn))),
        }))
    }

    fn commit(&self) -> Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(&self) -> Result<()> {
        self.finish("ROLLBACK")
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_transaction(&self) -> bool {
        matches!(self.handle, Handle::Tx(_))
    }
}
