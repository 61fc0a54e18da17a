//! Connections and transactions.
//!
//! A [`Connection`] pairs finalized [`ConnectionDetails`] with the dialect
//! built for them and, once opened, a [`Store`]. Starting a transaction
//! returns a second `Connection` bound to the transaction store; statements
//! meant to run inside the transaction must go through that value.
//! Transactions do not nest: asking a transaction-bound connection for a
//! transaction hands back the same transaction.

use std::fmt;
use std::sync::Arc;

use quarry_types::Value;
use uuid::Uuid;

use crate::details::ConnectionDetails;
use crate::dialect::Dialect;
use crate::error::{DbError, Result, ResultExt};
use crate::query::Query;
use crate::registry::Registry;
use crate::store::Store;

/// A database connection: details, dialect and an optional open store.
#[derive(Clone)]
pub struct Connection {
    id: Uuid,
    details: Arc<ConnectionDetails>,
    dialect: Arc<dyn Dialect>,
    registry: Arc<Registry>,
    store: Option<Arc<dyn Store>>,
}

impl Connection {
    /// Finalizes `details` and builds the dialect from the global registry.
    /// The connection is not opened.
    ///
    /// # Errors
    ///
    /// Fails when the details are incomplete or name an unknown dialect.
    pub fn new(details: ConnectionDetails) -> Result<Self> {
        Self::with_registry(details, Arc::clone(Registry::global()))
    }

    /// Like [`Connection::new`] with an explicit registry.
    ///
    /// # Errors
    ///
    /// Fails when the details are incomplete or name an unknown dialect.
    pub fn with_registry(mut details: ConnectionDetails, registry: Arc<Registry>) -> Result<Self> {
        details.finalize()?;
        let dialect = registry
            .dialects()
            .new_dialect(&details.dialect, details.clone())?;
        let id = Uuid::new_v4();
        tracing::debug!(connection = %id, dialect = dialect.name(), "connection created");
        Ok(Self {
            id,
            details: Arc::new(details),
            dialect,
            registry,
            store: None,
        })
    }

    /// Uses an externally supplied store instead of opening one.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Unique identity of this connection value.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Finalized connection details.
    pub fn details(&self) -> &ConnectionDetails {
        &self.details
    }

    /// The dialect bound to these details.
    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// Registry used for dialects and table names.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Opens the store and verifies it answers. Opening an open connection
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be built or does not answer a ping.
    pub fn open(&mut self) -> Result<()> {
        if self.store.is_some() {
            return Ok(());
        }
        let store = self
            .dialect
            .open_store()
            .with_context(|| format!("could not open {} connection", self.dialect.name()))?;
        if let Err(e) = store.ping() {
            let _ = store.close();
            return Err(e).context("could not ping database");
        }
        tracing::info!(connection = %self.id, dialect = self.dialect.name(), "connection opened");
        self.store = Some(store);
        Ok(())
    }

    /// Releases the store. Closing a transaction-bound connection does
    /// nothing; the pooled connection owns the resources.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn close(&mut self) -> Result<()> {
        if self.in_transaction() {
            return Ok(());
        }
        if let Some(store) = self.store.take() {
            store.close().context("could not close connection")?;
            tracing::info!(connection = %self.id, "connection closed");
        }
        Ok(())
    }

    /// Whether a store is attached.
    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    /// Whether this connection is bound to a transaction.
    pub fn in_transaction(&self) -> bool {
        self.store.as_ref().is_some_and(|s| s.is_transaction())
    }

    /// The attached store.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotOpen` before [`Connection::open`].
    pub fn store(&self) -> Result<&dyn Store> {
        self.store.as_deref().ok_or(DbError::NotOpen)
    }

    /// Begins a transaction and returns a connection bound to it. A
    /// transaction-bound connection returns a copy of itself.
    ///
    /// # Errors
    ///
    /// Fails when the connection is not open or the store cannot begin.
    pub fn new_transaction(&self) -> Result<Connection> {
        if self.in_transaction() {
            return Ok(self.clone());
        }
        let store = self.store.clone().ok_or(DbError::NotOpen)?;
        let tx = store.begin().context("could not start new transaction")?;
        let id = Uuid::new_v4();
        tracing::debug!(connection = %self.id, transaction = %id, "transaction started");
        Ok(Connection {
            id,
            store: Some(tx),
            ..self.clone()
        })
    }

    /// Runs `f` inside a transaction under the dialect's lock.
    ///
    /// The transaction commits when `f` succeeds and rolls back when it
    /// fails. When called on a transaction-bound connection, `f` joins the
    /// outer transaction and neither commits nor rolls back.
    ///
    /// On SQLite a busy or locked database rolls the attempt back and runs
    /// `f` again in a fresh transaction, up to `retry_limit` times, so `f`
    /// may be called more than once and should not have side effects
    /// outside the database.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or from beginning or committing.
    pub fn transaction<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        let owns = !self.in_transaction();
        let mut output = None;
        self.dialect.lock(&mut || {
            let tx = self.new_transaction()?;
            match f(&tx) {
                Ok(value) => {
                    if owns {
                        tx.store()?.commit().context("could not commit transaction")?;
                        tracing::debug!(transaction = %tx.id, "transaction committed");
                    }
                    output = Some(value);
                    Ok(())
                }
                Err(e) => {
                    if owns {
                        if let Err(rollback) = tx.store().and_then(|s| s.rollback()) {
                            tracing::warn!(error = %rollback, "could not roll back transaction");
                        } else {
                            tracing::debug!(
                                transaction = %tx.id,
                                error = %e,
                                "transaction rolled back"
                            );
                        }
                    }
                    Err(e)
                }
            }
        })?;
        output.ok_or_else(|| DbError::custom("transaction finished without a result"))
    }

    /// Starts a query.
    pub fn query(&self) -> Query<'_> {
        Query::new(self)
    }

    /// Starts a query whose statement is `sql`.
    pub fn raw(&self, sql: impl Into<String>, args: Vec<Value>) -> Query<'_> {
        Query::new(self).raw(sql, args)
    }

    /// Whether `table` exists.
    ///
    /// # Errors
    ///
    /// Fails when the connection is not open or the query fails.
    pub fn has_table(&self, table: &str) -> Result<bool> {
        self.dialect.has_table(self.store()?, table)
    }

    /// Whether `table` has `column`.
    ///
    /// # Errors
    ///
    /// Fails when the connection is not open or the query fails.
    pub fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        self.dialect.has_column(self.store()?, table, column)
    }

    /// Whether `table` has index `index`.
    ///
    /// # Errors
    ///
    /// Fails when the connection is not open or the query fails.
    pub fn has_index(&self, table: &str, index: &str) -> Result<bool> {
        self.dialect.has_index(self.store()?, table, index)
    }

    /// Whether `table` has foreign key `name`.
    ///
    /// # Errors
    ///
    /// Fails when the connection is not open or the query fails.
    pub fn has_foreign_key(&self, table: &str, name: &str) -> Result<bool> {
        self.dialect.has_foreign_key(self.store()?, table, name)
    }

    /// Name of the connected database.
    ///
    /// # Errors
    ///
    /// Fails when the connection is not open or the query fails.
    pub fn current_database(&self) -> Result<String> {
        self.dialect.current_database(self.store()?)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("dialect", &self.dialect.name())
            .field("database", &self.details.database)
            .field("open", &self.is_open())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::RecordingStore;

    fn recorded() -> (Connection, Arc<RecordingStore>) {
        let store = RecordingStore::new();
        let conn = Connection::new(ConnectionDetails::from_url("postgres://u:p@db/shop"))
            .expect("connection")
            .with_store(store.clone());
        (conn, store)
    }

    fn sql_log(store: &RecordingStore) -> Vec<String> {
        store.calls().into_iter().map(|c| c.sql).collect()
    }

    // ── lifecycle ──

    #[test]
    fn open_is_idempotent_and_close_releases() {
        let mut conn = Connection::new(ConnectionDetails::sqlite(":memory:")).expect("connection");
        assert!(!conn.is_open());
        assert!(matches!(conn.store(), Err(DbError::NotOpen)));
        conn.open().expect("open");
        conn.open().expect("open again");
        assert!(conn.is_open());
        assert_eq!(conn.current_database().expect("database"), "main");
        conn.close().expect("close");
        assert!(!conn.is_open());
    }

    #[test]
    fn unknown_dialect_is_rejected() {
        let details = ConnectionDetails {
            dialect: "oracle".into(),
            database: "x".into(),
            ..ConnectionDetails::default()
        };
        assert!(matches!(
            Connection::new(details),
            Err(DbError::UnsupportedDialect(name)) if name == "oracle"
        ));
    }

    #[test]
    fn drivers_without_store_fail_to_open() {
        let mut conn = Connection::new(ConnectionDetails::from_url("mysql://u:p@db/shop"))
            .expect("connection");
        let err = conn.open().expect_err("should have no driver");
        assert!(matches!(err.root(), DbError::DriverUnavailable(_)));
    }

    // ── transactions ──

    #[test]
    fn new_transaction_returns_bound_connection() {
        let (conn, store) = recorded();
        let tx = conn.new_transaction().expect("tx");
        assert!(tx.in_transaction());
        assert!(!conn.in_transaction());
        assert_ne!(tx.id(), conn.id());

        let inner = tx.new_transaction().expect("inner");
        assert_eq!(inner.id(), tx.id());
        assert_eq!(sql_log(&store), vec!["BEGIN"]);
    }

    #[test]
    fn transaction_commits_on_success() {
        let (conn, store) = recorded();
        let n = conn
            .transaction(|tx| {
                tx.store()?.exec("UPDATE a SET b = 1", &[])?;
                Ok(7)
            })
            .expect("transaction");
        assert_eq!(n, 7);
        assert_eq!(sql_log(&store), vec!["BEGIN", "UPDATE a SET b = 1", "COMMIT"]);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let (conn, store) = recorded();
        let err = conn
            .transaction(|_tx| -> Result<()> { Err(DbError::custom("boom")) })
            .expect_err("should fail");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(sql_log(&store), vec!["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn nested_transaction_joins_outer() {
        let (conn, store) = recorded();
        conn.transaction(|tx| {
            let inner = tx.transaction(|inner| {
                assert_eq!(inner.id(), tx.id());
                Ok(1)
            })?;
            let failed = tx.transaction(|_| -> Result<()> { Err(DbError::custom("inner")) });
            assert!(failed.is_err());
            Ok(inner)
        })
        .expect("outer");
        assert_eq!(sql_log(&store), vec!["BEGIN", "COMMIT"]);
    }

    #[test]
    fn busy_sqlite_reruns_the_unit() {
        let store = RecordingStore::new();
        let mut details = ConnectionDetails::sqlite(":memory:");
        details.options.insert("retry_limit".into(), "3".into());
        details.options.insert("retry_sleep".into(), "0".into());
        let conn = Connection::new(details)
            .expect("connection")
            .with_store(store.clone());

        let mut runs = 0;
        let value = conn
            .transaction(|_tx| {
                runs += 1;
                if runs == 1 {
                    return Err(DbError::Sqlite(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                        None,
                    )));
                }
                Ok(runs)
            })
            .expect("second attempt should commit");

        assert_eq!(value, 2);
        assert_eq!(
            sql_log(&store),
            vec!["BEGIN", "ROLLBACK", "BEGIN", "COMMIT"]
        );
    }

    #[test]
    fn close_is_noop_inside_transaction() {
        let (conn, _store) = recorded();
        let mut tx = conn.new_transaction().expect("tx");
        tx.close().expect("close");
        assert!(tx.is_open());
    }
}
