//! Error types for the database engine.

use thiserror::Error;

/// Errors produced by connections, dialects, queries and executors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The dialect name is not in the registry.
    #[error("unsupported dialect '{0}'")]
    UnsupportedDialect(String),

    /// A connection URL could not be parsed.
    #[error("invalid connection url '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A required connection detail was not supplied.
    #[error("missing required connection detail '{0}'")]
    MissingField(&'static str),

    /// The dialect has no built-in driver and no store was supplied.
    #[error("no driver available for dialect '{0}'; supply a store with Connection::with_store")]
    DriverUnavailable(String),

    /// Failed to build or check out from the connection pool.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A SQLite driver call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A statement failed; carries the SQL that was sent.
    #[error("statement failed: {source} (sql: {sql})")]
    Statement {
        /// The statement text.
        sql: String,
        /// The underlying failure.
        source: Box<DbError>,
    },

    /// The connection has not been opened.
    #[error("connection is not open")]
    NotOpen,

    /// A single-row query returned nothing.
    #[error("no rows in result set")]
    NoRows,

    /// A lifecycle hook returned an error.
    #[error("{hook} hook failed: {source}")]
    Hook {
        /// Hook name, e.g. `before_create`.
        hook: &'static str,
        /// The error returned by the hook.
        source: Box<DbError>,
    },

    /// A row did not carry a column the model asked for.
    #[error("column '{0}' is not present in the result row")]
    MissingColumn(String),

    /// A column held a value of an unexpected type.
    #[error("column '{column}' holds {found}, expected {expected}")]
    ColumnType {
        /// Column name.
        column: String,
        /// Expected kind.
        expected: &'static str,
        /// Kind actually found.
        found: &'static str,
    },

    /// The dialect does not support the requested operation.
    #[error("{dialect} does not support {operation}")]
    Unsupported {
        /// Dialect name.
        dialect: &'static str,
        /// Operation name.
        operation: &'static str,
    },

    /// An argument could not be bound to a statement.
    #[error("cannot bind argument: {0}")]
    Bind(String),

    /// Application-level failure raised from a hook, validator or migration.
    #[error("{0}")]
    Custom(String),

    /// An error wrapped with operation context.
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted.
        context: String,
        /// The underlying failure.
        source: Box<DbError>,
    },
}

impl DbError {
    /// Builds a [`DbError::Custom`] from any message.
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Strips any [`DbError::Context`] and [`DbError::Statement`] layers.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Context { source, .. } | Self::Statement { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` if the underlying failure is SQLite reporting a busy or
    /// locked database.
    pub fn is_busy(&self) -> bool {
        match self.root() {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Adds operation context to errors.
pub trait ResultExt<T> {
    /// Wraps the error in [`DbError::Context`].
    fn context(self, context: impl Into<String>) -> Result<T, DbError>;

    /// Like [`ResultExt::context`] but builds the message lazily.
    fn with_context<F, S>(self, f: F) -> Result<T, DbError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<DbError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, DbError> {
        self.map_err(|e| DbError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T, DbError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| DbError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = DbError> = std::result::Result<T, E>;
