//! Database access engine for Quarry.
//!
//! Normalizes connection details, generates dialect-specific SQL for MySQL,
//! PostgreSQL and SQLite, maps model types onto tables, builds and runs
//! queries, manages transactions and applies versioned migrations. SQLite is
//! served by a bundled `r2d2` pooled store; other dialects run against a
//! [`Store`] supplied through [`Connection::with_store`].
//!
//! # Design decisions
//!
//! - **Static model descriptors**: models list their columns through
//!   [`Model::columns`] instead of runtime reflection. Table names are
//!   derived once per type and cached in a shared [`TableNameCache`].
//! - **Dialects by composition**: [`CommonDialect`] supplies the defaults
//!   every [`Dialect`] method falls back to; family dialects override only
//!   what differs.
//! - **Flat transactions**: a transaction-bound [`Connection`] asked for a
//!   transaction joins the existing one. Only the scope that began it
//!   commits or rolls back.
//! - **One registry object**: dialect constructors and the table-name cache
//!   live in a [`Registry`] built once, with a lazily created default.

mod builder;
mod clause;
mod columns;
mod connection;
mod details;
pub mod dialect;
mod error;
mod executors;
mod migrations;
mod model;
mod pool;
mod query;
mod registry;
mod store;

pub use builder::QueryBuilder;
pub use clause::{Clause, Clauses, FromClause, GroupClause, HavingClause, JoinClause};
pub use columns::Columns;
pub use connection::Connection;
pub use details::{parse_duration, ConnectionDetails, MYSQL, POSTGRES, SQLITE3};
pub use dialect::{CommonDialect, Dialect, DialectFactory};
pub use error::{DbError, Result, ResultExt};
pub use executors::FindId;
pub use migrations::{
    generate_migration_files, Direction, Migration, MigrationAction, MigrationError, MigrationFn,
    MigrationStatus, Migrator,
};
pub use model::{tableize, Column, Hooks, Model, ModelMeta, TableNameCache, Validate};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, SqliteStore};
pub use query::{Paginator, Query};
pub use registry::{DialectRegistry, Registry};
pub use store::{ExecResult, Row, Store};

pub use quarry_types::{args, ValidationErrors, Value};
