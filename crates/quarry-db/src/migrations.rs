//! Versioned schema migrations.
//!
//! Migrations come in `up`/`down` pairs keyed by a numeric version and are
//! tracked in a table holding one row per applied version (by default
//! `schema_migration`). Every public operation creates the tracking table
//! first if it is missing.
//!
//! Migration files follow `<version>_<name>[.<dialect>].<up|down>.<ext>`.
//! A file tagged with a dialect is only used on connections of that
//! dialect, and wins over an untagged file with the same version.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use heck::ToSnakeCase;
use quarry_types::Value;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::connection::Connection;
use crate::error::DbError;

static MIGRATION_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)_([^.]+)(\.[a-z0-9]+)?\.(up|down)\.([a-z]+)$").expect("valid regex")
});

/// Errors that can occur while discovering or running migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The tracking table could not be created.
    #[error("problem creating schema migrations: {0}")]
    Bootstrap(#[source] DbError),

    /// Failed to query migration state.
    #[error("problem checking for migration version {version}: {source}")]
    StateQuery {
        /// Version being checked, or `*` for the applied count.
        version: String,
        /// The underlying failure.
        source: DbError,
    },

    /// A migration or its tracking statement failed.
    #[error("migration '{version}_{name}' failed: {source}")]
    ExecutionFailed {
        /// Version of the failed migration.
        version: String,
        /// Name of the failed migration.
        name: String,
        /// The underlying failure.
        source: DbError,
    },

    /// A down migration targeted a version that is not applied.
    #[error("migration version {version} is not applied")]
    NotApplied {
        /// The version.
        version: String,
    },

    /// The migration directory could not be read or written.
    #[error("migration files: {0}")]
    Discovery(#[from] io::Error),
}

/// Which way a migration moves the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// Code run by a function migration.
pub type MigrationFn = Arc<dyn Fn(&Connection) -> Result<(), DbError> + Send + Sync>;

/// What a migration does when run.
#[derive(Clone)]
pub enum MigrationAction {
    /// A SQL script, possibly several statements.
    Sql(String),
    /// Arbitrary code against the connection.
    Func(MigrationFn),
}

impl fmt::Debug for MigrationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// One direction of one migration version.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub direction: Direction,
    /// Dialect the migration is restricted to, if any.
    pub dialect: Option<String>,
    /// File extension, e.g. `sql`.
    pub extension: String,
    pub action: MigrationAction,
}

impl Migration {
    /// A SQL migration.
    pub fn sql(
        version: impl Into<String>,
        name: impl Into<String>,
        direction: Direction,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            direction,
            dialect: None,
            extension: "sql".to_string(),
            action: MigrationAction::Sql(sql.into()),
        }
    }

    /// A function migration.
    pub fn func(
        version: impl Into<String>,
        name: impl Into<String>,
        direction: Direction,
        f: impl Fn(&Connection) -> Result<(), DbError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            direction,
            dialect: None,
            extension: String::new(),
            action: MigrationAction::Func(Arc::new(f)),
        }
    }

    /// Runs the migration body.
    ///
    /// # Errors
    ///
    /// Propagates statement or function failures.
    pub fn run(&self, conn: &Connection) -> Result<(), DbError> {
        match &self.action {
            MigrationAction::Sql(sql) if sql.trim().is_empty() => Ok(()),
            MigrationAction::Sql(sql) => {
                tracing::debug!(sql = %sql, version = %self.version, "running migration script");
                conn.store()?.exec_script(sql)
            }
            MigrationAction::Func(f) => f(conn),
        }
    }

    // Versions are fixed-width timestamps, so string order is time order.
    fn sort_key(&self) -> &str {
        self.version.as_str()
    }
}

/// Applied state of one up migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: String,
    pub name: String,
    pub applied: bool,
}

/// Runs migrations against a connection.
pub struct Migrator<'c> {
    conn: &'c Connection,
    migrations: Vec<Migration>,
}

impl<'c> Migrator<'c> {
    /// A migrator with no migrations.
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            migrations: Vec::new(),
        }
    }

    /// A migrator loaded with the migration files in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Discovery` if the directory or a file cannot
    /// be read.
    pub fn from_dir(conn: &'c Connection, dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let mut migrator = Self::new(conn);
        for migration in discover(dir.as_ref(), conn.dialect().name())? {
            migrator.add(migration);
        }
        Ok(migrator)
    }

    /// Adds a migration.
    pub fn add(&mut self, migration: Migration) {
        self.migrations.push(migration);
    }

    /// Registered migrations.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    fn table(&self) -> String {
        self.conn.details().migration_table_name()
    }

    fn sorted(&self, direction: Direction) -> Vec<&Migration> {
        let mut list: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.direction == direction)
            .collect();
        list.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        list
    }

    /// Creates the tracking table unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Bootstrap` if the check or the DDL fails.
    pub fn create_schema_migrations(&self) -> Result<(), MigrationError> {
        let table = self.table();
        if self
            .conn
            .has_table(&table)
            .map_err(MigrationError::Bootstrap)?
        {
            return Ok(());
        }
        tracing::info!(table = %table, "creating migration table");
        let ddl = self.conn.dialect().create_migration_table_sql(&table);
        self.conn
            .store()
            .and_then(|s| s.exec_script(&ddl))
            .map_err(MigrationError::Bootstrap)
    }

    fn is_applied(&self, version: &str) -> Result<bool, MigrationError> {
        let sql = self.conn.dialect().translate_sql(&format!(
            "SELECT COUNT(*) AS row_count FROM {} WHERE version = ?",
            self.table()
        ));
        self.conn
            .select_one(&sql, &[Value::from(version)])
            .and_then(|row| row.get_i64("row_count"))
            .map(|n| n > 0)
            .map_err(|source| MigrationError::StateQuery {
                version: version.to_string(),
                source,
            })
    }

    fn applied_count(&self) -> Result<usize, MigrationError> {
        let sql = format!("SELECT COUNT(*) AS row_count FROM {}", self.table());
        self.conn
            .select_one(&sql, &[])
            .and_then(|row| row.get_i64("row_count"))
            .map(|n| usize::try_from(n).unwrap_or(0))
            .map_err(|source| MigrationError::StateQuery {
                version: "*".to_string(),
                source,
            })
    }

    fn timed<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce() -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        let started = Instant::now();
        self.create_schema_migrations()?;
        let result = f();
        tracing::info!(
            operation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "migrations finished"
        );
        result
    }

    /// Applies pending up migrations in ascending version order, stopping at
    /// the first failure. Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns the first state-query or execution failure.
    pub fn up(&self) -> Result<usize, MigrationError> {
        self.timed("up", || {
            let insert = self.conn.dialect().translate_sql(&format!(
                "INSERT INTO {} (version, name) VALUES (?, ?)",
                self.table()
            ));
            let mut applied = 0;
            for migration in self.sorted(Direction::Up) {
                if self.is_applied(&migration.version)? {
                    continue;
                }
                let failed = |source| MigrationError::ExecutionFailed {
                    version: migration.version.clone(),
                    name: migration.name.clone(),
                    source,
                };
                migration.run(self.conn).map_err(failed)?;
                self.conn
                    .exec_sql(
                        &insert,
                        &[
                            Value::from(&migration.version),
                            Value::from(&migration.name),
                        ],
                    )
                    .map_err(|source| MigrationError::ExecutionFailed {
                        version: migration.version.clone(),
                        name: migration.name.clone(),
                        source,
                    })?;
                tracing::info!(
                    version = %migration.version,
                    name = %migration.name,
                    "> applied migration"
                );
                applied += 1;
            }
            Ok(applied)
        })
    }

    /// Reverts up to `step` applied migrations, newest first. A step of zero
    /// or less reverts everything applied. Returns how many were reverted.
    ///
    /// # Errors
    ///
    /// Fails with `MigrationError::NotApplied` when a targeted version is
    /// not applied, or with the first execution failure.
    pub fn down(&self, step: i64) -> Result<usize, MigrationError> {
        self.timed("down", || {
            let count = self.applied_count()?;
            let mut targets = self.sorted(Direction::Down);
            targets.reverse();
            if targets.len() > count {
                targets = targets.split_off(targets.len() - count);
            }
            if let Ok(step) = usize::try_from(step) {
                if step > 0 {
                    targets.truncate(step);
                }
            }

            let delete = self.conn.dialect().translate_sql(&format!(
                "DELETE FROM {} WHERE version = ?",
                self.table()
            ));
            let mut reverted = 0;
            for migration in targets {
                if !self.is_applied(&migration.version)? {
                    return Err(MigrationError::NotApplied {
                        version: migration.version.clone(),
                    });
                }
                let failed = |source| MigrationError::ExecutionFailed {
                    version: migration.version.clone(),
                    name: migration.name.clone(),
                    source,
                };
                migration.run(self.conn).map_err(failed)?;
                self.conn
                    .exec_sql(&delete, &[Value::from(&migration.version)])
                    .map_err(|source| MigrationError::ExecutionFailed {
                        version: migration.version.clone(),
                        name: migration.name.clone(),
                        source,
                    })?;
                tracing::info!(
                    version = %migration.version,
                    name = %migration.name,
                    "< reverted migration"
                );
                reverted += 1;
            }
            Ok(reverted)
        })
    }

    /// Applied or pending state of every up migration, by version.
    ///
    /// # Errors
    ///
    /// Returns the first state-query failure.
    pub fn status(&self) -> Result<Vec<MigrationStatus>, MigrationError> {
        self.timed("status", || {
            self.sorted(Direction::Up)
                .into_iter()
                .map(|m| -> Result<MigrationStatus, MigrationError> {
                    Ok(MigrationStatus {
                        version: m.version.clone(),
                        name: m.name.clone(),
                        applied: self.is_applied(&m.version)?,
                    })
                })
                .collect()
        })
    }

    /// Reverts everything applied, then applies every up migration. Returns
    /// how many were applied.
    ///
    /// # Errors
    ///
    /// See [`Migrator::down`] and [`Migrator::up`].
    pub fn reset(&self) -> Result<usize, MigrationError> {
        self.down(-1)?;
        self.up()
    }
}

fn canonical_dialect(name: &str) -> &str {
    match name {
        "sqlite" => "sqlite3",
        "postgresql" | "pg" => "postgres",
        other => other,
    }
}

/// Reads migration files from `dir` for a connection of dialect `dialect`.
fn discover(dir: &Path, dialect: &str) -> Result<Vec<Migration>, MigrationError> {
    let mut chosen: BTreeMap<(String, Direction), Migration> = BTreeMap::new();
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    paths.sort();

    for path in paths {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(caps) = MIGRATION_FILE.captures(file_name) else {
            tracing::debug!(file = file_name, "not a migration file, skipping");
            continue;
        };
        let tagged = caps
            .get(3)
            .map(|m| canonical_dialect(m.as_str().trim_start_matches('.')).to_string());
        if tagged.as_deref().is_some_and(|d| d != dialect) {
            tracing::debug!(file = file_name, "migration is for another dialect, skipping");
            continue;
        }
        let extension = caps[5].to_string();
        if extension != "sql" {
            tracing::warn!(file = file_name, "unsupported migration type, skipping");
            continue;
        }
        let direction = if &caps[4] == "up" {
            Direction::Up
        } else {
            Direction::Down
        };
        let migration = Migration {
            version: caps[1].to_string(),
            name: caps[2].to_string(),
            direction,
            dialect: tagged,
            extension,
            action: MigrationAction::Sql(fs::read_to_string(&path)?),
        };
        let key = (migration.version.clone(), direction);
        match chosen.get(&key) {
            Some(existing) if existing.dialect.is_some() => {}
            _ => {
                chosen.insert(key, migration);
            }
        }
    }
    Ok(chosen.into_values().collect())
}

/// Writes an empty `up`/`down` pair for a new migration named after `now`
/// (`YYYYMMDDHHMMSS`) and returns their paths. Existing files are never
/// overwritten.
///
/// # Errors
///
/// Returns `MigrationError::Discovery` on I/O failure, including when a
/// file with the same name exists.
pub fn generate_migration_files(
    dir: impl AsRef<Path>,
    name: &str,
    ext: &str,
    now: DateTime<Utc>,
) -> Result<(PathBuf, PathBuf), MigrationError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let base = format!("{}_{}", now.format("%Y%m%d%H%M%S"), name.to_snake_case());
    let up = dir.join(format!("{base}.up.{ext}"));
    let down = dir.join(format!("{base}.down.{ext}"));
    for path in [&up, &down] {
        fs::OpenOptions::new().write(true).create_new(true).open(path)?;
        tracing::info!(path = %path.display(), "created migration file");
    }
    Ok((up, down))
}
