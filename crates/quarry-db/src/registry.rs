//! Process-wide registries.
//!
//! [`Registry`] bundles the dialect registry and the table-name cache. It is
//! built once; connections either share [`Registry::global`] or are handed
//! an explicit instance with [`crate::Connection::with_registry`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::details::{ConnectionDetails, MYSQL, POSTGRES, SQLITE3};
use crate::dialect::{Dialect, DialectFactory, MySql, Postgres, Sqlite};
use crate::error::{DbError, Result};
use crate::model::TableNameCache;

/// Name to constructor map for dialect families.
#[derive(Clone)]
pub struct DialectRegistry {
    factories: HashMap<String, DialectFactory>,
}

impl DialectRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry with the bundled dialects registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MYSQL, |d| -> Arc<dyn Dialect> { Arc::new(MySql::new(d)) });
        registry.register(POSTGRES, |d| -> Arc<dyn Dialect> { Arc::new(Postgres::new(d)) });
        registry.register(SQLITE3, |d| -> Arc<dyn Dialect> { Arc::new(Sqlite::new(d)) });
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: DialectFactory) {
        tracing::info!(dialect = name, "registering dialect");
        self.factories.insert(name.to_string(), factory);
    }

    /// Builds a fresh dialect instance bound to `details`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::UnsupportedDialect` for unknown names.
    pub fn new_dialect(&self, name: &str, details: ConnectionDetails) -> Result<Arc<dyn Dialect>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DbError::UnsupportedDialect(name.to_string()))?;
        Ok(factory(details))
    }

    /// Whether `name` is registered.
    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for DialectRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// The dialect registry and table-name cache shared by connections.
#[derive(Default)]
pub struct Registry {
    dialects: DialectRegistry,
    tables: TableNameCache,
}

impl Registry {
    /// Builds a registry from its parts.
    pub fn new(dialects: DialectRegistry, tables: TableNameCache) -> Self {
        Self { dialects, tables }
    }

    /// The lazily initialized default registry.
    pub fn global() -> &'static Arc<Registry> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Registry::default()))
    }

    /// Dialect constructors.
    pub fn dialects(&self) -> &DialectRegistry {
        &self.dialects
    }

    /// Resolved table names per model type.
    pub fn tables(&self) -> &TableNameCache {
        &self.tables
    }
}
