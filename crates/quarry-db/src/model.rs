//! Model layer: mapping application types to tables and columns.
//!
//! Persisted types implement [`Model`] with a static column descriptor list
//! instead of relying on runtime inspection. Table names are resolved once
//! per type and cached in a [`TableNameCache`]; lifecycle hooks and
//! validation come from the [`Hooks`] and [`Validate`] supertraits, whose
//! methods all default to doing nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use heck::ToSnakeCase;
use quarry_types::{ValidationErrors, Value};

use crate::columns::Columns;
use crate::connection::Connection;
use crate::error::Result;
use crate::store::Row;

/// One persisted field: the struct field and its column tag.
///
/// A field is persisted only when its tag is non-empty and not `"-"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Rust field name.
    pub field: &'static str,
    /// Column name, or `""`/`"-"` to skip the field.
    pub tag: &'static str,
}

impl Column {
    /// Describes a field persisted under `tag`.
    pub const fn new(field: &'static str, tag: &'static str) -> Self {
        Self { field, tag }
    }

    /// Whether the field maps to a column.
    pub fn is_persisted(&self) -> bool {
        !self.tag.is_empty() && self.tag != "-"
    }
}

/// Lifecycle hooks run around the write executors.
///
/// A failing `before_*` hook aborts the operation before any statement is
/// sent. A failing `after_*` hook is reported even though the statement has
/// already run.
#[allow(unused_variables)]
pub trait Hooks {
    /// Runs before the `INSERT`.
    ///
    /// # Errors
    ///
    /// Any error aborts the create.
    fn before_create(&mut self, conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Runs after the `INSERT`.
    ///
    /// # Errors
    ///
    /// Any error is returned to the caller.
    fn after_create(&mut self, conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Runs before the `UPDATE`.
    ///
    /// # Errors
    ///
    /// Any error aborts the update.
    fn before_update(&mut self, conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Runs after the `UPDATE`.
    ///
    /// # Errors
    ///
    /// Any error is returned to the caller.
    fn after_update(&mut self, conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Runs before the `DELETE`.
    ///
    /// # Errors
    ///
    /// Any error aborts the delete.
    fn before_delete(&mut self, conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Runs after the `DELETE`.
    ///
    /// # Errors
    ///
    /// Any error is returned to the caller.
    fn after_delete(&mut self, conn: &Connection) -> Result<()> {
        Ok(())
    }
}

/// Validation consulted by the `validate_and_*` executors.
#[allow(unused_variables)]
pub trait Validate {
    /// Prepares the value for validation, e.g. normalizing fields.
    ///
    /// # Errors
    ///
    /// Any error aborts the operation.
    fn before_validate(&mut self, conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Checks that apply to every write.
    ///
    /// # Errors
    ///
    /// Errors mean the checks could not run, not that they failed.
    fn validate(&self, conn: &Connection) -> Result<ValidationErrors> {
        Ok(ValidationErrors::new())
    }

    /// Checks specific to inserts.
    ///
    /// # Errors
    ///
    /// Errors mean the checks could not run.
    fn validate_create(&self, conn: &Connection) -> Result<ValidationErrors> {
        Ok(ValidationErrors::new())
    }

    /// Checks specific to updates.
    ///
    /// # Errors
    ///
    /// Errors mean the checks could not run.
    fn validate_update(&self, conn: &Connection) -> Result<ValidationErrors> {
        Ok(ValidationErrors::new())
    }

    /// Checks specific to deletes.
    ///
    /// # Errors
    ///
    /// Errors mean the checks could not run.
    fn validate_delete(&self, conn: &Connection) -> Result<ValidationErrors> {
        Ok(ValidationErrors::new())
    }
}

/// A type persisted to one table.
pub trait Model: Hooks + Validate + Sized {
    /// Static description of the persisted fields.
    fn columns() -> &'static [Column];

    /// Explicit table name. When `None` the name is derived from the type.
    fn table_name() -> Option<&'static str> {
        None
    }

    /// Short type name used to derive the table name.
    fn type_name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Primary key value. Types without an `id` return `Value::Null`.
    fn id(&self) -> Value {
        Value::Null
    }

    /// Stores a driver-assigned primary key.
    fn set_id(&mut self, _id: Value) {}

    /// Column tag to value pairs for every persisted field.
    fn values(&self) -> Vec<(&'static str, Value)>;

    /// Builds a value from a result row.
    ///
    /// # Errors
    ///
    /// Fails when a column is missing or has the wrong type.
    fn from_row(row: &Row) -> Result<Self>;

    /// Sets a `created_at` field, if the type has one.
    fn touch_created_at(&mut self, _now: DateTime<Utc>) {}

    /// Sets an `updated_at` field, if the type has one.
    fn touch_updated_at(&mut self, _now: DateTime<Utc>) {}
}

/// Strips the module path and generic arguments from a type path.
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

type Inflector = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Process-wide map from model type to resolved table name.
///
/// Reads take a shared lock; the first resolution for a type takes the
/// exclusive lock once to store the result.
pub struct TableNameCache {
    names: RwLock<HashMap<&'static str, String>>,
    inflector: Inflector,
}

impl TableNameCache {
    /// A cache deriving names with [`tableize`].
    pub fn new() -> Self {
        Self::with_inflector(tableize)
    }

    /// A cache deriving names with a custom function.
    pub fn with_inflector(inflector: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            names: RwLock::new(HashMap::new()),
            inflector: Box::new(inflector),
        }
    }

    /// Table name for `M`: its explicit name, else the cached or freshly
    /// derived one.
    pub fn resolve<M: Model>(&self) -> String {
        if let Some(name) = M::table_name() {
            return name.to_string();
        }
        self.resolve_key(std::any::type_name::<M>(), M::type_name())
    }

    fn resolve_key(&self, key: &'static str, type_name: &str) -> String {
        if let Some(name) = self
            .names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return name.clone();
        }
        let derived = (self.inflector)(type_name);
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(derived)
            .clone()
    }

    /// Number of cached types.
    pub fn len(&self) -> usize {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TableNameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TableNameCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableNameCache")
            .field("cached", &self.len())
            .finish_non_exhaustive()
    }
}

/// Converts a type name to a plural snake_case table name:
/// `UserProfile` becomes `user_profiles`, `Person` becomes `people`.
pub fn tableize(type_name: &str) -> String {
    let snake = type_name.to_snake_case();
    match snake.rsplit_once('_') {
        Some((head, last)) => format!("{head}_{}", pluralize(last)),
        None => pluralize(&snake),
    }
}

const IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("man", "men"),
    ("woman", "women"),
    ("child", "children"),
    ("mouse", "mice"),
    ("goose", "geese"),
    ("foot", "feet"),
    ("tooth", "teeth"),
    ("ox", "oxen"),
];

const UNCOUNTABLE: &[&str] = &[
    "equipment",
    "information",
    "rice",
    "money",
    "species",
    "series",
    "fish",
    "sheep",
    "news",
    "data",
];

fn pluralize(word: &str) -> String {
    if word.is_empty() || UNCOUNTABLE.contains(&word) {
        return word.to_string();
    }
    if let Some((_, plural)) = IRREGULAR.iter().find(|(single, _)| *single == word) {
        return (*plural).to_string();
    }
    if ["s", "x", "z", "ch", "sh"].iter().any(|s| word.ends_with(s)) {
        return format!("{word}es");
    }
    if let Some(stem) = word.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{stem}ies");
        }
    }
    format!("{word}s")
}

/// Per-operation view of a model: table, alias and persisted columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMeta {
    table_name: String,
    alias: Option<String>,
    columns: Vec<&'static str>,
}

impl ModelMeta {
    /// Metadata for model type `M`, resolving its table name through `cache`.
    pub fn for_model<M: Model>(cache: &TableNameCache) -> Self {
        Self {
            table_name: cache.resolve::<M>(),
            alias: None,
            columns: M::columns()
                .iter()
                .filter(|c| c.is_persisted())
                .map(|c| c.tag)
                .collect(),
        }
    }

    /// Metadata for a table known only by name. Selects `alias.*`.
    pub fn for_table(name: impl Into<String>) -> Self {
        Self {
            table_name: name.into(),
            alias: None,
            columns: Vec::new(),
        }
    }

    /// Overrides the alias used in `FROM` and column qualification.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Explicit alias, or the table name with `.` replaced by `_`.
    pub fn alias(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.table_name.replace('.', "_"))
    }

    /// Persisted column names in declaration order.
    pub fn column_names(&self) -> &[&'static str] {
        &self.columns
    }

    /// Persisted columns qualified by the alias; `alias.*` for a table
    /// known only by name.
    pub fn columns(&self) -> Columns {
        let mut cols = Columns::new(self.alias());
        if self.columns.is_empty() {
            cols.add(["*"]);
        } else {
            cols.add(self.columns.iter());
        }
        cols
    }

    /// Equality fragment selecting `id`: numeric ids render bare, anything
    /// else as a quoted string.
    pub fn where_id(&self, id: &Value) -> String {
        match id {
            Value::Int(i) => format!("{}.id = {i}", self.table_name),
            other => format!(
                "{}.id = '{}'",
                self.table_name,
                other.to_string().replace('\'', "''")
            ),
        }
    }
}
