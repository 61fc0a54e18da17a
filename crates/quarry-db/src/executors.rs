//! Statement execution: the write verbs on [`Connection`] and the read verbs
//! on [`Query`].
//!
//! Every statement is logged at debug level before it is sent. Driver
//! failures are wrapped in `DbError::Statement` carrying the SQL.

use std::sync::LazyLock;

use chrono::Utc;
use quarry_types::{ValidationErrors, Value};
use regex::Regex;
use uuid::Uuid;

use crate::columns::Columns;
use crate::connection::Connection;
use crate::error::{DbError, Result, ResultExt};
use crate::model::{Model, ModelMeta};
use crate::query::Query;
use crate::store::{ExecResult, Row};

static TRAILING_LIMIT_OFFSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(limit [0-9]+ offset [0-9]+)$").expect("valid regex"));
static TRAILING_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(limit [0-9]+)$").expect("valid regex"));

fn statement_error(sql: &str) -> impl FnOnce(DbError) -> DbError + '_ {
    move |source| DbError::Statement {
        sql: sql.to_string(),
        source: Box::new(source),
    }
}

fn hook_error(hook: &'static str) -> impl FnOnce(DbError) -> DbError {
    move |source| DbError::Hook {
        hook,
        source: Box::new(source),
    }
}

/// Keeps the values whose column survived into `columns`.
fn written(
    values: Vec<(&'static str, Value)>,
    columns: &Columns,
) -> Vec<(&'static str, Value)> {
    values
        .into_iter()
        .filter(|(col, _)| columns.contains(col))
        .collect()
}

// ── statement plumbing ──

impl Connection {
    /// Table metadata for model type `M`.
    pub fn meta<M: Model>(&self) -> ModelMeta {
        ModelMeta::for_model::<M>(self.registry().tables())
    }

    pub(crate) fn select_rows(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        tracing::debug!(sql, ?args, "select");
        self.store()?.select(sql, args).map_err(statement_error(sql))
    }

    pub(crate) fn select_one(&self, sql: &str, args: &[Value]) -> Result<Row> {
        tracing::debug!(sql, ?args, "select one");
        self.store()?
            .query_row(sql, args)
            .map_err(statement_error(sql))?
            .ok_or(DbError::NoRows)
    }

    pub(crate) fn exec_sql(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        tracing::debug!(sql, ?args, "exec");
        self.store()?.exec(sql, args).map_err(statement_error(sql))
    }

    fn exec_named(&self, sql: &str, params: &[(&str, Value)]) -> Result<ExecResult> {
        tracing::debug!(sql, ?params, "exec");
        self.store()?
            .named_exec(sql, params)
            .map_err(statement_error(sql))
    }

    fn query_named(&self, sql: &str, params: &[(&str, Value)]) -> Result<Option<Row>> {
        tracing::debug!(sql, ?params, "query");
        self.store()?
            .named_query_row(sql, params)
            .map_err(statement_error(sql))
    }
}

// ── write verbs ──

impl Connection {
    /// Inserts `model`, storing the generated id back into it.
    ///
    /// A zero integer id is left to the database; an empty string id is
    /// replaced by a new UUID. Columns named in `excludes` are not written.
    ///
    /// # Errors
    ///
    /// Fails when a hook fails or the statement fails. A failing
    /// `after_create` hook is reported after the row was written.
    pub fn create<M: Model>(&self, model: &mut M, excludes: &[&str]) -> Result<()> {
        let meta = self.meta::<M>();
        self.dialect().lock(&mut || {
            model.before_create(self).map_err(hook_error("before_create"))?;

            let now = Utc::now();
            model.touch_created_at(now);
            model.touch_updated_at(now);

            let id = model.id();
            let generated_by_db = matches!(id, Value::Int(0) | Value::Null);
            if matches!(&id, Value::Text(s) if s.is_empty()) {
                model.set_id(Value::Text(Uuid::new_v4().to_string()));
            }

            let values = model.values();
            let mut columns = Columns::new("");
            columns.add(values.iter().map(|(col, _)| *col));
            columns.remove(excludes);
            if generated_by_db {
                columns.remove(["id"]);
            }
            let params = written(values, &columns);

            let dialect = self.dialect();
            let suffix = dialect.last_insert_id_returning_suffix(meta.table_name(), "id");
            let sql = format!("{}{suffix}", dialect.create_stmt(meta.table_name(), &columns));

            if suffix.is_empty() {
                let result = self.exec_named(&sql, &params)?;
                if generated_by_db {
                    if let Some(new_id) = result.last_insert_id {
                        model.set_id(Value::Int(new_id));
                    }
                }
            } else {
                let row = self.query_named(&sql, &params)?.ok_or(DbError::NoRows)?;
                if let Some(new_id) = row.value(0) {
                    model.set_id(new_id.clone());
                }
            }

            model.after_create(self).map_err(hook_error("after_create"))
        })
    }

    /// Updates `model` by id. `id`, `created_at` and `excludes` are never
    /// written.
    ///
    /// # Errors
    ///
    /// Fails when a hook fails or the statement fails.
    pub fn update<M: Model>(&self, model: &mut M, excludes: &[&str]) -> Result<()> {
        let meta = self.meta::<M>();
        self.dialect().lock(&mut || {
            model.before_update(self).map_err(hook_error("before_update"))?;
            model.touch_updated_at(Utc::now());

            let values = model.values();
            let mut columns = Columns::new("");
            columns.add(values.iter().map(|(col, _)| *col));
            columns.remove(["id", "created_at"]);
            columns.remove(excludes);
            let params = written(values, &columns);
            let sql = self.dialect().update_stmt(
                meta.table_name(),
                &columns,
                &meta.where_id(&model.id()),
            );
            self.exec_named(&sql, &params)?;

            model.after_update(self).map_err(hook_error("after_update"))
        })
    }

    /// Deletes `model` by id.
    ///
    /// # Errors
    ///
    /// Fails when a hook fails or the statement fails.
    pub fn delete<M: Model>(&self, model: &mut M) -> Result<()> {
        let meta = self.meta::<M>();
        self.dialect().lock(&mut || {
            model.before_delete(self).map_err(hook_error("before_delete"))?;
            let sql = self
                .dialect()
                .delete_stmt(meta.table_name(), &meta.where_id(&model.id()));
            self.exec_sql(&sql, &[])?;
            model.after_delete(self).map_err(hook_error("after_delete"))
        })
    }

    /// Creates `model` when its id is zero, otherwise updates it.
    ///
    /// # Errors
    ///
    /// See [`Connection::create`] and [`Connection::update`].
    pub fn save<M: Model>(&self, model: &mut M, excludes: &[&str]) -> Result<()> {
        if model.id().is_zero() {
            self.create(model, excludes)
        } else {
            self.update(model, excludes)
        }
    }

    fn run_validations<M: Model>(
        &self,
        model: &mut M,
        specific: fn(&M, &Connection) -> Result<ValidationErrors>,
    ) -> Result<ValidationErrors> {
        model
            .before_validate(self)
            .map_err(hook_error("before_validate"))?;
        let mut errors = model.validate(self)?;
        errors.append(specific(model, self)?);
        if errors.has_any() {
            tracing::debug!(
                model = M::type_name(),
                fields = errors.len(),
                "validation failed, skipping write"
            );
        }
        Ok(errors)
    }

    /// Validates and, when there are no failures, creates `model`.
    ///
    /// # Errors
    ///
    /// Fails when validation cannot run or the create fails. Validation
    /// failures are returned as `Ok`.
    pub fn validate_and_create<M: Model>(
        &self,
        model: &mut M,
        excludes: &[&str],
    ) -> Result<ValidationErrors> {
        let errors = self.run_validations(model, M::validate_create)?;
        if errors.is_empty() {
            self.create(model, excludes)?;
        }
        Ok(errors)
    }

    /// Validates and, when there are no failures, updates `model`.
    ///
    /// # Errors
    ///
    /// Fails when validation cannot run or the update fails.
    pub fn validate_and_update<M: Model>(
        &self,
        model: &mut M,
        excludes: &[&str],
    ) -> Result<ValidationErrors> {
        let errors = self.run_validations(model, M::validate_update)?;
        if errors.is_empty() {
            self.update(model, excludes)?;
        }
        Ok(errors)
    }

    /// Validates and saves `model`, picking create or update by its id.
    ///
    /// # Errors
    ///
    /// Fails when validation cannot run or the write fails.
    pub fn validate_and_save<M: Model>(
        &self,
        model: &mut M,
        excludes: &[&str],
    ) -> Result<ValidationErrors> {
        if model.id().is_zero() {
            self.validate_and_create(model, excludes)
        } else {
            self.validate_and_update(model, excludes)
        }
    }

    /// Validates and, when there are no failures, deletes `model`.
    ///
    /// # Errors
    ///
    /// Fails when validation cannot run or the delete fails.
    pub fn validate_and_delete<M: Model>(&self, model: &mut M) -> Result<ValidationErrors> {
        let errors = self.run_validations(model, M::validate_delete)?;
        if errors.is_empty() {
            self.delete(model)?;
        }
        Ok(errors)
    }
}

// ── read verbs ──

/// Identifier accepted by [`Query::find`]. Text that parses as an integer
/// is looked up as an integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindId {
    Int(i64),
    Text(String),
}

impl FindId {
    fn into_value(self) -> Value {
        match self {
            Self::Int(i) => Value::Int(i),
            Self::Text(s) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Text(s),
            },
        }
    }
}

macro_rules! find_id_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for FindId {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}

find_id_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<&str> for FindId {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FindId {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Uuid> for FindId {
    fn from(v: Uuid) -> Self {
        Self::Text(v.to_string())
    }
}

fn strip_trailing_limit(sql: &str) -> &str {
    let sql = sql.trim_end();
    let found = TRAILING_LIMIT_OFFSET
        .find(sql)
        .or_else(|| TRAILING_LIMIT.find(sql));
    match found {
        Some(m) => sql[..m.start()].trim_end(),
        None => sql,
    }
}

impl<'c> Query<'c> {
    /// Runs the raw statement.
    ///
    /// # Errors
    ///
    /// Fails when no raw statement was set or the statement fails.
    pub fn exec(&self) -> Result<()> {
        self.exec_with_count().map(|_| ())
    }

    /// Runs the raw statement and returns the number of affected rows.
    ///
    /// # Errors
    ///
    /// Fails when no raw statement was set or the statement fails.
    pub fn exec_with_count(&self) -> Result<u64> {
        if !self.is_raw() {
            return Err(DbError::custom("exec requires a raw statement"));
        }
        let (sql, args) = self.to_sql(&ModelMeta::for_table(""));
        Ok(self.conn.exec_sql(&sql, &args)?.rows_affected)
    }

    /// First row as `M`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NoRows` when nothing matches.
    pub fn first<M: Model>(&self) -> Result<M> {
        let meta = self.conn.meta::<M>();
        let (sql, args) = self.clone().limit(1).to_sql(&meta);
        M::from_row(&self.conn.select_one(&sql, &args)?)
    }

    /// Row with the highest id as `M`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NoRows` when nothing matches.
    pub fn last<M: Model>(&self) -> Result<M> {
        let meta = self.conn.meta::<M>();
        let alias = self.alias.clone().unwrap_or_else(|| meta.alias());
        let (sql, args) = self
            .clone()
            .order(format!("{alias}.id DESC"))
            .limit(1)
            .to_sql(&meta);
        M::from_row(&self.conn.select_one(&sql, &args)?)
    }

    /// Row whose id equals `id` as `M`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NoRows` when nothing matches.
    pub fn find<M: Model>(&self, id: impl Into<FindId>) -> Result<M> {
        let meta = self.conn.meta::<M>();
        let alias = self.alias.clone().unwrap_or_else(|| meta.alias());
        self.clone()
            .where_clause(format!("{alias}.id = ?"), vec![id.into().into_value()])
            .first()
    }

    /// Every matching row as `M`. With a page requested, the paginator is
    /// filled with totals.
    ///
    /// # Errors
    ///
    /// Fails when a statement fails or a row does not map onto `M`.
    pub fn all<M: Model>(&mut self) -> Result<Vec<M>> {
        let meta = self.conn.meta::<M>();
        let (sql, args) = self.to_sql(&meta);
        let models = self
            .conn
            .select_rows(&sql, &args)?
            .iter()
            .map(M::from_row)
            .collect::<Result<Vec<_>>>()?;

        if self.paginator.is_some() {
            let total = self.count_meta(&meta, "*")?;
            if let Some(page) = self.paginator.as_mut() {
                page.total_entries_size = total;
                page.current_entries_size = models.len() as i64;
                page.compute_total_pages();
            }
        }
        Ok(models)
    }

    /// Number of matching rows, ignoring ordering and pagination.
    ///
    /// # Errors
    ///
    /// Fails when the statement fails.
    pub fn count<M: Model>(&self) -> Result<i64> {
        self.count_by_field::<M>("*")
    }

    /// `COUNT(field)` over the matching rows.
    ///
    /// # Errors
    ///
    /// Fails when the statement fails.
    pub fn count_by_field<M: Model>(&self, field: &str) -> Result<i64> {
        self.count_meta(&self.conn.meta::<M>(), field)
    }

    /// Whether any row matches.
    ///
    /// # Errors
    ///
    /// Fails when the statement fails.
    pub fn exists<M: Model>(&self) -> Result<bool> {
        Ok(self.count::<M>()? != 0)
    }

    /// Number of matching rows in `table`, without a model type.
    ///
    /// # Errors
    ///
    /// Fails when the statement fails.
    pub fn count_table(&self, table: &str) -> Result<i64> {
        self.count_meta(&ModelMeta::for_table(table), "*")
    }

    /// Whether any row of `table` matches.
    ///
    /// # Errors
    ///
    /// Fails when the statement fails.
    pub fn exists_table(&self, table: &str) -> Result<bool> {
        Ok(self.count_table(table)? != 0)
    }

    fn count_meta(&self, meta: &ModelMeta, field: &str) -> Result<i64> {
        let (sql, args) = self.for_count().to_sql(meta);
        let sql = self
            .conn
            .dialect()
            .count_stmt(field, strip_trailing_limit(&sql));
        self.conn
            .select_one(&sql, &args)
            .and_then(|row| row.get_i64("row_count"))
            .with_context(|| format!("could not count {}", meta.table_name()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quarry_types::args;

    use super::*;
    use crate::details::ConnectionDetails;
    use crate::model::{Column, Hooks, Validate};
    use crate::store::testing::RecordingStore;

    #[derive(Debug, Default)]
    struct Widget {
        id: i64,
        name: String,
    }

    impl Hooks for Widget {
        fn before_delete(&mut self, _conn: &Connection) -> Result<()> {
            if self.name == "locked" {
                return Err(DbError::custom("widget is locked"));
            }
            Ok(())
        }
    }

    impl Validate for Widget {
        fn validate(&self, _conn: &Connection) -> Result<ValidationErrors> {
            let mut errors = ValidationErrors::new();
            if self.name.is_empty() {
                errors.add("name", "name can not be blank");
            }
            Ok(errors)
        }
    }

    impl Model for Widget {
        fn columns() -> &'static [Column] {
            const COLUMNS: &[Column] = &[Column::new("id", "id"), Column::new("name", "name")];
            COLUMNS
        }

        fn id(&self) -> Value {
            Value::Int(self.id)
        }

        fn set_id(&mut self, id: Value) {
            if let Some(id) = id.as_i64() {
                self.id = id;
            }
        }

        fn values(&self) -> Vec<(&'static str, Value)> {
            vec![("id", Value::Int(self.id)), ("name", Value::from(&self.name))]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_i64("id")?,
                name: row.get_string("name")?,
            })
        }
    }

    fn widget_row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int(id), Value::from(name)],
        )
    }

    fn recorded(url: &str) -> (Connection, Arc<RecordingStore>) {
        let store = RecordingStore::new();
        let conn = Connection::new(ConnectionDetails::from_url(url))
            .expect("connection")
            .with_store(store.clone());
        (conn, store)
    }

    // ── writes ──

    #[test]
    fn create_omits_zero_id_and_captures_insert_id() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        let mut w = Widget {
            id: 0,
            name: "bolt".into(),
        };
        conn.create(&mut w, &[]).expect("create");
        assert_eq!(w.id, 1);
        assert_eq!(
            store.last_sql(),
            "INSERT INTO widgets (name) VALUES (:name)"
        );
    }

    #[test]
    fn create_uses_returning_for_postgres() {
        let (conn, store) = recorded("postgres://u:p@db/shop");
        store.push_rows(vec![Row::new(vec!["id".into()], vec![Value::Int(42)])]);
        let mut w = Widget {
            id: 0,
            name: "nut".into(),
        };
        conn.create(&mut w, &[]).expect("create");
        assert_eq!(w.id, 42);
        assert_eq!(
            store.last_sql(),
            "INSERT INTO widgets (name) VALUES (:name) RETURNING id"
        );
    }

    #[test]
    fn excluded_columns_are_not_written() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        let mut w = Widget {
            id: 5,
            name: "spring".into(),
        };
        conn.create(&mut w, &["name"]).expect("create");
        assert_eq!(store.last_sql(), "INSERT INTO widgets (id) VALUES (:id)");
        assert_eq!(store.calls()[0].args, vec![Value::Int(5)]);
    }

    #[test]
    fn update_and_delete_target_id() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        let mut w = Widget {
            id: 9,
            name: "gear".into(),
        };
        conn.save(&mut w, &[]).expect("save");
        assert_eq!(
            store.last_sql(),
            "UPDATE widgets SET name = :name WHERE widgets.id = 9"
        );
        conn.delete(&mut w).expect("delete");
        assert_eq!(store.last_sql(), "DELETE FROM widgets WHERE widgets.id = 9");
    }

    #[test]
    fn failing_before_hook_sends_nothing() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        let mut w = Widget {
            id: 3,
            name: "locked".into(),
        };
        let err = conn.delete(&mut w).expect_err("should fail");
        assert!(matches!(err, DbError::Hook { hook: "before_delete", .. }));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn validation_failures_veto_the_write() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        let mut w = Widget::default();
        let errors = conn.validate_and_save(&mut w, &[]).expect("validate");
        assert_eq!(errors.get("name"), Some(&["name can not be blank".to_string()][..]));
        assert!(store.calls().is_empty());
    }

    // ── reads ──

    #[test]
    fn find_parses_numeric_strings() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        store.push_rows(vec![widget_row(5, "cog")]);
        let w: Widget = conn.query().find("5").expect("find");
        assert_eq!(w.id, 5);
        let call = store.calls().remove(0);
        assert_eq!(
            call.sql,
            "SELECT widgets.id, widgets.name FROM widgets AS widgets WHERE widgets.id = ? LIMIT 1"
        );
        assert_eq!(call.args, args![5]);
    }

    #[test]
    fn find_missing_row_is_no_rows() {
        let (conn, _store) = recorded("mysql://u:p@db/shop");
        let err = conn.query().find::<Widget>(1).expect_err("should be empty");
        assert!(matches!(err, DbError::NoRows));
    }

    #[test]
    fn last_orders_by_id_descending() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        store.push_rows(vec![widget_row(8, "z")]);
        let _: Widget = conn.query().last().expect("last");
        assert!(store
            .last_sql()
            .ends_with("ORDER BY widgets.id DESC LIMIT 1"));
    }

    #[test]
    fn all_fills_paginator() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        store.push_rows(vec![widget_row(21, "a"), widget_row(22, "b")]);
        store.push_count(22);
        let mut q = conn.query().order("id").paginate(3, 10);
        let widgets: Vec<Widget> = q.all().expect("all");
        assert_eq!(widgets.len(), 2);

        let page = q.paginator().expect("paginator");
        assert_eq!(page.total_entries_size, 22);
        assert_eq!(page.current_entries_size, 2);
        assert_eq!(page.total_pages, 3);

        let calls = store.calls();
        assert!(calls[0].sql.ends_with("ORDER BY id LIMIT 10 OFFSET 20"));
        assert_eq!(
            calls[1].sql,
            "SELECT COUNT(*) AS row_count FROM (SELECT widgets.id, widgets.name FROM widgets AS widgets) AS count_query"
        );
    }

    #[test]
    fn count_strips_raw_limits() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        store.push_count(4);
        let n = conn
            .raw("SELECT * FROM widgets LIMIT 10 OFFSET 5 ", Vec::new())
            .count_table("widgets")
            .expect("count");
        assert_eq!(n, 4);
        assert_eq!(
            store.last_sql(),
            "SELECT COUNT(*) AS row_count FROM (SELECT * FROM widgets) AS count_query"
        );
    }

    #[test]
    fn exec_requires_raw_sql() {
        let (conn, store) = recorded("mysql://u:p@db/shop");
        assert!(conn.query().exec().is_err());
        let n = conn
            .raw("DELETE FROM widgets WHERE id IN (?)", vec![Value::from(vec![1, 2])])
            .exec_with_count()
            .expect("exec");
        assert_eq!(n, 1);
        assert_eq!(store.last_sql(), "DELETE FROM widgets WHERE id IN (?, ?)");
    }

    #[test]
    fn strip_trailing_limit_forms() {
        assert_eq!(strip_trailing_limit("SELECT a FROM t limit 5"), "SELECT a FROM t");
        assert_eq!(
            strip_trailing_limit("SELECT a FROM t LIMIT 5 OFFSET 10"),
            "SELECT a FROM t"
        );
        assert_eq!(strip_trailing_limit("SELECT a FROM t"), "SELECT a FROM t");
    }
}
