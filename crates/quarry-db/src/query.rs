//! Query construction.
//!
//! A [`Query`] accumulates clauses against a [`Connection`] and is compiled
//! by [`QueryBuilder`](crate::QueryBuilder) once a target model is known.
//! Raw SQL set with [`Query::raw`] takes precedence: clause methods called
//! afterwards are ignored with a warning.

use std::sync::LazyLock;

use quarry_types::Value;
use regex::Regex;
use serde::Serialize;

use crate::builder::QueryBuilder;
use crate::clause::{Clause, Clauses, FromClause, GroupClause, HavingClause, JoinClause};
use crate::connection::Connection;
use crate::model::ModelMeta;

static IN_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)in\s*\(\s*\?\s*\)").expect("valid regex"));

/// Page request and, after [`Query::all`], the page totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Paginator {
    /// 1-based page number.
    pub page: i64,
    /// Entries per page.
    pub per_page: i64,
    /// Rows skipped before this page.
    pub offset: i64,
    /// Rows matching the query across all pages.
    pub total_entries_size: i64,
    /// Rows on this page.
    pub current_entries_size: i64,
    /// Number of pages.
    pub total_pages: i64,
}

impl Paginator {
    /// Entries per page when the caller passes a non-positive size.
    pub const DEFAULT_PER_PAGE: i64 = 20;

    /// A paginator for `page` with `per_page` entries; pages below 1 become 1.
    pub fn new(page: i64, per_page: i64) -> Self {
        let page = page.max(1);
        let per_page = if per_page < 1 {
            Self::DEFAULT_PER_PAGE
        } else {
            per_page
        };
        Self {
            page,
            per_page,
            offset: (page - 1).saturating_mul(per_page),
            total_entries_size: 0,
            current_entries_size: 0,
            total_pages: 0,
        }
    }

    /// Sets `total_pages` from `total_entries_size`, rounding up.
    pub fn compute_total_pages(&mut self) {
        let total = self.total_entries_size.max(0);
        let per_page = self.per_page.max(1);
        self.total_pages = total / per_page + i64::from(total % per_page != 0);
    }
}

impl Default for Paginator {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_PER_PAGE)
    }
}

/// Clauses for one statement against a connection.
#[derive(Debug, Clone)]
pub struct Query<'c> {
    pub(crate) conn: &'c Connection,
    pub(crate) raw_sql: Option<Clause>,
    pub(crate) where_clauses: Clauses,
    pub(crate) order_clauses: Vec<String>,
    pub(crate) from_clauses: Vec<FromClause>,
    pub(crate) join_clauses: Vec<JoinClause>,
    pub(crate) group_clauses: Vec<GroupClause>,
    pub(crate) having_clauses: Clauses,
    pub(crate) limit_results: Option<i64>,
    pub(crate) paginator: Option<Paginator>,
    pub(crate) add_columns: Vec<String>,
    pub(crate) alias: Option<String>,
}

impl<'c> Query<'c> {
    /// An empty query bound to `conn`.
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            raw_sql: None,
            where_clauses: Clauses::default(),
            order_clauses: Vec::new(),
            from_clauses: Vec::new(),
            join_clauses: Vec::new(),
            group_clauses: Vec::new(),
            having_clauses: Clauses::default(),
            limit_results: None,
            paginator: None,
            add_columns: Vec::new(),
            alias: None,
        }
    }

    /// The connection statements run against.
    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    /// Replaces the whole statement with `sql`. List arguments are expanded
    /// into their `?` placeholders at compile time.
    pub fn raw(mut self, sql: impl Into<String>, args: Vec<Value>) -> Self {
        self.raw_sql = Some(Clause::new(sql, args));
        self
    }

    /// Whether a raw statement overrides the clause lists.
    pub fn is_raw(&self) -> bool {
        self.raw_sql.is_some()
    }

    fn ignored_with_raw(&self, method: &'static str) -> bool {
        if self.raw_sql.is_some() {
            tracing::warn!(method, "query has raw sql; ignoring clause");
            return true;
        }
        false
    }

    /// Adds a `WHERE` condition; conditions are joined with `AND`.
    ///
    /// An `IN (?)` placeholder is widened to one `?` per argument, or per
    /// element when a single list argument is given.
    pub fn where_clause(mut self, stmt: impl Into<String>, args: Vec<Value>) -> Self {
        if self.ignored_with_raw("where_clause") {
            return self;
        }
        let mut stmt = stmt.into();
        let args = if IN_PLACEHOLDER.is_match(&stmt) {
            let expanded = flatten(args);
            let placeholders = if expanded.is_empty() {
                "NULL".to_string()
            } else {
                vec!["?"; expanded.len()].join(",")
            };
            stmt = IN_PLACEHOLDER
                .replace(&stmt, format!("IN ({placeholders})").as_str())
                .into_owned();
            expanded
        } else {
            args
        };
        self.where_clauses.push(Clause::new(stmt, args));
        self
    }

    /// Adds an `ORDER BY` term.
    pub fn order(mut self, stmt: impl Into<String>) -> Self {
        if self.ignored_with_raw("order") {
            return self;
        }
        self.order_clauses.push(stmt.into());
        self
    }

    /// Limits the number of rows. Ignored when a page is requested; zero or
    /// a negative limit clears it.
    pub fn limit(mut self, limit: i64) -> Self {
        if self.ignored_with_raw("limit") {
            return self;
        }
        self.limit_results = (limit > 0).then_some(limit);
        self
    }

    /// Requests one page of results.
    pub fn paginate(mut self, page: i64, per_page: i64) -> Self {
        if self.ignored_with_raw("paginate") {
            return self;
        }
        self.paginator = Some(Paginator::new(page, per_page));
        self
    }

    /// The page request, filled with totals once [`Query::all`] has run.
    pub fn paginator(&self) -> Option<&Paginator> {
        self.paginator.as_ref()
    }

    /// Adds a join of the given type, e.g. `LEFT JOIN`.
    pub fn join_with(
        mut self,
        join_type: &str,
        table: impl Into<String>,
        on: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        if self.ignored_with_raw("join") {
            return self;
        }
        self.join_clauses.push(JoinClause {
            join_type: join_type.to_string(),
            table: table.into(),
            on: on.into(),
            args,
        });
        self
    }

    /// Adds a plain `JOIN`.
    pub fn join(self, table: impl Into<String>, on: impl Into<String>, args: Vec<Value>) -> Self {
        self.join_with("JOIN", table, on, args)
    }

    pub fn inner_join(
        self,
        table: impl Into<String>,
        on: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        self.join_with("INNER JOIN", table, on, args)
    }

    pub fn left_join(
        self,
        table: impl Into<String>,
        on: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        self.join_with("LEFT JOIN", table, on, args)
    }

    pub fn right_join(
        self,
        table: impl Into<String>,
        on: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        self.join_with("RIGHT JOIN", table, on, args)
    }

    /// Adds `GROUP BY` fields.
    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.ignored_with_raw("group_by") {
            return self;
        }
        self.group_clauses
            .extend(fields.into_iter().map(|f| GroupClause { field: f.into() }));
        self
    }

    /// Adds a `HAVING` condition. Only rendered together with `GROUP BY`.
    pub fn having(mut self, condition: impl Into<String>, args: Vec<Value>) -> Self {
        if self.ignored_with_raw("having") {
            return self;
        }
        self.having_clauses.push(HavingClause::new(condition, args));
        self
    }

    /// Adds another table to the `FROM` list.
    pub fn from_table(mut self, table: impl Into<String>, alias: impl Into<String>) -> Self {
        if self.ignored_with_raw("from_table") {
            return self;
        }
        self.from_clauses.push(FromClause {
            table: table.into(),
            alias: alias.into(),
        });
        self
    }

    /// Selects extra columns or expressions next to the model's columns.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Overrides the table alias used in `FROM`.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Compiles the query for `meta`.
    pub fn to_sql(&self, meta: &ModelMeta) -> (String, Vec<Value>) {
        let builder = QueryBuilder::new(self, meta);
        (builder.sql().to_string(), builder.args().to_vec())
    }

    /// Copy with ordering, limit and pagination removed, for counting.
    pub(crate) fn for_count(&self) -> Self {
        let mut q = self.clone();
        q.paginator = None;
        q.order_clauses.clear();
        q.limit_results = None;
        q
    }
}

/// Spreads list values into their elements.
pub(crate) fn flatten(args: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::List(items) => out.extend(flatten(items)),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use quarry_types::args;

    use super::*;
    use crate::details::ConnectionDetails;

    fn conn() -> Connection {
        Connection::new(ConnectionDetails::sqlite(":memory:")).expect("connection")
    }

    // ── pagination ──

    #[test]
    fn paginator_clamps_inputs() {
        let p = Paginator::new(0, 0);
        assert_eq!((p.page, p.per_page, p.offset), (1, 20, 0));
        let p = Paginator::new(3, 10);
        assert_eq!(p.offset, 20);
    }

    #[test]
    fn total_pages_rounds_up() {
        let mut p = Paginator::new(1, 10);
        for (total, pages) in [(0, 0), (1, 1), (10, 1), (20, 2), (25, 3)] {
            p.total_entries_size = total;
            p.compute_total_pages();
            assert_eq!(p.total_pages, pages, "{total} entries");
        }
    }

    #[test]
    fn paginator_saturates_extreme_inputs() {
        let p = Paginator::new(i64::MAX, 10);
        assert_eq!(p.offset, i64::MAX);

        let mut p = Paginator::new(1, i64::MAX);
        p.total_entries_size = 5;
        p.compute_total_pages();
        assert_eq!(p.total_pages, 1);

        p.total_entries_size = i64::MAX;
        p.compute_total_pages();
        assert_eq!(p.total_pages, 1);
    }

    // ── clauses ──

    #[test]
    fn in_placeholder_expands_per_argument() {
        let c = conn();
        let q = c.query().where_clause("id in (?)", args![1, 2, 3]);
        assert_eq!(q.where_clauses.join(" AND "), "id IN (?,?,?)");
        assert_eq!(q.where_clauses.args().count(), 3);
    }

    #[test]
    fn in_placeholder_expands_list_argument() {
        let c = conn();
        let q = c
            .query()
            .where_clause("name IN ( ? )", vec![Value::from(vec!["a", "b"])]);
        assert_eq!(q.where_clauses.join(" AND "), "name IN (?,?)");
        assert_eq!(
            q.where_clauses.args().cloned().collect::<Vec<_>>(),
            args!["a", "b"]
        );
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let c = conn();
        let q = c.query().where_clause("id in (?)", vec![Value::List(Vec::new())]);
        assert_eq!(q.where_clauses.join(" AND "), "id IN (NULL)");
    }

    #[test]
    fn raw_sql_ignores_later_clauses() {
        let c = conn();
        let q = c
            .raw("SELECT 1", Vec::new())
            .where_clause("a = ?", args![1])
            .order("a")
            .limit(5)
            .paginate(2, 10)
            .group_by(["a"]);
        assert!(q.is_raw());
        assert!(q.where_clauses.is_empty());
        assert!(q.order_clauses.is_empty());
        assert!(q.limit_results.is_none());
        assert!(q.paginator().is_none());
        assert!(q.group_clauses.is_empty());
    }

    #[test]
    fn non_positive_limit_means_unlimited() {
        let c = conn();
        assert_eq!(c.query().limit(0).limit_results, None);
        assert_eq!(c.query().limit(-4).limit_results, None);
        assert_eq!(c.query().limit(7).limit(0).limit_results, None);
        assert_eq!(c.query().limit(7).limit_results, Some(7));
    }

    #[test]
    fn count_copy_leaves_original_untouched() {
        let c = conn();
        let q = c.query().order("id").limit(3).paginate(2, 5);
        let counted = q.for_count();
        assert!(counted.order_clauses.is_empty());
        assert!(counted.paginator.is_none());
        assert_eq!(q.order_clauses, vec!["id".to_string()]);
        assert!(q.paginator.is_some());
    }
}
