//! Compiles a [`Query`] into SQL text and positional arguments.

use std::cell::OnceCell;

use quarry_types::Value;

use crate::clause::join_display;
use crate::model::ModelMeta;
use crate::query::Query;

/// One compilation of a query for a model. The result is computed on first
/// access and reused afterwards.
pub struct QueryBuilder<'q, 'c> {
    query: &'q Query<'c>,
    meta: &'q ModelMeta,
    compiled: OnceCell<(String, Vec<Value>)>,
}

impl<'q, 'c> QueryBuilder<'q, 'c> {
    pub fn new(query: &'q Query<'c>, meta: &'q ModelMeta) -> Self {
        Self {
            query,
            meta,
            compiled: OnceCell::new(),
        }
    }

    /// Compiled SQL.
    pub fn sql(&self) -> &str {
        &self.compiled().0
    }

    /// Positional arguments matching [`QueryBuilder::sql`].
    pub fn args(&self) -> &[Value] {
        &self.compiled().1
    }

    fn compiled(&self) -> &(String, Vec<Value>) {
        self.compiled.get_or_init(|| self.compile())
    }

    fn compile(&self) -> (String, Vec<Value>) {
        let (sql, args) = match &self.query.raw_sql {
            Some(raw) => (raw.fragment.clone(), raw.args.clone()),
            None => self.build_select(),
        };
        let (sql, args) = expand_list_args(&sql, args);
        (self.query.conn.dialect().translate_sql(&sql), args)
    }

    fn build_select(&self) -> (String, Vec<Value>) {
        let q = self.query;
        let meta = match &q.alias {
            Some(alias) => self.meta.clone().with_alias(alias.clone()),
            None => self.meta.clone(),
        };
        let mut args = Vec::new();

        let mut columns = meta.columns();
        columns.add(q.add_columns.iter());
        let mut sql = format!(
            "SELECT {} FROM {} AS {}",
            columns.select_list(),
            meta.table_name(),
            meta.alias()
        );
        if !q.from_clauses.is_empty() {
            sql.push_str(", ");
            sql.push_str(&join_display(&q.from_clauses, ", "));
        }

        if !q.join_clauses.is_empty() {
            sql.push(' ');
            sql.push_str(&join_display(&q.join_clauses, " "));
            args.extend(q.join_clauses.iter().flat_map(|j| j.args.iter().cloned()));
        }

        if !q.where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&q.where_clauses.join(" AND "));
            args.extend(q.where_clauses.args().cloned());
        }

        if !q.group_clauses.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&join_display(&q.group_clauses, ", "));
            if !q.having_clauses.is_empty() {
                sql.push_str(" HAVING ");
                sql.push_str(&q.having_clauses.join(" AND "));
                args.extend(q.having_clauses.args().cloned());
            }
        }

        if !q.order_clauses.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&q.order_clauses.join(", "));
        }

        let dialect = q.conn.dialect();
        if let Some(page) = &q.paginator {
            sql.push_str(&dialect.limit_and_offset_sql(
                Some(&Value::Int(page.per_page)),
                Some(&Value::Int(page.offset)),
            ));
        } else if let Some(limit) = q.limit_results {
            sql.push_str(&dialect.limit_and_offset_sql(Some(&Value::Int(limit)), None));
        }

        (sql, args)
    }
}

/// Replaces each `?` bound to a list argument with one `?` per element and
/// flattens the arguments. Placeholders inside quoted literals are skipped.
pub(crate) fn expand_list_args(sql: &str, args: Vec<Value>) -> (String, Vec<Value>) {
    if !args.iter().any(|a| matches!(a, Value::List(_))) {
        return (sql.to_string(), args);
    }
    let mut out = String::with_capacity(sql.len());
    let mut flat = Vec::with_capacity(args.len());
    let mut pending = args.into_iter();
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                out.push(ch);
            }
            (None, '?') => match pending.next() {
                Some(Value::List(items)) if items.is_empty() => out.push_str("NULL"),
                Some(Value::List(items)) => {
                    out.push_str(&vec!["?"; items.len()].join(", "));
                    flat.extend(crate::query::flatten(items));
                }
                Some(other) => {
                    out.push('?');
                    flat.push(other);
                }
                None => out.push('?'),
            },
            (None, c) => out.push(c),
        }
    }
    flat.extend(pending);
    (out, flat)
}
