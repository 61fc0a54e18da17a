//! SQL clause fragments collected by [`crate::Query`].

use std::fmt;

use quarry_types::Value;

/// A SQL fragment and the positional arguments it consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clause {
    /// SQL text with `?` placeholders.
    pub fragment: String,
    /// Arguments in placeholder order.
    pub args: Vec<Value>,
}

impl Clause {
    /// Builds a clause.
    pub fn new(fragment: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            fragment: fragment.into(),
            args,
        }
    }
}

/// An ordered list of clauses rendered with a connector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clauses(Vec<Clause>);

impl Clauses {
    /// Appends a clause.
    pub fn push(&mut self, clause: Clause) {
        self.0.push(clause);
    }

    /// Fragments joined with `sep`.
    pub fn join(&self, sep: &str) -> String {
        self.0
            .iter()
            .map(|c| c.fragment.as_str())
            .collect::<Vec<_>>()
            .join(sep)
    }

    /// All arguments, in clause order.
    pub fn args(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().flat_map(|c| c.args.iter())
    }

    /// Returns `true` when no clause has been added.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of clauses.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Removes every clause.
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// An additional `FROM` entry: `table AS alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromClause {
    pub table: String,
    pub alias: String,
}

impl fmt::Display for FromClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} AS {}", self.table, self.alias)
    }
}

/// A join: `LEFT JOIN table ON condition`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    /// `JOIN`, `INNER JOIN`, `LEFT JOIN`, ...
    pub join_type: String,
    /// Joined table, optionally with an alias.
    pub table: String,
    /// Join condition.
    pub on: String,
    /// Arguments referenced by the condition.
    pub args: Vec<Value>,
}

impl fmt::Display for JoinClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ON {}", self.join_type, self.table, self.on)
    }
}

/// A `GROUP BY` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupClause {
    pub field: String,
}

impl fmt::Display for GroupClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.field)
    }
}

/// A `HAVING` condition. Conditions are joined with `AND`.
pub type HavingClause = Clause;

/// Renders displayable clauses joined by `sep`.
pub(crate) fn join_display<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clauses_join_and_flatten_args() {
        let mut c = Clauses::default();
        c.push(Clause::new("a = ?", vec![Value::Int(1)]));
        c.push(Clause::new("b IN (?,?)", vec![Value::Int(2), Value::Int(3)]));
        assert_eq!(c.join(" AND "), "a = ? AND b IN (?,?)");
        assert_eq!(
            c.args().cloned().collect::<Vec<_>>(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        c.clear();
        assert!(c.is_empty());
    }

    #[test]
    fn display_forms() {
        let from = FromClause {
            table: "orders".into(),
            alias: "o".into(),
        };
        let join = JoinClause {
            join_type: "LEFT JOIN".into(),
            table: "orders o".into(),
            on: "o.user_id = users.id".into(),
            args: Vec::new(),
        };
        assert_eq!(from.to_string(), "orders AS o");
        assert_eq!(join.to_string(), "LEFT JOIN orders o ON o.user_id = users.id");
        assert_eq!(
            join_display(
                &[
                    GroupClause { field: "a".into() },
                    GroupClause { field: "b".into() }
                ],
                ", "
            ),
            "a, b"
        );
    }
}
