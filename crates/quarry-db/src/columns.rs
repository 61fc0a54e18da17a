//! Column sets rendered into select lists and statement templates.

use std::collections::BTreeSet;

/// Unique, ordered column names plus the alias used to qualify them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Columns {
    alias: String,
    names: BTreeSet<String>,
}

impl Columns {
    /// An empty set qualified by `alias`. An empty alias leaves names bare.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            names: BTreeSet::new(),
        }
    }

    /// Adds names, trimming whitespace and ignoring duplicates.
    pub fn add<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let name = name.as_ref().trim();
            if !name.is_empty() {
                self.names.insert(name.to_string());
            }
        }
    }

    /// Removes names.
    pub fn remove<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.names.remove(name.as_ref().trim());
        }
    }

    /// Whether `name` is in the set.
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` when there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Bare names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }

    fn qualify(&self, name: &str) -> String {
        // Expressions and already qualified names are left alone.
        if self.alias.is_empty() || name.contains('.') || name.contains('(') || name.contains(' ') {
            name.to_string()
        } else {
            format!("{}.{name}", self.alias)
        }
    }

    /// Select list: `alias.a, alias.b`, or `alias.*` when empty.
    pub fn select_list(&self) -> String {
        if self.names.is_empty() {
            return self.qualify("*");
        }
        self.names
            .iter()
            .map(|n| self.qualify(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Named parameters: `:a, :b`.
    pub fn param_string(&self) -> String {
        self.names
            .iter()
            .map(|n| format!(":{n}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Assignments: `a = :a, b = :b`.
    pub fn update_string(&self) -> String {
        self.names
            .iter()
            .map(|n| format!("{n} = :{n}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
