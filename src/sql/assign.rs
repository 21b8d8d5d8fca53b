//! Column assignment lists for generated INSERT/UPDATE statements.
//!
//! An [`Assignments`] value is an ordered `column = value` list. Rendering
//! produces the SQL fragment plus the bound parameters in matching order:
//! plain values become `?` placeholders, raw expressions (`NOW()`,
//! `col + 1`) are spliced in verbatim, and values that trim to nothing
//! become `NULL`.

use crate::models::SqlParam;

/// Quote an identifier with backticks, doubling any embedded backtick.
pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// A value on the right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// Bound as a parameter placeholder.
    Value(String),
    /// Spliced into the statement verbatim. The caller owns its safety.
    Literal(String),
}

impl SqlValue {
    pub fn value(v: impl Into<String>) -> Self {
        Self::Value(v.into())
    }

    pub fn literal(expr: impl Into<String>) -> Self {
        Self::Literal(expr.into())
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Value(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Value(v)
    }
}

/// A rendered assignment list: the SQL fragment and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAssignments {
    pub fragment: String,
    pub params: Vec<SqlParam>,
}

/// Ordered `column = value` list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignments {
    entries: Vec<(String, SqlValue)>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bound-value assignment.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries
            .push((column.into(), SqlValue::Value(value.into())));
        self
    }

    /// Append a raw-expression assignment, e.g. `NOW()`.
    pub fn set_literal(mut self, column: impl Into<String>, expr: impl Into<String>) -> Self {
        self.entries
            .push((column.into(), SqlValue::Literal(expr.into())));
        self
    }

    /// Append with an explicit [`SqlValue`].
    pub fn push(&mut self, column: impl Into<String>, value: SqlValue) {
        self.entries.push((column.into(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.entries.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Copy of this list without the named columns.
    ///
    /// Used for ON DUPLICATE KEY UPDATE clauses that must not touch
    /// creation-time fields.
    pub fn without(&self, skip: &[&str]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(c, _)| !skip.contains(&c.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Render to `` `a` = ?, `b` = NOW(), `c` = NULL `` plus bound params.
    ///
    /// Values are trimmed first; a value that trims to the empty string
    /// renders as NULL and binds nothing.
    pub fn render(&self) -> RenderedAssignments {
        let mut fragment = String::new();
        let mut params = Vec::new();

        for (i, (column, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                fragment.push_str(", ");
            }
            fragment.push_str(&quote_ident(column));
            fragment.push_str(" = ");

            let trimmed = match value {
                SqlValue::Value(v) => v.trim(),
                SqlValue::Literal(v) => v.trim(),
            };
            if trimmed.is_empty() {
                fragment.push_str("NULL");
                continue;
            }
            match value {
                SqlValue::Value(_) => {
                    fragment.push('?');
                    params.push(SqlParam::Text(trimmed.to_string()));
                }
                SqlValue::Literal(_) => fragment.push_str(trimmed),
            }
        }

        RenderedAssignments { fragment, params }
    }
}

impl<C, V> FromIterator<(C, V)> for Assignments
where
    C: Into<String>,
    V: Into<SqlValue>,
{
    fn from_iter<I: IntoIterator<Item = (C, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(c, v)| (c.into(), v.into()))
                .collect(),
        }
    }
}
