//! Legacy query-text transforms for paginated listing code.
//!
//! These are naive, case-sensitive substring splits on uppercase keywords,
//! kept bug-compatible with the listing code they serve. They do not parse
//! SQL: a keyword inside a string literal or subquery will split too.

/// Rewrite a SELECT into its COUNT(*) companion.
///
/// Takes everything after the first `FROM` (joins and predicates included),
/// truncated before the first `ORDER BY`, else the first `LIMIT`. Empty
/// input and statements without a `FROM` are returned unchanged.
pub fn count_query(sql: &str) -> String {
    if sql.is_empty() {
        return String::new();
    }
    let Some(pos) = sql.find("FROM") else {
        return sql.to_string();
    };

    let mut source = &sql[pos + "FROM".len()..];
    if let Some(cut) = source.find("ORDER BY") {
        source = &source[..cut];
    } else if let Some(cut) = source.find("LIMIT") {
        source = &source[..cut];
    }
    format!("SELECT COUNT(*) FROM {}", source.trim_start())
}

/// Clause fragments produced by [`split_clauses`].
///
/// The slot layout follows the listing code that consumes it: `group`
/// receives the raw text after `WHERE` when one was split off, otherwise a
/// reattached `GROUP BY` clause, otherwise nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParts {
    pub main: String,
    pub group: String,
    pub order: String,
    pub having: String,
}

/// Split a statement on `HAVING`, `ORDER BY`, then `WHERE` (or `GROUP BY`).
///
/// Each split uses the first occurrence only. `HAVING` and `ORDER BY`
/// fragments are returned with their keyword reattached so callers can
/// append them verbatim when rebuilding the statement.
pub fn split_clauses(sql: &str) -> QueryParts {
    let mut query = sql;
    let mut having = String::new();
    let mut order = String::new();

    if let Some((before, after)) = query.split_once("HAVING") {
        having = format!(" HAVING {after}");
        query = before;
    }
    if let Some((before, after)) = query.split_once("ORDER BY") {
        order = format!(" ORDER BY {after}");
        query = before;
    }

    let (main, group) = match query.split_once("WHERE") {
        Some((before, after)) => (before.to_string(), after.to_string()),
        None => match query.split_once("GROUP BY") {
            Some((before, after)) => (before.to_string(), format!(" GROUP BY {after}")),
            None => (query.to_string(), String::new()),
        },
    };

    QueryParts {
        main,
        group,
        order,
        having,
    }
}

/// The connective for appending one more predicate to a statement.
///
/// `" AND "` once the text already contains `WHERE`, else `" WHERE "`.
pub fn where_or_and(sql: &str) -> &'static str {
    if sql.contains("WHERE") { " AND " } else { " WHERE " }
}
