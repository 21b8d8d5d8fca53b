//! Statement classification.
//!
//! Statements are classified from their leading text only: the first eight
//! characters of the trimmed statement are lowercased and substring-matched
//! against the four CRUD keywords, so `(SELECT ...` still counts as a
//! select. Anything else is classified by its first word. This is keyword
//! sniffing, not parsing; it decides test-mode short-circuiting and
//! post-execution bookkeeping, nothing more.

use std::fmt;

/// How many leading characters take part in keyword matching.
const CLASSIFY_WINDOW: usize = 8;

/// Classified statement kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
    /// First word of anything else, lowercased: `set`, `show`, `drop`, ...
    Other(String),
}

impl StatementKind {
    /// Classify a statement from its leading text.
    pub fn classify(sql: &str) -> Self {
        let trimmed = sql.trim();
        let window: String = trimmed
            .chars()
            .take(CLASSIFY_WINDOW)
            .collect::<String>()
            .to_lowercase();

        if window.contains("insert") {
            Self::Insert
        } else if window.contains("update") {
            Self::Update
        } else if window.contains("delete") {
            Self::Delete
        } else if window.contains("select") {
            Self::Select
        } else {
            let token = trimmed
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_lowercase();
            Self::Other(token)
        }
    }

    /// Whether this statement still executes when test mode is active.
    ///
    /// Test mode short-circuits everything except selects.
    pub fn runs_in_test_mode(&self) -> bool {
        matches!(self, Self::Select)
    }

    /// Whether delete tracking applies to this statement.
    pub fn is_destructive(&self) -> bool {
        match self {
            Self::Delete => true,
            Self::Other(token) => token == "drop" || token == "truncate",
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Select => "select",
            Self::Other(token) => token,
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
