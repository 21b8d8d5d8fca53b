//! SQL statement text: classification, assignment building, and the legacy
//! text transforms used for pagination-style query rewriting. Everything in
//! this module is a pure string operation with no driver access.

pub mod assign;
pub mod stmt;
pub mod text;

// Re-export commonly used types
pub use assign::{Assignments, RenderedAssignments, SqlValue, quote_ident};
pub use stmt::StatementKind;
pub use text::{QueryParts, count_query, split_clauses, where_or_and};
