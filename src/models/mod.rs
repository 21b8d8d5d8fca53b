//! Data models shared across the crate.

pub mod row;
pub mod value;

// Re-export commonly used types
pub use row::{ResultSet, Row};
pub use value::SqlParam;
