//! MySQL session management with legacy-friendly CRUD helpers.
//!
//! A [`Session`] wraps one live connection: it classifies and logs every
//! statement, retries once across dropped connections, and keeps the row,
//! error, and inserted-key state callers read back after each statement.
//! A [`SessionRegistry`] opens and caches sessions by connection profile.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sql;

pub use config::{ConnectionParams, DEFAULT_PROFILE, Profiles};
pub use db::{MySqlConnector, Session, SessionRegistry};
pub use error::{Error, Result};
pub use models::{ResultSet, Row, SqlParam};
pub use sql::Assignments;
