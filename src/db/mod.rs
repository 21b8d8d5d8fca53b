//! Database access layer.
//!
//! This module provides the session machinery:
//! - Driver seam between sessions and the wire client
//! - sqlx-backed MySQL driver with JSON row decoding
//! - Session execution pipeline with CRUD helpers and diagnostics
//! - Profile-keyed session registry

pub mod driver;
pub mod mysql;
pub mod registry;
pub mod session;

pub use driver::{
    CR_SERVER_GONE_ERROR, CR_SERVER_LOST, Connector, Driver, DriverError, SessionEncoding,
    StatementOutcome,
};
pub use mysql::MySqlConnector;
pub use registry::SessionRegistry;
pub use session::{CONNECT_ATTEMPTS, EncodingMode, PRIMARY_KEY_COLUMN, Session};
