//! The driver seam.
//!
//! Sessions talk to MySQL through these traits rather than a concrete
//! client, so the execution pipeline can be exercised against scripted
//! drivers in tests and the sqlx backend stays swappable.

use std::fmt;

use async_trait::async_trait;

use crate::config::ConnectionParams;
use crate::models::{Row, SqlParam};

/// MySQL client error code: server has gone away.
pub const CR_SERVER_GONE_ERROR: u32 = 2006;
/// MySQL client error code: lost connection during query.
pub const CR_SERVER_LOST: u32 = 2013;

/// Error surfaced by a driver operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DriverError {
    /// MySQL error number (server range or client 2xxx range).
    pub code: u32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Transient transport loss that warrants one reconnect-and-retry.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self.code, CR_SERVER_GONE_ERROR | CR_SERVER_LOST)
    }
}

/// What one statement produced.
#[derive(Debug, Clone, Default)]
pub struct StatementOutcome {
    /// Decoded result rows. Empty for statements without a result set.
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    /// Auto-generated id; 0 when the statement generated none.
    pub last_insert_id: u64,
}

/// Connection character set and collation as the server reports them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionEncoding {
    pub charset: String,
    pub collation: String,
}

impl SessionEncoding {
    pub fn new(charset: impl Into<String>, collation: impl Into<String>) -> Self {
        Self {
            charset: charset.into(),
            collation: collation.into(),
        }
    }
}

impl fmt::Display for SessionEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.charset, self.collation)
    }
}

/// One live MySQL connection.
#[async_trait]
pub trait Driver: Send {
    /// Execute one statement with bound parameters.
    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<StatementOutcome, DriverError>;

    /// Read back the active character set and collation.
    async fn encoding(&mut self) -> Result<SessionEncoding, DriverError>;

    /// Close the connection. Subsequent `execute` calls fail with
    /// [`CR_SERVER_GONE_ERROR`].
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Opens [`Driver`] connections from connection parameters.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Driver>, DriverError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted connector/driver pair recording everything a session does.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Default)]
    pub struct MockState {
        /// Per-statement outcomes, popped in order. An exhausted queue
        /// yields empty successful outcomes.
        pub outcomes: VecDeque<Result<StatementOutcome, DriverError>>,
        /// How many connect attempts fail before the next one succeeds.
        pub connect_failures: u32,
        /// Every executed statement with its bound parameters.
        pub executed: Vec<(String, Vec<SqlParam>)>,
        /// Total connect attempts, including failed ones.
        pub connect_attempts: u32,
        /// Successful connects.
        pub connects: u32,
        pub closes: u32,
        pub encoding: SessionEncoding,
        pub encoding_fails: bool,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MockConnector {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_outcome(&self, outcome: Result<StatementOutcome, DriverError>) {
            self.state.lock().unwrap().outcomes.push_back(outcome);
        }

        pub fn push_rows(&self, rows: Vec<Row>) {
            self.push_outcome(Ok(StatementOutcome {
                rows,
                ..StatementOutcome::default()
            }));
        }

        pub fn fail_connects(&self, count: u32) {
            self.state.lock().unwrap().connect_failures = count;
        }

        pub fn set_encoding(&self, charset: &str, collation: &str) {
            self.state.lock().unwrap().encoding = SessionEncoding::new(charset, collation);
        }

        pub fn executed_sql(&self) -> Vec<String> {
            self.state
                .lock()
                .unwrap()
                .executed
                .iter()
                .map(|(sql, _)| sql.clone())
                .collect()
        }

        pub fn executed_params(&self) -> Vec<Vec<SqlParam>> {
            self.state
                .lock()
                .unwrap()
                .executed
                .iter()
                .map(|(_, params)| params.clone())
                .collect()
        }

        pub fn connects(&self) -> u32 {
            self.state.lock().unwrap().connects
        }

        pub fn connect_attempts(&self) -> u32 {
            self.state.lock().unwrap().connect_attempts
        }

        pub fn closes(&self) -> u32 {
            self.state.lock().unwrap().closes
        }
    }

    pub struct MockDriver {
        state: Arc<Mutex<MockState>>,
        closed: bool,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _params: &ConnectionParams) -> Result<Box<dyn Driver>, DriverError> {
            let mut state = self.state.lock().unwrap();
            state.connect_attempts += 1;
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(DriverError::new(2002, "connection refused"));
            }
            state.connects += 1;
            Ok(Box::new(MockDriver {
                state: Arc::clone(&self.state),
                closed: false,
            }))
        }
    }

    #[async_trait]
    impl Driver for MockDriver {
        async fn execute(
            &mut self,
            sql: &str,
            params: &[SqlParam],
        ) -> Result<StatementOutcome, DriverError> {
            if self.closed {
                return Err(DriverError::new(CR_SERVER_GONE_ERROR, "connection closed"));
            }
            let mut state = self.state.lock().unwrap();
            state.executed.push((sql.to_string(), params.to_vec()));
            state
                .outcomes
                .pop_front()
                .unwrap_or_else(|| Ok(StatementOutcome::default()))
        }

        async fn encoding(&mut self) -> Result<SessionEncoding, DriverError> {
            let state = self.state.lock().unwrap();
            if state.encoding_fails {
                return Err(DriverError::new(2014, "commands out of sync"));
            }
            Ok(state.encoding.clone())
        }

        async fn close(&mut self) -> Result<(), DriverError> {
            self.closed = true;
            self.state.lock().unwrap().closes += 1;
            Ok(())
        }
    }
}
