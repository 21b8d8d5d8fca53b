//! One live database session and its execution pipeline.
//!
//! A [`Session`] owns a [`Driver`] handle plus the per-statement state the
//! legacy callers expect to read back: last SQL, statement kind, error code
//! and message, row buffers, and the captured primary key. Statements run
//! through a single pipeline that classifies the SQL, honors test mode,
//! retries once after a transient connection loss, and records diagnostics.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ConnectionParams;
use crate::db::driver::{
    CR_SERVER_GONE_ERROR, CR_SERVER_LOST, Connector, Driver, StatementOutcome,
};
use crate::error::{Error, Result};
use crate::models::{ResultSet, Row, SqlParam};
use crate::sql::{Assignments, StatementKind, quote_ident};

/// Connection attempts before opening a session gives up.
pub const CONNECT_ATTEMPTS: u32 = 5;

/// Delay between failed connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default key column used by the CRUD helpers.
pub const PRIMARY_KEY_COLUMN: &str = "z_PRIMARY_KEY";

/// Candidate probes before random key allocation reports failure.
const KEY_ALLOCATION_ATTEMPTS: u32 = 64;

/// Connection character set applied right after connecting.
///
/// `Utf8` and `Utf8mb4` pin the matching unicode collation with a
/// `SET collation_connection` statement; `Server` leaves the connection
/// at whatever the handshake negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingMode {
    #[default]
    Server,
    Utf8,
    Utf8mb4,
}

impl EncodingMode {
    fn from_params(params: &ConnectionParams) -> Self {
        match params.charset.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("utf8") => EncodingMode::Utf8,
            Some("utf8mb4") => EncodingMode::Utf8mb4,
            _ => EncodingMode::Server,
        }
    }

    fn collation_statement(self) -> Option<&'static str> {
        match self {
            EncodingMode::Server => None,
            EncodingMode::Utf8 => Some("SET collation_connection = 'utf8_unicode_ci'"),
            EncodingMode::Utf8mb4 => Some("SET collation_connection = 'utf8mb4_unicode_ci'"),
        }
    }
}

/// A live MySQL session with statement history and CRUD helpers.
pub struct Session {
    connector: Arc<dyn Connector>,
    params: ConnectionParams,
    driver: Box<dyn Driver>,
    encoding_mode: EncodingMode,
    failed_connects: u32,

    // Per-statement execution state, rewritten by every run
    last_sql: String,
    statement_log: String,
    kind: Option<StatementKind>,
    error_code: u32,
    error_message: String,
    reported_encoding: String,
    result: Option<ResultSet>,
    row_buffer: Row,
    row_count: u64,
    affected_rows: u64,
    last_insert_id: u64,
    primary_key: Option<u64>,

    test_mode: bool,
    track_deleted: bool,
    strict_columns: bool,
}

impl Session {
    /// Open a session, retrying the connect up to [`CONNECT_ATTEMPTS`] times
    /// with a fixed one second delay between attempts.
    pub async fn open(connector: Arc<dyn Connector>, params: ConnectionParams) -> Result<Self> {
        params.validate()?;

        let mut failed = 0;
        let driver = Self::connect_with_retry(connector.as_ref(), &params, &mut failed).await?;

        let encoding_mode = EncodingMode::from_params(&params);
        let mut session = Self {
            connector,
            params,
            driver,
            encoding_mode,
            failed_connects: failed,
            last_sql: String::new(),
            statement_log: String::new(),
            kind: None,
            error_code: 0,
            error_message: String::new(),
            reported_encoding: String::new(),
            result: None,
            row_buffer: Row::default(),
            row_count: 0,
            affected_rows: 0,
            last_insert_id: 0,
            primary_key: None,
            test_mode: false,
            track_deleted: false,
            strict_columns: false,
        };
        session.apply_encoding().await?;
        Ok(session)
    }

    async fn connect_with_retry(
        connector: &dyn Connector,
        params: &ConnectionParams,
        failed: &mut u32,
    ) -> Result<Box<dyn Driver>> {
        loop {
            match connector.connect(params).await {
                Ok(driver) => {
                    *failed = 0;
                    return Ok(driver);
                }
                Err(e) => {
                    *failed += 1;
                    warn!(
                        database = %params.database,
                        host = %params.host,
                        attempt = *failed,
                        error = %e,
                        "Tried to connect"
                    );
                    if *failed >= CONNECT_ATTEMPTS {
                        return Err(Error::connection(
                            format!(
                                "Unable to connect to {} on {}, msg: {}",
                                params.database, params.host, e.message
                            ),
                            *failed,
                        ));
                    }
                    sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Pin the connection collation for the configured character set.
    ///
    /// Runs directly against the driver rather than through [`Session::execute`]
    /// so a reconnect never re-enters the statement pipeline.
    async fn apply_encoding(&mut self) -> Result<()> {
        let Some(sql) = self.encoding_mode.collation_statement() else {
            return Ok(());
        };
        if let Err(e) = self.driver.execute(sql, &[]).await {
            warn!(error = %e, "Set connection encoding issue");
            return Err(Error::execution(e.code, e.message, sql));
        }
        Ok(())
    }

    /// Tear down the current handle and connect again with the same
    /// parameters, re-applying the session encoding.
    async fn reopen(&mut self) -> Result<()> {
        if let Err(e) = self.driver.close().await {
            debug!(error = %e, "Close before reconnect failed");
        }
        let mut failed = 0;
        let driver =
            Self::connect_with_retry(self.connector.as_ref(), &self.params, &mut failed).await?;
        self.driver = driver;
        self.failed_connects = failed;
        self.apply_encoding().await?;
        Ok(())
    }

    /// Close the underlying connection.
    pub async fn close(&mut self) -> Result<()> {
        self.driver
            .close()
            .await
            .map_err(|e| Error::connection(e.to_string(), 0))
    }

    /// Execute a raw statement without bound parameters.
    pub async fn execute(&mut self, sql: &str) -> Result<Option<ResultSet>> {
        self.execute_with_params(sql, &[]).await
    }

    /// Execute a statement with bound parameters.
    ///
    /// On the MySQL "server has gone away" and "lost connection" codes the
    /// session closes the handle, reconnects, and reruns the statement exactly
    /// once; any further failure surfaces to the caller. Returns a snapshot of
    /// the buffered result set, or `None` for statements without one.
    pub async fn execute_with_params(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Option<ResultSet>> {
        let mut reconnected = false;
        loop {
            match self.run_statement(sql, params, reconnected).await {
                Err(err) if !reconnected && is_transient(&err) => {
                    warn!(
                        database = %self.params.database,
                        sql = %sql,
                        "Lost connection, reconnecting"
                    );
                    self.reopen().await?;
                    reconnected = true;
                }
                other => return other,
            }
        }
    }

    async fn run_statement(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        reconnected: bool,
    ) -> Result<Option<ResultSet>> {
        // Stale result state never leaks into the next statement
        self.row_count = 0;
        self.row_buffer = Row::default();
        self.result = None;

        if reconnected {
            info!(
                database = %self.params.database,
                sql = %sql,
                "Reconnected, retrying statement"
            );
        }

        self.last_sql = sql.to_string();
        self.statement_log = format!(" | db: {}, query: {}", self.params.database, sql);

        let kind = StatementKind::classify(sql);
        let runs_in_test_mode = kind.runs_in_test_mode();
        self.kind = Some(kind);

        // Mutating statements are skipped in test mode; the prior error
        // state stays observable for the caller
        if self.test_mode && !runs_in_test_mode {
            return Ok(None);
        }

        self.error_code = 0;
        self.error_message.clear();

        let outcome = match self.driver.execute(sql, params).await {
            Ok(outcome) => {
                self.affected_rows = outcome.affected_rows;
                self.last_insert_id = outcome.last_insert_id;
                Some(outcome)
            }
            Err(e) => {
                self.error_code = e.code;
                self.error_message = e.message;
                self.affected_rows = 0;
                None
            }
        };

        // Best-effort readback for diagnostics; older servers may refuse
        match self.driver.encoding().await {
            Ok(enc) => self.reported_encoding = enc.to_string(),
            Err(e) => warn!(error = %e, "Could not read connection encoding"),
        }

        self.statement_log.push_str(&format!(
            ", error: {}::{}, affRows: {}, enc: {} | ",
            self.error_code, self.error_message, self.affected_rows, self.reported_encoding
        ));

        let Some(outcome) = outcome else {
            return Err(Error::execution(
                self.error_code,
                self.error_message.clone(),
                sql,
            ));
        };

        if matches!(self.kind, Some(StatementKind::Insert)) {
            self.primary_key = non_zero_key(outcome.last_insert_id);
        }

        self.store_result(outcome);

        if self.track_deleted && self.kind.as_ref().is_some_and(|k| k.is_destructive()) {
            info!(
                database = %self.params.database,
                sql = %self.last_sql,
                code = self.error_code,
                message = %self.error_message,
                "Tracked destructive statement"
            );
        }

        Ok(self.result.clone())
    }

    /// Buffer the statement's result set.
    ///
    /// DML and DDL produce no set at all; a SELECT always produces one, even
    /// when it matched nothing. The first row is eagerly copied into the
    /// compatibility buffer and the read cursor starts at row zero.
    fn store_result(&mut self, outcome: StatementOutcome) {
        let has_rows = !outcome.rows.is_empty();
        if has_rows || matches!(self.kind, Some(StatementKind::Select)) {
            let set = ResultSet::new(outcome.rows);
            self.row_count = set.len() as u64;
            self.row_buffer = set.first().cloned().unwrap_or_default();
            self.result = Some(set);
        } else {
            self.row_count = 0;
            self.row_buffer = Row::default();
            self.result = None;
        }
    }

    // =========================================================================
    // CRUD helpers
    // =========================================================================

    /// Insert a row built from `fields`, capturing the auto-generated key.
    ///
    /// Returns `false` without touching the database when `fields` is empty.
    /// Failures are logged and reported through the error accessors.
    pub async fn create(&mut self, table: &str, fields: &Assignments) -> bool {
        if fields.is_empty() {
            warn!(
                database = %self.params.database,
                table = table,
                "create cancelled, no fields to insert"
            );
            return false;
        }

        self.primary_key = None;

        let rendered = fields.render();
        let sql = format!("INSERT INTO {table} SET {}", rendered.fragment);
        if let Err(e) = self.execute_with_params(&sql, &rendered.params).await {
            warn!(error = %e, "INSERT action failed");
        }
        !self.has_error()
    }

    /// Insert a bare row, either forcing `explicit_key` or letting the server
    /// assign one. Returns the key now associated with the row, if any.
    ///
    /// This is the low-level allocation primitive behind [`Session::insert_update`];
    /// use [`Session::create`] to insert actual column data.
    pub async fn insert(&mut self, table: &str, explicit_key: Option<u64>) -> Option<u64> {
        self.primary_key = None;

        match explicit_key {
            Some(key) if key != 0 => {
                self.primary_key = Some(key);
                let sql = format!(
                    "INSERT INTO {table} SET {} = ?",
                    quote_ident(PRIMARY_KEY_COLUMN)
                );
                if let Err(e) = self.execute_with_params(&sql, &[SqlParam::Uint(key)]).await {
                    warn!(error = %e, "INSERT PRIMARY KEY action failed");
                }
                // A forced key generates no insert id, so verify the write
                if self.has_error() || self.affected_rows == 0 {
                    self.primary_key = None;
                } else {
                    self.primary_key = Some(key);
                }
            }
            _ => {
                let sql = format!("INSERT INTO {table} VALUES ()");
                if let Err(e) = self.execute(&sql).await {
                    warn!(error = %e, "INSERT action failed");
                }
            }
        }
        self.primary_key
    }

    /// Update the row matched by `key`, binding every assignment and the key.
    ///
    /// `match_column` defaults to [`PRIMARY_KEY_COLUMN`]. Returns `false`
    /// without touching the database when `fields` is empty.
    pub async fn update(
        &mut self,
        table: &str,
        fields: &Assignments,
        key: impl Into<SqlParam>,
        match_column: Option<&str>,
    ) -> bool {
        if fields.is_empty() {
            warn!(
                database = %self.params.database,
                table = table,
                "update cancelled, no fields to set"
            );
            return false;
        }

        let column = match_column.unwrap_or(PRIMARY_KEY_COLUMN);
        let rendered = fields.render();
        let sql = format!(
            "UPDATE {table} SET {} WHERE {} = ?",
            rendered.fragment,
            quote_ident(column)
        );
        let mut params = rendered.params;
        params.push(key.into());
        if let Err(e) = self.execute_with_params(&sql, &params).await {
            warn!(error = %e, "UPDATE action failed");
        }
        !self.has_error()
    }

    /// Insert a bare row, then update it with `fields` using the fresh key.
    pub async fn insert_update(
        &mut self,
        table: &str,
        fields: &Assignments,
        match_column: Option<&str>,
    ) -> bool {
        let Some(key) = self.insert(table, None).await else {
            return false;
        };
        self.update(table, fields, key, match_column).await
    }

    /// Insert or, on a duplicate key, update in one statement.
    ///
    /// Fields named in `excluded_on_update` are written on insert but left
    /// untouched by the update clause, which keeps creation metadata stable.
    pub async fn upsert_on_duplicate(
        &mut self,
        table: &str,
        fields: &Assignments,
        excluded_on_update: &[&str],
    ) -> bool {
        if fields.is_empty() {
            warn!(
                database = %self.params.database,
                table = table,
                "upsert cancelled, no fields to set"
            );
            return false;
        }

        self.primary_key = None;

        let insert = fields.render();
        let update = fields.without(excluded_on_update).render();
        let sql = format!(
            "INSERT INTO {table} SET {} ON DUPLICATE KEY UPDATE {}",
            insert.fragment, update.fragment
        );
        let mut params = insert.params;
        params.extend(update.params);
        if let Err(e) = self.execute_with_params(&sql, &params).await {
            warn!(error = %e, "INSERT ON DUPLICATE KEY UPDATE failed");
        }
        !self.has_error()
    }

    /// Delete the rows whose `match_column` value is in `keys`.
    ///
    /// With an empty key list nothing runs and the current error state is
    /// returned unchanged.
    pub async fn delete(
        &mut self,
        table: &str,
        keys: &[SqlParam],
        match_column: Option<&str>,
    ) -> bool {
        let column = match_column.unwrap_or(PRIMARY_KEY_COLUMN);

        if keys.is_empty() {
            return !self.has_error();
        }

        let sql = if keys.len() == 1 {
            format!("DELETE FROM {table} WHERE {} = ?", quote_ident(column))
        } else {
            let placeholders = vec!["?"; keys.len()].join(", ");
            format!(
                "DELETE FROM {table} WHERE {} IN ({placeholders})",
                quote_ident(column)
            )
        };
        if let Err(e) = self.execute_with_params(&sql, keys).await {
            warn!(error = %e, "DELETE action failed");
        }
        !self.has_error()
    }

    /// Allocate an unused random key for `table`.
    ///
    /// Candidates are ten digit numbers shaped `1` + four random digits +
    /// five random digits, probed against the table until one is free. A
    /// lost connection reconnects and keeps probing. Gives up with
    /// [`Error::KeyAllocation`] after a fixed number of probes.
    pub async fn allocate_random_key(&mut self, table: &str) -> Result<u64> {
        let sql = format!(
            "SELECT {PRIMARY_KEY_COLUMN} FROM {table} WHERE {} = ?",
            quote_ident(PRIMARY_KEY_COLUMN)
        );

        for _ in 0..KEY_ALLOCATION_ATTEMPTS {
            // The thread-local generator is not Send, so it never lives
            // across the probe await
            let candidate = {
                let mut rng = rand::thread_rng();
                let high: u64 = rng.gen_range(1000..=9999);
                let low: u64 = rng.gen_range(10_000..=99_999);
                1_000_000_000 + high * 100_000 + low
            };

            // Probes run directly on the driver so the session's statement
            // state is left alone
            match self.driver.execute(&sql, &[SqlParam::Uint(candidate)]).await {
                Ok(outcome) if outcome.rows.is_empty() => return Ok(candidate),
                Ok(_) => {}
                Err(e) if e.is_connection_loss() => {
                    warn!(
                        error = %e,
                        table = table,
                        "Lost connection during key probe, reconnecting"
                    );
                    self.reopen().await?;
                }
                Err(e) => warn!(error = %e, table = table, "Primary key probe failed"),
            }
        }
        Err(Error::key_allocation(table, KEY_ALLOCATION_ATTEMPTS))
    }

    /// Switch the session to another database on the same server.
    pub async fn use_database(&mut self, database: &str) -> Result<()> {
        let sql = format!("USE {}", quote_ident(database));
        match self.execute(&sql).await {
            Ok(_) => {
                // Keep params in step so logging and reconnects target the
                // database that is actually active
                self.params.database = database.to_string();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, database = database, "Switching database failed");
                Err(e)
            }
        }
    }

    // =========================================================================
    // Row access
    // =========================================================================

    /// Fetch the next row of the buffered result set.
    ///
    /// Returns `None` when no result set is present, an error is pending,
    /// or the set is exhausted. Never fails.
    pub fn fetch_one(&mut self) -> Option<Row> {
        if self.has_error() {
            return None;
        }
        let row = self
            .result
            .as_mut()
            .and_then(|set| set.next_row())
            .cloned()?;
        self.row_buffer = row.clone();
        Some(row)
    }

    /// Collect every row of the buffered result set, releasing it afterwards.
    ///
    /// Rows come back in result order starting at row zero regardless of the
    /// cursor position. The set is one-shot: after this call the session no
    /// longer holds a result.
    pub fn fetch_all(&mut self) -> Vec<Row> {
        if self.has_error() {
            return Vec::new();
        }
        let Some(set) = self.result.take() else {
            return Vec::new();
        };
        let rows = set.into_rows();
        if let Some(last) = rows.last() {
            self.row_buffer = last.clone();
        }
        rows
    }

    /// Project one column out of `rows`, or out of the buffered result set
    /// when `rows` is `None`.
    ///
    /// Missing columns are skipped silently unless strict column mode is
    /// enabled, in which case they fail with [`Error::ColumnNotFound`].
    pub fn extract_column(
        &mut self,
        column: &str,
        rows: Option<&[Row]>,
    ) -> Result<Vec<JsonValue>> {
        let strict = self.strict_columns;
        match rows {
            Some(rows) => project_column(column, rows, strict),
            None => {
                let Some(set) = self.result.as_mut() else {
                    return Ok(Vec::new());
                };
                let values = project_column(column, set.rows(), strict);
                set.rewind();
                values
            }
        }
    }

    // =========================================================================
    // Diagnostics and state accessors
    // =========================================================================

    /// Whether the last statement left a non-zero error code.
    pub fn has_error(&self) -> bool {
        self.error_code != 0
    }

    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// One-line summary of the last error state.
    pub fn last_error(&self) -> String {
        format!(
            "Database: {}, Error ID: {} :: {} :: {} :: {}",
            self.params.database,
            self.error_code,
            self.error_message,
            self.last_sql,
            self.reported_encoding
        )
    }

    /// Multi-line error report with the SQL text and active encoding.
    pub fn last_error_verbose(&self) -> String {
        format!(
            "Database: {}\n Error ID: {}\n Error message:{}\n SQL: {}\n Encoding: {}",
            self.params.database,
            self.error_code,
            self.error_message,
            self.last_sql,
            self.reported_encoding
        )
    }

    /// Diagnostic log line for the last statement: database, SQL, error,
    /// affected rows, and encoding.
    pub fn last_statement_log(&self) -> &str {
        &self.statement_log
    }

    pub fn last_sql(&self) -> &str {
        &self.last_sql
    }

    pub fn statement_kind(&self) -> Option<&StatementKind> {
        self.kind.as_ref()
    }

    /// Rows in the buffered result set.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Affected row count as the driver reported it.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// The most recently buffered row: the first row right after execution,
    /// then whatever [`Session::fetch_one`] returned last.
    pub fn buffered_row(&self) -> &Row {
        &self.row_buffer
    }

    pub fn result(&self) -> Option<&ResultSet> {
        self.result.as_ref()
    }

    /// The captured primary key, if the last insert produced one.
    pub fn primary_key(&self) -> Option<u64> {
        self.primary_key
    }

    /// Set the primary key; zero clears it.
    pub fn set_primary_key(&mut self, key: u64) {
        self.primary_key = non_zero_key(key);
    }

    pub fn clear_primary_key(&mut self) {
        self.primary_key = None;
    }

    /// The key of the last inserted row.
    ///
    /// Fails with [`Error::MissingKey`] when an error is pending or no key
    /// was captured.
    pub fn last_inserted_key(&self) -> Result<u64> {
        if self.has_error() {
            let detail = format!("Missing {PRIMARY_KEY_COLUMN}. {}", self.last_error());
            warn!("{detail}");
            return Err(Error::missing_key(detail));
        }
        self.primary_key.ok_or_else(|| {
            Error::missing_key(format!(
                "No key captured for the last statement in {}",
                self.params.database
            ))
        })
    }

    /// Like [`Session::last_inserted_key`] but never fails: a pending error
    /// clears the key and `None` comes back instead.
    pub fn last_inserted_key_silent(&mut self) -> Option<u64> {
        if self.has_error() {
            self.primary_key = None;
        }
        self.primary_key
    }

    pub fn database(&self) -> &str {
        &self.params.database
    }

    pub fn connection_params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Character set and collation as last reported by the server.
    pub fn encoding(&self) -> &str {
        &self.reported_encoding
    }

    pub fn encoding_mode(&self) -> EncodingMode {
        self.encoding_mode
    }

    /// Whether a registry may hand this session out again. Sessions pinned to
    /// utf8mb4 are always rebuilt.
    pub fn is_reusable(&self) -> bool {
        self.encoding_mode != EncodingMode::Utf8mb4
    }

    /// Failed connect attempts behind the current handle; zero after any
    /// successful connect.
    pub fn failed_connects(&self) -> u32 {
        self.failed_connects
    }

    /// Skip mutating statements, letting only SELECT reach the database.
    pub fn set_test_mode(&mut self, enabled: bool) {
        self.test_mode = enabled;
    }

    /// Log DELETE, DROP, and TRUNCATE statements as they run.
    pub fn set_track_deleted(&mut self, enabled: bool) {
        self.track_deleted = enabled;
    }

    /// Make [`Session::extract_column`] fail on missing columns instead of
    /// skipping them.
    pub fn set_strict_columns(&mut self, enabled: bool) {
        self.strict_columns = enabled;
    }
}

// The driver handles are trait objects, so derive(Debug) is unavailable;
// render the diagnostic state and keep credentials out of the output.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("database", &self.params.database)
            .field("host", &self.params.host)
            .field("encoding_mode", &self.encoding_mode)
            .field("last_sql", &self.last_sql)
            .field("error_code", &self.error_code)
            .field("test_mode", &self.test_mode)
            .finish_non_exhaustive()
    }
}

fn non_zero_key(key: u64) -> Option<u64> {
    (key != 0).then_some(key)
}

fn is_transient(err: &Error) -> bool {
    err.mysql_code()
        .is_some_and(|code| code == CR_SERVER_GONE_ERROR || code == CR_SERVER_LOST)
}

fn project_column(column: &str, rows: &[Row], strict: bool) -> Result<Vec<JsonValue>> {
    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        match row.get(column) {
            Some(value) => values.push(value.clone()),
            None if strict => return Err(Error::column_not_found(column)),
            None => {}
        }
    }
    Ok(values)
}
