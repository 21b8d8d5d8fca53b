//! sqlx-backed MySQL driver.
//!
//! [`MySqlConnector`] opens one plain [`MySqlConnection`] per session; this
//! mirrors the classic one-handle-per-instance model rather than a pool.
//! [`SqlxDriver`] wraps the handle behind the [`Driver`] trait and decodes
//! result rows into column-name/JSON pairs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::mysql::{
    MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlTypeInfo, MySqlValueRef,
};
use sqlx::{Column, ConnectOptions, Connection, Decode, Either, Executor, Row as _, Type, TypeInfo};
use tracing::debug;

use crate::config::ConnectionParams;
use crate::db::driver::{
    CR_SERVER_GONE_ERROR, CR_SERVER_LOST, Connector, Driver, DriverError, SessionEncoding,
    StatementOutcome,
};
use crate::models::{Row, SqlParam};

/// MySQL client error code: can't connect to server.
const CR_CONNECTION_ERROR: u32 = 2002;
/// MySQL client error code: unknown client-side failure.
const CR_UNKNOWN_ERROR: u32 = 2000;

/// Opens plain sqlx connections from [`ConnectionParams`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Driver>, DriverError> {
        debug!(
            host = %params.host,
            port = params.port,
            database = %params.database,
            "Opening MySQL connection"
        );

        let conn = connect_options(params)
            .connect()
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) => database_error(db),
                other => DriverError::new(CR_CONNECTION_ERROR, other.to_string()),
            })?;

        Ok(Box::new(SqlxDriver { conn: Some(conn) }))
    }
}

fn connect_options(params: &ConnectionParams) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.username)
        .database(&params.database);
    if !params.password.is_empty() {
        options = options.password(&params.password);
    }
    if let Some(charset) = &params.charset {
        options = options.charset(charset);
    }
    if let Some(collation) = &params.collation {
        options = options.collation(collation);
    }
    options
}

/// [`Driver`] over a single live [`MySqlConnection`].
///
/// The handle is consumed on [`Driver::close`]; later calls fail with
/// [`CR_SERVER_GONE_ERROR`] just as a dropped socket would.
pub struct SqlxDriver {
    conn: Option<MySqlConnection>,
}

impl SqlxDriver {
    fn handle(&mut self) -> Result<&mut MySqlConnection, DriverError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DriverError::new(CR_SERVER_GONE_ERROR, "MySQL server has gone away"))
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<StatementOutcome, DriverError> {
        let conn = self.handle()?;

        debug!(sql = %sql, params = params.len(), "Executing statement");

        // Parameter-free statements go over the text protocol; USE and SET
        // cannot run as prepared statements.
        let mut stream = if params.is_empty() {
            conn.fetch_many(sql)
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            query.fetch_many(&mut *conn)
        };

        let mut outcome = StatementOutcome::default();
        while let Some(step) = stream.try_next().await.map_err(map_sqlx_error)? {
            match step {
                Either::Left(result) => {
                    outcome.affected_rows = result.rows_affected();
                    outcome.last_insert_id = result.last_insert_id();
                }
                Either::Right(row) => outcome.rows.push(decode_row(&row)),
            }
        }
        Ok(outcome)
    }

    async fn encoding(&mut self) -> Result<SessionEncoding, DriverError> {
        let conn = self.handle()?;
        let row = sqlx::query("SELECT @@character_set_connection, @@collation_connection")
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        let charset: String = row.try_get(0).map_err(map_sqlx_error)?;
        let collation: String = row.try_get(1).map_err(map_sqlx_error)?;
        Ok(SessionEncoding::new(charset, collation))
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(map_sqlx_error)?;
        }
        Ok(())
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
    param: &'q SqlParam,
) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Uint(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.as_str()),
        SqlParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn database_error(db: Box<dyn sqlx::error::DatabaseError>) -> DriverError {
    let code = db
        .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
        .map(|e| u32::from(e.number()))
        .unwrap_or(CR_UNKNOWN_ERROR);
    DriverError::new(code, db.message().to_string())
}

fn map_sqlx_error(err: sqlx::Error) -> DriverError {
    match err {
        sqlx::Error::Database(db) => database_error(db),
        sqlx::Error::Io(e) => DriverError::new(
            CR_SERVER_LOST,
            format!("Lost connection to MySQL server during query: {e}"),
        ),
        sqlx::Error::Protocol(message) => DriverError::new(CR_SERVER_LOST, message),
        sqlx::Error::Tls(e) => DriverError::new(CR_SERVER_LOST, e.to_string()),
        other => DriverError::new(CR_UNKNOWN_ERROR, other.to_string()),
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Logical category for MySQL column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Temporal,
    Binary,
    Json,
    Unknown,
}

fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal first; "numeric" would otherwise be caught by later checks
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Decimal;
    }

    // YEAR travels as a small integer on the wire
    if lower.contains("int") || lower == "year" {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" {
        return TypeCategory::Json;
    }

    if lower.contains("date") || lower.contains("time") {
        return TypeCategory::Temporal;
    }

    if lower.contains("blob") || lower.contains("binary") {
        return TypeCategory::Binary;
    }

    // Everything else (varchar, text, char, enum, set) reads as text
    TypeCategory::Unknown
}

fn decode_row(row: &MySqlRow) -> Row {
    let mut columns = Vec::with_capacity(row.columns().len());
    let mut values = Vec::with_capacity(row.columns().len());
    for (idx, col) in row.columns().iter().enumerate() {
        let type_name = col.type_info().name();
        let category = categorize_type(type_name);
        columns.push(col.name().to_string());
        values.push(decode_column(row, idx, type_name, category));
    }
    Row::new(columns, values)
}

fn decode_column(row: &MySqlRow, idx: usize, type_name: &str, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Decimal => decode_decimal(row, idx),
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Temporal => decode_temporal(row, idx, type_name),
        TypeCategory::Binary => decode_binary_col(row, idx),
        TypeCategory::Json => decode_json_value(row, idx),
        TypeCategory::Unknown => decode_text(row, idx),
    }
}

fn decode_decimal(row: &MySqlRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<RawDecimal>, _>(idx) {
        Ok(Some(v)) => JsonValue::String(v.0),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::error!("Failed to decode DECIMAL: {:?}", e);
            JsonValue::Null
        }
    }
}

fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
    // Check NULL first
    if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Null;
    }
    // Try signed types
    if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    // Try unsigned types
    if let Ok(Some(v)) = row.try_get::<Option<u8>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<u16>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    JsonValue::Null
}

fn decode_boolean(row: &MySqlRow, idx: usize) -> JsonValue {
    row.try_get::<Option<bool>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::Bool)
        .unwrap_or(JsonValue::Null)
}

fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
        return serde_json::Number::from_f64(v as f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    JsonValue::Null
}

fn decode_temporal(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
    let lower = type_name.to_lowercase();
    if lower == "date" {
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return JsonValue::String(v.format("%Y-%m-%d").to_string());
        }
    } else if lower == "time" {
        if let Ok(Some(v)) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return JsonValue::String(v.format("%H:%M:%S").to_string());
        }
    } else {
        // DATETIME and TIMESTAMP
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return JsonValue::String(v.format("%Y-%m-%d %H:%M:%S").to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return JsonValue::String(v.format("%Y-%m-%d %H:%M:%S").to_string());
        }
    }
    // NULL, or a zero date chrono cannot represent
    decode_text(row, idx)
}

fn decode_binary_col(row: &MySqlRow, idx: usize) -> JsonValue {
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| decode_binary_value(&v))
        .unwrap_or(JsonValue::Null)
}

fn decode_json_value(row: &MySqlRow, idx: usize) -> JsonValue {
    // MySQL JSON decodes as serde_json::Value directly
    row.try_get::<Option<JsonValue>, _>(idx)
        .ok()
        .flatten()
        .unwrap_or(JsonValue::Null)
}

fn decode_text(row: &MySqlRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return JsonValue::String(v);
    }
    JsonValue::Null
}

/// Decode binary data, preferring UTF-8 text and falling back to base64.
fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::String(STANDARD.encode(bytes)),
    }
}

/// Wrapper keeping DECIMAL/NUMERIC values in their exact string form.
#[derive(Debug)]
struct RawDecimal(String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type() {
        assert_eq!(categorize_type("DECIMAL"), TypeCategory::Decimal);
        assert_eq!(categorize_type("BIGINT UNSIGNED"), TypeCategory::Integer);
        assert_eq!(categorize_type("YEAR"), TypeCategory::Integer);
        assert_eq!(categorize_type("BOOLEAN"), TypeCategory::Boolean);
        assert_eq!(categorize_type("DOUBLE"), TypeCategory::Float);
        assert_eq!(categorize_type("JSON"), TypeCategory::Json);
        assert_eq!(categorize_type("DATETIME"), TypeCategory::Temporal);
        assert_eq!(categorize_type("TIMESTAMP"), TypeCategory::Temporal);
        assert_eq!(categorize_type("MEDIUMBLOB"), TypeCategory::Binary);
        assert_eq!(categorize_type("VARBINARY"), TypeCategory::Binary);
        assert_eq!(categorize_type("VARCHAR"), TypeCategory::Unknown);
        assert_eq!(categorize_type("ENUM"), TypeCategory::Unknown);
    }

    #[test]
    fn test_decode_binary_value_utf8_and_raw() {
        assert_eq!(
            decode_binary_value(b"hello"),
            JsonValue::String("hello".to_string())
        );
        // Invalid UTF-8 falls back to base64
        assert_eq!(
            decode_binary_value(&[0xff, 0xfe]),
            JsonValue::String("//4=".to_string())
        );
    }

    #[test]
    fn test_map_sqlx_error_io_is_connection_loss() {
        let err = map_sqlx_error(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        )));
        assert_eq!(err.code, CR_SERVER_LOST);
        assert!(err.is_connection_loss());
    }

    #[test]
    fn test_map_sqlx_error_other_is_not_retryable() {
        let err = map_sqlx_error(sqlx::Error::RowNotFound);
        assert_eq!(err.code, CR_UNKNOWN_ERROR);
        assert!(!err.is_connection_loss());
    }
}
