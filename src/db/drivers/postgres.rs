// PostgreSQL Driver
// bb8 pooled tokio-postgres connections; values cross the wire in binary form

use crate::db::builder::Statement;
use crate::db::dialect::{DatabaseType, Dialect, ReturningMode};
use crate::db::traits::{
    Connection, DatabaseConfig, DatabaseDriver, DatabaseError, DriverError, ExecResult,
    InsertResult, TransactionHandle,
};
use crate::db::transaction::IsolationLevel;
use crate::db::value::{Row, RowSet, SqlValue};
use bb8::{Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager as Bb8PostgresManager;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

pub type PostgresPool = Pool<Bb8PostgresManager<NoTls>>;

type BoxError = Box<dyn Error + Sync + Send>;

// ============================================================================
// Error mapping
// ============================================================================

fn map_pg_error(e: tokio_postgres::Error) -> DatabaseError {
    let mut err = match e.as_db_error() {
        Some(db) => DriverError::new(DatabaseType::Postgresql, db.message())
            .with_sql_state(db.code().code()),
        None => DriverError::new(DatabaseType::Postgresql, e.to_string()),
    };
    if e.is_closed() {
        err = err.connection_lost();
    }
    DatabaseError::Driver(err)
}

fn map_run_error(e: RunError<tokio_postgres::Error>) -> DatabaseError {
    match e {
        RunError::User(e) => map_pg_error(e),
        RunError::TimedOut => DatabaseError::Timeout,
    }
}

// ============================================================================
// Parameter binding
// ============================================================================

fn is_text(ty: &Type) -> bool {
    [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME, Type::UNKNOWN].contains(ty)
}

fn is_json(ty: &Type) -> bool {
    *ty == Type::JSON || *ty == Type::JSONB
}

fn bind_int(v: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::INT2 {
        i16::try_from(v)?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        i32::try_from(v)?.to_sql(ty, out)
    } else if *ty == Type::INT8 {
        v.to_sql(ty, out)
    } else if *ty == Type::FLOAT4 {
        (v as f32).to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        (v as f64).to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        Decimal::from(v).to_sql(ty, out)
    } else if *ty == Type::BOOL {
        (v != 0).to_sql(ty, out)
    } else if *ty == Type::OID {
        u32::try_from(v)?.to_sql(ty, out)
    } else if is_text(ty) {
        v.to_string().to_sql(ty, out)
    } else if is_json(ty) {
        serde_json::Value::from(v).to_sql(ty, out)
    } else {
        Err(format!("cannot bind an integer to {}", ty).into())
    }
}

fn bind_text(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if is_text(ty) {
        s.to_sql(ty, out)
    } else if is_json(ty) {
        let json = serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.to_string()));
        json.to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        s.trim().parse::<Decimal>()?.to_sql(ty, out)
    } else if [Type::INT2, Type::INT4, Type::INT8, Type::OID].contains(ty) {
        bind_int(s.trim().parse::<i64>()?, ty, out)
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
        SqlValue::Float(s.trim().parse::<f64>()?).to_sql(ty, out)
    } else if *ty == Type::BOOL {
        let b = match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => true,
            "false" | "f" | "0" | "no" | "n" => false,
            other => return Err(format!("invalid boolean: {}", other).into()),
        };
        b.to_sql(ty, out)
    } else if *ty == Type::UUID {
        uuid::Uuid::parse_str(s.trim())?.to_sql(ty, out)
    } else if *ty == Type::DATE {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?.to_sql(ty, out)
    } else if *ty == Type::TIMESTAMP || *ty == Type::TIMESTAMPTZ {
        let dt = parse_timestamp(s.trim())?;
        SqlValue::DateTime(dt).to_sql(ty, out)
    } else if *ty == Type::TIME {
        NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")?.to_sql(ty, out)
    } else if *ty == Type::BYTEA {
        s.as_bytes().to_sql(ty, out)
    } else {
        Err(format!("cannot bind text to {}", ty).into())
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, BoxError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt);
        }
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    Ok(date.and_time(NaiveTime::MIN))
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => {
                if *ty == Type::BOOL {
                    b.to_sql(ty, out)
                } else {
                    bind_int(i64::from(*b), ty, out)
                }
            }
            SqlValue::Int(v) => bind_int(*v, ty, out),
            SqlValue::Float(f) => {
                if *ty == Type::FLOAT8 {
                    f.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::try_from(*f)?.to_sql(ty, out)
                } else if is_text(ty) {
                    f.to_string().to_sql(ty, out)
                } else if is_json(ty) {
                    serde_json::Value::from(*f).to_sql(ty, out)
                } else {
                    Err(format!("cannot bind a float to {}", ty).into())
                }
            }
            SqlValue::Decimal(s) | SqlValue::String(s) => bind_text(s, ty, out),
            SqlValue::DateTime(dt) => {
                if *ty == Type::TIMESTAMP {
                    dt.to_sql(ty, out)
                } else if *ty == Type::TIMESTAMPTZ {
                    Utc.from_utc_datetime(dt).to_sql(ty, out)
                } else if *ty == Type::DATE {
                    dt.date().to_sql(ty, out)
                } else if is_text(ty) {
                    dt.to_string().to_sql(ty, out)
                } else {
                    Err(format!("cannot bind a timestamp to {}", ty).into())
                }
            }
            SqlValue::Uuid(u) => {
                if *ty == Type::UUID {
                    u.to_sql(ty, out)
                } else {
                    bind_text(&u.to_string(), ty, out)
                }
            }
            SqlValue::Bytes(b) => b.as_slice().to_sql(ty, out),
            SqlValue::Json(json) => {
                if is_json(ty) {
                    json.to_sql(ty, out)
                } else {
                    bind_text(&json.to_string(), ty, out)
                }
            }
            SqlValue::Array(items) => match ty.kind() {
                Kind::Array(_) => items.to_sql(ty, out),
                _ if is_json(ty) => self.to_json().to_sql(ty, out),
                _ => bind_text(&self.to_json().to_string(), ty, out),
            },
            SqlValue::Expression(e) => {
                Err(format!("expression {} must be inlined before binding", e).into())
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

// ============================================================================
// Row decoding
// ============================================================================

/// Any column value, decoded by the column's type
struct PgCell(SqlValue);

impl<'a> FromSql<'a> for PgCell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        let value = if *ty == Type::BOOL {
            SqlValue::Bool(bool::from_sql(ty, raw)?)
        } else if *ty == Type::INT2 {
            SqlValue::Int(i64::from(i16::from_sql(ty, raw)?))
        } else if *ty == Type::INT4 {
            SqlValue::Int(i64::from(i32::from_sql(ty, raw)?))
        } else if *ty == Type::INT8 {
            SqlValue::Int(i64::from_sql(ty, raw)?)
        } else if *ty == Type::OID {
            SqlValue::Int(i64::from(u32::from_sql(ty, raw)?))
        } else if *ty == Type::FLOAT4 {
            SqlValue::Float(f64::from(f32::from_sql(ty, raw)?))
        } else if *ty == Type::FLOAT8 {
            SqlValue::Float(f64::from_sql(ty, raw)?)
        } else if *ty == Type::NUMERIC {
            SqlValue::Decimal(Decimal::from_sql(ty, raw)?.to_string())
        } else if is_json(ty) {
            SqlValue::Json(serde_json::Value::from_sql(ty, raw)?)
        } else if *ty == Type::UUID {
            SqlValue::Uuid(uuid::Uuid::from_sql(ty, raw)?)
        } else if *ty == Type::TIMESTAMP {
            SqlValue::DateTime(NaiveDateTime::from_sql(ty, raw)?)
        } else if *ty == Type::TIMESTAMPTZ {
            SqlValue::DateTime(DateTime::<Utc>::from_sql(ty, raw)?.naive_utc())
        } else if *ty == Type::DATE {
            SqlValue::DateTime(NaiveDate::from_sql(ty, raw)?.and_time(NaiveTime::MIN))
        } else if *ty == Type::TIME {
            SqlValue::String(NaiveTime::from_sql(ty, raw)?.to_string())
        } else if *ty == Type::BYTEA {
            SqlValue::Bytes(raw.to_vec())
        } else if let Kind::Array(_) = ty.kind() {
            let items = Vec::<PgCell>::from_sql(ty, raw)?;
            SqlValue::Array(items.into_iter().map(|cell| cell.0).collect())
        } else {
            // text, enums, domains and extension types send text
            match std::str::from_utf8(raw) {
                Ok(s) => SqlValue::String(s.to_string()),
                Err(_) => SqlValue::Bytes(raw.to_vec()),
            }
        };
        Ok(PgCell(value))
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(PgCell(SqlValue::Null))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn rows_to_rowset(rows: Vec<tokio_postgres::Row>) -> Result<RowSet, DatabaseError> {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Row::with_capacity(columns.len());
        for (idx, column) in row.columns().iter().enumerate() {
            let cell: PgCell = row.try_get(idx).map_err(map_pg_error)?;
            values.insert(column.name().to_string(), cell.0);
        }
        out.push(values);
    }
    Ok(RowSet::new(columns, out))
}

fn params(statement: &Statement) -> Vec<&(dyn ToSql + Sync)> {
    statement
        .params
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect()
}

async fn run_query(client: &Client, statement: &Statement) -> Result<RowSet, DatabaseError> {
    let rows = client
        .query(statement.sql.as_str(), &params(statement))
        .await
        .map_err(map_pg_error)?;
    rows_to_rowset(rows)
}

async fn run_execute(client: &Client, statement: &Statement) -> Result<ExecResult, DatabaseError> {
    let affected = client
        .execute(statement.sql.as_str(), &params(statement))
        .await
        .map_err(map_pg_error)?;
    Ok(ExecResult::affected(affected))
}

async fn run_insert(
    client: &Client,
    statement: &Statement,
    mode: &ReturningMode,
) -> Result<InsertResult, DatabaseError> {
    if *mode != ReturningMode::Row {
        return Err(DatabaseError::InvalidRequest(format!(
            "{:?} is not an insert mode of PostgreSQL",
            mode
        )));
    }
    let rowset = run_query(client, statement).await?;
    rowset
        .into_first()
        .map(InsertResult::RowReturned)
        .ok_or_else(|| DatabaseError::NoIdReturned("INSERT returned no row".to_string()))
}

// ============================================================================
// Connection
// ============================================================================

pub struct PostgresConnection {
    id: String,
    pool: PostgresPool,
    closed: AtomicBool,
}

impl PostgresConnection {
    fn pool(&self) -> Result<&PostgresPool, DatabaseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::NotConnected(format!("{} is closed", self.id)));
        }
        Ok(&self.pool)
    }

    async fn client(
        &self,
    ) -> Result<PooledConnection<'_, Bb8PostgresManager<NoTls>>, DatabaseError> {
        self.pool()?.get().await.map_err(map_run_error)
    }
}

#[async_trait::async_trait]
impl Connection for PostgresConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.map_err(map_pg_error)?;
        Ok(())
    }

    async fn query(&self, statement: &Statement) -> Result<RowSet, DatabaseError> {
        let client = self.client().await?;
        run_query(&client, statement).await
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecResult, DatabaseError> {
        let client = self.client().await?;
        run_execute(&client, statement).await
    }

    async fn insert(
        &self,
        statement: &Statement,
        mode: &ReturningMode,
    ) -> Result<InsertResult, DatabaseError> {
        let client = self.client().await?;
        run_insert(&client, statement, mode).await
    }

    async fn execute_batch(&self, sql: &str) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client.batch_execute(sql).await.map_err(map_pg_error)
    }

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn TransactionHandle>, DatabaseError> {
        let conn = self.pool()?.get_owned().await.map_err(map_run_error)?;
        let begin = match crate::db::dialect::PostgresDialect.isolation_level_sql(isolation) {
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level),
            None => "BEGIN".to_string(),
        };
        conn.batch_execute(&begin).await.map_err(map_pg_error)?;
        Ok(Box::new(PostgresTransaction { conn: Some(conn) }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!(connection_id = %self.id, "PostgreSQL pool closed");
    }
}

// ============================================================================
// Transaction
// ============================================================================

type OwnedPgConnection = PooledConnection<'static, Bb8PostgresManager<NoTls>>;

pub struct PostgresTransaction {
    /// Taken once COMMIT or ROLLBACK ran
    conn: Option<OwnedPgConnection>,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&OwnedPgConnection, DatabaseError> {
        self.conn.as_ref().ok_or(DatabaseError::TransactionFinished)
    }

    async fn finish(&mut self, sql: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.take().ok_or(DatabaseError::TransactionFinished)?;
        match conn.batch_execute(sql).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // COMMIT failed: keep the connection so a ROLLBACK can still run
                if sql == "COMMIT" && !e.is_closed() {
                    self.conn = Some(conn);
                }
                Err(map_pg_error(e))
            }
        }
    }
}

#[async_trait::async_trait]
impl TransactionHandle for PostgresTransaction {
    async fn query(&mut self, statement: &Statement) -> Result<RowSet, DatabaseError> {
        run_query(self.client()?, statement).await
    }

    async fn execute(&mut self, statement: &Statement) -> Result<ExecResult, DatabaseError> {
        run_execute(self.client()?, statement).await
    }

    async fn insert(
        &mut self,
        statement: &Statement,
        mode: &ReturningMode,
    ) -> Result<InsertResult, DatabaseError> {
        run_insert(self.client()?, statement, mode).await
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = conn.batch_execute("ROLLBACK").await {
                            warn!(error = %e, "rollback of abandoned transaction failed");
                        }
                    });
                }
                Err(_) => warn!("abandoned transaction dropped outside a runtime"),
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// PostgreSQL driver implementation
pub struct PostgresDriver;

impl PostgresDriver {
    /// Create a new PostgreSQL driver
    pub fn new() -> Self {
        Self
    }

    fn build_manager(config: &DatabaseConfig) -> Result<Bb8PostgresManager<NoTls>, DatabaseError> {
        Bb8PostgresManager::new_from_stringlike(config.connection_string()?, NoTls)
            .map_err(|e| DatabaseError::ConfigurationError(e.to_string()))
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for PostgresDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn Connection>, DatabaseError> {
        config.validate()?;
        let manager = Self::build_manager(config)?;
        let pool = Pool::builder()
            .max_size(config.pool.max_size)
            .min_idle(config.pool.min_idle)
            .connection_timeout(Duration::from_secs(config.pool.connect_timeout_secs))
            .build(manager)
            .await
            .map_err(map_pg_error)?;

        let connection = PostgresConnection {
            id: config.name_id.clone(),
            pool,
            closed: AtomicBool::new(false),
        };
        // bb8 dials lazily, so prove the server answers
        connection.ping().await?;
        info!(
            database = %config.name_id,
            target = %config.non_sensitive_connection_string(),
            "PostgreSQL pool ready"
        );
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(text: &str) -> BytesMut {
        let mut out = BytesMut::new();
        SqlValue::Decimal(text.into()).to_sql(&Type::NUMERIC, &mut out).unwrap();
        out
    }

    #[test]
    fn test_driver_type() {
        let driver = PostgresDriver::new();
        assert_eq!(driver.database_type(), DatabaseType::Postgresql);
        assert_eq!(driver.driver_name(), "postgres");
    }

    #[test]
    fn test_numeric_keeps_digits_and_scale() {
        for text in ["0", "-1", "0.05", "12345.67", "-98765.4321", "1.10"] {
            let cell = PgCell::from_sql(&Type::NUMERIC, &numeric(text)).unwrap();
            assert_eq!(cell.0, SqlValue::Decimal(text.into()), "{}", text);
        }
        let cell = PgCell::from_sql(&Type::NUMERIC, &numeric(" 7.5 ")).unwrap();
        assert_eq!(cell.0, SqlValue::Decimal("7.5".into()));
    }

    #[test]
    fn test_numeric_binds_ints_and_floats() {
        let mut out = BytesMut::new();
        SqlValue::Int(42).to_sql(&Type::NUMERIC, &mut out).unwrap();
        assert_eq!(
            PgCell::from_sql(&Type::NUMERIC, &out).unwrap().0,
            SqlValue::Decimal("42".into())
        );

        let mut out = BytesMut::new();
        SqlValue::Float(2.5).to_sql(&Type::NUMERIC, &mut out).unwrap();
        assert_eq!(
            PgCell::from_sql(&Type::NUMERIC, &out).unwrap().0,
            SqlValue::Decimal("2.5".into())
        );
    }

    #[test]
    fn test_numeric_rejects_garbage() {
        let mut out = BytesMut::new();
        for text in ["12a", "", "abc"] {
            assert!(SqlValue::Decimal(text.into()).to_sql(&Type::NUMERIC, &mut out).is_err());
        }
        assert!(PgCell::from_sql(&Type::NUMERIC, &[0, 1]).is_err());
    }

    #[test]
    fn test_bind_int_narrows_to_column_type() {
        let mut out = BytesMut::new();
        SqlValue::Int(7).to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(out.as_ref(), &[0, 0, 0, 7]);

        let mut out = BytesMut::new();
        assert!(SqlValue::Int(i64::from(i32::MAX) + 1)
            .to_sql(&Type::INT4, &mut out)
            .is_err());

        let mut out = BytesMut::new();
        SqlValue::from("42").to_sql(&Type::INT2, &mut out).unwrap();
        assert_eq!(out.as_ref(), &[0, 42]);
    }

    #[test]
    fn test_bind_null_and_expression() {
        let mut out = BytesMut::new();
        assert!(matches!(
            SqlValue::Null.to_sql(&Type::INT8, &mut out).unwrap(),
            IsNull::Yes
        ));
        let expression = SqlValue::Expression(crate::db::value::SqlExpression::new("now()"));
        assert!(expression.to_sql(&Type::TIMESTAMP, &mut out).is_err());
    }

    #[test]
    fn test_decode_cells() {
        let cell = PgCell::from_sql(&Type::INT2, &[0, 5]).unwrap();
        assert_eq!(cell.0, SqlValue::Int(5));
        let cell = PgCell::from_sql(&Type::TEXT, b"north").unwrap();
        assert_eq!(cell.0, SqlValue::from("north"));
        let cell = PgCell::from_sql_null(&Type::TEXT).unwrap();
        assert_eq!(cell.0, SqlValue::Null);
        let raw = numeric("-3.5");
        let cell = PgCell::from_sql(&Type::NUMERIC, &raw).unwrap();
        assert_eq!(cell.0, SqlValue::Decimal("-3.5".into()));
    }

    #[test]
    fn test_parse_timestamp() {
        let dt = parse_timestamp("2024-03-01 10:20:30").unwrap();
        assert_eq!(dt.to_string(), "2024-03-01 10:20:30");
        let dt = parse_timestamp("2024-03-01").unwrap();
        assert_eq!(dt.to_string(), "2024-03-01 00:00:00");
        assert!(parse_timestamp("yesterday").is_err());
    }
}
