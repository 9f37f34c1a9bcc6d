// SQL Server Driver
// bb8-tiberius pool; statements carry @Pn placeholders bound through tiberius::Query

use crate::db::builder::Statement;
use crate::db::dialect::{DatabaseType, Dialect, ReturningMode, SqlServerDialect};
use crate::db::traits::{
    Connection, DatabaseConfig, DatabaseDriver, DatabaseError, DriverError, ExecResult,
    InsertResult, TransactionHandle,
};
use crate::db::transaction::IsolationLevel;
use crate::db::value::{Row as ValueRow, RowSet, SqlValue};
use bb8::{Pool, PooledConnection, RunError};
use bb8_tiberius::ConnectionManager;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, ColumnType, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::Compat;
use tracing::{debug, info, warn};

pub type MssqlPool = Pool<ConnectionManager>;
type MssqlClient = tiberius::Client<Compat<TcpStream>>;

// ============================================================================
// Error mapping
// ============================================================================

fn map_mssql_error(e: tiberius::error::Error) -> DatabaseError {
    let err = match &e {
        tiberius::error::Error::Server(token) => {
            DriverError::new(DatabaseType::Sqlserver, token.message())
                .with_code(token.code().to_string())
        }
        tiberius::error::Error::Io { .. } | tiberius::error::Error::Routing { .. } => {
            DriverError::new(DatabaseType::Sqlserver, e.to_string()).connection_lost()
        }
        _ => DriverError::new(DatabaseType::Sqlserver, e.to_string()),
    };
    DatabaseError::Driver(err)
}

fn map_run_error<E: std::fmt::Display>(e: RunError<E>) -> DatabaseError {
    match e {
        // checkout only fails while dialing or validating
        RunError::User(e) => DatabaseError::Driver(
            DriverError::new(DatabaseType::Sqlserver, e.to_string()).connection_lost(),
        ),
        RunError::TimedOut => DatabaseError::Timeout,
    }
}

// ============================================================================
// Binding and decoding
// ============================================================================

/// Decimal text as a tiberius Numeric, `None` when it does not parse
fn parse_numeric(text: &str) -> Option<Numeric> {
    let decimal: Decimal = text.trim().parse().ok()?;
    let scale = u8::try_from(decimal.scale()).ok()?;
    Some(Numeric::new_with_scale(decimal.mantissa(), scale))
}

fn bind_value(query: &mut Query<'_>, value: &SqlValue) -> Result<(), DatabaseError> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Decimal(s) => match parse_numeric(s) {
            Some(n) => query.bind(n),
            None => query.bind(s.clone()),
        },
        SqlValue::String(s) => query.bind(s.clone()),
        SqlValue::DateTime(dt) => query.bind(*dt),
        SqlValue::Uuid(u) => query.bind(u.to_string()),
        SqlValue::Bytes(b) => query.bind(b.clone()),
        SqlValue::Json(_) | SqlValue::Array(_) => query.bind(value.to_json().to_string()),
        SqlValue::Expression(e) => {
            return Err(DatabaseError::InvalidRequest(format!(
                "expression {} must be inlined before binding",
                e
            )))
        }
    }
    Ok(())
}

fn build_query(statement: &Statement) -> Result<Query<'_>, DatabaseError> {
    let mut query = Query::new(statement.sql.as_str());
    for value in &statement.params {
        bind_value(&mut query, value)?;
    }
    Ok(query)
}

/// Extract cell value from row
fn cell_value_from_row(row: &Row, idx: usize) -> SqlValue {
    let col_type = row
        .columns()
        .get(idx)
        .map(|c| c.column_type())
        .unwrap_or(ColumnType::Null);

    let value = match col_type {
        ColumnType::Null => None,

        // Integer types
        ColumnType::Int1 => row.try_get::<u8, _>(idx).ok().flatten().map(|v| SqlValue::Int(i64::from(v))),
        ColumnType::Int2 => row.try_get::<i16, _>(idx).ok().flatten().map(|v| SqlValue::Int(i64::from(v))),
        ColumnType::Int4 => row.try_get::<i32, _>(idx).ok().flatten().map(|v| SqlValue::Int(i64::from(v))),
        ColumnType::Int8 => row.try_get::<i64, _>(idx).ok().flatten().map(SqlValue::Int),
        ColumnType::Intn => row
            .try_get::<i64, _>(idx)
            .ok()
            .flatten()
            .or_else(|| row.try_get::<i32, _>(idx).ok().flatten().map(i64::from))
            .or_else(|| row.try_get::<i16, _>(idx).ok().flatten().map(i64::from))
            .or_else(|| row.try_get::<u8, _>(idx).ok().flatten().map(i64::from))
            .map(SqlValue::Int),

        // Float types
        ColumnType::Float4 => row.try_get::<f32, _>(idx).ok().flatten().map(|v| SqlValue::Float(f64::from(v))),
        ColumnType::Float8 | ColumnType::Money | ColumnType::Money4 => {
            row.try_get::<f64, _>(idx).ok().flatten().map(SqlValue::Float)
        }
        ColumnType::Floatn => row
            .try_get::<f64, _>(idx)
            .ok()
            .flatten()
            .or_else(|| row.try_get::<f32, _>(idx).ok().flatten().map(f64::from))
            .map(SqlValue::Float),

        // Decimal/Numeric keep their exact digits
        ColumnType::Decimaln | ColumnType::Numericn => row
            .try_get::<Numeric, _>(idx)
            .ok()
            .flatten()
            .map(|n| SqlValue::Decimal(n.to_string())),

        ColumnType::Bit | ColumnType::Bitn => row.try_get::<bool, _>(idx).ok().flatten().map(SqlValue::Bool),

        // String types
        ColumnType::BigVarChar
        | ColumnType::BigChar
        | ColumnType::NVarchar
        | ColumnType::NChar
        | ColumnType::Text
        | ColumnType::NText => row
            .try_get::<&str, _>(idx)
            .ok()
            .flatten()
            .map(|s| SqlValue::String(s.to_string())),

        // Date/Time types
        ColumnType::Datetime
        | ColumnType::Datetime2
        | ColumnType::Datetimen
        | ColumnType::Datetime4 => row
            .try_get::<NaiveDateTime, _>(idx)
            .ok()
            .flatten()
            .map(SqlValue::DateTime),
        ColumnType::DatetimeOffsetn => row
            .try_get::<DateTime<Utc>, _>(idx)
            .ok()
            .flatten()
            .map(|dt| SqlValue::DateTime(dt.naive_utc())),
        ColumnType::Daten => row
            .try_get::<NaiveDate, _>(idx)
            .ok()
            .flatten()
            .map(|d| SqlValue::DateTime(d.and_time(NaiveTime::MIN))),
        ColumnType::Timen => row
            .try_get::<NaiveTime, _>(idx)
            .ok()
            .flatten()
            .map(|t| SqlValue::String(t.to_string())),

        // Binary types
        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => row
            .try_get::<&[u8], _>(idx)
            .ok()
            .flatten()
            .map(|b| SqlValue::Bytes(b.to_vec())),

        ColumnType::Guid => row
            .try_get::<tiberius::Uuid, _>(idx)
            .ok()
            .flatten()
            .map(|u| SqlValue::String(u.to_string())),

        ColumnType::Xml => row
            .try_get::<&tiberius::xml::XmlData, _>(idx)
            .ok()
            .flatten()
            .map(|xml| SqlValue::String(xml.to_owned().into_string())),

        _ => None,
    };
    value.unwrap_or(SqlValue::Null)
}

fn rows_to_rowset(rows: Vec<Row>) -> RowSet {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.clone(), cell_value_from_row(row, idx)))
                .collect::<ValueRow>()
        })
        .collect();
    RowSet::new(columns, rows)
}

async fn run_query(client: &mut MssqlClient, statement: &Statement) -> Result<RowSet, DatabaseError> {
    let stream = build_query(statement)?
        .query(client)
        .await
        .map_err(map_mssql_error)?;
    let rows = stream.into_first_result().await.map_err(map_mssql_error)?;
    Ok(rows_to_rowset(rows))
}

async fn run_execute(
    client: &mut MssqlClient,
    statement: &Statement,
) -> Result<ExecResult, DatabaseError> {
    let result = build_query(statement)?
        .execute(client)
        .await
        .map_err(map_mssql_error)?;
    Ok(ExecResult::affected(result.total()))
}

async fn run_insert(
    client: &mut MssqlClient,
    statement: &Statement,
    mode: &ReturningMode,
) -> Result<InsertResult, DatabaseError> {
    if *mode != ReturningMode::Row {
        return Err(DatabaseError::InvalidRequest(format!(
            "{:?} is not an insert mode of SQL Server",
            mode
        )));
    }
    run_query(client, statement)
        .await?
        .into_first()
        .map(InsertResult::RowReturned)
        .ok_or_else(|| DatabaseError::NoIdReturned("INSERT produced no OUTPUT row".to_string()))
}

async fn run_batch(client: &mut MssqlClient, sql: &str) -> Result<(), DatabaseError> {
    client
        .simple_query(sql)
        .await
        .map_err(map_mssql_error)?
        .into_results()
        .await
        .map_err(map_mssql_error)?;
    Ok(())
}

// ============================================================================
// Connection
// ============================================================================

pub struct MssqlConnection {
    id: String,
    pool: MssqlPool,
    closed: AtomicBool,
}

impl MssqlConnection {
    fn pool(&self) -> Result<&MssqlPool, DatabaseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::NotConnected(format!("{} is closed", self.id)));
        }
        Ok(&self.pool)
    }

    async fn client(&self) -> Result<PooledConnection<'_, ConnectionManager>, DatabaseError> {
        self.pool()?.get().await.map_err(map_run_error)
    }
}

#[async_trait::async_trait]
impl Connection for MssqlConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlserver
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut client = self.client().await?;
        run_batch(&mut client, "SELECT 1").await
    }

    async fn query(&self, statement: &Statement) -> Result<RowSet, DatabaseError> {
        let mut client = self.client().await?;
        run_query(&mut client, statement).await
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecResult, DatabaseError> {
        let mut client = self.client().await?;
        run_execute(&mut client, statement).await
    }

    async fn insert(
        &self,
        statement: &Statement,
        mode: &ReturningMode,
    ) -> Result<InsertResult, DatabaseError> {
        let mut client = self.client().await?;
        run_insert(&mut client, statement, mode).await
    }

    async fn execute_batch(&self, sql: &str) -> Result<(), DatabaseError> {
        let mut client = self.client().await?;
        run_batch(&mut client, sql).await
    }

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn TransactionHandle>, DatabaseError> {
        let mut conn = self.pool()?.get_owned().await.map_err(map_run_error)?;
        if let Some(level) = SqlServerDialect.isolation_level_sql(isolation) {
            run_batch(&mut conn, &format!("SET TRANSACTION ISOLATION LEVEL {}", level)).await?;
        }
        run_batch(&mut conn, "BEGIN TRANSACTION").await?;
        Ok(Box::new(MssqlTransaction { conn: Some(conn) }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!(connection_id = %self.id, "SQL Server pool closed");
    }
}

// ============================================================================
// Transaction
// ============================================================================

type OwnedMssqlConnection = PooledConnection<'static, ConnectionManager>;

const ROLLBACK_SQL: &str = "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION";

pub struct MssqlTransaction {
    /// Taken once COMMIT or ROLLBACK ran
    conn: Option<OwnedMssqlConnection>,
}

impl MssqlTransaction {
    fn client(&mut self) -> Result<&mut MssqlClient, DatabaseError> {
        self.conn
            .as_mut()
            .map(|conn| &mut **conn)
            .ok_or(DatabaseError::TransactionFinished)
    }
}

#[async_trait::async_trait]
impl TransactionHandle for MssqlTransaction {
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
        run_batch(self.client()?, "COMMIT TRANSACTION").await?;
        self.conn = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        let mut conn = self.conn.take().ok_or(DatabaseError::TransactionFinished)?;
        run_batch(&mut conn, ROLLBACK_SQL).await
    }
}

impl Drop for MssqlTransaction {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = run_batch(&mut conn, ROLLBACK_SQL).await {
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

/// SQL Server driver implementation
pub struct SqlServerDriver;

impl SqlServerDriver {
    /// Create a new SQL Server driver
    pub fn new() -> Self {
        Self
    }

    /// Build the tiberius config; `encrypt`, `trustservercertificate` and
    /// `instance` are read from the connection options.
    fn to_tiberius_config(config: &DatabaseConfig) -> Config {
        let flag = |key: &str, default: bool| {
            config
                .option(key)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(default)
        };

        let mut tiberius_config = Config::new();
        tiberius_config.host(config.host());
        tiberius_config.port(config.get_port());
        tiberius_config.database(&config.database_name);
        tiberius_config.authentication(AuthMethod::sql_server(
            &config.user_name,
            &config.user_password,
        ));
        if let Some(instance) = config.option("instance") {
            tiberius_config.instance_name(instance);
        }
        if flag("trustservercertificate", true) {
            tiberius_config.trust_cert();
        }
        tiberius_config.encryption(if flag("encrypt", false) {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::Off
        });
        tiberius_config
    }
}

impl Default for SqlServerDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for SqlServerDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlserver
    }

    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn Connection>, DatabaseError> {
        config.validate()?;
        let manager = ConnectionManager::build(Self::to_tiberius_config(config))
            .map_err(|e| DatabaseError::ConfigurationError(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(config.pool.max_size)
            .min_idle(config.pool.min_idle)
            .connection_timeout(Duration::from_secs(config.pool.connect_timeout_secs))
            .build(manager)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let connection = MssqlConnection {
            id: config.name_id.clone(),
            pool,
            closed: AtomicBool::new(false),
        };
        connection.ping().await?;
        info!(
            database = %config.name_id,
            target = %config.non_sensitive_connection_string(),
            "SQL Server pool ready"
        );
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_type() {
        let driver = SqlServerDriver::new();
        assert_eq!(driver.database_type(), DatabaseType::Sqlserver);
    }

    #[test]
    fn test_config_conversion() {
        let config = DatabaseConfig {
            name_id: "main".to_string(),
            database_type: DatabaseType::Sqlserver,
            address: "db.local".to_string(),
            user_name: "sa".to_string(),
            user_password: "secret".to_string(),
            database_name: "master".to_string(),
            connection_options: "encrypt=false".to_string(),
            ..Default::default()
        };
        let tiberius_config = SqlServerDriver::to_tiberius_config(&config);
        assert_eq!(tiberius_config.get_addr(), "db.local:1433");

        let config = DatabaseConfig {
            address: "db.local:14330".to_string(),
            ..config
        };
        let tiberius_config = SqlServerDriver::to_tiberius_config(&config);
        assert_eq!(tiberius_config.get_addr(), "db.local:14330");
    }

    #[test]
    fn test_parse_numeric() {
        let n = parse_numeric("-12.50").unwrap();
        assert_eq!(n.value(), -1250);
        assert_eq!(n.scale(), 2);
        assert_eq!(parse_numeric("7").unwrap().value(), 7);
        assert_eq!(parse_numeric(" 0.001 ").unwrap().scale(), 3);
        assert!(parse_numeric("1e5").is_none());
        assert!(parse_numeric("").is_none());
        assert!(parse_numeric("abc").is_none());
    }

    #[test]
    fn test_bind_rejects_expressions() {
        let mut query = Query::new("SELECT @P1");
        let expression = SqlValue::Expression(crate::db::value::SqlExpression::new("GETDATE()"));
        assert!(bind_value(&mut query, &expression).is_err());
        assert!(bind_value(&mut query, &SqlValue::Null).is_ok());
    }
}
