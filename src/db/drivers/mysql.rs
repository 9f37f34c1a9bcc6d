// MySQL / MariaDB Driver
// sqlx pool shared by both engines; MariaDB differs only in RETURNING support

use crate::db::builder::Statement;
use crate::db::dialect::{DatabaseType, ReturningMode};
use crate::db::traits::{
    Connection, DatabaseConfig, DatabaseDriver, DatabaseError, DriverError, ExecResult,
    InsertResult, TransactionHandle,
};
use crate::db::transaction::IsolationLevel;
use crate::db::value::{Row as ValueRow, RowSet, SqlValue};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use sqlx::mysql::{
    MySqlArguments, MySqlConnectOptions, MySqlDatabaseError, MySqlPoolOptions, MySqlRow,
    MySqlValueRef,
};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column, Executor, MySql, MySqlPool, Row, TypeInfo, Value, ValueRef};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Error mapping
// ============================================================================

fn map_sqlx_error(database_type: DatabaseType, e: sqlx::Error) -> DatabaseError {
    match e {
        sqlx::Error::Database(db) => {
            let mut err = DriverError::new(database_type, db.message());
            if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
                err = err.with_code(mysql.number().to_string());
            }
            if let Some(state) = db.code() {
                err = err.with_sql_state(state.into_owned());
            }
            DatabaseError::Driver(err)
        }
        sqlx::Error::PoolTimedOut => DatabaseError::Timeout,
        sqlx::Error::PoolClosed => {
            DatabaseError::NotConnected(format!("{} pool is closed", database_type))
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => {
            DatabaseError::Driver(DriverError::new(database_type, e.to_string()).connection_lost())
        }
        sqlx::Error::RowNotFound => DatabaseError::RowNotFound(e.to_string()),
        other => DatabaseError::Driver(DriverError::new(database_type, other.to_string())),
    }
}

// ============================================================================
// Binding and decoding
// ============================================================================

fn bind_values<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    values: &[SqlValue],
) -> Result<Query<'q, MySql, MySqlArguments>, DatabaseError> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Decimal(s) => match s.trim().parse::<Decimal>() {
                Ok(decimal) => query.bind(decimal),
                // out of Decimal range; the server casts the text itself
                Err(_) => query.bind(s.clone()),
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
        };
    }
    Ok(query)
}

fn column_value(value: MySqlValueRef<'_>) -> Result<SqlValue, sqlx::Error> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = value.type_info().name().to_string();
    let owned = ValueRef::to_owned(&value);
    let decoded = match type_name.as_str() {
        "BOOLEAN" => SqlValue::Bool(owned.try_decode()?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            SqlValue::Int(owned.try_decode::<i64>()?)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" | "YEAR" => {
            let v: u64 = owned.try_decode_unchecked()?;
            match i64::try_from(v) {
                Ok(v) => SqlValue::Int(v),
                Err(_) => SqlValue::Decimal(v.to_string()),
            }
        }
        "FLOAT" => SqlValue::Float(f64::from(owned.try_decode::<f32>()?)),
        "DOUBLE" => SqlValue::Float(owned.try_decode()?),
        "DECIMAL" => SqlValue::Decimal(owned.try_decode::<Decimal>()?.to_string()),
        "JSON" => SqlValue::Json(owned.try_decode()?),
        "DATETIME" | "TIMESTAMP" => SqlValue::DateTime(owned.try_decode::<NaiveDateTime>()?),
        "DATE" => SqlValue::DateTime(owned.try_decode::<NaiveDate>()?.and_time(NaiveTime::MIN)),
        "TIME" => SqlValue::String(owned.try_decode::<NaiveTime>()?.to_string()),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
            SqlValue::Bytes(owned.try_decode_unchecked::<Vec<u8>>()?)
        }
        // CHAR, VARCHAR, TEXT family, ENUM, SET
        _ => SqlValue::String(owned.try_decode_unchecked::<String>()?),
    };
    Ok(decoded)
}

fn rows_to_rowset(database_type: DatabaseType, rows: Vec<MySqlRow>) -> Result<RowSet, DatabaseError> {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut values = ValueRow::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            let raw = row
                .try_get_raw(idx)
                .map_err(|e| map_sqlx_error(database_type, e))?;
            let value = column_value(raw).map_err(|e| map_sqlx_error(database_type, e))?;
            values.insert(name.clone(), value);
        }
        out.push(values);
    }
    Ok(RowSet::new(columns, out))
}

async fn run_query<'e, E>(
    database_type: DatabaseType,
    executor: E,
    statement: &Statement,
) -> Result<RowSet, DatabaseError>
where
    E: Executor<'e, Database = MySql>,
{
    let query = bind_values(sqlx::query(statement.sql.as_str()), &statement.params)?;
    let rows = query
        .fetch_all(executor)
        .await
        .map_err(|e| map_sqlx_error(database_type, e))?;
    rows_to_rowset(database_type, rows)
}

async fn run_execute<'e, E>(
    database_type: DatabaseType,
    executor: E,
    statement: &Statement,
) -> Result<ExecResult, DatabaseError>
where
    E: Executor<'e, Database = MySql>,
{
    let query = bind_values(sqlx::query(statement.sql.as_str()), &statement.params)?;
    let result = query
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error(database_type, e))?;
    Ok(ExecResult::affected(result.rows_affected()))
}

async fn run_insert<'e, E>(
    database_type: DatabaseType,
    executor: E,
    statement: &Statement,
    mode: &ReturningMode,
) -> Result<InsertResult, DatabaseError>
where
    E: Executor<'e, Database = MySql>,
{
    match mode {
        ReturningMode::LastInsertId => {
            let query = bind_values(sqlx::query(statement.sql.as_str()), &statement.params)?;
            let result = query
                .execute(executor)
                .await
                .map_err(|e| map_sqlx_error(database_type, e))?;
            let id = i64::try_from(result.last_insert_id()).map_err(|_| {
                DatabaseError::NoIdReturned(format!("{} overflows i64", result.last_insert_id()))
            })?;
            Ok(InsertResult::LastInsertId(id))
        }
        ReturningMode::Row => run_query(database_type, executor, statement)
            .await?
            .into_first()
            .map(InsertResult::RowReturned)
            .ok_or_else(|| DatabaseError::NoIdReturned("INSERT returned no row".to_string())),
        ReturningMode::OutParam { .. } => Err(DatabaseError::InvalidRequest(format!(
            "out parameters are not supported on {}",
            database_type
        ))),
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct MysqlConnection {
    id: String,
    database_type: DatabaseType,
    pool: MySqlPool,
}

#[async_trait::async_trait]
impl Connection for MysqlConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error(self.database_type, e))?;
        sqlx::Connection::ping(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(self.database_type, e))
    }

    async fn query(&self, statement: &Statement) -> Result<RowSet, DatabaseError> {
        run_query(self.database_type, &self.pool, statement).await
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecResult, DatabaseError> {
        run_execute(self.database_type, &self.pool, statement).await
    }

    async fn insert(
        &self,
        statement: &Statement,
        mode: &ReturningMode,
    ) -> Result<InsertResult, DatabaseError> {
        run_insert(self.database_type, &self.pool, statement, mode).await
    }

    async fn execute_batch(&self, sql: &str) -> Result<(), DatabaseError> {
        self.pool
            .execute(sql)
            .await
            .map_err(|e| map_sqlx_error(self.database_type, e))?;
        Ok(())
    }

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn TransactionHandle>, DatabaseError> {
        let database_type = self.database_type;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error(database_type, e))?;
        // must precede START TRANSACTION to apply to it
        if let Some(level) = database_type.dialect()?.isolation_level_sql(isolation) {
            conn.execute(format!("SET TRANSACTION ISOLATION LEVEL {}", level).as_str())
                .await
                .map_err(|e| map_sqlx_error(database_type, e))?;
        }
        conn.execute("START TRANSACTION")
            .await
            .map_err(|e| map_sqlx_error(database_type, e))?;
        Ok(Box::new(MysqlTransaction {
            database_type,
            conn: Some(conn),
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!(connection_id = %self.id, "{} pool closed", self.database_type);
    }
}

// ============================================================================
// Transaction
// ============================================================================

pub struct MysqlTransaction {
    database_type: DatabaseType,
    /// Taken once COMMIT or ROLLBACK ran
    conn: Option<PoolConnection<MySql>>,
}

impl MysqlTransaction {
    fn conn(&mut self) -> Result<&mut sqlx::MySqlConnection, DatabaseError> {
        self.conn
            .as_mut()
            .map(|conn| &mut **conn)
            .ok_or(DatabaseError::TransactionFinished)
    }
}

#[async_trait::async_trait]
impl TransactionHandle for MysqlTransaction {
    async fn query(&mut self, statement: &Statement) -> Result<RowSet, DatabaseError> {
        let database_type = self.database_type;
        run_query(database_type, self.conn()?, statement).await
    }

    async fn execute(&mut self, statement: &Statement) -> Result<ExecResult, DatabaseError> {
        let database_type = self.database_type;
        run_execute(database_type, self.conn()?, statement).await
    }

    async fn insert(
        &mut self,
        statement: &Statement,
        mode: &ReturningMode,
    ) -> Result<InsertResult, DatabaseError> {
        let database_type = self.database_type;
        run_insert(database_type, self.conn()?, statement, mode).await
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        let database_type = self.database_type;
        self.conn()?
            .execute("COMMIT")
            .await
            .map_err(|e| map_sqlx_error(database_type, e))?;
        self.conn = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        let database_type = self.database_type;
        let mut conn = self.conn.take().ok_or(DatabaseError::TransactionFinished)?;
        conn.execute("ROLLBACK")
            .await
            .map_err(|e| map_sqlx_error(database_type, e))?;
        Ok(())
    }
}

impl Drop for MysqlTransaction {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = conn.execute("ROLLBACK").await {
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

/// Driver for MySQL and MariaDB
pub struct MysqlDriver {
    database_type: DatabaseType,
}

impl MysqlDriver {
    pub fn mysql() -> Self {
        Self {
            database_type: DatabaseType::Mysql,
        }
    }

    pub fn mariadb() -> Self {
        Self {
            database_type: DatabaseType::Mariadb,
        }
    }

    fn connect_options(config: &DatabaseConfig) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(config.host())
            .port(config.get_port())
            .username(&config.user_name)
            .password(&config.user_password)
            .database(&config.database_name);
        if let Some(charset) = config.option("charset") {
            options = options.charset(&charset);
        }
        options
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for MysqlDriver {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn Connection>, DatabaseError> {
        config.validate()?;
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool.max_size)
            .min_connections(config.pool.min_idle.unwrap_or(0))
            .acquire_timeout(Duration::from_secs(config.pool.connect_timeout_secs))
            .connect_with(Self::connect_options(config))
            .await
            .map_err(|e| map_sqlx_error(self.database_type, e))?;

        info!(
            database = %config.name_id,
            target = %config.non_sensitive_connection_string(),
            "{} pool ready",
            self.database_type
        );
        Ok(Arc::new(MysqlConnection {
            id: config.name_id.clone(),
            database_type: self.database_type,
            pool,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::error_check::{is_connection_error, is_duplicate_key_error};

    #[test]
    fn test_driver_types() {
        assert_eq!(MysqlDriver::mysql().database_type(), DatabaseType::Mysql);
        assert_eq!(MysqlDriver::mariadb().database_type(), DatabaseType::Mariadb);
        assert_eq!(MysqlDriver::mariadb().driver_name(), "mariadb");
    }

    #[test]
    fn test_connect_options() {
        let config = DatabaseConfig {
            name_id: "main".to_string(),
            database_type: DatabaseType::Mysql,
            address: "db.local".to_string(),
            user_name: "app".to_string(),
            user_password: "secret".to_string(),
            database_name: "shop".to_string(),
            ..Default::default()
        };
        let options = format!("{:?}", MysqlDriver::connect_options(&config));
        assert!(options.contains("db.local"));
        assert!(options.contains("3306"));
        assert!(options.contains("shop"));
    }

    #[test]
    fn test_error_mapping() {
        let err = map_sqlx_error(
            DatabaseType::Mysql,
            sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe")),
        );
        assert!(is_connection_error(&err));

        let err = map_sqlx_error(DatabaseType::Mariadb, sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DatabaseError::Timeout));

        let err = map_sqlx_error(
            DatabaseType::Mysql,
            sqlx::Error::Protocol("Duplicate entry 'a' for key 'code'".to_string()),
        );
        assert!(is_duplicate_key_error(&err));
    }

    #[test]
    fn test_bind_rejects_expressions() {
        let values = vec![SqlValue::Expression(crate::db::value::SqlExpression::new("NOW()"))];
        assert!(bind_values(sqlx::query("SELECT ?"), &values).is_err());
        assert!(bind_values(sqlx::query("SELECT ?"), &[SqlValue::Int(1)]).is_ok());
    }
}
