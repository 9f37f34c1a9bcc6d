// Database Object
// `DxDatabase` owns one configured database: its pool, its connect and
// reconnect lifecycle, and the retried CRUD surface built on the builders.

use crate::config::{DatabaseSection, DatabasesConfiguration, RetryPolicy};
use crate::db::builder::{
    build_count, build_delete, build_insert, build_paging, build_select, build_update,
    total_pages, CountRequest, CountResult, NamedStatement, PagingRequest, PagingResult,
    SelectRequest, Statement, WriteStatement,
};
use crate::db::dialect::{DatabaseType, Dialect};
use crate::db::error_check::check_database_error;
use crate::db::registry::DriverRegistry;
use crate::db::script::split_sql_statements;
use crate::db::sqlchecker::CheckOptions;
use crate::db::traits::{Connection, DatabaseConfig, DatabaseError, ExecResult};
use crate::db::transaction::{DxDatabaseTx, IsolationLevel};
use crate::db::value::{
    deformat_keys, deformat_row, kv, FieldTypeMapping, KeyValues, Row, RowSet, SqlValue,
};
use futures::future::BoxFuture;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

const PING_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_CONCURRENT_STATEMENTS: usize = 10;

/// Called with the database name id whenever a connect attempt fails
pub type OnCannotConnect = Arc<dyn Fn(&str, &DatabaseError) + Send + Sync>;

struct Settings {
    is_configured: bool,
    is_connect_at_start: bool,
    must_connected: bool,
    config: DatabaseConfig,
    create_script_files: Vec<String>,
    retry: RetryPolicy,
}

pub struct DxDatabase {
    name_id: String,
    registry: Arc<DriverRegistry>,
    settings: RwLock<Settings>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    connect_lock: Mutex<()>,
    connected: AtomicBool,
    semaphore: Semaphore,
    on_cannot_connect: RwLock<Option<OnCannotConnect>>,
}

impl DxDatabase {
    pub fn new(
        name_id: impl Into<String>,
        registry: Arc<DriverRegistry>,
        is_connect_at_start: bool,
        must_connected: bool,
    ) -> Self {
        let name_id = name_id.into();
        Self {
            settings: RwLock::new(Settings {
                is_configured: false,
                is_connect_at_start,
                must_connected,
                config: DatabaseConfig {
                    name_id: name_id.clone(),
                    ..Default::default()
                },
                create_script_files: Vec::new(),
                retry: RetryPolicy::default(),
            }),
            name_id,
            registry,
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            semaphore: Semaphore::new(MAX_CONCURRENT_STATEMENTS),
            on_cannot_connect: RwLock::new(None),
        }
    }

    pub fn name_id(&self) -> &str {
        &self.name_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn is_configured(&self) -> bool {
        self.settings.read().await.is_configured
    }

    pub async fn is_connect_at_start(&self) -> bool {
        self.settings.read().await.is_connect_at_start
    }

    pub async fn must_connected(&self) -> bool {
        self.settings.read().await.must_connected
    }

    pub async fn database_type(&self) -> DatabaseType {
        self.settings.read().await.config.database_type
    }

    /// Resolved connection parameters, password included
    pub async fn database_config(&self) -> DatabaseConfig {
        self.settings.read().await.config.clone()
    }

    pub async fn non_sensitive_connection_string(&self) -> String {
        self.settings.read().await.config.non_sensitive_connection_string()
    }

    pub async fn create_script_files(&self) -> Vec<String> {
        self.settings.read().await.create_script_files.clone()
    }

    pub async fn set_on_cannot_connect(&self, hook: OnCannotConnect) {
        *self.on_cannot_connect.write().await = Some(hook);
    }

    pub async fn set_retry_policy(&self, retry: RetryPolicy) {
        self.settings.write().await.retry = retry;
    }

    async fn dialect(&self) -> Result<&'static dyn Dialect, DatabaseError> {
        self.database_type().await.dialect()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Use an already resolved configuration
    pub async fn configure(&self, mut config: DatabaseConfig) -> Result<(), DatabaseError> {
        config.name_id = self.name_id.clone();
        config.validate()?;
        let mut settings = self.settings.write().await;
        settings.config = config;
        settings.is_configured = true;
        Ok(())
    }

    fn configuration_error(&self, must_connected: bool, message: String) -> DatabaseError {
        if must_connected {
            error!(database = %self.name_id, "{}", message);
            DatabaseError::Fatal(Box::new(DatabaseError::ConfigurationError(message)))
        } else {
            warn!(database = %self.name_id, "{}", message);
            DatabaseError::ConfigurationError(message)
        }
    }

    /// Look up this database's section and apply it; a no-op once configured.
    pub async fn apply_from_configuration(
        &self,
        configuration: &DatabasesConfiguration,
    ) -> Result<(), DatabaseError> {
        if self.is_configured().await {
            return Ok(());
        }
        match configuration.get(&self.name_id) {
            Some(section) => self.apply_section(section).await,
            None => {
                let must_connected = self.must_connected().await;
                Err(self.configuration_error(
                    must_connected,
                    format!("Manager is unusable, database {} configuration not found", self.name_id),
                ))
            }
        }
    }

    pub async fn apply_section(&self, section: &DatabaseSection) -> Result<(), DatabaseError> {
        let mut settings = self.settings.write().await;
        if settings.is_configured {
            return Ok(());
        }
        info!(database = %self.name_id, "Configuring database... start");

        if let Some(must_connected) = section.must_connected {
            settings.must_connected = must_connected;
        }
        if let Some(is_connect_at_start) = section.is_connect_at_start {
            settings.is_connect_at_start = is_connect_at_start;
        }
        let must_connected = settings.must_connected;

        let database_type = match section.database_type.as_deref() {
            None => {
                return Err(self.configuration_error(
                    must_connected,
                    format!("mandatory database_type field in database {} configuration not exist", self.name_id),
                ))
            }
            Some(raw) => match DatabaseType::from_str_lossy(raw) {
                DatabaseType::Unknown => {
                    return Err(self.configuration_error(
                        must_connected,
                        format!(
                            "value of database_type field of database {} configuration is not supported ({})",
                            self.name_id, raw
                        ),
                    ))
                }
                known => known,
            },
        };

        let required = |field: &'static str, value: &Option<String>| {
            value.clone().ok_or_else(|| {
                self.configuration_error(
                    must_connected,
                    format!(
                        "mandatory {} field in database {} configuration not exist",
                        field, self.name_id
                    ),
                )
            })
        };
        let address = required("address", &section.address)?;
        let user_name = required("user_name", &section.user_name)?;
        let user_password = required("user_password", &section.user_password)?;
        let database_name = required("database_name", &section.database_name)?;

        settings.config = DatabaseConfig {
            name_id: self.name_id.clone(),
            database_type,
            address,
            user_name,
            user_password,
            database_name,
            connection_options: section.connection_options.clone(),
            pool: section.pool,
        };
        settings.create_script_files = section.create_script_files.clone();
        settings.retry = section.retry;
        settings.is_configured = true;
        info!(
            database = %self.name_id,
            connection = %settings.config.non_sensitive_connection_string(),
            "Configuring database... done"
        );
        Ok(())
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    async fn open(&self, config: &DatabaseConfig) -> Result<Arc<dyn Connection>, DatabaseError> {
        let driver = self.registry.get_driver(config.database_type).await?;
        let connection = driver.connect(config).await?;
        match tokio::time::timeout(PING_TIMEOUT, connection.ping()).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(e)) => {
                connection.close().await;
                Err(e)
            }
            Err(_) => {
                connection.close().await;
                Err(DatabaseError::Timeout)
            }
        }
    }

    /// Open the pool and ping it. Calling it while connected does nothing.
    pub async fn connect(&self) -> Result<(), DatabaseError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let (config, must_connected) = {
            let settings = self.settings.read().await;
            if !settings.is_configured {
                return Err(DatabaseError::ConfigurationError(format!(
                    "database {} is not configured",
                    self.name_id
                )));
            }
            (settings.config.clone(), settings.must_connected)
        };
        let target = config.non_sensitive_connection_string();
        info!(database = %self.name_id, connection = %target, "Connecting to database... start");

        let stale = self.connection.write().await.take();
        if let Some(stale) = stale {
            stale.close().await;
        }

        match self.open(&config).await {
            Ok(connection) => {
                *self.connection.write().await = Some(connection);
                self.connected.store(true, Ordering::SeqCst);
                info!(database = %self.name_id, connection = %target, "Connecting to database... done");
                Ok(())
            }
            Err(e) => {
                error!(database = %self.name_id, connection = %target, error = %e, "CANNOT_CONNECT");
                let hook = self.on_cannot_connect.read().await.clone();
                if let Some(hook) = hook {
                    hook(&self.name_id, &e);
                }
                let failed = DatabaseError::ConnectionFailed(format!("{}: {}", target, e));
                if must_connected {
                    Err(DatabaseError::Fatal(Box::new(failed)))
                } else {
                    Err(failed)
                }
            }
        }
    }

    pub async fn ensure_connection(&self) -> Result<(), DatabaseError> {
        if self.is_connected() && self.connection.read().await.is_some() {
            return Ok(());
        }
        self.connect().await
    }

    async fn current_connection(&self) -> Result<Arc<dyn Connection>, DatabaseError> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| DatabaseError::NotConnected(self.name_id.clone()))
    }

    /// Ping with a one second limit, updating the connected flag
    pub async fn check_connection(&self) -> Result<(), DatabaseError> {
        let connection = self.current_connection().await?;
        match tokio::time::timeout(PING_TIMEOUT, connection.ping()).await {
            Ok(Ok(())) => {
                self.connected.store(true, Ordering::SeqCst);
                debug!(database = %self.name_id, "ping ok");
                Ok(())
            }
            Ok(Err(e)) => {
                self.connected.store(false, Ordering::SeqCst);
                warn!(database = %self.name_id, error = %e, "ping failed");
                Err(check_database_error(e))
            }
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                warn!(database = %self.name_id, "ping timed out");
                Err(DatabaseError::Timeout)
            }
        }
    }

    pub async fn check_connection_and_reconnect(&self) -> Result<(), DatabaseError> {
        let reconnect = if self.is_connected() {
            self.check_connection().await.is_err()
        } else {
            true
        };
        if reconnect {
            let backoff = self.settings.read().await.retry.backoff();
            tokio::time::sleep(backoff).await;
            self.connect().await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), DatabaseError> {
        let _guard = self.connect_lock.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        let connection = self.connection.write().await.take();
        if let Some(connection) = connection {
            connection.close().await;
            info!(database = %self.name_id, "Disconnected");
        }
        Ok(())
    }

    // ========================================================================
    // Retry
    // ========================================================================

    /// Run `attempt` until it succeeds, fails with anything other than a lost
    /// connection, or the retry policy runs out.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        table: &str,
        mut attempt: F,
    ) -> Result<T, DatabaseError>
    where
        F: FnMut(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        self.ensure_connection().await?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DatabaseError::NotConnected(self.name_id.clone()))?;
        let max_attempts = self.settings.read().await.retry.max_attempts.max(1);

        let mut last_error = DatabaseError::NotConnected(self.name_id.clone());
        for attempt_no in 1..=max_attempts {
            let result = match self.current_connection().await {
                Ok(connection) => attempt(connection).await,
                Err(e) => Err(e),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            warn!(
                database = %self.name_id,
                table,
                attempt = attempt_no,
                error = %err,
                "{} failed",
                operation
            );
            let err = check_database_error(err);
            if !matches!(err, DatabaseError::NotConnected(_)) {
                return Err(err.context(operation, table));
            }
            last_error = err;
            if attempt_no < max_attempts {
                if let Err(e) = self.check_connection_and_reconnect().await {
                    warn!(database = %self.name_id, error = %e, "RECONNECT_ERROR");
                }
            }
        }
        Err(last_error.context(operation, table))
    }

    async fn bind(&self, named: &NamedStatement, options: CheckOptions) -> Result<Statement, DatabaseError> {
        named.checked_bind(self.dialect().await?, options)
    }

    async fn query_statement(
        &self,
        operation: &'static str,
        table: &str,
        statement: &Statement,
    ) -> Result<RowSet, DatabaseError> {
        self.with_retry(operation, table, |connection| async move {
            connection.query(statement).await
        })
        .await
    }

    async fn run_write(
        &self,
        operation: &'static str,
        table: &str,
        write: &WriteStatement,
    ) -> Result<ExecResult, DatabaseError> {
        let statement = self.bind(&write.statement, CheckOptions::default()).await?;
        let statement = &statement;
        if write.returns_rows {
            self.with_retry(operation, table, |connection| async move {
                let rows = connection.query(statement).await?;
                Ok(ExecResult::returning(deformat_keys(rows, None)))
            })
            .await
        } else {
            self.with_retry(operation, table, |connection| async move {
                connection.execute(statement).await
            })
            .await
        }
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    pub async fn select(
        &self,
        request: &SelectRequest,
        field_type_mapping: Option<&FieldTypeMapping>,
    ) -> Result<RowSet, DatabaseError> {
        let named = build_select(self.dialect().await?, request)?;
        let statement = self.bind(&named, CheckOptions::default()).await?;
        let rows = self.query_statement("select", &request.table, &statement).await?;
        Ok(deformat_keys(rows, field_type_mapping))
    }

    /// First row of a `LIMIT 1` select, `None` when nothing matches
    pub async fn select_one(
        &self,
        request: &SelectRequest,
        field_type_mapping: Option<&FieldTypeMapping>,
    ) -> Result<Option<Row>, DatabaseError> {
        let request = request.clone().limit(1);
        Ok(self.select(&request, field_type_mapping).await?.into_first())
    }

    pub async fn should_select_one(
        &self,
        request: &SelectRequest,
        field_type_mapping: Option<&FieldTypeMapping>,
    ) -> Result<Row, DatabaseError> {
        self.select_one(request, field_type_mapping)
            .await?
            .ok_or_else(|| {
                DatabaseError::RowNotFound(format!("ROW_SHOULD_EXIST_BUT_NOT_FOUND:{}", request.table))
            })
    }

    /// Insert one row and return its generated id
    pub async fn insert(
        &self,
        table: &str,
        id_field: &str,
        values: &KeyValues,
    ) -> Result<i64, DatabaseError> {
        let insert = build_insert(self.dialect().await?, table, id_field, values)?;
        let statement = self.bind(&insert.statement, CheckOptions::default()).await?;
        let (statement, mode) = (&statement, &insert.mode);
        let result = self
            .with_retry("insert", table, |connection| async move {
                connection.insert(statement, mode).await
            })
            .await?;
        result.into_id(&insert.id_field)
    }

    pub async fn update(
        &self,
        table: &str,
        set: &KeyValues,
        where_kv: &KeyValues,
    ) -> Result<ExecResult, DatabaseError> {
        self.update_returning(table, set, where_kv, &[]).await
    }

    /// UPDATE that hands back `returning` columns of the changed rows
    pub async fn update_returning(
        &self,
        table: &str,
        set: &KeyValues,
        where_kv: &KeyValues,
        returning: &[String],
    ) -> Result<ExecResult, DatabaseError> {
        let update = build_update(self.dialect().await?, table, set, where_kv, returning)?;
        self.run_write("update", table, &update).await
    }

    pub async fn delete(&self, table: &str, where_kv: &KeyValues) -> Result<ExecResult, DatabaseError> {
        self.delete_returning(table, where_kv, &[]).await
    }

    pub async fn delete_returning(
        &self,
        table: &str,
        where_kv: &KeyValues,
        returning: &[String],
    ) -> Result<ExecResult, DatabaseError> {
        let delete = build_delete(self.dialect().await?, table, where_kv, returning)?;
        self.run_write("delete", table, &delete).await
    }

    /// Mark rows as deleted instead of removing them
    pub async fn soft_delete(&self, table: &str, where_kv: &KeyValues) -> Result<ExecResult, DatabaseError> {
        self.update(table, &kv([("is_deleted", SqlValue::Bool(true))]), where_kv)
            .await
    }

    pub async fn count(&self, request: &CountRequest) -> Result<CountResult, DatabaseError> {
        let named = build_count(self.dialect().await?, request)?;
        let statement = self.bind(&named, CheckOptions::default()).await?;
        let rows = self.query_statement("count", &request.table, &statement).await?;
        let row = rows
            .into_first()
            .map(|row| deformat_row(row, None))
            .unwrap_or_default();
        CountResult::from_row(row)
    }

    /// Count that must match exactly one row
    pub async fn count_one(&self, request: &CountRequest) -> Result<CountResult, DatabaseError> {
        let result = self.count(request).await?;
        if result.total_rows != 1 {
            return Err(DatabaseError::QueryError(format!(
                "expected exactly one row, got {} rows",
                result.total_rows
            )));
        }
        Ok(result)
    }

    /// Count that must match at least one row
    pub async fn should_count(&self, request: &CountRequest) -> Result<CountResult, DatabaseError> {
        let result = self.count(request).await?;
        if result.total_rows == 0 {
            return Err(DatabaseError::RowNotFound(format!("NO_ROWS_FOUND:{}", request.table)));
        }
        Ok(result)
    }

    pub async fn query_paging(
        &self,
        request: &PagingRequest,
        field_type_mapping: Option<&FieldTypeMapping>,
    ) -> Result<PagingResult, DatabaseError> {
        let statements = build_paging(self.dialect().await?, request)?;
        let count = self.bind(&statements.count, CheckOptions::default()).await?;
        let rows = self.bind(&statements.rows, CheckOptions::default()).await?;

        let count_rows = self.query_statement("paging_count", &request.from, &count).await?;
        let count = CountResult::from_row(
            count_rows
                .into_first()
                .map(|row| deformat_row(row, None))
                .unwrap_or_default(),
        )?;
        let rows = self.query_statement("paging", &request.from, &rows).await?;

        Ok(PagingResult {
            rows: deformat_keys(rows, field_type_mapping),
            total_rows: count.total_rows,
            total_pages: total_pages(count.total_rows, request.rows_per_page),
            summary: count.summary,
        })
    }

    /// Hand-written SQL with `:name` parameters
    pub async fn query_raw(
        &self,
        sql: &str,
        args: &KeyValues,
        field_type_mapping: Option<&FieldTypeMapping>,
        options: CheckOptions,
    ) -> Result<RowSet, DatabaseError> {
        let statement = self.bind(&NamedStatement::new(sql, args.clone()), options).await?;
        let rows = self.query_statement("query", "", &statement).await?;
        Ok(deformat_keys(rows, field_type_mapping))
    }

    pub async fn execute_raw(
        &self,
        sql: &str,
        args: &KeyValues,
        options: CheckOptions,
    ) -> Result<ExecResult, DatabaseError> {
        let statement = self.bind(&NamedStatement::new(sql, args.clone()), options).await?;
        let statement = &statement;
        self.with_retry("execute", "", |connection| async move {
            connection.execute(statement).await
        })
        .await
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Run `callback` inside one transaction: commit when it returns `Ok`,
    /// roll back when it returns `Err`.
    pub async fn tx<T, F>(&self, isolation: IsolationLevel, callback: F) -> Result<T, DatabaseError>
    where
        F: for<'t> FnOnce(&'t mut DxDatabaseTx) -> BoxFuture<'t, Result<T, DatabaseError>>,
    {
        self.ensure_connection().await?;
        let dialect = self.dialect().await?;
        // the permit covers BEGIN only; the callback may call back into this database
        let handle = {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| DatabaseError::NotConnected(self.name_id.clone()))?;
            let connection = self.current_connection().await?;
            connection.begin(isolation).await.map_err(|e| {
                error!(database = %self.name_id, error = %e, "TX_BEGIN_ERROR");
                check_database_error(e).context("begin", self.name_id.clone())
            })?
        };

        let mut tx = DxDatabaseTx::new(self.name_id.clone(), dialect, CheckOptions::default(), handle);
        let result = callback(&mut tx).await;
        if let Err(e) = &result {
            error!(database = %self.name_id, error = %e, "TX_ERROR_IN_CALLBACK");
        }
        tx.finish(result).await
    }

    // ========================================================================
    // Scripts
    // ========================================================================

    /// Run every statement of a SQL file in order; stops at the first failure.
    /// Returns the number of statements executed.
    pub async fn execute_file(&self, path: impl AsRef<Path>) -> Result<usize, DatabaseError> {
        let path = path.as_ref();
        let file = path.display().to_string();
        self.ensure_connection().await?;
        let connection = self.current_connection().await?;

        info!(database = %self.name_id, file = %file, "Executing SQL file... start");
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            error!(database = %self.name_id, file = %file, error = %e, "Error reading SQL file");
            DatabaseError::IoError(e)
        })?;
        let statements = split_sql_statements(&content);
        for (index, statement) in statements.iter().enumerate() {
            if let Err(e) = connection.execute_batch(statement).await {
                error!(
                    database = %self.name_id,
                    file = %file,
                    statement = index + 1,
                    error = %e,
                    "Error executing SQL file"
                );
                if let DatabaseError::Driver(detail) = e.root() {
                    error!(
                        database = %self.name_id,
                        code = ?detail.code,
                        sql_state = ?detail.sql_state,
                        message = %detail.message,
                        "{} error detail",
                        detail.database_type.display_name()
                    );
                }
                return Err(check_database_error(e).context("execute_file", file));
            }
        }
        info!(
            database = %self.name_id,
            file = %file,
            statements = statements.len(),
            "Executing SQL file... done"
        );
        Ok(statements.len())
    }

    /// Run the configured `create_script_files` in order
    pub async fn execute_create_scripts(&self) -> Result<usize, DatabaseError> {
        self.ensure_connection().await?;
        let files = self.create_script_files().await;
        let mut executed = 0;
        for (index, file) in files.iter().enumerate() {
            executed += self.execute_file(file).await?;
            info!(database = %self.name_id, "Executing file {}:'{}'... done", index + 1, file);
        }
        Ok(executed)
    }
}
