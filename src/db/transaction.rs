// Transaction Wrapper
// `DxDatabaseTx` runs builder statements on one native transaction and
// guarantees it is terminated once.

use crate::db::builder::{
    build_count, build_delete, build_insert, build_select, build_update, CountRequest,
    CountResult, NamedStatement, SelectRequest,
};
use crate::db::dialect::{DatabaseType, Dialect};
use crate::db::error_check::check_database_error;
use crate::db::sqlchecker::CheckOptions;
use crate::db::traits::{DatabaseError, ExecResult, TransactionHandle};
use crate::db::value::{deformat_keys, deformat_row, FieldTypeMapping, KeyValues, Row, RowSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    WriteCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
    Linearizable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

pub struct DxDatabaseTx {
    database_name: String,
    dialect: &'static dyn Dialect,
    check_options: CheckOptions,
    handle: Box<dyn TransactionHandle>,
    state: TxState,
}

impl DxDatabaseTx {
    pub(crate) fn new(
        database_name: impl Into<String>,
        dialect: &'static dyn Dialect,
        check_options: CheckOptions,
        handle: Box<dyn TransactionHandle>,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            dialect,
            check_options,
            handle,
            state: TxState::Open,
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn database_type(&self) -> DatabaseType {
        self.dialect.database_type()
    }

    pub fn is_finished(&self) -> bool {
        self.state != TxState::Open
    }

    fn ensure_open(&self) -> Result<(), DatabaseError> {
        if self.is_finished() {
            Err(DatabaseError::TransactionFinished)
        } else {
            Ok(())
        }
    }

    fn fail(&self, operation: &'static str, table: &str, err: DatabaseError) -> DatabaseError {
        error!(
            database = %self.database_name,
            table,
            error = %err,
            "TX {} failed",
            operation
        );
        check_database_error(err).context(operation, table)
    }

    async fn run_query(
        &mut self,
        operation: &'static str,
        table: &str,
        named: &NamedStatement,
    ) -> Result<RowSet, DatabaseError> {
        self.ensure_open()?;
        let statement = named.checked_bind(self.dialect, self.check_options)?;
        match self.handle.query(&statement).await {
            Ok(rows) => Ok(rows),
            Err(e) => Err(self.fail(operation, table, e)),
        }
    }

    async fn run_execute(
        &mut self,
        operation: &'static str,
        table: &str,
        named: &NamedStatement,
    ) -> Result<ExecResult, DatabaseError> {
        self.ensure_open()?;
        let statement = named.checked_bind(self.dialect, self.check_options)?;
        match self.handle.execute(&statement).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.fail(operation, table, e)),
        }
    }

    pub async fn select(
        &mut self,
        request: &SelectRequest,
        field_type_mapping: Option<&FieldTypeMapping>,
    ) -> Result<RowSet, DatabaseError> {
        let named = build_select(self.dialect, request)?;
        let rows = self.run_query("select", &request.table, &named).await?;
        Ok(deformat_keys(rows, field_type_mapping))
    }

    pub async fn select_one(
        &mut self,
        request: &SelectRequest,
        field_type_mapping: Option<&FieldTypeMapping>,
    ) -> Result<Option<Row>, DatabaseError> {
        let request = request.clone().limit(1);
        let rows = self.select(&request, field_type_mapping).await?;
        Ok(rows.into_first())
    }

    pub async fn should_select_one(
        &mut self,
        request: &SelectRequest,
        field_type_mapping: Option<&FieldTypeMapping>,
    ) -> Result<Row, DatabaseError> {
        self.select_one(request, field_type_mapping)
            .await?
            .ok_or_else(|| {
                DatabaseError::RowNotFound(format!("ROW_SHOULD_EXIST_BUT_NOT_FOUND:{}", request.table))
            })
    }

    pub async fn insert(
        &mut self,
        table: &str,
        id_field: &str,
        values: &KeyValues,
    ) -> Result<i64, DatabaseError> {
        self.ensure_open()?;
        let insert = build_insert(self.dialect, table, id_field, values)?;
        let statement = insert.statement.checked_bind(self.dialect, self.check_options)?;
        let result = match self.handle.insert(&statement, &insert.mode).await {
            Ok(result) => result,
            Err(e) => return Err(self.fail("insert", table, e)),
        };
        let id = result.into_id(&insert.id_field)?;
        debug!(database = %self.database_name, table, id, "TX insert");
        Ok(id)
    }

    pub async fn update(
        &mut self,
        table: &str,
        set: &KeyValues,
        where_kv: &KeyValues,
    ) -> Result<ExecResult, DatabaseError> {
        let update = build_update(self.dialect, table, set, where_kv, &[])?;
        self.run_execute("update", table, &update.statement).await
    }

    pub async fn delete(
        &mut self,
        table: &str,
        where_kv: &KeyValues,
    ) -> Result<ExecResult, DatabaseError> {
        let delete = build_delete(self.dialect, table, where_kv, &[])?;
        self.run_execute("delete", table, &delete.statement).await
    }

    pub async fn count(&mut self, request: &CountRequest) -> Result<CountResult, DatabaseError> {
        let named = build_count(self.dialect, request)?;
        let rows = self.run_query("count", &request.table, &named).await?;
        let row = rows
            .into_first()
            .map(|row| deformat_row(row, None))
            .unwrap_or_default();
        CountResult::from_row(row)
    }

    pub async fn query_raw(
        &mut self,
        sql: &str,
        args: &KeyValues,
        field_type_mapping: Option<&FieldTypeMapping>,
    ) -> Result<RowSet, DatabaseError> {
        let named = NamedStatement::new(sql, args.clone());
        let rows = self.run_query("query", "", &named).await?;
        Ok(deformat_keys(rows, field_type_mapping))
    }

    pub async fn execute_raw(&mut self, sql: &str, args: &KeyValues) -> Result<ExecResult, DatabaseError> {
        let named = NamedStatement::new(sql, args.clone());
        self.run_execute("execute", "", &named).await
    }

    pub async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.ensure_open()?;
        match self.handle.commit().await {
            Ok(()) => {
                self.state = TxState::Committed;
                debug!(database = %self.database_name, "TX committed");
                Ok(())
            }
            Err(e) => {
                // stays open so the caller can still roll back
                error!(database = %self.database_name, error = %e, "TX_COMMIT_ERROR");
                Err(e.context("commit", self.database_name.clone()))
            }
        }
    }

    pub async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.ensure_open()?;
        let result = self.handle.rollback().await;
        self.state = TxState::RolledBack;
        match result {
            Ok(()) => {
                debug!(database = %self.database_name, "TX rolled back");
                Ok(())
            }
            Err(e) => {
                error!(database = %self.database_name, error = %e, "TX_ROLLBACK_ERROR");
                Err(e.context("rollback", self.database_name.clone()))
            }
        }
    }

    /// Commit on `Ok`, roll back on `Err`.
    pub async fn finish<T>(
        &mut self,
        result: Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        match result {
            Ok(value) => {
                if let Err(commit_err) = self.commit().await {
                    if let Err(rollback_err) = self.rollback().await {
                        warn!(
                            database = %self.database_name,
                            error = %rollback_err,
                            "rollback after failed commit also failed"
                        );
                    }
                    return Err(commit_err);
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(database = %self.database_name, error = %rollback_err, "TX rollback failed");
                }
                Err(e)
            }
        }
    }
}

impl Drop for DxDatabaseTx {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            warn!(
                database = %self.database_name,
                "transaction dropped while open, the driver rolls it back"
            );
        }
    }
}
