// Database Module
// Dialect-aware query building, injection checks, pooled drivers and the
// `DxDatabase` / `DxDatabaseManager` surface applications use.

pub mod builder;
pub mod database;
pub mod dialect;
pub mod drivers;
pub mod error_check;
pub mod manager;
pub mod registry;
pub mod script;
pub mod sqlchecker;
pub mod traits;
pub mod transaction;
pub mod value;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::{
    CountRequest, CountResult, NamedStatement, OrderByField, PagingRequest, PagingResult,
    SelectRequest, Statement,
};
pub use database::{DxDatabase, OnCannotConnect};
pub use dialect::{DatabaseType, Dialect};
pub use drivers::{MysqlDriver, PostgresDriver, SqlServerDriver};
pub use error_check::{check_database_error, classify, ErrorClass};
pub use manager::DxDatabaseManager;
pub use registry::DriverRegistry;
pub use script::{split_sql_statements, DxDatabaseScript};
pub use sqlchecker::CheckOptions;
pub use traits::{
    Connection, DatabaseConfig, DatabaseDriver, DatabaseError, DriverError, ExecResult,
    InsertResult, PoolSettings, TransactionHandle,
};
pub use transaction::{DxDatabaseTx, IsolationLevel};
pub use value::{kv, FieldType, FieldTypeMapping, KeyValues, Row, RowSet, SqlExpression, SqlValue};
