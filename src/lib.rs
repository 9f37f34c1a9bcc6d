// dx-database
// Cross-dialect SQL query building and database layer

pub mod config;
pub mod db;
pub mod logging;

pub use config::{ConfigError, DatabaseSection, DatabasesConfiguration, RetryPolicy};
pub use db::{
    CheckOptions, DatabaseError, DatabaseType, DxDatabase, DxDatabaseManager, DxDatabaseTx,
    IsolationLevel, KeyValues, Row, RowSet, SqlValue,
};
pub use logging::{init_logging, LogFormat, LoggingConfig};
