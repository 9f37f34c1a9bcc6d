// Database Drivers
// One pooled driver per engine family; Oracle has a dialect but no driver

pub mod mssql;
pub mod mysql;
pub mod postgres;

// Re-export drivers
pub use mssql::SqlServerDriver;
pub use mysql::MysqlDriver;
pub use postgres::PostgresDriver;
