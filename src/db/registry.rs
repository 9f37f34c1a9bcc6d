// Driver Registry
// Maps each database type to the driver that opens pools for it

use crate::db::dialect::DatabaseType;
use crate::db::drivers::{MysqlDriver, PostgresDriver, SqlServerDriver};
use crate::db::traits::{DatabaseDriver, DatabaseError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Registry for managing database drivers
pub struct DriverRegistry {
    drivers: RwLock<HashMap<DatabaseType, Arc<dyn DatabaseDriver>>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding every driver this crate ships
    pub async fn with_default_drivers() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(PostgresDriver::new())).await;
        registry.register(Arc::new(SqlServerDriver::new())).await;
        registry.register(Arc::new(MysqlDriver::mysql())).await;
        registry.register(Arc::new(MysqlDriver::mariadb())).await;
        registry
    }

    /// Register a database driver, replacing any previous one for the type
    pub async fn register(&self, driver: Arc<dyn DatabaseDriver>) {
        let db_type = driver.database_type();
        let mut drivers = self.drivers.write().await;
        drivers.insert(db_type, driver);
        debug!(database_type = %db_type, "registered driver");
    }

    /// Get a driver by database type
    pub async fn get_driver(
        &self,
        db_type: DatabaseType,
    ) -> Result<Arc<dyn DatabaseDriver>, DatabaseError> {
        let drivers = self.drivers.read().await;
        drivers
            .get(&db_type)
            .cloned()
            .ok_or(DatabaseError::DriverNotFound(db_type))
    }

    /// Get all registered database types
    pub async fn get_supported_types(&self) -> Vec<DatabaseType> {
        let drivers = self.drivers.read().await;
        drivers.keys().copied().collect()
    }

    /// Check if a driver is registered for a given database type
    pub async fn has_driver(&self, db_type: DatabaseType) -> bool {
        let drivers = self.drivers.read().await;
        drivers.contains_key(&db_type)
    }

    /// Remove a driver (useful for testing)
    pub async fn unregister(&self, db_type: DatabaseType) {
        let mut drivers = self.drivers.write().await;
        drivers.remove(&db_type);
        debug!(database_type = %db_type, "unregistered driver");
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
