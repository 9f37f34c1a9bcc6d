// Database Manager
// Registry of named databases and SQL scripts for one process

use crate::config::DatabasesConfiguration;
use crate::db::database::DxDatabase;
use crate::db::registry::DriverRegistry;
use crate::db::script::DxDatabaseScript;
use crate::db::traits::DatabaseError;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct DxDatabaseManager {
    registry: Arc<DriverRegistry>,
    databases: RwLock<IndexMap<String, Arc<DxDatabase>>>,
    scripts: RwLock<IndexMap<String, Arc<DxDatabaseScript>>>,
}

impl DxDatabaseManager {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            databases: RwLock::new(IndexMap::new()),
            scripts: RwLock::new(IndexMap::new()),
        }
    }

    /// Manager backed by every driver this crate ships
    pub async fn with_default_drivers() -> Self {
        Self::new(Arc::new(DriverRegistry::with_default_drivers().await))
    }

    pub fn registry(&self) -> Arc<DriverRegistry> {
        Arc::clone(&self.registry)
    }

    /// Register a database; an existing one with the same name id is returned unchanged.
    pub async fn new_database(
        &self,
        name_id: &str,
        is_connect_at_start: bool,
        must_connected: bool,
    ) -> Arc<DxDatabase> {
        let mut databases = self.databases.write().await;
        if let Some(existing) = databases.get(name_id) {
            return Arc::clone(existing);
        }
        let database = Arc::new(DxDatabase::new(
            name_id,
            Arc::clone(&self.registry),
            is_connect_at_start,
            must_connected,
        ));
        databases.insert(name_id.to_string(), Arc::clone(&database));
        database
    }

    pub async fn database(&self, name_id: &str) -> Result<Arc<DxDatabase>, DatabaseError> {
        self.databases
            .read()
            .await
            .get(name_id)
            .cloned()
            .ok_or_else(|| DatabaseError::DatabaseNotFound(name_id.to_string()))
    }

    pub async fn databases(&self) -> Vec<Arc<DxDatabase>> {
        self.databases.read().await.values().cloned().collect()
    }

    /// Configure every database. Sections without a registered database get
    /// one. Only fatal configuration errors are returned; the rest are logged.
    pub async fn load_from_configuration(
        &self,
        configuration: &DatabasesConfiguration,
    ) -> Result<(), DatabaseError> {
        for name_id in configuration.names() {
            self.new_database(name_id, false, false).await;
        }
        for database in self.databases().await {
            if let Err(e) = database.apply_from_configuration(configuration).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(database = %database.name_id(), error = %e, "database left unconfigured");
            }
        }
        Ok(())
    }

    /// Connect the databases flagged `is_connect_at_start`
    pub async fn connect_all_at_start(&self) -> Result<(), DatabaseError> {
        let mut errors = Vec::new();
        for database in self.databases().await {
            if !database.is_connect_at_start().await {
                continue;
            }
            if let Err(e) = database.connect().await {
                if e.is_fatal() {
                    return Err(e);
                }
                errors.push(e);
            }
        }
        aggregate(errors)
    }

    pub async fn connect_all(&self) -> Result<(), DatabaseError> {
        let mut errors = Vec::new();
        for database in self.databases().await {
            if let Err(e) = database.connect().await {
                errors.push(e);
            }
        }
        aggregate(errors)
    }

    /// Disconnect everything, reporting every failure at once
    pub async fn disconnect_all(&self) -> Result<(), DatabaseError> {
        let mut errors = Vec::new();
        for database in self.databases().await {
            if let Err(e) = database.disconnect().await {
                warn!(database = %database.name_id(), error = %e, "disconnect failed");
                errors.push(e);
            }
        }
        aggregate(errors)
    }

    pub async fn new_database_script<I, P>(&self, name_id: &str, files: I) -> Arc<DxDatabaseScript>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let script = Arc::new(DxDatabaseScript::new(name_id, files));
        self.scripts
            .write()
            .await
            .insert(name_id.to_string(), Arc::clone(&script));
        script
    }

    pub async fn script(&self, name_id: &str) -> Option<Arc<DxDatabaseScript>> {
        self.scripts.read().await.get(name_id).cloned()
    }

    /// Run every registered script against one database, in registration order
    pub async fn execute_scripts(&self, database_name_id: &str) -> Result<usize, DatabaseError> {
        let database = self.database(database_name_id).await?;
        let scripts: Vec<_> = self.scripts.read().await.values().cloned().collect();
        let mut executed = 0;
        for script in scripts {
            executed += script.execute(&database).await?.iter().sum::<usize>();
        }
        info!(database = %database_name_id, statements = executed, "Scripts executed");
        Ok(executed)
    }
}

fn aggregate(mut errors: Vec<DatabaseError>) -> Result<(), DatabaseError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(DatabaseError::Aggregate(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSection;
    use crate::db::database::tests::{mock_registry, section};
    use crate::db::dialect::DatabaseType;
    use std::io::Write;
    use std::sync::atomic::Ordering;

    fn configuration(entries: Vec<(&str, DatabaseSection)>) -> DatabasesConfiguration {
        DatabasesConfiguration {
            databases: entries
                .into_iter()
                .map(|(name, section)| (name.to_string(), section))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let (registry, _state) = mock_registry().await;
        let manager = DxDatabaseManager::new(registry);
        let first = manager.new_database("main", true, false).await;
        let second = manager.new_database("main", false, true).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.is_connect_at_start().await);
        assert!(!second.must_connected().await);
        assert!(matches!(
            manager.database("other").await,
            Err(DatabaseError::DatabaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_registers_configured_databases() {
        let (registry, _state) = mock_registry().await;
        let manager = DxDatabaseManager::new(registry);
        let mut broken = section();
        broken.database_type = Some("sybase".into());
        let config = configuration(vec![("main", section()), ("broken", broken)]);

        manager.load_from_configuration(&config).await.unwrap();
        let main = manager.database("main").await.unwrap();
        assert!(main.is_configured().await);
        assert_eq!(main.database_type().await, DatabaseType::Postgresql);
        assert!(!manager.database("broken").await.unwrap().is_configured().await);
    }

    #[tokio::test]
    async fn test_load_missing_section_of_required_database_is_fatal() {
        let (registry, _state) = mock_registry().await;
        let manager = DxDatabaseManager::new(registry);
        manager.new_database("audit", true, true).await;
        let err = manager
            .load_from_configuration(&configuration(vec![("main", section())]))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_all_at_start_and_disconnect_all() {
        let (registry, state) = mock_registry().await;
        let manager = DxDatabaseManager::new(registry);
        let mut eager = section();
        eager.is_connect_at_start = Some(true);
        manager
            .load_from_configuration(&configuration(vec![("eager", eager), ("lazy", section())]))
            .await
            .unwrap();

        manager.connect_all_at_start().await.unwrap();
        assert!(manager.database("eager").await.unwrap().is_connected());
        assert!(!manager.database("lazy").await.unwrap().is_connected());
        assert_eq!(state.dials.load(Ordering::SeqCst), 1);

        manager.connect_all().await.unwrap();
        assert_eq!(state.dials.load(Ordering::SeqCst), 2);

        manager.disconnect_all().await.unwrap();
        for database in manager.databases().await {
            assert!(!database.is_connected());
        }
    }

    #[tokio::test]
    async fn test_connect_all_aggregates_failures() {
        let (registry, state) = mock_registry().await;
        state.fail_dial.store(true, Ordering::SeqCst);
        let manager = DxDatabaseManager::new(registry);
        manager
            .load_from_configuration(&configuration(vec![("a", section()), ("b", section())]))
            .await
            .unwrap();
        match manager.connect_all().await {
            Err(DatabaseError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_scripts() {
        let (registry, state) = mock_registry().await;
        let manager = DxDatabaseManager::new(registry);
        manager
            .load_from_configuration(&configuration(vec![("main", section())]))
            .await
            .unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CREATE TABLE a (id int);\nCREATE INDEX a_id ON a (id);").unwrap();
        manager.new_database_script("schema", [file.path()]).await;
        assert!(manager.script("schema").await.is_some());

        assert_eq!(manager.execute_scripts("main").await.unwrap(), 2);
        assert_eq!(state.batches.lock().unwrap().len(), 2);
        assert!(manager.execute_scripts("missing").await.is_err());
    }
}
