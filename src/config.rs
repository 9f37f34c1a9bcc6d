// Database Configuration
// JSON sections keyed by database name id, loaded from a string, a file or
// the file named by `DX_DATABASE_CONFIG`.

use crate::db::dialect::DatabaseType;
use crate::db::traits::PoolSettings;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "DX_DATABASE_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Reconnect-and-retry policy for statements that lose their connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_ms: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_ms: 2000,
        }
    }
}

/// One database entry. Mandatory fields stay optional here so a missing
/// field can be reported against `must_connected`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub database_type: Option<String>,
    pub address: Option<String>,
    pub user_name: Option<String>,
    #[serde(skip_serializing)]
    pub user_password: Option<String>,
    pub database_name: Option<String>,
    pub connection_options: String,
    pub must_connected: Option<bool>,
    pub is_connect_at_start: Option<bool>,
    pub create_script_files: Vec<String>,
    pub retry: RetryPolicy,
    pub pool: PoolSettings,
}

impl DatabaseSection {
    /// `Unknown` when the field is missing or names an unsupported engine
    pub fn resolved_database_type(&self) -> DatabaseType {
        self.database_type
            .as_deref()
            .map(DatabaseType::from_str_lossy)
            .unwrap_or_default()
    }
}

/// All database sections, in file order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DatabasesConfiguration {
    pub databases: IndexMap<String, DatabaseSection>,
}

impl DatabasesConfiguration {
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Load the file named by `DX_DATABASE_CONFIG`
    pub fn from_env() -> ConfigResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).map_err(|_| ConfigError::MissingEnv(CONFIG_PATH_ENV))?;
        Self::from_file(path)
    }

    pub fn get(&self, name_id: &str) -> Option<&DatabaseSection> {
        self.databases.get(name_id)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.databases.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "main": {
            "database_type": "postgres",
            "address": "localhost:5432",
            "user_name": "app",
            "user_password": "secret",
            "database_name": "dx",
            "connection_options": "sslmode=disable",
            "must_connected": true,
            "is_connect_at_start": true,
            "create_script_files": ["schema.sql"],
            "retry": { "max_attempts": 2 }
        },
        "audit": {
            "database_type": "sybase"
        }
    }"#;

    #[test]
    fn test_parse_sections() {
        let config = DatabasesConfiguration::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.names().collect::<Vec<_>>(), vec!["main", "audit"]);

        let main = config.get("main").unwrap();
        assert_eq!(main.resolved_database_type(), DatabaseType::Postgresql);
        assert_eq!(main.must_connected, Some(true));
        assert_eq!(main.create_script_files, vec!["schema.sql"]);
        assert_eq!(main.retry.max_attempts, 2);
        assert_eq!(main.retry.backoff(), Duration::from_secs(2));
        assert_eq!(main.pool, PoolSettings::default());

        let audit = config.get("audit").unwrap();
        assert_eq!(audit.resolved_database_type(), DatabaseType::Unknown);
        assert!(audit.address.is_none());
    }

    #[test]
    fn test_password_not_serialized() {
        let config = DatabasesConfiguration::from_json_str(SAMPLE).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            DatabasesConfiguration::from_json_str("{ not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = DatabasesConfiguration::from_file(file.path()).unwrap();
        assert!(config.get("main").is_some());

        let missing = DatabasesConfiguration::from_file("/nonexistent/dx.json");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        std::env::set_var(CONFIG_PATH_ENV, file.path());
        let config = DatabasesConfiguration::from_env().unwrap();
        assert_eq!(config.databases.len(), 2);

        std::env::remove_var(CONFIG_PATH_ENV);
        assert!(matches!(
            DatabasesConfiguration::from_env(),
            Err(ConfigError::MissingEnv(CONFIG_PATH_ENV))
        ));
    }
}
