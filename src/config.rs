//! Backing-store configuration.

use std::env;

use crate::error::{ErrorCode, StorageError, StorageResult};

/// Environment variable holding the database user name.
pub const ENV_DB_USERNAME: &str = "AZURITE_DB_USERNAME";
/// Environment variable holding the database password.
pub const ENV_DB_PASSWORD: &str = "AZURITE_DB_PASSWORD";
/// Environment variable holding the database name (file path for SQLite).
pub const ENV_DB_NAME: &str = "AZURITE_DB_NAME";
/// Environment variable holding the database host name.
pub const ENV_DB_HOSTNAME: &str = "AZURITE_DB_HOSTNAME";
/// Environment variable selecting the database dialect.
pub const ENV_DB_DIALECT: &str = "AZURITE_DB_DIALECT";

/// Default pool size for the metadata store.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Supported backing-store dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Sqlite,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
        }
    }

    pub fn parse(s: &str) -> StorageResult<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            other => Err(StorageError::with_message(
                ErrorCode::InvalidInput,
                format!("unsupported database dialect `{other}`; this build supports sqlite"),
            )),
        }
    }
}

/// Database connection configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database name. For SQLite this is the database file path; empty means
    /// an in-memory database.
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub dialect: Dialect,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            name: None,
            hostname: None,
            dialect: Dialect::Sqlite,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl DbConfig {
    /// Builds a configuration from `AZURITE_DB_*` environment variables.
    pub fn from_env() -> StorageResult<Self> {
        let dialect = match env::var(ENV_DB_DIALECT) {
            Ok(value) => Dialect::parse(&value)?,
            Err(_) => Dialect::default(),
        };

        Ok(Self {
            username: env::var(ENV_DB_USERNAME).ok(),
            password: env::var(ENV_DB_PASSWORD).ok(),
            name: env::var(ENV_DB_NAME).ok().filter(|s| !s.is_empty()),
            hostname: env::var(ENV_DB_HOSTNAME).ok(),
            dialect,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    /// Creates an in-memory configuration, useful for tests.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Returns the connection URI for this configuration.
    pub fn connection_uri(&self) -> String {
        match (&self.dialect, &self.name) {
            (Dialect::Sqlite, Some(path)) => format!("sqlite://{path}?mode=rwc"),
            (Dialect::Sqlite, None) => "sqlite::memory:".to_string(),
        }
    }

    /// Returns true when the configuration points at an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.name.is_none()
    }
}
