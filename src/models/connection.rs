//! Data-source related data models.
//!
//! This module defines types for data source configuration and the nested
//! transaction state machine.

use crate::config::PoolOptions;
use serde::{Deserialize, Serialize};
use url::Url;

/// Role a data source plays for a logical database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    /// Read-write primary; joins nested transactions.
    #[default]
    Master,
    /// Read replica; never joins nested transactions.
    Slave,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Slave => "slave",
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Actor {
    type Err = ConnectionConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "slave" => Ok(Self::Slave),
            other => Err(ConnectionConfigError::UnknownActor(other.to_string())),
        }
    }
}

/// Configuration for one data source (one logical database in one role).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub actor: Actor,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub user: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Prepended to every table name built through the query builder.
    #[serde(default)]
    pub prefix: String,
    /// False selects a single unpooled driver.
    #[serde(default = "default_pooled")]
    pub pooled: bool,
    #[serde(default)]
    pub pool_options: PoolOptions,
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_pooled() -> bool {
    true
}

impl DataSource {
    /// Create a new data source configuration from a MySQL connection URL.
    pub fn new(
        name: impl Into<String>,
        actor: Actor,
        connection_string: impl Into<String>,
        prefix: impl Into<String>,
        pool_options: PoolOptions,
    ) -> Result<Self, ConnectionConfigError> {
        let name = name.into();
        let connection_string = connection_string.into();

        if name.is_empty() {
            return Err(ConnectionConfigError::EmptyName);
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConnectionConfigError::InvalidName(name));
        }

        let url = Url::parse(&connection_string)
            .map_err(|e| ConnectionConfigError::InvalidUrl(e.to_string()))?;
        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "mysql" && scheme != "mariadb" {
            return Err(ConnectionConfigError::UnsupportedScheme(scheme));
        }

        let database = url
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(String::from);

        Ok(Self {
            name,
            actor,
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(3306),
            database,
            user: url.username().to_string(),
            charset: default_charset(),
            prefix: prefix.into(),
            pooled: true,
            pool_options,
            connection_string,
        })
    }

    /// Identity of the physical data source, without credentials.
    ///
    /// Two logical databases pointing at the same server and schema share a
    /// dsn and therefore share one transaction inside a nested scope.
    pub fn dsn(&self) -> String {
        format!(
            "mysql://{}@{}:{}/{}",
            self.user,
            self.host,
            self.port,
            self.database.as_deref().unwrap_or("")
        )
    }

    /// Same settings, different role.
    pub fn with_actor(&self, actor: Actor) -> Self {
        Self {
            actor,
            ..self.clone()
        }
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        if let Some(at_pos) = self.connection_string.find('@') {
            if let Some(colon_pos) = self.connection_string[..at_pos].rfind(':') {
                // The scheme separator is not a password separator
                if !self.connection_string[colon_pos..].starts_with("://") {
                    let prefix = &self.connection_string[..colon_pos + 1];
                    let suffix = &self.connection_string[at_pos..];
                    return format!("{}****{}", prefix, suffix);
                }
            }
        }
        self.connection_string.clone()
    }
}

/// Errors that can occur when creating a data source configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    #[error("Data source name cannot be empty")]
    EmptyName,

    /// Data source name contains invalid characters
    #[error("Data source name contains invalid characters: {0}")]
    InvalidName(String),

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported scheme '{0}', expected mysql://")]
    UnsupportedScheme(String),

    #[error("Unknown actor '{0}', expected master or slave")]
    UnknownActor(String),
}

impl From<ConnectionConfigError> for crate::error::DbError {
    fn from(err: ConnectionConfigError) -> Self {
        crate::error::DbError::config(err.to_string())
    }
}

/// State of a nested transaction coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedState {
    #[default]
    Inactive,
    Active,
    Finished,
}

impl NestedState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}
