use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {details}")]
    Invalid { key: &'static str, details: String },
}

/// Connection parameters for the PostgreSQL pool.
///
/// `port` and `ssl_mode` are kept as the raw strings from the environment;
/// they are checked when the connection descriptor is built.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let database = DatabaseConfig {
            host: required("POSTGRES_HOST")?,
            port: required("POSTGRES_PORT")?,
            user: required("POSTGRES_USER")?,
            password: required("POSTGRES_PASSWORD")?,
            name: required("POSTGRES_DB")?,
            ssl_mode: required("POSTGRES_SSL")?,
            max_connections: parsed(&lookup, "DB_MAX_CONNECTIONS", 10)?,
            acquire_timeout: Duration::from_secs(parsed(&lookup, "DB_ACQUIRE_TIMEOUT_SECS", 5)?),
        };

        let port = required("SERVER_PORT")?;
        let server = ServerConfig {
            host: lookup("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: port.parse().map_err(|e| ConfigError::Invalid {
                key: "SERVER_PORT",
                details: format!("{e}"),
            })?,
            request_timeout: Duration::from_secs(parsed(&lookup, "REQUEST_TIMEOUT_SECS", 30)?),
        };

        Ok(Self { database, server })
    }
}

fn parsed<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            details: e.to_string(),
        }),
        None => Ok(default),
    }
}
