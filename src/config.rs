//! Runtime configuration read from the environment.
//!
//! A `.env` file in the working directory is loaded first when present. Values set in
//! the real environment win over the file.

use crate::dialect::Backend;
use std::time::Duration;
use thiserror::Error;

pub const DATABASE_URL_VAR: &str = "ALBUMEN_DATABASE_URL";
pub const MAX_CONNECTIONS_VAR: &str = "ALBUMEN_MAX_CONNECTIONS";
pub const CONNECT_TIMEOUT_VAR: &str = "ALBUMEN_CONNECT_TIMEOUT_SECS";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://albumen.sqlite3?mode=rwc";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported database url `{url}`: expected a sqlite: or postgres: scheme")]
    UnsupportedBackend { url: String },

    #[error("{var} must be a positive integer, got `{value}`")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is the normal case.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup(DATABASE_URL_VAR) {
            config.database_url = url;
        }
        if let Some(value) = lookup(MAX_CONNECTIONS_VAR) {
            config.max_connections = positive(MAX_CONNECTIONS_VAR, &value)?;
        }
        if let Some(value) = lookup(CONNECT_TIMEOUT_VAR) {
            config.connect_timeout = Duration::from_secs(positive(CONNECT_TIMEOUT_VAR, &value)?);
        }

        config.backend()?;
        Ok(config)
    }

    pub fn database_url<T: Into<String>>(mut self, url: T) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The backend named by the URL scheme.
    pub fn backend(&self) -> Result<Backend, ConfigError> {
        Backend::from_url(&self.database_url).ok_or_else(|| ConfigError::UnsupportedBackend {
            url: self.database_url.clone(),
        })
    }
}

fn positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match value.trim().parse::<T>() {
        Ok(n) if n > T::default() => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError};
    use crate::dialect::Backend;
    use std::{collections::HashMap, time::Duration};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(Config::default(), config);
        assert_eq!(Backend::Sqlite, config.backend().unwrap());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ALBUMEN_DATABASE_URL", "postgres://localhost/albumen"),
            ("ALBUMEN_MAX_CONNECTIONS", "12"),
            ("ALBUMEN_CONNECT_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();

        assert_eq!(Backend::Postgres, config.backend().unwrap());
        assert_eq!(12, config.max_connections);
        assert_eq!(Duration::from_secs(3), config.connect_timeout);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("ALBUMEN_DATABASE_URL", "mysql://localhost/x")])),
            Err(ConfigError::UnsupportedBackend { .. })
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("ALBUMEN_MAX_CONNECTIONS", "0")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("ALBUMEN_CONNECT_TIMEOUT_SECS", "soon")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .database_url("sqlite::memory:")
            .max_connections(1)
            .connect_timeout(Duration::from_secs(1));

        assert_eq!("sqlite::memory:", config.database_url);
        assert_eq!(1, config.max_connections);
    }
}
