// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server configuration.
//!
//! PostgreSQL connection parameters default from the environment
//! (`OML_PG_HOST`, `OML_PG_PORT`, `OML_PG_USER`, `OML_PG_PASS`,
//! `OML_PG_CONNINFO`); command-line flags take precedence over the
//! environment. Invalid configuration aborts at startup.

use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

pub const ENV_PG_HOST: &str = "OML_PG_HOST";
pub const ENV_PG_PORT: &str = "OML_PG_PORT";
pub const ENV_PG_USER: &str = "OML_PG_USER";
pub const ENV_PG_PASS: &str = "OML_PG_PASS";
pub const ENV_PG_CONNINFO: &str = "OML_PG_CONNINFO";

/// PostgreSQL connection parameters.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    /// Port number as text; non-numeric values fall back to 5432.
    pub port: String,
    pub user: String,
    pub pass: String,
    /// Extra libpq-style connection string, applied before the explicit
    /// parameters.
    pub conninfo: String,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: "5432".to_string(),
            user: "oml".to_string(),
            pass: String::new(),
            conninfo: String::new(),
        }
    }
}

impl PgConfig {
    /// Defaults overridden by the `OML_PG_*` environment variables.
    pub fn from_env() -> PgConfig {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> PgConfig {
        let defaults = PgConfig::default();
        PgConfig {
            host: get(ENV_PG_HOST).unwrap_or(defaults.host),
            port: get(ENV_PG_PORT).unwrap_or(defaults.port),
            user: get(ENV_PG_USER).unwrap_or(defaults.user),
            pass: get(ENV_PG_PASS).unwrap_or(defaults.pass),
            conninfo: get(ENV_PG_CONNINFO).unwrap_or(defaults.conninfo),
        }
    }

    /// The port as a number, defaulting to 5432 with a warning when the
    /// configured service cannot be resolved.
    pub fn port_number(&self) -> u16 {
        match self.port.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                warn!("could not resolve service '{}', defaulting to 5432", self.port);
                5432
            }
        }
    }
}

/// Which storage backend experiment databases live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub backend: BackendKind,
    /// Directory holding SQLite experiment files.
    pub data_dir: PathBuf,
    pub pg: PgConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PostgreSQL port '{0}'")]
    InvalidPort(String),
    #[error("data path '{0}' exists but is not a directory")]
    BadDataDir(PathBuf),
}

impl ServerConfig {
    /// Startup validation; failures here abort the server.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            BackendKind::Postgres => {
                if self.pg.port.parse::<u16>().is_err() {
                    return Err(ConfigError::InvalidPort(self.pg.port.clone()));
                }
            }
            BackendKind::Sqlite => {
                if self.data_dir.exists() && !self.data_dir.is_dir() {
                    return Err(ConfigError::BadDataDir(self.data_dir.clone()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_defaults() {
        let cfg = PgConfig::from_lookup(|key| match key {
            ENV_PG_HOST => Some("db.example".to_string()),
            ENV_PG_PORT => Some("5433".to_string()),
            _ => None,
        });
        assert_eq!(cfg.host, "db.example");
        assert_eq!(cfg.port, "5433");
        assert_eq!(cfg.user, "oml");
        assert!(cfg.pass.is_empty());
    }

    #[test]
    fn test_port_number_fallback() {
        let mut cfg = PgConfig::default();
        assert_eq!(cfg.port_number(), 5432);
        cfg.port = "15432".to_string();
        assert_eq!(cfg.port_number(), 15432);
        cfg.port = "postgresql".to_string();
        assert_eq!(cfg.port_number(), 5432);
    }

    #[test]
    fn test_validate_rejects_bad_port() {
        let config = ServerConfig {
            backend: BackendKind::Postgres,
            data_dir: PathBuf::from("."),
            pg: PgConfig {
                port: "not-a-port".to_string(),
                ..Default::default()
            },
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_validate_rejects_file_as_data_dir() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = ServerConfig {
            backend: BackendKind::Sqlite,
            data_dir: file.path().to_path_buf(),
            pg: PgConfig::default(),
        };
        assert!(matches!(config.validate(), Err(ConfigError::BadDataDir(_))));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let config = ServerConfig {
            backend: BackendKind::Sqlite,
            data_dir: PathBuf::from("."),
            pg: PgConfig::default(),
        };
        assert!(config.validate().is_ok());
    }
}
