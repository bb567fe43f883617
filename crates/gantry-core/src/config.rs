// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment-driven configuration.
//!
//! All settings come from `GANTRY_*` environment variables. The database
//! URL and vault passphrase are required; everything else has a default
//! suitable for local development.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is not set
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable is set but cannot be parsed
    #[error("invalid value for {name}: {value}")]
    Invalid {
        /// The variable name
        name: &'static str,
        /// The offending value
        value: String,
    },
}

/// Runtime configuration for the orchestration core.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Passphrase the credential vault derives its key from
    pub vault_passphrase: String,
    /// Base URL agents use to call back into the panel
    pub panel_url: String,
    /// How often the schedule poller scans for due schedules
    pub schedule_poll_interval: Duration,
    /// Maximum PostgreSQL connections in the pool
    pub max_db_connections: u32,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require("GANTRY_DATABASE_URL")?,
            vault_passphrase: require("GANTRY_VAULT_PASSPHRASE")?,
            panel_url: env::var("GANTRY_PANEL_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            schedule_poll_interval: Duration::from_secs(parse_or(
                "GANTRY_SCHEDULE_POLL_SECS",
                60,
            )?),
            max_db_connections: parse_or("GANTRY_MAX_DB_CONNECTIONS", 10)?,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
        }),
        Err(_) => Ok(default),
    }
}
