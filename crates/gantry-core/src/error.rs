// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for panel orchestration.

use thiserror::Error;

/// Top-level error for orchestration operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading or validation failed
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Credential vault operation failed
    #[error("vault error: {0}")]
    Vault(#[from] crate::vault::VaultError),

    /// A call to a node agent failed
    #[error("agent error: {0}")]
    Agent(#[from] gantry_agent_client::ClientError),

    /// Signing a transfer credential failed
    #[error("credential signing error: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    /// A referenced node does not exist
    #[error("node {0} not found")]
    NodeNotFound(i32),

    /// A referenced workload does not exist
    #[error("workload {0} not found")]
    ServerNotFound(i32),

    /// A referenced schedule does not exist
    #[error("schedule {0} not found")]
    ScheduleNotFound(i32),

    /// The request was rejected by a precondition check
    #[error("{reason}")]
    Validation {
        /// Human-readable rejection reason
        reason: String,
        /// Suggested HTTP-style status for API surfaces
        status: u16,
    },
}

impl Error {
    /// Build a [`Error::Validation`] with a suggested HTTP-style status.
    pub fn validation(status: u16, reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
            status,
        }
    }

    /// Suggested HTTP-style status for this error. Orchestration has no
    /// HTTP surface of its own, but callers embedding it in one need a
    /// consistent mapping.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { status, .. } => *status,
            Self::NodeNotFound(_) | Self::ServerNotFound(_) | Self::ScheduleNotFound(_) => 404,
            Self::Agent(e) if e.is_auth() => 502,
            Self::Agent(_) => 504,
            _ => 500,
        }
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_carries_status_and_reason() {
        let err = Error::validation(409, "workload is already being transferred");
        assert_eq!(err.http_status(), 409);
        assert_eq!(err.to_string(), "workload is already being transferred");
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(Error::NodeNotFound(7).http_status(), 404);
        assert_eq!(Error::ServerNotFound(3).http_status(), 404);
    }

    #[test]
    fn agent_connection_failure_maps_to_gateway_timeout() {
        let err = Error::Agent(gantry_agent_client::ClientError::Connection(
            "connection refused".into(),
        ));
        assert_eq!(err.http_status(), 504);
    }

    #[test]
    fn agent_auth_failure_maps_to_bad_gateway() {
        let err = Error::Agent(gantry_agent_client::ClientError::Auth { status: 401 });
        assert_eq!(err.http_status(), 502);
    }
}
