// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gantry-agent-client.

use thiserror::Error;

/// Result type using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to a node agent.
///
/// The taxonomy matters to callers: [`ClientError::Auth`] is terminal and is
/// never retried by the client, while [`ClientError::Connection`] covers
/// everything transient (timeouts, transport failures, non-2xx responses)
/// and has already exhausted the retry budget by the time it surfaces.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The agent rejected our credentials (HTTP 401/403). Never retried.
    #[error("node agent rejected credentials (HTTP {status})")]
    Auth {
        /// The HTTP status the agent answered with.
        status: u16,
    },

    /// Timeout, transport failure, or an unexpected HTTP status.
    #[error("connection error talking to node agent: {0}")]
    Connection(String),

    /// The connection descriptor produced an unusable URL.
    #[error("invalid agent URL: {0}")]
    InvalidUrl(String),

    /// The agent answered 2xx but the body could not be decoded.
    #[error("unexpected response from node agent: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// True if this error represents a rejected credential.
    pub fn is_auth(&self) -> bool {
        matches!(self, ClientError::Auth { .. })
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::UnexpectedResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_display() {
        let err = ClientError::Auth { status: 403 };
        assert_eq!(
            err.to_string(),
            "node agent rejected credentials (HTTP 403)"
        );
        assert!(err.is_auth());
    }

    #[test]
    fn test_connection_error_is_not_auth() {
        let err = ClientError::Connection("connect timeout".to_string());
        assert!(!err.is_auth());
        assert!(err.to_string().contains("connect timeout"));
    }
}
