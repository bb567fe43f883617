// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection descriptor for a single node agent.

use std::time::Duration;

use url::Url;

use crate::error::{ClientError, Result};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default retry budget for transport-level failures.
pub const DEFAULT_RETRIES: u32 = 1;

/// Default backoff base; attempt `n` waits `base * 2^n` before retrying.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Everything needed to reach one node agent.
///
/// A descriptor is cheap to build and holds no live connection state; the
/// panel resolves one from the node registry per operation. The bearer token
/// is the combined `tokenId.secret` credential formatted by the token vault.
#[derive(Debug, Clone)]
pub struct NodeConnection {
    /// URL scheme, `http` or `https`.
    pub scheme: String,
    /// Hostname or IP the agent listens on.
    pub fqdn: String,
    /// Agent listen port.
    pub port: u16,
    /// Combined bearer credential (`tokenId.secret`).
    pub token: String,
    /// Accept invalid TLS certificates for this node only.
    ///
    /// Threaded through to the HTTP transport per connection instead of
    /// flipping process-wide verification state.
    pub skip_cert_verification: bool,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// How many times a transport failure is retried before surfacing.
    pub retries: u32,
    /// Backoff base for retries.
    pub backoff_base: Duration,
}

impl NodeConnection {
    /// Create a descriptor with default timeout/retry settings.
    pub fn new(
        scheme: impl Into<String>,
        fqdn: impl Into<String>,
        port: u16,
        token: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            fqdn: fqdn.into(),
            port,
            token: token.into(),
            skip_cert_verification: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: DEFAULT_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    /// Accept invalid TLS certificates for this connection.
    pub fn with_skip_cert_verification(mut self, skip: bool) -> Self {
        self.skip_cert_verification = skip;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the retry budget for transport failures.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the backoff base for retries.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// The agent's base URL (`scheme://fqdn:port`).
    pub fn base_url(&self) -> Result<Url> {
        let raw = format!("{}://{}:{}", self.scheme, self.fqdn, self.port);
        let url = Url::parse(&raw)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        Ok(url)
    }

    /// Resolve an API path against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self.base_url()?;
        Ok(base.join(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let conn = NodeConnection::new("https", "node1.example.com", 8080, "id.secret");
        assert_eq!(
            conn.base_url().unwrap().as_str(),
            "https://node1.example.com:8080/"
        );
    }

    #[test]
    fn test_endpoint_join() {
        let conn = NodeConnection::new("http", "10.0.0.5", 8080, "id.secret");
        let url = conn.endpoint("/api/servers").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:8080/api/servers");
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let conn = NodeConnection::new("ftp", "node1", 21, "id.secret");
        assert!(matches!(
            conn.base_url(),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let conn = NodeConnection::new("https", "node1", 8080, "id.secret");
        assert_eq!(conn.request_timeout, Duration::from_secs(10));
        assert_eq!(conn.retries, 1);
        assert_eq!(conn.backoff_base, Duration::from_millis(200));
        assert!(!conn.skip_cert_verification);
    }
}
