// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The node agent HTTP client.
//!
//! One [`AgentClient`] is bound to one node's connection descriptor and is
//! stateless per call: it holds only the static connection info plus a
//! configured `reqwest` client. Every operation funnels through a single
//! request path that implements the retry and error policy:
//!
//! - HTTP 401/403 surface as [`ClientError::Auth`] immediately, never retried.
//! - Any other failure (non-2xx, transport error, timeout) surfaces as
//!   [`ClientError::Connection`] after the retry budget is spent; attempt `n`
//!   backs off `backoff_base * 2^n` before retrying.
//! - HTTP 204/202, non-JSON content types, and empty bodies decode as an
//!   empty result rather than erroring.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::NodeConnection;
use crate::error::{ClientError, Result};
use crate::types::{
    BackupDownloadUrl, BackupSummary, ChmodFile, ChmodRequest, CommandRequest, CompressRequest,
    CopyRequest, CreateBackupRequest, CreateServerRequest, DecompressRequest, DeleteFilesRequest,
    FileEntry, PowerAction, PowerRequest, PullFileRequest, RenameFile, RenameRequest,
    RestoreBackupRequest, ServerConfiguration, ServerDetails, SystemInformation,
    TransferNotifyRequest, WebsocketToken,
};

/// Request payload variants the agent protocol uses.
enum Payload {
    None,
    Json(Value),
    /// Raw text body (file writes).
    Text(String),
}

/// HTTP client for a single node agent.
pub struct AgentClient {
    http: reqwest::Client,
    conn: NodeConnection,
}

impl AgentClient {
    /// Build a client for the given connection descriptor.
    ///
    /// TLS certificate verification is controlled per connection via
    /// `skip_cert_verification`; no process-global state is touched.
    pub fn new(conn: NodeConnection) -> Result<Self> {
        // Validate the descriptor up front so a bad scheme/host fails here,
        // not on the first operation.
        conn.base_url()?;

        let http = reqwest::Client::builder()
            .timeout(conn.request_timeout)
            .danger_accept_invalid_certs(conn.skip_cert_verification)
            .build()
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        Ok(Self { http, conn })
    }

    /// The connection descriptor this client was built from.
    pub fn connection(&self) -> &NodeConnection {
        &self.conn
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    /// Send a request, applying the auth/retry policy, and return the raw
    /// successful response.
    async fn perform(&self, method: Method, url: Url, payload: &Payload) -> Result<Response> {
        let mut attempt: u32 = 0;

        loop {
            let mut builder = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&self.conn.token)
                .header(ACCEPT, "application/json");

            builder = match payload {
                Payload::None => builder,
                Payload::Json(body) => builder.json(body),
                Payload::Text(body) => builder
                    .header(CONTENT_TYPE, "text/plain")
                    .body(body.clone()),
            };

            let err = match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        // Credential rejection is terminal; retrying cannot help.
                        return Err(ClientError::Auth {
                            status: status.as_u16(),
                        });
                    }
                    if status.is_success() {
                        return Ok(response);
                    }
                    ClientError::Connection(format!(
                        "{} {} answered HTTP {}",
                        method,
                        url.path(),
                        status.as_u16()
                    ))
                }
                Err(e) if e.is_timeout() => {
                    ClientError::Connection(format!("{} {} timed out", method, url.path()))
                }
                Err(e) => ClientError::Connection(e.to_string()),
            };

            if attempt >= self.conn.retries {
                return Err(err);
            }

            let backoff = self.conn.backoff_base * 2u32.pow(attempt);
            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Agent request failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Send a request and decode the JSON body into `T`.
    ///
    /// 204/202, non-JSON content types, and empty bodies decode from JSON
    /// `null`, so `()` and `Option<T>` results tolerate them.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        payload: Payload,
    ) -> Result<T> {
        let mut url = self.conn.endpoint(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().copied());
        }

        let response = self.perform(method, url, &payload).await?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);

        let body = if status == StatusCode::NO_CONTENT || status == StatusCode::ACCEPTED {
            Value::Null
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?;
            if !is_json || bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes)?
            }
        };

        debug!(status = status.as_u16(), "Agent request completed");
        Ok(serde_json::from_value(body)?)
    }

    /// Send a request and return the response body as text.
    async fn request_text(&self, method: Method, path: &str, query: &[(&str, &str)]) -> Result<String> {
        let mut url = self.conn.endpoint(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().copied());
        }
        let response = self.perform(method, url, &Payload::None).await?;
        response
            .text()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))
    }

    fn json(body: impl serde::Serialize) -> Result<Payload> {
        Ok(Payload::Json(serde_json::to_value(body)?))
    }

    // =========================================================================
    // System
    // =========================================================================

    /// Fetch agent version and host details. Also serves as a liveness probe.
    #[instrument(skip(self))]
    pub async fn get_system_information(&self) -> Result<SystemInformation> {
        self.request(Method::GET, "/api/system", &[], Payload::None)
            .await
    }

    // =========================================================================
    // Server lifecycle
    // =========================================================================

    /// Fetch runtime details for one workload.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn get_server_details(&self, uuid: Uuid) -> Result<ServerDetails> {
        self.request(
            Method::GET,
            &format!("/api/servers/{uuid}"),
            &[],
            Payload::None,
        )
        .await
    }

    /// Create a workload on the agent. Installation continues asynchronously;
    /// callers poll [`Self::get_server_details`] until the state settles.
    #[instrument(skip(self, request), fields(server = %request.uuid))]
    pub async fn create_server(&self, request: &CreateServerRequest) -> Result<()> {
        self.request(Method::POST, "/api/servers", &[], Self::json(request)?)
            .await
    }

    /// Replace the agent's stored configuration for a workload.
    #[instrument(skip(self, settings), fields(server = %uuid))]
    pub async fn update_server(&self, uuid: Uuid, settings: &ServerConfiguration) -> Result<()> {
        self.request(
            Method::PATCH,
            &format!("/api/servers/{uuid}"),
            &[],
            Self::json(settings)?,
        )
        .await
    }

    /// Ask the agent to re-fetch the workload's configuration from the panel.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn sync_server(&self, uuid: Uuid) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/sync"),
            &[],
            Payload::None,
        )
        .await
    }

    /// Delete a workload and its data from the agent.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn delete_server(&self, uuid: Uuid) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("/api/servers/{uuid}"),
            &[],
            Payload::None,
        )
        .await
    }

    /// Re-run the workload's install process.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn reinstall_server(&self, uuid: Uuid) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/reinstall"),
            &[],
            Payload::None,
        )
        .await
    }

    /// Send a power action to a workload.
    #[instrument(skip(self), fields(server = %uuid, action = action.as_str()))]
    pub async fn power(&self, uuid: Uuid, action: PowerAction) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/power"),
            &[],
            Self::json(PowerRequest { action })?,
        )
        .await
    }

    /// Send console commands to a running workload.
    #[instrument(skip(self, commands), fields(server = %uuid, count = commands.len()))]
    pub async fn send_commands(&self, uuid: Uuid, commands: &[String]) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/commands"),
            &[],
            Self::json(CommandRequest {
                commands: commands.to_vec(),
            })?,
        )
        .await
    }

    /// Mint a signed console websocket token for a workload.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn get_websocket_token(&self, uuid: Uuid) -> Result<WebsocketToken> {
        self.request(
            Method::GET,
            &format!("/api/servers/{uuid}/ws"),
            &[],
            Payload::None,
        )
        .await
    }

    /// Notify the source agent that a workload should be pushed to another
    /// node. The payload carries the destination base URL and a short-lived
    /// credential the destination will accept.
    #[instrument(skip(self, request), fields(server = %request.server_id))]
    pub async fn notify_transfer(&self, request: &TransferNotifyRequest) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{}/transfer", request.server_id),
            &[],
            Self::json(request)?,
        )
        .await
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// List a directory inside the workload filesystem.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn list_files(&self, uuid: Uuid, directory: &str) -> Result<Vec<FileEntry>> {
        self.request(
            Method::GET,
            &format!("/api/servers/{uuid}/files/list-directory"),
            &[("directory", directory)],
            Payload::None,
        )
        .await
    }

    /// Read a file's contents as text.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn read_file(&self, uuid: Uuid, file: &str) -> Result<String> {
        self.request_text(
            Method::GET,
            &format!("/api/servers/{uuid}/files/contents"),
            &[("file", file)],
        )
        .await
    }

    /// Write text contents to a file, creating it if needed.
    #[instrument(skip(self, contents), fields(server = %uuid))]
    pub async fn write_file(&self, uuid: Uuid, file: &str, contents: &str) -> Result<()> {
        let mut url = self
            .conn
            .endpoint(&format!("/api/servers/{uuid}/files/write"))?;
        url.query_pairs_mut().append_pair("file", file);
        self.perform(Method::POST, url, &Payload::Text(contents.to_string()))
            .await?;
        Ok(())
    }

    /// Rename (move) one or more files relative to `root`.
    #[instrument(skip(self, files), fields(server = %uuid, count = files.len()))]
    pub async fn rename_files(&self, uuid: Uuid, root: &str, files: Vec<RenameFile>) -> Result<()> {
        self.request(
            Method::PUT,
            &format!("/api/servers/{uuid}/files/rename"),
            &[],
            Self::json(RenameRequest {
                root: root.to_string(),
                files,
            })?,
        )
        .await
    }

    /// Duplicate a file next to itself.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn copy_file(&self, uuid: Uuid, location: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/files/copy"),
            &[],
            Self::json(CopyRequest {
                location: location.to_string(),
            })?,
        )
        .await
    }

    /// Delete files relative to `root`.
    #[instrument(skip(self, files), fields(server = %uuid, count = files.len()))]
    pub async fn delete_files(&self, uuid: Uuid, root: &str, files: Vec<String>) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/files/delete"),
            &[],
            Self::json(DeleteFilesRequest {
                root: root.to_string(),
                files,
            })?,
        )
        .await
    }

    /// Change file modes relative to `root`.
    #[instrument(skip(self, files), fields(server = %uuid, count = files.len()))]
    pub async fn chmod_files(&self, uuid: Uuid, root: &str, files: Vec<ChmodFile>) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/files/chmod"),
            &[],
            Self::json(ChmodRequest {
                root: root.to_string(),
                files,
            })?,
        )
        .await
    }

    /// Compress files into an archive; returns the archive's directory entry.
    #[instrument(skip(self, files), fields(server = %uuid, count = files.len()))]
    pub async fn compress_files(
        &self,
        uuid: Uuid,
        root: &str,
        files: Vec<String>,
    ) -> Result<FileEntry> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/files/compress"),
            &[],
            Self::json(CompressRequest {
                root: root.to_string(),
                files,
            })?,
        )
        .await
    }

    /// Expand an archive in place.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn decompress_file(&self, uuid: Uuid, root: &str, file: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/files/decompress"),
            &[],
            Self::json(DecompressRequest {
                root: root.to_string(),
                file: file.to_string(),
            })?,
        )
        .await
    }

    /// Pull a remote URL into the workload filesystem.
    #[instrument(skip(self, request), fields(server = %uuid))]
    pub async fn pull_file(&self, uuid: Uuid, request: &PullFileRequest) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/files/pull"),
            &[],
            Self::json(request)?,
        )
        .await
    }

    // =========================================================================
    // Backups
    // =========================================================================

    /// List backups the agent knows about for a workload.
    #[instrument(skip(self), fields(server = %uuid))]
    pub async fn list_backups(&self, uuid: Uuid) -> Result<Vec<BackupSummary>> {
        self.request(
            Method::GET,
            &format!("/api/servers/{uuid}/backups"),
            &[],
            Payload::None,
        )
        .await
    }

    /// Start a backup on the agent. Completion is reported asynchronously.
    #[instrument(skip(self, request), fields(server = %uuid, backup = %request.uuid))]
    pub async fn create_backup(&self, uuid: Uuid, request: &CreateBackupRequest) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/backup"),
            &[],
            Self::json(request)?,
        )
        .await
    }

    /// Delete a backup archive from the agent.
    #[instrument(skip(self), fields(server = %uuid, backup = %backup))]
    pub async fn delete_backup(&self, uuid: Uuid, backup: Uuid) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("/api/servers/{uuid}/backup/{backup}"),
            &[],
            Payload::None,
        )
        .await
    }

    /// Restore a backup onto the workload.
    #[instrument(skip(self, request), fields(server = %uuid, backup = %backup))]
    pub async fn restore_backup(
        &self,
        uuid: Uuid,
        backup: Uuid,
        request: &RestoreBackupRequest,
    ) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/servers/{uuid}/backup/{backup}/restore"),
            &[],
            Self::json(request)?,
        )
        .await
    }

    /// Fetch a signed, time-limited download URL for a backup archive.
    #[instrument(skip(self), fields(server = %uuid, backup = %backup))]
    pub async fn get_backup_download_url(
        &self,
        uuid: Uuid,
        backup: Uuid,
    ) -> Result<BackupDownloadUrl> {
        self.request(
            Method::GET,
            &format!("/api/servers/{uuid}/backup/{backup}/download"),
            &[],
            Payload::None,
        )
        .await
    }
}

/// Convenience: poll a workload's details until its state settles.
///
/// Returns the settled details, or a [`ClientError::Connection`] once
/// `max_attempts` polls have elapsed without the state settling.
pub async fn wait_for_settled_state(
    client: &AgentClient,
    uuid: Uuid,
    poll_interval: Duration,
    max_attempts: u32,
) -> Result<ServerDetails> {
    for attempt in 0..max_attempts {
        let details = client.get_server_details(uuid).await?;
        if details.state.is_settled() {
            return Ok(details);
        }
        debug!(
            server = %uuid,
            attempt,
            state = ?details.state,
            "Workload not settled yet"
        );
        // No point sleeping after the last poll; the caller gets the
        // timeout error right away.
        if attempt + 1 < max_attempts {
            tokio::time::sleep(poll_interval).await;
        }
    }

    Err(ClientError::Connection(format!(
        "workload {uuid} did not settle within {max_attempts} polls"
    )))
}
