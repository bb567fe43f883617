// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types for the node agent's JSON-over-HTTP protocol.
//!
//! The protocol is defined by the agent; these types mirror what it accepts
//! and emits. Request types serialize exactly what the agent expects, and
//! response types tolerate fields we do not consume being absent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Power & console
// ============================================================================

/// Power verbs the agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    /// Boot the workload.
    Start,
    /// Graceful stop.
    Stop,
    /// Stop then start.
    Restart,
    /// Terminate the container immediately.
    Kill,
}

impl PowerAction {
    /// The wire representation of this verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
        }
    }

    /// Parse a wire/power-task verb.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "kill" | "terminate" => Some(Self::Kill),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PowerRequest {
    pub action: PowerAction,
}

#[derive(Debug, Serialize)]
pub(crate) struct CommandRequest {
    pub commands: Vec<String>,
}

// ============================================================================
// Server lifecycle
// ============================================================================

/// Build limits applied to the workload's container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildLimits {
    /// Memory limit in megabytes.
    pub memory_limit: i64,
    /// Swap in megabytes (-1 = unlimited).
    pub swap: i64,
    /// Block IO weight.
    pub io_weight: i16,
    /// CPU limit as a percentage of one core (0 = unlimited).
    pub cpu_limit: i64,
    /// Disk space limit in megabytes.
    pub disk_space: i64,
    /// Pinned CPU threads, e.g. `"0,1"` (empty = unpinned).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<String>,
}

/// The default (primary) allocation the workload binds to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultAllocation {
    /// Primary IP.
    pub ip: String,
    /// Primary port.
    pub port: u16,
}

/// Allocation mapping grouped by IP.
///
/// Every IP maps to the list of ports bound on it. The primary allocation's
/// IP is always present, even when it carries no additional ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationMap {
    /// The primary ip/port pair.
    pub default: DefaultAllocation,
    /// All ports grouped per IP (primary included).
    pub mappings: BTreeMap<String, Vec<u16>>,
}

/// Container settings for the workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Docker image reference.
    pub image: String,
    /// Registry credentials (`user:password`), when the image is private.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_credentials: Option<String>,
}

/// A filesystem mount exposed to the workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Host path.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Whether the workload may write through the mount.
    pub read_only: bool,
}

/// The full agent-facing workload configuration.
///
/// Assembled by the provisioning workflow from panel rows; the agent treats
/// it as authoritative and persists it locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfiguration {
    /// Agent-facing identity of the workload.
    pub uuid: Uuid,
    /// Whether the panel currently suspends the workload.
    pub suspended: bool,
    /// Startup invocation line (post variable substitution).
    pub invocation: String,
    /// Merged environment variables.
    pub environment: BTreeMap<String, Value>,
    /// Container resource limits.
    pub build: BuildLimits,
    /// Container image settings.
    pub container: ContainerSettings,
    /// Network allocations.
    pub allocations: AllocationMap,
    /// Mounts exposed to the workload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    /// Whether install scripts should be skipped on creation.
    #[serde(default)]
    pub skip_scripts: bool,
}

/// Payload for `POST /api/servers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServerRequest {
    /// Workload identity; must match `settings.uuid`.
    pub uuid: Uuid,
    /// Start the workload once installation finishes.
    pub start_on_completion: bool,
    /// Full workload configuration.
    pub settings: ServerConfiguration,
}

/// Runtime state the agent reports for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Not running.
    Offline,
    /// Boot in progress.
    Starting,
    /// Process is up.
    Running,
    /// Shutdown in progress.
    Stopping,
}

impl ServerState {
    /// True once the agent has finished creating the workload; the
    /// provisioning poll loop stops on either settled state.
    pub fn is_settled(&self) -> bool {
        matches!(self, ServerState::Running | ServerState::Offline)
    }
}

/// Point-in-time resource usage the agent reports alongside state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUtilization {
    /// Memory in use, bytes.
    #[serde(default)]
    pub memory_bytes: u64,
    /// Disk in use, bytes.
    #[serde(default)]
    pub disk_bytes: u64,
    /// CPU usage as absolute percentage.
    #[serde(default)]
    pub cpu_absolute: f64,
    /// Uptime in milliseconds.
    #[serde(default)]
    pub uptime: u64,
}

/// Response of `GET /api/servers/{uuid}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDetails {
    /// Current runtime state.
    pub state: ServerState,
    /// Whether the agent considers the workload suspended.
    #[serde(default)]
    pub is_suspended: bool,
    /// Resource usage snapshot, when the agent includes one.
    #[serde(default)]
    pub utilization: Option<ResourceUtilization>,
}

/// Response of `GET /api/system`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemInformation {
    /// Agent version string.
    pub version: String,
    /// Kernel version.
    #[serde(default)]
    pub kernel_version: Option<String>,
    /// Operating system architecture.
    #[serde(default)]
    pub architecture: Option<String>,
    /// Number of CPU threads on the node.
    #[serde(default)]
    pub cpu_count: Option<u32>,
}

// ============================================================================
// Files
// ============================================================================

/// One directory entry from a file listing.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    /// File or directory name.
    pub name: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// True for directories.
    #[serde(default)]
    pub directory: bool,
    /// Octal mode string, e.g. `"755"`.
    #[serde(default)]
    pub mode: Option<String>,
    /// Detected MIME type.
    #[serde(default)]
    pub mime: Option<String>,
}

/// One from/to pair for a rename operation.
#[derive(Debug, Clone, Serialize)]
pub struct RenameFile {
    /// Current path, relative to `root`.
    pub from: String,
    /// New path, relative to `root`.
    pub to: String,
}

/// One path/mode pair for a chmod operation.
#[derive(Debug, Clone, Serialize)]
pub struct ChmodFile {
    /// Path relative to `root`.
    pub file: String,
    /// Octal mode string.
    pub mode: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RenameRequest {
    pub root: String,
    pub files: Vec<RenameFile>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CopyRequest {
    pub location: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct DeleteFilesRequest {
    pub root: String,
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChmodRequest {
    pub root: String,
    pub files: Vec<ChmodFile>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CompressRequest {
    pub root: String,
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DecompressRequest {
    pub root: String,
    pub file: String,
}

/// Payload for pulling a remote URL into the workload filesystem.
#[derive(Debug, Clone, Serialize)]
pub struct PullFileRequest {
    /// Remote URL to fetch.
    pub url: String,
    /// Directory to place the file in.
    pub directory: String,
    /// Optional target filename (derived from the URL when absent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Run the download in the foreground (blocks the request).
    pub foreground: bool,
}

// ============================================================================
// Backups
// ============================================================================

/// Payload for creating a backup on the agent.
#[derive(Debug, Clone, Serialize)]
pub struct CreateBackupRequest {
    /// Panel-assigned backup uuid.
    pub uuid: Uuid,
    /// Storage adapter (`local` or `s3`).
    pub adapter: String,
    /// Newline-separated ignore patterns.
    pub ignore: String,
}

/// Payload for restoring a backup.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreBackupRequest {
    /// Storage adapter the backup lives on.
    pub adapter: String,
    /// Wipe the workload directory before restoring.
    pub truncate_directory: bool,
    /// Signed URL to download the archive from, for remote adapters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// One backup the agent knows about.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupSummary {
    /// Backup uuid.
    pub uuid: Uuid,
    /// Archive size in bytes, once completed.
    #[serde(default)]
    pub size: u64,
    /// Whether the archive completed successfully.
    #[serde(default)]
    pub successful: bool,
}

/// Response carrying a signed, time-limited download URL for a backup.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupDownloadUrl {
    /// The signed URL.
    pub url: String,
}

// ============================================================================
// Transfers & websocket
// ============================================================================

/// Identity block inside a transfer notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferServerInfo {
    /// Workload uuid being moved.
    pub uuid: Uuid,
    /// Whether the destination should boot the workload once the data
    /// transfer completes.
    pub start_on_completion: bool,
}

/// Payload for `POST /api/servers/{uuid}/transfer`, sent to the **source**
/// node to kick off a cross-node migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferNotifyRequest {
    /// Workload uuid (duplicated for the agent's convenience).
    pub server_id: Uuid,
    /// Base URL of the destination agent.
    pub url: String,
    /// `Bearer <signed JWT>` the destination will accept for the pull.
    pub token: String,
    /// Identity and post-transfer behavior.
    pub server: TransferServerInfo,
}

/// Response of the websocket token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WebsocketToken {
    /// Signed console-session token.
    pub token: String,
    /// Websocket URL the browser should connect to.
    pub socket: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_action_wire_format() {
        assert_eq!(
            serde_json::to_string(&PowerAction::Start).unwrap(),
            "\"start\""
        );
        assert_eq!(PowerAction::parse("kill"), Some(PowerAction::Kill));
        assert_eq!(PowerAction::parse("terminate"), Some(PowerAction::Kill));
        assert_eq!(PowerAction::parse("reboot"), None);
    }

    #[test]
    fn test_server_state_settled() {
        assert!(ServerState::Running.is_settled());
        assert!(ServerState::Offline.is_settled());
        assert!(!ServerState::Starting.is_settled());
        assert!(!ServerState::Stopping.is_settled());
    }

    #[test]
    fn test_server_details_tolerates_missing_fields() {
        let details: ServerDetails = serde_json::from_str(r#"{"state":"running"}"#).unwrap();
        assert_eq!(details.state, ServerState::Running);
        assert!(!details.is_suspended);
        assert!(details.utilization.is_none());
    }

    #[test]
    fn test_transfer_notify_shape() {
        let uuid = Uuid::new_v4();
        let req = TransferNotifyRequest {
            server_id: uuid,
            url: "https://node2.example.com:8080".to_string(),
            token: "Bearer abc.def.ghi".to_string(),
            server: TransferServerInfo {
                uuid,
                start_on_completion: true,
            },
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["server_id"], value["server"]["uuid"]);
        assert_eq!(value["server"]["start_on_completion"], true);
        assert!(value["token"].as_str().unwrap().starts_with("Bearer "));
    }

    #[test]
    fn test_build_limits_omits_empty_threads() {
        let limits = BuildLimits {
            memory_limit: 1024,
            swap: 0,
            io_weight: 500,
            cpu_limit: 200,
            disk_space: 10240,
            threads: None,
        };
        let value = serde_json::to_value(&limits).unwrap();
        assert!(value.get("threads").is_none());
        assert_eq!(value["memory_limit"], 1024);
    }
}
