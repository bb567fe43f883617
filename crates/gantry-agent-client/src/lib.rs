// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed HTTP client for gantry node agents.
//!
//! A node agent is the remote daemon that actually runs game-server
//! workloads; the panel drives it over JSON-over-HTTP at
//! `scheme://fqdn:port/api/...` with an `Authorization: Bearer
//! <tokenId>.<secret>` credential. This crate is the only place the panel
//! speaks that protocol.
//!
//! # Request policy
//!
//! | Outcome | Behavior |
//! |---------|----------|
//! | HTTP 401/403 | [`ClientError::Auth`], surfaced immediately, never retried |
//! | Timeout / transport error / other non-2xx | [`ClientError::Connection`], retried once with exponential backoff |
//! | HTTP 204/202, empty or non-JSON body | Empty result, not an error |
//! | 2xx JSON body | Decoded into the operation's result type |
//!
//! # Example
//!
//! ```ignore
//! use gantry_agent_client::{AgentClient, NodeConnection, PowerAction};
//!
//! let conn = NodeConnection::new("https", "node1.example.com", 8080, "tokenId.secret");
//! let client = AgentClient::new(conn)?;
//! client.power(server_uuid, PowerAction::Start).await?;
//! ```

#![deny(missing_docs)]

/// Connection descriptor for a single node agent.
pub mod config;

/// The agent HTTP client and its request policy.
pub mod client;

/// Error types for agent operations.
pub mod error;

/// Wire types for the agent protocol.
pub mod types;

pub use client::{AgentClient, wait_for_settled_state};
pub use config::NodeConnection;
pub use error::{ClientError, Result};
pub use types::{
    AllocationMap, BackupDownloadUrl, BackupSummary, BuildLimits, ChmodFile, ContainerSettings,
    CreateBackupRequest, CreateServerRequest, DefaultAllocation, FileEntry, Mount, PowerAction,
    PullFileRequest, RenameFile, ResourceUtilization, RestoreBackupRequest, ServerConfiguration,
    ServerDetails, ServerState, SystemInformation, TransferNotifyRequest, TransferServerInfo,
    WebsocketToken,
};
