// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node registry: credentials, connection resolution, and bootstrap
//! configuration for agents.
//!
//! A node's agent credential is two-part: a clear-text token identifier
//! and a secret that only exists in the database inside a vault
//! envelope. The registry is the only component that turns a node row
//! into something that can actually speak to the agent.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, instrument};

use gantry_agent_client::{AgentClient, NodeConnection};

use crate::db::{self, Node};
use crate::error::{Error, Result};
use crate::vault::TokenVault;

/// Token identifier length in characters.
const TOKEN_ID_LEN: usize = 16;

/// Token secret length in characters.
const TOKEN_SECRET_LEN: usize = 64;

/// Registry over the `nodes` table.
#[derive(Clone)]
pub struct NodeRegistry {
    pool: PgPool,
    vault: TokenVault,
}

/// Configuration document a node agent boots from, serialized to JSON
/// for operators to drop onto the machine.
#[derive(Debug, Serialize)]
pub struct BootstrapConfig {
    /// Debug logging toggle; always off in generated configs
    pub debug: bool,
    /// The node's stable identifier
    pub uuid: uuid::Uuid,
    /// Clear-text token identifier
    pub token_id: String,
    /// Decrypted token secret
    pub token: String,
    /// Agent API listener settings
    pub api: BootstrapApi,
    /// Data directory and SFTP settings
    pub system: BootstrapSystem,
    /// Base URL the agent calls back to
    pub remote: String,
}

/// API listener section of a bootstrap config.
#[derive(Debug, Serialize)]
pub struct BootstrapApi {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: i32,
    /// TLS enablement, mirroring the registered scheme
    pub ssl: BootstrapSsl,
    /// Upload size cap in MiB
    pub upload_limit: i32,
}

/// TLS section of a bootstrap config.
#[derive(Debug, Serialize)]
pub struct BootstrapSsl {
    /// Whether the agent should serve TLS
    pub enabled: bool,
}

/// System section of a bootstrap config.
#[derive(Debug, Serialize)]
pub struct BootstrapSystem {
    /// Workload data directory
    pub data: String,
    /// SFTP subsystem settings
    pub sftp: BootstrapSftp,
}

/// SFTP section of a bootstrap config.
#[derive(Debug, Serialize)]
pub struct BootstrapSftp {
    /// SFTP bind port
    pub bind_port: i32,
}

impl NodeRegistry {
    /// Create a registry over the given pool and vault.
    pub fn new(pool: PgPool, vault: TokenVault) -> Self {
        Self { pool, vault }
    }

    /// Load a node, failing with a typed error when it does not exist.
    pub async fn get(&self, node_id: i32) -> Result<Node> {
        db::get_node(&self.pool, node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))
    }

    /// Resolve a node into a ready [`AgentClient`], decrypting its
    /// credential and honoring its TLS-verification setting.
    #[instrument(skip(self))]
    pub async fn client_for(&self, node_id: i32) -> Result<(Node, AgentClient)> {
        let node = self.get(node_id).await?;
        let client = self.client_for_node(&node)?;
        Ok((node, client))
    }

    /// Build a client for an already-loaded node row.
    pub fn client_for_node(&self, node: &Node) -> Result<AgentClient> {
        let (token_id, envelope) = match (&node.token_id, &node.token_envelope) {
            (Some(id), Some(env)) => (id, env),
            _ => {
                return Err(Error::validation(
                    409,
                    format!("node {} has no agent credential yet", node.id),
                ));
            }
        };
        let bearer = self.vault.format_bearer(token_id, envelope)?;
        let conn = NodeConnection::new(&node.scheme, &node.fqdn, node.daemon_listen as u16, bearer)
            .with_skip_cert_verification(node.allow_insecure);
        Ok(AgentClient::new(conn)?)
    }

    /// Ensure a node has an agent credential, minting one only when
    /// absent. Returns the node with its credential columns populated.
    #[instrument(skip(self))]
    pub async fn ensure_token(&self, node_id: i32) -> Result<Node> {
        let node = self.get(node_id).await?;
        if node.token_id.is_some() && node.token_envelope.is_some() {
            return Ok(node);
        }

        let token_id = random_alnum(TOKEN_ID_LEN);
        let secret = random_alnum(TOKEN_SECRET_LEN);
        let envelope = self.vault.encrypt(&secret);
        db::update_node_token(&self.pool, node.id, &token_id, &envelope).await?;
        info!(node_id = node.id, "minted agent credential");
        Ok(Node {
            token_id: Some(token_id),
            token_envelope: Some(envelope),
            ..node
        })
    }

    /// Mint a fresh agent credential for a node, replacing any existing
    /// one. Returns the clear-text `tokenId.secret` pair exactly once;
    /// only the envelope is stored.
    #[instrument(skip(self))]
    pub async fn rotate_token(&self, node_id: i32) -> Result<(String, String)> {
        // Existence check before minting.
        let node = self.get(node_id).await?;

        let token_id = random_alnum(TOKEN_ID_LEN);
        let secret = random_alnum(TOKEN_SECRET_LEN);
        let envelope = self.vault.encrypt(&secret);
        db::update_node_token(&self.pool, node.id, &token_id, &envelope).await?;
        info!(node_id = node.id, "rotated agent credential");
        Ok((token_id, secret))
    }

    /// Generate the configuration document the node's agent boots from.
    /// Requires a minted credential.
    #[instrument(skip(self))]
    pub async fn bootstrap_config(&self, node_id: i32, panel_url: &str) -> Result<BootstrapConfig> {
        let node = self.get(node_id).await?;
        let (token_id, envelope) = match (&node.token_id, &node.token_envelope) {
            (Some(id), Some(env)) => (id.clone(), env.clone()),
            _ => {
                return Err(Error::validation(
                    409,
                    format!("node {} has no agent credential yet", node.id),
                ));
            }
        };
        let token = self.vault.decrypt(&envelope)?;
        if token.len() < 32 {
            return Err(Error::validation(
                500,
                format!(
                    "node {} has a suspiciously short credential secret; rotate the token",
                    node.id
                ),
            ));
        }

        Ok(BootstrapConfig {
            debug: false,
            uuid: node.uuid,
            token_id,
            token,
            api: BootstrapApi {
                host: "0.0.0.0".to_string(),
                port: node.daemon_listen,
                ssl: BootstrapSsl {
                    enabled: node.scheme == "https",
                },
                upload_limit: node.upload_size,
            },
            system: BootstrapSystem {
                data: node.daemon_base.clone(),
                sftp: BootstrapSftp {
                    bind_port: node.daemon_sftp,
                },
            },
            remote: panel_url.to_string(),
        })
    }

    /// Record that the node's agent answered a request just now.
    pub async fn touch_last_seen(&self, node_id: i32) -> Result<()> {
        db::touch_node_last_seen(&self.pool, node_id).await
    }
}

fn random_alnum(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
