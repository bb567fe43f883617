// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer workflow: moving a workload between nodes.
//!
//! A transfer is a three-party handshake. The panel reserves destination
//! allocations and a transfer record transactionally, then hands the
//! source agent a short-lived signed credential and the destination's
//! URL; the agents stream the data between themselves. If the source
//! agent refuses the kickoff, the reservation is rolled back
//! transactionally so no destination resources stay claimed.
//!
//! Every precondition is checked before anything is written: a rejected
//! request leaves the database untouched.

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use gantry_agent_client::{TransferNotifyRequest, TransferServerInfo};

use crate::capacity::ResourceUsage;
use crate::db::{self, Allocation, Node, Server, ServerLimits};
use crate::error::{Error, Result};
use crate::nodes::NodeRegistry;
use crate::vault::TokenVault;

/// How long the destination accepts the handshake credential.
const CREDENTIAL_TTL_MINUTES: i64 = 15;

/// Caller-supplied inputs for a transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Workload to move
    pub server_id: i32,
    /// Destination node
    pub target_node_id: i32,
    /// Destination primary allocation; picked automatically when absent
    pub allocation_id: Option<i32>,
    /// Additional destination allocations to reserve
    pub additional_allocation_ids: Vec<i32>,
    /// Boot the workload on the destination once data arrives
    pub start_on_completion: bool,
}

/// What a successful initiation reserved.
#[derive(Debug, Clone)]
pub struct TransferStart {
    /// The new transfer record
    pub transfer_id: i32,
    /// Reserved primary allocation on the destination
    pub new_allocation_id: i32,
    /// Reserved additional allocations on the destination
    pub new_additional_allocation_ids: Vec<i32>,
}

/// Claims inside the handshake credential. The destination agent
/// verifies the signature with its own token secret.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TransferCredential {
    /// Workload being moved
    pub sub: Uuid,
    /// Panel that issued the credential
    pub iss: String,
    /// Destination node's stable identifier
    pub aud: Uuid,
    /// Issued-at, seconds since epoch
    pub iat: i64,
    /// Expiry, seconds since epoch
    pub exp: i64,
    /// Unique credential id
    pub jti: Uuid,
}

/// Orchestrates cross-node transfers.
#[derive(Clone)]
pub struct TransferWorkflow {
    pool: PgPool,
    registry: NodeRegistry,
    vault: TokenVault,
    panel_url: String,
}

impl TransferWorkflow {
    /// Create a workflow over the given pool, registry, and vault.
    pub fn new(pool: PgPool, registry: NodeRegistry, vault: TokenVault, panel_url: String) -> Self {
        Self {
            pool,
            registry,
            vault,
            panel_url,
        }
    }

    /// Validate, reserve, and kick off a transfer.
    #[instrument(skip(self, request), fields(server_id = request.server_id, target = request.target_node_id))]
    pub async fn initiate(&self, request: TransferRequest) -> Result<TransferStart> {
        let server = db::get_server(&self.pool, request.server_id)
            .await?
            .ok_or(Error::ServerNotFound(request.server_id))?;

        // Load everything the gauntlet looks at, then run the checks as
        // one pure sequence before any allocation work or writes.
        let has_active_transfer = db::server_has_active_transfer(&self.pool, server.id).await?;
        let target = db::get_node(&self.pool, request.target_node_id).await?;
        let limits = db::get_server_limits(&self.pool, server.id).await?;
        let target_usage = match &target {
            Some(node) => db::node_resource_usage(&self.pool, node.id).await?,
            None => ResourceUsage::default(),
        };
        check_transfer_preconditions(&TransferSnapshot {
            server: &server,
            has_active_transfer,
            target_node_id: request.target_node_id,
            target: target.as_ref(),
            limits: limits.as_ref(),
            target_usage,
        })?;
        let target = target.ok_or(Error::NodeNotFound(request.target_node_id))?;

        let primary = self.pick_primary(&request, &target).await?;
        let additional = self
            .pick_additional(&request, &target, primary.id)
            .await?;

        // Everything checked out; reserve in one transaction.
        let old_allocations = db::get_server_allocations(&self.pool, server.id).await?;
        let old_primary = old_allocations
            .iter()
            .find(|a| Some(a.id) == server.allocation_id)
            .or_else(|| old_allocations.first())
            .map(|a| a.id)
            .ok_or_else(|| {
                Error::validation(400, "workload has no network allocation to move")
            })?;
        let old_additional: Vec<i32> = old_allocations
            .iter()
            .filter(|a| Some(a.id) != server.allocation_id)
            .map(|a| a.id)
            .collect();
        let additional_ids: Vec<i32> = additional.iter().map(|a| a.id).collect();

        let transfer_id = db::reserve_transfer(
            &self.pool,
            &server,
            target.id,
            old_primary,
            &old_additional,
            primary.id,
            &additional_ids,
        )
        .await?;
        info!(transfer_id, "transfer reserved");

        // Hand the source agent the signed credential and destination URL.
        if let Err(e) = self.notify_source(&server, &target, request.start_on_completion).await {
            warn!(transfer_id, error = %e, "source agent refused transfer, rolling back");
            let mut reserved = vec![primary.id];
            reserved.extend_from_slice(&additional_ids);
            let rollback = db::rollback_transfer(
                &self.pool,
                transfer_id,
                server.id,
                server.status.as_deref(),
                &reserved,
            )
            .await;
            return Err(fail_with_rollback(e, rollback, transfer_id));
        }

        Ok(TransferStart {
            transfer_id,
            new_allocation_id: primary.id,
            new_additional_allocation_ids: additional_ids,
        })
    }

    async fn pick_primary(
        &self,
        request: &TransferRequest,
        target: &Node,
    ) -> Result<Allocation> {
        match request.allocation_id {
            Some(id) => {
                if request.additional_allocation_ids.contains(&id) {
                    return Err(Error::validation(
                        400,
                        "primary allocation also listed as additional",
                    ));
                }
                let allocation = db::get_allocation(&self.pool, id)
                    .await?
                    .ok_or_else(|| Error::validation(400, format!("allocation {id} not found")))?;
                check_allocation_reservable(&allocation, target.id)?;
                Ok(allocation)
            }
            None => db::find_free_allocation(&self.pool, target.id)
                .await?
                .ok_or_else(|| {
                    Error::validation(
                        400,
                        format!("node {} has no free allocations", target.id),
                    )
                }),
        }
    }

    async fn pick_additional(
        &self,
        request: &TransferRequest,
        target: &Node,
        primary_id: i32,
    ) -> Result<Vec<Allocation>> {
        if request.additional_allocation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids = request.additional_allocation_ids.clone();
        ids.sort_unstable();
        ids.dedup();
        let allocations = db::get_allocations(&self.pool, &ids).await?;
        if allocations.len() != ids.len() {
            return Err(Error::validation(
                400,
                "one or more additional allocations do not exist",
            ));
        }
        for allocation in &allocations {
            if allocation.id == primary_id {
                return Err(Error::validation(
                    400,
                    "primary allocation also listed as additional",
                ));
            }
            check_allocation_reservable(allocation, target.id)?;
        }
        Ok(allocations)
    }

    async fn notify_source(
        &self,
        server: &Server,
        target: &Node,
        start_on_completion: bool,
    ) -> Result<()> {
        let envelope = target.token_envelope.as_deref().ok_or_else(|| {
            Error::validation(
                409,
                format!("node {} has no agent credential yet", target.id),
            )
        })?;
        let mut secret = self.vault.decrypt(envelope)?;
        let credential =
            sign_transfer_credential(secret.as_bytes(), server.uuid, target.uuid, &self.panel_url)?;
        zeroize::Zeroize::zeroize(&mut secret);

        let (_, source_client) = self.registry.client_for(server.node_id).await?;
        let notify = TransferNotifyRequest {
            server_id: server.uuid,
            url: format!(
                "{}://{}:{}/api/transfers",
                target.scheme, target.fqdn, target.daemon_listen
            ),
            token: format!("Bearer {credential}"),
            server: TransferServerInfo {
                uuid: server.uuid,
                start_on_completion,
            },
        };
        source_client.notify_transfer(&notify).await?;
        self.registry.touch_last_seen(server.node_id).await?;
        Ok(())
    }
}

/// Everything the precondition gauntlet inspects, loaded before any
/// check runs. Allocation availability is checked separately, after this
/// gauntlet passes.
pub(crate) struct TransferSnapshot<'a> {
    /// Workload being moved
    pub server: &'a Server,
    /// Whether an unarchived transfer already exists for it
    pub has_active_transfer: bool,
    /// Requested destination node id
    pub target_node_id: i32,
    /// Destination row, when it exists
    pub target: Option<&'a Node>,
    /// The workload's limits row, when it exists
    pub limits: Option<&'a ServerLimits>,
    /// Summed limits already placed on the destination
    pub target_usage: ResourceUsage,
}

/// Run every transfer precondition, in a fixed order, against loaded
/// rows. Nothing is written until all of these pass: state and
/// uniqueness first, then destination checks, then capacity.
pub(crate) fn check_transfer_preconditions(snapshot: &TransferSnapshot<'_>) -> Result<()> {
    if snapshot.server.has_active_operation() {
        return Err(Error::validation(
            409,
            "workload has another operation in progress",
        ));
    }
    if snapshot.has_active_transfer {
        return Err(Error::validation(
            409,
            "workload is already being transferred",
        ));
    }
    if snapshot.target_node_id == snapshot.server.node_id {
        return Err(Error::validation(
            400,
            "workload is already on the requested node",
        ));
    }
    let target = snapshot
        .target
        .ok_or(Error::NodeNotFound(snapshot.target_node_id))?;
    if target.maintenance_mode {
        return Err(Error::validation(
            409,
            format!("node {} is in maintenance mode", target.id),
        ));
    }
    let limits = snapshot
        .limits
        .ok_or_else(|| Error::validation(400, "workload has no resource limits configured"))?;
    check_capacity(target, snapshot.target_usage, limits)
}

/// A failed handshake is the error the caller needs to see; a rollback
/// failure on top of it is logged for operators but never masks it.
pub(crate) fn fail_with_rollback(handshake: Error, rollback: Result<()>, transfer_id: i32) -> Error {
    if let Err(e) = rollback {
        error!(
            transfer_id,
            error = %e,
            "transfer rollback failed, reserved allocations may need manual cleanup"
        );
    }
    handshake
}

/// Reject allocations that are occupied or live on the wrong node.
pub(crate) fn check_allocation_reservable(
    allocation: &Allocation,
    target_node_id: i32,
) -> Result<()> {
    if allocation.node_id != target_node_id {
        return Err(Error::validation(
            400,
            format!(
                "allocation {} belongs to node {}, not the target node",
                allocation.id, allocation.node_id
            ),
        ));
    }
    if allocation.server_id.is_some() {
        return Err(Error::validation(
            409,
            format!("allocation {} is already occupied", allocation.id),
        ));
    }
    Ok(())
}

/// Reject transfers the destination cannot hold.
pub(crate) fn check_capacity(
    target: &Node,
    usage: ResourceUsage,
    limits: &ServerLimits,
) -> Result<()> {
    if !target.capacity().fits(usage, limits.request()) {
        return Err(Error::validation(
            400,
            format!(
                "node {} lacks capacity for {} MiB memory / {} MiB disk",
                target.id, limits.memory, limits.disk
            ),
        ));
    }
    Ok(())
}

/// Sign a handshake credential with the destination node's secret. The
/// destination can verify it without a callback to the panel.
pub(crate) fn sign_transfer_credential(
    secret: &[u8],
    server_uuid: Uuid,
    target_node_uuid: Uuid,
    panel_url: &str,
) -> Result<String> {
    let now = Utc::now();
    let claims = TransferCredential {
        sub: server_uuid,
        iss: panel_url.to_string(),
        aud: target_node_uuid,
        iat: now.timestamp(),
        exp: (now + ChronoDuration::minutes(CREDENTIAL_TTL_MINUTES)).timestamp(),
        jti: Uuid::new_v4(),
    };
    Ok(jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{Algorithm, DecodingKey, Validation};

    fn node(id: i32, maintenance: bool) -> Node {
        Node {
            id,
            uuid: Uuid::new_v4(),
            name: format!("node-{id}"),
            scheme: "https".to_string(),
            fqdn: format!("node{id}.example.com"),
            daemon_listen: 8080,
            daemon_sftp: 2022,
            daemon_base: "/var/lib/gantry/volumes".to_string(),
            upload_size: 100,
            memory: 8192,
            memory_overallocate: 0,
            disk: 102400,
            disk_overallocate: 0,
            maintenance_mode: maintenance,
            allow_insecure: false,
            token_id: Some("abcdef0123456789".to_string()),
            token_envelope: None,
            last_seen_at: None,
            created_at: Utc::now(),
        }
    }

    fn limits(memory: i64, disk: i64) -> ServerLimits {
        ServerLimits {
            server_id: 10,
            memory,
            swap: 0,
            disk,
            io_weight: 500,
            cpu: 0,
            threads: None,
        }
    }

    fn server(node_id: i32, status: Option<&str>) -> Server {
        Server {
            id: 10,
            uuid: Uuid::new_v4(),
            name: "mc-lobby".to_string(),
            node_id,
            allocation_id: Some(1),
            template_id: 3,
            status: status.map(str::to_string),
            suspended: false,
            image: None,
            startup: "java -jar server.jar".to_string(),
            skip_scripts: false,
            installed_at: None,
            created_at: Utc::now(),
        }
    }

    /// A snapshot that passes every precondition: idle workload on node
    /// 1 moving to an empty, healthy node 2.
    fn valid_snapshot<'a>(
        server: &'a Server,
        target: &'a Node,
        limits: &'a ServerLimits,
    ) -> TransferSnapshot<'a> {
        TransferSnapshot {
            server,
            has_active_transfer: false,
            target_node_id: target.id,
            target: Some(target),
            limits: Some(limits),
            target_usage: ResourceUsage::default(),
        }
    }

    #[test]
    fn valid_request_passes_the_gauntlet() {
        let s = server(1, None);
        let target = node(2, false);
        let limits = limits(1024, 10240);
        assert!(check_transfer_preconditions(&valid_snapshot(&s, &target, &limits)).is_ok());
    }

    #[test]
    fn in_flight_operation_is_rejected() {
        let s = server(1, Some(crate::db::server_status::INSTALLING));
        let target = node(2, false);
        let limits = limits(1024, 10240);
        let err =
            check_transfer_preconditions(&valid_snapshot(&s, &target, &limits)).unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert!(err.to_string().contains("operation in progress"));
    }

    #[test]
    fn failed_transfer_can_be_retried() {
        // transfer_failed is a terminal outcome, not an in-flight state.
        let s = server(1, Some(crate::db::server_status::TRANSFER_FAILED));
        let target = node(2, false);
        let limits = limits(1024, 10240);
        assert!(check_transfer_preconditions(&valid_snapshot(&s, &target, &limits)).is_ok());
    }

    #[test]
    fn duplicate_transfer_is_rejected() {
        let s = server(1, None);
        let target = node(2, false);
        let limits = limits(1024, 10240);
        let mut snapshot = valid_snapshot(&s, &target, &limits);
        snapshot.has_active_transfer = true;
        let err = check_transfer_preconditions(&snapshot).unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert!(err.to_string().contains("already being transferred"));
    }

    #[test]
    fn uniqueness_is_checked_before_capacity() {
        // A request that violates both uniqueness and capacity fails on
        // uniqueness, before anything downstream would be touched.
        let s = server(1, None);
        let target = node(2, false);
        let limits = limits(1_000_000, 1_000_000);
        let mut snapshot = valid_snapshot(&s, &target, &limits);
        snapshot.has_active_transfer = true;
        let err = check_transfer_preconditions(&snapshot).unwrap_err();
        assert!(err.to_string().contains("already being transferred"));
    }

    #[test]
    fn same_node_is_rejected() {
        let s = server(2, None);
        let target = node(2, false);
        let limits = limits(1024, 10240);
        let err =
            check_transfer_preconditions(&valid_snapshot(&s, &target, &limits)).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("already on the requested node"));
    }

    #[test]
    fn missing_target_node_is_rejected() {
        let s = server(1, None);
        let limits = limits(1024, 10240);
        let snapshot = TransferSnapshot {
            server: &s,
            has_active_transfer: false,
            target_node_id: 42,
            target: None,
            limits: Some(&limits),
            target_usage: ResourceUsage::default(),
        };
        let err = check_transfer_preconditions(&snapshot).unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn maintenance_mode_target_is_rejected() {
        let s = server(1, None);
        let target = node(2, true);
        let limits = limits(1024, 10240);
        let err =
            check_transfer_preconditions(&valid_snapshot(&s, &target, &limits)).unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert!(err.to_string().contains("maintenance"));
    }

    #[test]
    fn missing_limits_are_rejected() {
        let s = server(1, None);
        let target = node(2, false);
        let limits = limits(1024, 10240);
        let mut snapshot = valid_snapshot(&s, &target, &limits);
        snapshot.limits = None;
        let err = check_transfer_preconditions(&snapshot).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("resource limits"));
    }

    #[test]
    fn overfull_target_is_rejected_by_the_gauntlet() {
        let s = server(1, None);
        let target = node(2, false);
        let limits = limits(1024, 10240);
        let mut snapshot = valid_snapshot(&s, &target, &limits);
        snapshot.target_usage = ResourceUsage {
            memory: 8000,
            disk: 0,
        };
        let err = check_transfer_preconditions(&snapshot).unwrap_err();
        assert!(err.to_string().contains("lacks capacity"));
    }

    #[test]
    fn rollback_failure_never_masks_the_handshake_error() {
        let handshake = Error::Agent(gantry_agent_client::ClientError::Connection(
            "connection refused".into(),
        ));
        let rollback: Result<()> = Err(Error::validation(500, "rollback went sideways"));
        let surfaced = fail_with_rollback(handshake, rollback, 7);
        assert_eq!(surfaced.http_status(), 504);
        assert!(surfaced.to_string().contains("connection refused"));
    }

    #[test]
    fn occupied_allocation_is_rejected_with_conflict() {
        let allocation = Allocation {
            id: 5,
            node_id: 2,
            ip: "10.0.0.5".to_string(),
            port: 25565,
            server_id: Some(99),
            is_primary: false,
        };
        let err = check_allocation_reservable(&allocation, 2).unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert!(err.to_string().contains("occupied"));
    }

    #[test]
    fn foreign_allocation_is_rejected() {
        let allocation = Allocation {
            id: 5,
            node_id: 3,
            ip: "10.0.0.5".to_string(),
            port: 25565,
            server_id: None,
            is_primary: false,
        };
        let err = check_allocation_reservable(&allocation, 2).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn free_allocation_on_target_passes() {
        let allocation = Allocation {
            id: 5,
            node_id: 2,
            ip: "10.0.0.5".to_string(),
            port: 25565,
            server_id: None,
            is_primary: false,
        };
        assert!(check_allocation_reservable(&allocation, 2).is_ok());
    }

    #[test]
    fn capacity_shortfall_is_rejected() {
        let target = node(2, false);
        let usage = ResourceUsage {
            memory: 8000,
            disk: 0,
        };
        let err = check_capacity(&target, usage, &limits(1024, 1024)).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("lacks capacity"));
    }

    #[test]
    fn capacity_fit_passes() {
        let target = node(2, false);
        let usage = ResourceUsage {
            memory: 4096,
            disk: 51200,
        };
        assert!(check_capacity(&target, usage, &limits(4096, 51200)).is_ok());
    }

    #[test]
    fn credential_round_trips_and_expires_in_fifteen_minutes() {
        let secret = b"a-64-character-agent-secret-value-for-signing-transfer-tokens!!";
        let server_uuid = Uuid::new_v4();
        let node_uuid = Uuid::new_v4();
        let token = sign_transfer_credential(
            secret,
            server_uuid,
            node_uuid,
            "https://panel.example.com",
        )
        .unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[node_uuid.to_string()]);
        let decoded = jsonwebtoken::decode::<TransferCredential>(
            &token,
            &DecodingKey::from_secret(secret),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, server_uuid);
        assert_eq!(decoded.claims.iss, "https://panel.example.com");
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 15 * 60);
    }

    #[test]
    fn credential_signed_with_wrong_key_is_rejected() {
        let token = sign_transfer_credential(
            b"right key",
            Uuid::new_v4(),
            Uuid::new_v4(),
            "https://panel.example.com",
        )
        .unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        assert!(
            jsonwebtoken::decode::<TransferCredential>(
                &token,
                &DecodingKey::from_secret(b"wrong key"),
                &validation,
            )
            .is_err()
        );
    }

    #[test]
    fn each_credential_is_unique() {
        let secret = b"key";
        let server_uuid = Uuid::new_v4();
        let node_uuid = Uuid::new_v4();
        let a = sign_transfer_credential(secret, server_uuid, node_uuid, "https://p").unwrap();
        let b = sign_transfer_credential(secret, server_uuid, node_uuid, "https://p").unwrap();
        // Distinct jti claims produce distinct tokens.
        assert_ne!(a, b);
    }
}
