// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for nodes, workloads, allocations, transfers,
//! and schedules.
//!
//! All access goes through free functions over a [`PgPool`]. Multi-step
//! mutations that must be atomic (transfer reservation and rollback) run
//! inside explicit transactions here rather than in the workflows.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// A registered node agent.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Node {
    /// Primary key
    pub id: i32,
    /// Stable public identifier
    pub uuid: Uuid,
    /// Display name
    pub name: String,
    /// `http` or `https`
    pub scheme: String,
    /// Hostname or IP the agent listens on
    pub fqdn: String,
    /// Agent API port
    pub daemon_listen: i32,
    /// Agent SFTP port
    pub daemon_sftp: i32,
    /// Data directory on the node
    pub daemon_base: String,
    /// Maximum upload size in MiB
    pub upload_size: i32,
    /// Memory capacity in MiB
    pub memory: i64,
    /// Memory overallocation percentage; `-1` is unlimited
    pub memory_overallocate: i32,
    /// Disk capacity in MiB
    pub disk: i64,
    /// Disk overallocation percentage; `-1` is unlimited
    pub disk_overallocate: i32,
    /// Whether the node is closed for placement
    pub maintenance_mode: bool,
    /// Skip TLS certificate verification when talking to this node
    pub allow_insecure: bool,
    /// Clear-text token identifier, if a credential has been minted
    pub token_id: Option<String>,
    /// Encrypted token secret envelope
    pub token_envelope: Option<String>,
    /// Last successful contact with the agent
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Capacity view used by the evaluator.
    pub fn capacity(&self) -> crate::capacity::NodeCapacity {
        crate::capacity::NodeCapacity {
            memory: self.memory,
            memory_overallocate: self.memory_overallocate,
            disk: self.disk,
            disk_overallocate: self.disk_overallocate,
        }
    }
}

/// A managed workload (game server instance).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Server {
    /// Primary key
    pub id: i32,
    /// Stable identifier shared with the agent
    pub uuid: Uuid,
    /// Display name
    pub name: String,
    /// Node the workload lives on
    pub node_id: i32,
    /// Primary allocation, once assigned
    pub allocation_id: Option<i32>,
    /// Template the workload was provisioned from
    pub template_id: i32,
    /// Lifecycle status; `None` means stable/idle
    pub status: Option<String>,
    /// Whether the workload is administratively suspended
    pub suspended: bool,
    /// Container image override, if any
    pub image: Option<String>,
    /// Startup invocation
    pub startup: String,
    /// Skip install scripts on (re)install
    pub skip_scripts: bool,
    /// When installation last completed
    pub installed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status values stored in `servers.status`.
pub mod server_status {
    /// Install in progress on the agent
    pub const INSTALLING: &str = "installing";
    /// Install did not complete
    pub const INSTALL_FAILED: &str = "install_failed";
    /// Transfer in progress
    pub const TRANSFERRING: &str = "transferring";
    /// Transfer did not complete
    pub const TRANSFER_FAILED: &str = "transfer_failed";
    /// Deletion in progress on the agent
    pub const DELETING: &str = "deleting";
    /// Deletion did not complete
    pub const DELETION_FAILED: &str = "deletion_failed";
}

impl Server {
    /// Whether an orchestration operation currently owns this workload.
    ///
    /// Only the in-progress markers count. Failure markers
    /// (`install_failed`, `transfer_failed`, `deletion_failed`) are
    /// terminal outcomes an operator retries from, so they never block
    /// a new operation.
    pub fn has_active_operation(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some(server_status::INSTALLING)
                | Some(server_status::TRANSFERRING)
                | Some(server_status::DELETING)
        )
    }
}

/// Per-workload resource limits, stored separately so their absence is
/// detectable as a data-integrity problem.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerLimits {
    /// Owning workload
    pub server_id: i32,
    /// Memory limit in MiB
    pub memory: i64,
    /// Swap in MiB; `-1` is unlimited
    pub swap: i64,
    /// Disk limit in MiB
    pub disk: i64,
    /// Relative IO weight
    pub io_weight: i16,
    /// CPU limit in percent (100 = one core)
    pub cpu: i64,
    /// CPU pinning, e.g. `0,1-3`
    pub threads: Option<String>,
}

impl ServerLimits {
    /// Resource request view used by the capacity evaluator.
    pub fn request(&self) -> crate::capacity::ResourceRequest {
        crate::capacity::ResourceRequest {
            memory: self.memory,
            disk: self.disk,
        }
    }
}

/// A network allocation (ip:port pair) on a node.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Allocation {
    /// Primary key
    pub id: i32,
    /// Owning node
    pub node_id: i32,
    /// Bind address
    pub ip: String,
    /// Bind port
    pub port: i32,
    /// Workload occupying this allocation, if any
    pub server_id: Option<i32>,
    /// Whether this is the workload's primary allocation
    pub is_primary: bool,
}

/// An in-flight or archived workload transfer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Transfer {
    /// Primary key
    pub id: i32,
    /// Workload being moved
    pub server_id: i32,
    /// Source node
    pub old_node_id: i32,
    /// Destination node
    pub new_node_id: i32,
    /// Primary allocation on the source
    pub old_allocation_id: i32,
    /// Reserved primary allocation on the destination
    pub new_allocation_id: i32,
    /// Additional allocations on the source
    pub old_additional_allocations: Vec<i32>,
    /// Reserved additional allocations on the destination
    pub new_additional_allocations: Vec<i32>,
    /// `None` while in flight, then the outcome
    pub successful: Option<bool>,
    /// Whether the transfer has been finalized and archived
    pub archived: bool,
    /// Initiation time
    pub created_at: DateTime<Utc>,
}

/// A recurring schedule attached to a workload.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Schedule {
    /// Primary key
    pub id: i32,
    /// Owning workload
    pub server_id: i32,
    /// Display name
    pub name: String,
    /// Five-field cron expression
    pub cron_expression: String,
    /// Whether the poller considers this schedule
    pub enabled: bool,
    /// Last execution start
    pub last_run_at: Option<DateTime<Utc>>,
    /// Predicted next execution
    pub next_run_at: Option<DateTime<Utc>>,
}

/// One step of a schedule.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleTask {
    /// Primary key
    pub id: i32,
    /// Owning schedule
    pub schedule_id: i32,
    /// Execution order within the schedule
    pub sequence_number: i32,
    /// `command`, `power`, or `backup`
    pub action: String,
    /// Action-specific payload
    pub payload: String,
    /// Seconds to wait before this step
    pub time_offset: i32,
    /// Keep running later steps if this one fails
    pub continue_on_failure: bool,
}

/// A provisioning template (image, invocation, install defaults).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Template {
    /// Primary key
    pub id: i32,
    /// Display name
    pub name: String,
    /// Default container image
    pub docker_image: String,
    /// Default startup invocation
    pub startup: String,
}

/// An environment variable a template expects, with its default.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TemplateVariable {
    /// Owning template
    pub template_id: i32,
    /// Environment variable name
    pub env_key: String,
    /// Default value when the workload supplies no override
    pub default_value: String,
}

/// A filesystem mount that can be attached to workloads.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MountRow {
    /// Primary key
    pub id: i32,
    /// Host path
    pub source: String,
    /// Container path
    pub target: String,
    /// Mount read-only
    pub read_only: bool,
}

// ---------------------------------------------------------------------------
// Nodes

/// Fetch a node by id.
pub async fn get_node(pool: &PgPool, node_id: i32) -> Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>(
        r#"
        SELECT * FROM nodes WHERE id = $1
        "#,
    )
    .bind(node_id)
    .fetch_optional(pool)
    .await?;
    Ok(node)
}

/// Persist a freshly minted credential for a node.
pub async fn update_node_token(
    pool: &PgPool,
    node_id: i32,
    token_id: &str,
    token_envelope: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE nodes SET token_id = $2, token_envelope = $3 WHERE id = $1
        "#,
    )
    .bind(node_id)
    .bind(token_id)
    .bind(token_envelope)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a successful contact with a node's agent.
pub async fn touch_node_last_seen(pool: &PgPool, node_id: i32) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE nodes SET last_seen_at = NOW() WHERE id = $1
        "#,
    )
    .bind(node_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Sum the configured limits of every workload placed on a node.
/// Counts placement, not runtime state.
pub async fn node_resource_usage(
    pool: &PgPool,
    node_id: i32,
) -> Result<crate::capacity::ResourceUsage> {
    let row: (Option<i64>, Option<i64>) = sqlx::query_as(
        r#"
        SELECT SUM(l.memory), SUM(l.disk)
        FROM server_limits l
        JOIN servers s ON s.id = l.server_id
        WHERE s.node_id = $1
        "#,
    )
    .bind(node_id)
    .fetch_one(pool)
    .await?;
    Ok(crate::capacity::ResourceUsage {
        memory: row.0.unwrap_or(0),
        disk: row.1.unwrap_or(0),
    })
}

// ---------------------------------------------------------------------------
// Servers

/// Fetch a workload by id.
pub async fn get_server(pool: &PgPool, server_id: i32) -> Result<Option<Server>> {
    let server = sqlx::query_as::<_, Server>(
        r#"
        SELECT * FROM servers WHERE id = $1
        "#,
    )
    .bind(server_id)
    .fetch_optional(pool)
    .await?;
    Ok(server)
}

/// Fetch a workload's resource limits, if configured.
pub async fn get_server_limits(pool: &PgPool, server_id: i32) -> Result<Option<ServerLimits>> {
    let limits = sqlx::query_as::<_, ServerLimits>(
        r#"
        SELECT * FROM server_limits WHERE server_id = $1
        "#,
    )
    .bind(server_id)
    .fetch_optional(pool)
    .await?;
    Ok(limits)
}

/// Set or clear a workload's lifecycle status.
pub async fn set_server_status(
    pool: &PgPool,
    server_id: i32,
    status: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE servers SET status = $2 WHERE id = $1
        "#,
    )
    .bind(server_id)
    .bind(status)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clear the lifecycle status and stamp the install time.
pub async fn mark_server_installed(pool: &PgPool, server_id: i32) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE servers SET status = NULL, installed_at = NOW() WHERE id = $1
        "#,
    )
    .bind(server_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Allocations

/// Fetch an allocation by id.
pub async fn get_allocation(pool: &PgPool, allocation_id: i32) -> Result<Option<Allocation>> {
    let allocation = sqlx::query_as::<_, Allocation>(
        r#"
        SELECT * FROM allocations WHERE id = $1
        "#,
    )
    .bind(allocation_id)
    .fetch_optional(pool)
    .await?;
    Ok(allocation)
}

/// Fetch a set of allocations by id.
pub async fn get_allocations(pool: &PgPool, ids: &[i32]) -> Result<Vec<Allocation>> {
    let allocations = sqlx::query_as::<_, Allocation>(
        r#"
        SELECT * FROM allocations WHERE id = ANY($1)
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(allocations)
}

/// Allocations currently held by a workload. The primary allocation
/// sorts first.
pub async fn get_server_allocations(pool: &PgPool, server_id: i32) -> Result<Vec<Allocation>> {
    let allocations = sqlx::query_as::<_, Allocation>(
        r#"
        SELECT * FROM allocations
        WHERE server_id = $1
        ORDER BY is_primary DESC, id
        "#,
    )
    .bind(server_id)
    .fetch_all(pool)
    .await?;
    Ok(allocations)
}

/// Pick an arbitrary unoccupied allocation on a node.
pub async fn find_free_allocation(pool: &PgPool, node_id: i32) -> Result<Option<Allocation>> {
    let allocation = sqlx::query_as::<_, Allocation>(
        r#"
        SELECT * FROM allocations
        WHERE node_id = $1 AND server_id IS NULL
        ORDER BY id
        LIMIT 1
        "#,
    )
    .bind(node_id)
    .fetch_optional(pool)
    .await?;
    Ok(allocation)
}

// ---------------------------------------------------------------------------
// Transfers

/// Whether the workload has a transfer that has not been archived.
pub async fn server_has_active_transfer(pool: &PgPool, server_id: i32) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM server_transfers
            WHERE server_id = $1 AND archived = FALSE
        )
        "#,
    )
    .bind(server_id)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// Atomically reserve a transfer: insert the transfer record, claim the
/// destination allocations for the workload, and flip the workload into
/// the transferring state. Returns the new transfer's id.
///
/// Either every step commits or none does; a crash mid-reservation
/// leaves no half-claimed allocations behind.
pub async fn reserve_transfer(
    pool: &PgPool,
    server: &Server,
    new_node_id: i32,
    old_allocation_id: i32,
    old_additional: &[i32],
    new_allocation_id: i32,
    new_additional: &[i32],
) -> Result<i32> {
    let mut tx = pool.begin().await?;

    let row: (i32,) = sqlx::query_as(
        r#"
        INSERT INTO server_transfers
            (server_id, old_node_id, new_node_id,
             old_allocation_id, old_additional_allocations,
             new_allocation_id, new_additional_allocations)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(server.id)
    .bind(server.node_id)
    .bind(new_node_id)
    .bind(old_allocation_id)
    .bind(old_additional)
    .bind(new_allocation_id)
    .bind(new_additional)
    .fetch_one(&mut *tx)
    .await?;

    let mut reserved: Vec<i32> = vec![new_allocation_id];
    reserved.extend_from_slice(new_additional);
    sqlx::query(
        r#"
        UPDATE allocations SET server_id = $2 WHERE id = ANY($1)
        "#,
    )
    .bind(&reserved)
    .bind(server.id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE servers SET status = $2 WHERE id = $1
        "#,
    )
    .bind(server.id)
    .bind(server_status::TRANSFERRING)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row.0)
}

/// Atomically undo a reservation after the source agent refused the
/// handshake: delete the transfer record, release the destination
/// allocations, and restore the workload's prior status.
pub async fn rollback_transfer(
    pool: &PgPool,
    transfer_id: i32,
    server_id: i32,
    previous_status: Option<&str>,
    reserved_allocations: &[i32],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        DELETE FROM server_transfers WHERE id = $1
        "#,
    )
    .bind(transfer_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE allocations SET server_id = NULL WHERE id = ANY($1)
        "#,
    )
    .bind(reserved_allocations)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE servers SET status = $2 WHERE id = $1
        "#,
    )
    .bind(server_id)
    .bind(previous_status)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Schedules

/// Fetch a schedule by id.
pub async fn get_schedule(pool: &PgPool, schedule_id: i32) -> Result<Option<Schedule>> {
    let schedule = sqlx::query_as::<_, Schedule>(
        r#"
        SELECT * FROM schedules WHERE id = $1
        "#,
    )
    .bind(schedule_id)
    .fetch_optional(pool)
    .await?;
    Ok(schedule)
}

/// Every enabled schedule, for the poller's due scan.
pub async fn list_enabled_schedules(pool: &PgPool) -> Result<Vec<Schedule>> {
    let schedules = sqlx::query_as::<_, Schedule>(
        r#"
        SELECT * FROM schedules WHERE enabled = TRUE ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(schedules)
}

/// Tasks of a schedule in execution order.
pub async fn get_schedule_tasks(pool: &PgPool, schedule_id: i32) -> Result<Vec<ScheduleTask>> {
    let tasks = sqlx::query_as::<_, ScheduleTask>(
        r#"
        SELECT * FROM schedule_tasks
        WHERE schedule_id = $1
        ORDER BY sequence_number
        "#,
    )
    .bind(schedule_id)
    .fetch_all(pool)
    .await?;
    Ok(tasks)
}

/// Record a run and the predicted next one.
pub async fn update_schedule_run(
    pool: &PgPool,
    schedule_id: i32,
    last_run_at: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE schedules SET last_run_at = $2, next_run_at = $3 WHERE id = $1
        "#,
    )
    .bind(schedule_id)
    .bind(last_run_at)
    .bind(next_run_at)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Templates and mounts

/// Fetch a template by id.
pub async fn get_template(pool: &PgPool, template_id: i32) -> Result<Option<Template>> {
    let template = sqlx::query_as::<_, Template>(
        r#"
        SELECT * FROM templates WHERE id = $1
        "#,
    )
    .bind(template_id)
    .fetch_optional(pool)
    .await?;
    Ok(template)
}

/// Environment variables a template declares, with defaults.
pub async fn get_template_variables(
    pool: &PgPool,
    template_id: i32,
) -> Result<Vec<TemplateVariable>> {
    let variables = sqlx::query_as::<_, TemplateVariable>(
        r#"
        SELECT * FROM template_variables WHERE template_id = $1 ORDER BY env_key
        "#,
    )
    .bind(template_id)
    .fetch_all(pool)
    .await?;
    Ok(variables)
}

/// Fetch a set of mounts by id.
pub async fn get_mounts(pool: &PgPool, ids: &[i32]) -> Result<Vec<MountRow>> {
    let mounts = sqlx::query_as::<_, MountRow>(
        r#"
        SELECT * FROM mounts WHERE id = ANY($1)
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(status: Option<&str>) -> Server {
        Server {
            id: 10,
            uuid: Uuid::new_v4(),
            name: "mc-lobby".to_string(),
            node_id: 1,
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

    #[test]
    fn in_flight_statuses_block_new_operations() {
        for status in [
            server_status::INSTALLING,
            server_status::TRANSFERRING,
            server_status::DELETING,
        ] {
            assert!(
                server(Some(status)).has_active_operation(),
                "{status} should count as in flight"
            );
        }
    }

    #[test]
    fn failure_markers_are_terminal_not_in_flight() {
        for status in [
            server_status::INSTALL_FAILED,
            server_status::TRANSFER_FAILED,
            server_status::DELETION_FAILED,
        ] {
            assert!(
                !server(Some(status)).has_active_operation(),
                "{status} is an outcome an operator retries from"
            );
        }
        assert!(!server(None).has_active_operation());
    }
}
