// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning workflow: placing a workload onto a node's agent.
//!
//! The workflow assembles the agent-facing configuration from panel rows
//! (template, limits, allocations, mounts), asks the agent to create the
//! workload, and polls until the install settles. Outcomes land in the
//! workload's status column: a failed install marks the row
//! `install_failed` and keeps it, so operators can inspect and retry.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, info, instrument, warn};

use gantry_agent_client::{
    AllocationMap, BuildLimits, ContainerSettings, CreateServerRequest, DefaultAllocation, Mount,
    ServerConfiguration, wait_for_settled_state,
};

use crate::db::{self, Allocation, MountRow, Server, ServerLimits, Template, server_status};
use crate::error::{Error, Result};
use crate::nodes::NodeRegistry;

/// How often the install poll asks the agent for state.
const INSTALL_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Poll attempts before the install is declared failed (5 minutes).
const INSTALL_POLL_ATTEMPTS: u32 = 60;

/// Caller-supplied inputs for an install.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    /// Per-workload environment overrides, keyed by variable name
    pub environment: BTreeMap<String, Value>,
    /// Mounts to attach
    pub mount_ids: Vec<i32>,
    /// Registry credentials (`user:password`) for private images
    pub registry_credentials: Option<String>,
    /// Boot the workload once installation finishes
    pub start_on_completion: bool,
}

/// How an install attempt ended. Agent-side failures are an outcome, not
/// an error: the status column records them and the workflow returns
/// normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The agent created the workload and it settled
    Installed,
    /// The agent rejected the install or it never settled
    Failed {
        /// What went wrong, for operator display
        reason: String,
    },
}

/// Orchestrates installs against node agents.
#[derive(Clone)]
pub struct Provisioner {
    pool: PgPool,
    registry: NodeRegistry,
}

impl Provisioner {
    /// Create a provisioner over the given pool and registry.
    pub fn new(pool: PgPool, registry: NodeRegistry) -> Self {
        Self { pool, registry }
    }

    /// Install a workload on its node.
    ///
    /// Precondition failures (missing rows, foreign allocations) surface
    /// as errors before the agent is contacted. Once the agent has been
    /// asked to create the workload, failures are recorded in the status
    /// column instead.
    #[instrument(skip(self, request))]
    pub async fn install(&self, server_id: i32, request: ProvisionRequest) -> Result<InstallOutcome> {
        let (server, settings) = self.assemble(server_id, &request).await?;
        let (_, client) = self.registry.client_for(server.node_id).await?;

        db::set_server_status(&self.pool, server.id, Some(server_status::INSTALLING)).await?;
        info!(server_id = server.id, uuid = %server.uuid, "starting install");

        let create = CreateServerRequest {
            uuid: server.uuid,
            start_on_completion: request.start_on_completion,
            settings,
        };
        if let Err(e) = client.create_server(&create).await {
            return self.record_failure(&server, e.to_string()).await;
        }
        self.registry.touch_last_seen(server.node_id).await?;

        match wait_for_settled_state(
            &client,
            server.uuid,
            INSTALL_POLL_INTERVAL,
            INSTALL_POLL_ATTEMPTS,
        )
        .await
        {
            Ok(details) => {
                db::mark_server_installed(&self.pool, server.id).await?;
                info!(server_id = server.id, state = ?details.state, "install completed");
                Ok(InstallOutcome::Installed)
            }
            Err(e) => self.record_failure(&server, e.to_string()).await,
        }
    }

    /// Re-run install scripts for an existing workload on its agent.
    #[instrument(skip(self))]
    pub async fn reinstall(&self, server_id: i32) -> Result<InstallOutcome> {
        let server = db::get_server(&self.pool, server_id)
            .await?
            .ok_or(Error::ServerNotFound(server_id))?;
        if server.has_active_operation() {
            return Err(Error::validation(
                409,
                "workload has another operation in progress",
            ));
        }
        let (_, client) = self.registry.client_for(server.node_id).await?;

        db::set_server_status(&self.pool, server.id, Some(server_status::INSTALLING)).await?;
        info!(server_id = server.id, uuid = %server.uuid, "starting reinstall");

        if let Err(e) = client.reinstall_server(server.uuid).await {
            return self.record_failure(&server, e.to_string()).await;
        }

        match wait_for_settled_state(
            &client,
            server.uuid,
            INSTALL_POLL_INTERVAL,
            INSTALL_POLL_ATTEMPTS,
        )
        .await
        {
            Ok(_) => {
                db::mark_server_installed(&self.pool, server.id).await?;
                info!(server_id = server.id, "reinstall completed");
                Ok(InstallOutcome::Installed)
            }
            Err(e) => self.record_failure(&server, e.to_string()).await,
        }
    }

    /// Load everything the agent configuration needs, failing fast on
    /// data-integrity problems.
    async fn assemble(
        &self,
        server_id: i32,
        request: &ProvisionRequest,
    ) -> Result<(Server, ServerConfiguration)> {
        let server = db::get_server(&self.pool, server_id)
            .await?
            .ok_or(Error::ServerNotFound(server_id))?;
        let limits = db::get_server_limits(&self.pool, server.id).await?;
        let limits = check_install_preconditions(&server, limits)?;
        let template = db::get_template(&self.pool, server.template_id)
            .await?
            .ok_or_else(|| Error::validation(500, "workload references a missing template"))?;

        let allocations = db::get_server_allocations(&self.pool, server.id).await?;
        let primary = allocations
            .iter()
            .find(|a| Some(a.id) == server.allocation_id)
            .or_else(|| allocations.first())
            .ok_or_else(|| Error::validation(500, "workload has no network allocation"))?;
        for allocation in &allocations {
            if allocation.node_id != server.node_id {
                return Err(Error::validation(
                    500,
                    format!(
                        "allocation {} belongs to node {}, not the workload's node",
                        allocation.id, allocation.node_id
                    ),
                ));
            }
        }

        let variables = db::get_template_variables(&self.pool, template.id).await?;
        let defaults: Vec<(String, Value)> = variables
            .into_iter()
            .map(|v| (v.env_key, Value::String(v.default_value)))
            .collect();
        let mounts = if request.mount_ids.is_empty() {
            Vec::new()
        } else {
            db::get_mounts(&self.pool, &request.mount_ids).await?
        };

        let settings = build_configuration(
            &server,
            &limits,
            &template,
            primary,
            &allocations,
            &defaults,
            &request.environment,
            &mounts,
            request.registry_credentials.clone(),
        );
        Ok((server, settings))
    }

    async fn record_failure(&self, server: &Server, reason: String) -> Result<InstallOutcome> {
        warn!(server_id = server.id, %reason, "install failed");
        db::set_server_status(&self.pool, server.id, Some(server_status::INSTALL_FAILED)).await?;
        Ok(InstallOutcome::Failed { reason })
    }
}

/// Gate an install on the workload's state and data integrity. In-flight
/// statuses block; failure markers do not, so a failed install can be
/// retried. A missing limits row rejects here, before any agent contact.
pub(crate) fn check_install_preconditions(
    server: &Server,
    limits: Option<ServerLimits>,
) -> Result<ServerLimits> {
    if server.has_active_operation() {
        return Err(Error::validation(
            409,
            "workload has another operation in progress",
        ));
    }
    limits.ok_or_else(|| {
        error!(server_id = server.id, "workload has no resource limits row");
        Error::validation(500, "workload has no resource limits configured")
    })
}

/// Merge template defaults, caller overrides, and computed variables into
/// the final environment. Precedence, lowest to highest: defaults,
/// overrides, computed.
pub(crate) fn merge_environment(
    defaults: &[(String, Value)],
    overrides: &BTreeMap<String, Value>,
    computed: &[(String, Value)],
) -> BTreeMap<String, Value> {
    let mut env: BTreeMap<String, Value> = defaults.iter().cloned().collect();
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in computed {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Group allocations into the agent's per-IP port map.
pub(crate) fn build_allocation_map(primary: &Allocation, all: &[Allocation]) -> AllocationMap {
    let mut mappings: BTreeMap<String, Vec<u16>> = BTreeMap::new();
    mappings.entry(primary.ip.clone()).or_default();
    for allocation in all {
        let ports = mappings.entry(allocation.ip.clone()).or_default();
        let port = allocation.port as u16;
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    for ports in mappings.values_mut() {
        ports.sort_unstable();
    }
    AllocationMap {
        default: DefaultAllocation {
            ip: primary.ip.clone(),
            port: primary.port as u16,
        },
        mappings,
    }
}

/// Assemble the full agent-facing configuration from panel rows.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_configuration(
    server: &Server,
    limits: &ServerLimits,
    template: &Template,
    primary: &Allocation,
    allocations: &[Allocation],
    defaults: &[(String, Value)],
    overrides: &BTreeMap<String, Value>,
    mounts: &[MountRow],
    registry_credentials: Option<String>,
) -> ServerConfiguration {
    let computed = [
        (
            "SERVER_IP".to_string(),
            Value::String(primary.ip.clone()),
        ),
        (
            "SERVER_PORT".to_string(),
            Value::String(primary.port.to_string()),
        ),
        (
            "SERVER_MEMORY".to_string(),
            Value::String(limits.memory.to_string()),
        ),
    ];
    let environment = merge_environment(defaults, overrides, &computed);

    ServerConfiguration {
        uuid: server.uuid,
        suspended: server.suspended,
        invocation: server.startup.clone(),
        environment,
        build: BuildLimits {
            memory_limit: limits.memory,
            swap: limits.swap,
            io_weight: limits.io_weight,
            cpu_limit: limits.cpu,
            disk_space: limits.disk,
            threads: limits.threads.clone(),
        },
        container: ContainerSettings {
            image: server
                .image
                .clone()
                .unwrap_or_else(|| template.docker_image.clone()),
            registry_credentials,
        },
        allocations: build_allocation_map(primary, allocations),
        mounts: mounts
            .iter()
            .map(|m| Mount {
                source: m.source.clone(),
                target: m.target.clone(),
                read_only: m.read_only,
            })
            .collect(),
        skip_scripts: server.skip_scripts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn allocation(id: i32, ip: &str, port: i32, primary: bool) -> Allocation {
        Allocation {
            id,
            node_id: 1,
            ip: ip.to_string(),
            port,
            server_id: Some(10),
            is_primary: primary,
        }
    }

    fn server() -> Server {
        Server {
            id: 10,
            uuid: Uuid::new_v4(),
            name: "mc-lobby".to_string(),
            node_id: 1,
            allocation_id: Some(1),
            template_id: 3,
            status: None,
            suspended: false,
            image: None,
            startup: "java -Xms128M -Xmx{{SERVER_MEMORY}}M -jar server.jar".to_string(),
            skip_scripts: false,
            installed_at: None,
            created_at: Utc::now(),
        }
    }

    fn limits() -> ServerLimits {
        ServerLimits {
            server_id: 10,
            memory: 2048,
            swap: 0,
            disk: 10240,
            io_weight: 500,
            cpu: 200,
            threads: None,
        }
    }

    fn template() -> Template {
        Template {
            id: 3,
            name: "minecraft".to_string(),
            docker_image: "ghcr.io/gantry/java:21".to_string(),
            startup: "java -jar server.jar".to_string(),
        }
    }

    #[test]
    fn failed_install_can_be_retried() {
        let mut s = server();
        s.status = Some(server_status::INSTALL_FAILED.to_string());
        assert!(check_install_preconditions(&s, Some(limits())).is_ok());
    }

    #[test]
    fn in_flight_operation_blocks_install() {
        for status in [server_status::INSTALLING, server_status::TRANSFERRING] {
            let mut s = server();
            s.status = Some(status.to_string());
            let err = check_install_preconditions(&s, Some(limits())).unwrap_err();
            assert_eq!(err.http_status(), 409);
        }
    }

    #[test]
    fn missing_limits_reject_before_any_agent_contact() {
        let err = check_install_preconditions(&server(), None).unwrap_err();
        assert_eq!(err.http_status(), 500);
        assert!(err.to_string().contains("resource limits"));
    }

    #[test]
    fn overrides_beat_defaults_and_computed_beats_both() {
        let defaults = vec![
            ("JAVA_VERSION".to_string(), Value::String("17".into())),
            ("SERVER_PORT".to_string(), Value::String("1".into())),
        ];
        let mut overrides = BTreeMap::new();
        overrides.insert("JAVA_VERSION".to_string(), Value::String("21".into()));
        let computed = [(
            "SERVER_PORT".to_string(),
            Value::String("25565".into()),
        )];

        let env = merge_environment(&defaults, &overrides, &computed);
        assert_eq!(env["JAVA_VERSION"], Value::String("21".into()));
        assert_eq!(env["SERVER_PORT"], Value::String("25565".into()));
    }

    #[test]
    fn unknown_override_keys_are_passed_through() {
        let env = merge_environment(
            &[],
            &BTreeMap::from([("EXTRA".to_string(), Value::String("1".into()))]),
            &[],
        );
        assert_eq!(env["EXTRA"], Value::String("1".into()));
    }

    #[test]
    fn allocation_map_groups_ports_by_ip() {
        let primary = allocation(1, "10.0.0.5", 25565, true);
        let all = vec![
            primary.clone(),
            allocation(2, "10.0.0.5", 25566, false),
            allocation(3, "10.0.0.6", 19132, false),
        ];
        let map = build_allocation_map(&primary, &all);
        assert_eq!(map.default.ip, "10.0.0.5");
        assert_eq!(map.default.port, 25565);
        assert_eq!(map.mappings["10.0.0.5"], vec![25565, 25566]);
        assert_eq!(map.mappings["10.0.0.6"], vec![19132]);
    }

    #[test]
    fn primary_ip_is_present_even_without_additional_ports() {
        let primary = allocation(1, "10.0.0.5", 25565, true);
        let map = build_allocation_map(&primary, std::slice::from_ref(&primary));
        assert_eq!(map.mappings.len(), 1);
        assert_eq!(map.mappings["10.0.0.5"], vec![25565]);
    }

    #[test]
    fn configuration_computes_standard_variables() {
        let primary = allocation(1, "10.0.0.5", 25565, true);
        let all = vec![primary.clone()];
        let settings = build_configuration(
            &server(),
            &limits(),
            &template(),
            &primary,
            &all,
            &[("JAVA_VERSION".to_string(), Value::String("17".into()))],
            &BTreeMap::new(),
            &[],
            None,
        );
        assert_eq!(settings.environment["SERVER_IP"], Value::String("10.0.0.5".into()));
        assert_eq!(settings.environment["SERVER_PORT"], Value::String("25565".into()));
        assert_eq!(settings.environment["SERVER_MEMORY"], Value::String("2048".into()));
        assert_eq!(settings.environment["JAVA_VERSION"], Value::String("17".into()));
        assert_eq!(settings.build.memory_limit, 2048);
        assert_eq!(settings.build.disk_space, 10240);
    }

    #[test]
    fn image_override_beats_template_default() {
        let mut s = server();
        s.image = Some("custom/image:1".to_string());
        let primary = allocation(1, "10.0.0.5", 25565, true);
        let settings = build_configuration(
            &s,
            &limits(),
            &template(),
            &primary,
            std::slice::from_ref(&primary),
            &[],
            &BTreeMap::new(),
            &[],
            None,
        );
        assert_eq!(settings.container.image, "custom/image:1");
    }

    #[test]
    fn mounts_are_mapped_through() {
        let primary = allocation(1, "10.0.0.5", 25565, true);
        let mounts = vec![MountRow {
            id: 1,
            source: "/srv/shared".to_string(),
            target: "/home/container/shared".to_string(),
            read_only: true,
        }];
        let settings = build_configuration(
            &server(),
            &limits(),
            &template(),
            &primary,
            std::slice::from_ref(&primary),
            &[],
            &BTreeMap::new(),
            &mounts,
            None,
        );
        assert_eq!(settings.mounts.len(), 1);
        assert!(settings.mounts[0].read_only);
    }
}
