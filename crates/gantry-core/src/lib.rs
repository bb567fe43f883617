// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration core for the gantry panel.
//!
//! The panel is the source of truth for nodes, workloads, allocations,
//! and schedules; node agents do the actual work. This crate holds
//! everything between the two: credential storage, placement decisions,
//! the provisioning and transfer workflows, and the schedule engine.
//!
//! ```text
//!                      ┌─────────────────────────────┐
//!                      │         gantry-core         │
//!                      │                             │
//!   PostgreSQL ◄──────►│  db / migrations            │
//!                      │  vault (encrypted tokens)   │
//!                      │  nodes (registry)           │
//!                      │  capacity (placement)       │
//!                      │  provisioning / transfer    │
//!                      │  cron / scheduler           │
//!                      └──────────────┬──────────────┘
//!                                     │ gantry-agent-client
//!                                     ▼
//!                      node agents (one per machine)
//! ```
//!
//! | Concern | Module |
//! |---------|--------|
//! | Agent credentials at rest | [`vault`] |
//! | Node lookup, tokens, bootstrap | [`nodes`] |
//! | Overallocation-aware placement | [`capacity`] |
//! | Install workflow | [`provisioning`] |
//! | Cross-node moves | [`transfer`] |
//! | Cron evaluation | [`cron`] |
//! | Schedule execution and polling | [`scheduler`] |

#![deny(missing_docs)]

/// Environment-driven configuration.
pub mod config;

/// Rows and queries over PostgreSQL.
pub mod db;

/// Error types for orchestration operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// At-rest encryption for agent credentials.
pub mod vault;

/// Node registry and bootstrap configuration.
pub mod nodes;

/// Node capacity evaluation.
pub mod capacity;

/// Provisioning workflow.
pub mod provisioning;

/// Transfer workflow.
pub mod transfer;

/// Restricted cron evaluation.
pub mod cron;

/// Schedule execution and background polling.
pub mod scheduler;

pub use config::Config;
pub use error::{Error, Result};
pub use nodes::NodeRegistry;
pub use provisioning::{InstallOutcome, ProvisionRequest, Provisioner};
pub use scheduler::{PollerConfig, RunGuard, SchedulePoller, ScheduleRunner};
pub use transfer::{TransferRequest, TransferStart, TransferWorkflow};
pub use vault::TokenVault;
