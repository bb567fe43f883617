// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Panel orchestration daemon.
//!
//! Connects to PostgreSQL, applies migrations, and runs the schedule
//! poller until interrupted.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gantry_core::scheduler::{PollerConfig, SchedulePoller, ScheduleRunner};
use gantry_core::{Config, NodeRegistry, TokenVault, migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(&config.database_url)
        .await
        .context("connecting to PostgreSQL")?;
    migrations::run(&pool).await?;

    let vault = TokenVault::new(&config.vault_passphrase);
    let registry = NodeRegistry::new(pool.clone(), vault);
    let runner = Arc::new(ScheduleRunner::new(pool.clone(), registry));

    let poller = SchedulePoller::new(
        pool.clone(),
        runner,
        PollerConfig {
            poll_interval: config.schedule_poll_interval,
            ..PollerConfig::default()
        },
    );
    let shutdown = poller.shutdown_handle();
    let poller_handle = poller.spawn();

    info!("gantry core started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    shutdown.notify_waiters();
    poller_handle.await.ok();
    pool.close().await;
    info!("gantry core stopped");
    Ok(())
}
