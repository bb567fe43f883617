// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations.

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use tracing::info;

use crate::error::Result;

/// Migrations compiled into the binary from `migrations/`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply any pending migrations.
pub async fn run(pool: &PgPool) -> Result<()> {
    info!("applying pending database migrations");
    MIGRATOR.run(pool).await?;
    info!("database schema is up to date");
    Ok(())
}
