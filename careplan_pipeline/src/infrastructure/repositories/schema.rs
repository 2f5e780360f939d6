// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Postgres schema helpers shared by the repository implementations.
//!
//! Applies migrations on start-up so integration tests and services see a
//! consistent database.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

/// Runs pending migrations against the provided pool.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    debug!("ensuring database schema is up to date");
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("database schema is up to date");
    Ok(())
}

/// Connects a pool and runs migrations. For application startup.
pub async fn initialize_database(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}
