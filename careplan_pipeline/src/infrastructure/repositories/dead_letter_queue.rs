// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Postgres-backed dead-letter queue. Payloads arrive already encrypted
//! from the job queue; error messages arrive already scrubbed from the
//! error carrier.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use careplan_pipeline_domain::entities::{DeadLetterEntry, DeadLetterResolution, JobType};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::repositories::DeadLetterRepository;

pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<DeadLetterEntry, PipelineError> {
        let resolution: Option<String> = row.get("resolution");
        Ok(DeadLetterEntry {
            id: row.get("id"),
            job_type: JobType::parse(&row.get::<String, _>("job_type"))?,
            job_id: row.get("job_id"),
            payload_encrypted: row.get("payload_encrypted"),
            error_message: row.get("error_message"),
            error_stack: row.get("error_stack"),
            attempts: row.get::<i32, _>("attempts") as u32,
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            resolved_at: row.get("resolved_at"),
            resolution: resolution.as_deref().map(DeadLetterResolution::parse).transpose()?,
        })
    }

    fn db_err(context: &str, e: sqlx::Error) -> PipelineError {
        PipelineError::internal(format!("{}: {}", context, e))
    }
}

#[async_trait]
impl DeadLetterRepository for PostgresDeadLetterQueue {
    async fn add(&self, entry: &DeadLetterEntry) -> Result<Uuid, PipelineError> {
        sqlx::query(
            "INSERT INTO dead_letter_queue \
             (id, job_type, job_id, payload_encrypted, error_message, error_stack, attempts, \
              first_failed_at, last_failed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(entry.job_type.as_str())
        .bind(&entry.job_id)
        .bind(&entry.payload_encrypted)
        .bind(&entry.error_message)
        .bind(&entry.error_stack)
        .bind(entry.attempts as i32)
        .bind(entry.first_failed_at)
        .bind(entry.last_failed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to add dead-letter entry", e))?;
        Ok(entry.id)
    }

    async fn get_unresolved(&self, limit: u32) -> Result<Vec<DeadLetterEntry>, PipelineError> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letter_queue WHERE resolved_at IS NULL ORDER BY first_failed_at LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to list unresolved entries", e))?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn resolve(&self, id: Uuid, resolution: DeadLetterResolution) -> Result<bool, PipelineError> {
        let result = sqlx::query(
            "UPDATE dead_letter_queue SET resolved_at = now(), resolution = $2 \
             WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id)
        .bind(resolution.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to resolve dead-letter entry", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn depth(&self) -> Result<u64, PipelineError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM dead_letter_queue WHERE resolved_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::db_err("failed to compute DLQ depth", e))?;
        Ok(count as u64)
    }

    async fn payload_for_retry(&self, id: Uuid) -> Result<Option<Vec<u8>>, PipelineError> {
        let row = sqlx::query("SELECT payload_encrypted FROM dead_letter_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::db_err("failed to fetch DLQ payload", e))?;
        Ok(row.map(|r| r.get("payload_encrypted")))
    }
}
