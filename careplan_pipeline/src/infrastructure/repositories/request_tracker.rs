// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Request Tracker
//!
//! Postgres-backed `RequestRepository` over the `pipeline_requests` table.
//! Owns the status machine (`PENDING → IN_PROGRESS` stamps `started_at`,
//! terminal transitions stamp `completed_at`), the encrypted blobs, the
//! expiry/cleanup sweepers, and the 24-hour rolling stats.
//!
//! Plaintext never touches the database: inputs and results are encrypted
//! by the injected `EncryptionService` before insert and decrypted only by
//! the `get_decrypted_*` operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use careplan_pipeline_domain::entities::{
    PipelineInput, PipelineOutput, PipelineRequestRecord, RequestError, RequestStats, RequestStatus,
};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::repositories::RequestRepository;
use careplan_pipeline_domain::services::EncryptionService;
use careplan_pipeline_domain::value_objects::{IdempotencyKey, RequestId};

pub struct PostgresRequestTracker {
    pool: PgPool,
    encryption: Arc<dyn EncryptionService>,
}

impl PostgresRequestTracker {
    pub fn new(pool: PgPool, encryption: Arc<dyn EncryptionService>) -> Self {
        Self { pool, encryption }
    }

    fn map_row(row: &PgRow) -> Result<PipelineRequestRecord, PipelineError> {
        let status: String = row.get("status");
        let error: Option<serde_json::Value> = row.get("error");
        let error = match error {
            Some(value) => Some(
                serde_json::from_value::<RequestError>(value)
                    .map_err(|e| PipelineError::internal(format!("stored error is malformed: {}", e)))?,
            ),
            None => None,
        };
        let key: String = row.get("idempotency_key");
        Ok(PipelineRequestRecord {
            id: RequestId::from_uuid(row.get::<Uuid, _>("id")),
            visit_id: row.get::<Uuid, _>("visit_id").to_string(),
            patient_id: row.get("patient_id"),
            user_id: row.get("user_id"),
            idempotency_key: IdempotencyKey::new(key)?,
            status: RequestStatus::parse(&status)?,
            input_encrypted: row.get("input_encrypted"),
            result_encrypted: row.get("result_encrypted"),
            error,
            stages_completed: row.get("stages_completed"),
            degraded_services: row.get("degraded_services"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            created_at: row.get("created_at"),
        })
    }

    fn parse_visit_id(visit_id: &str) -> Result<Uuid, PipelineError> {
        Uuid::parse_str(visit_id).map_err(|e| PipelineError::validation(format!("invalid visit id: {}", e)))
    }

    fn db_err(context: &str, e: sqlx::Error) -> PipelineError {
        PipelineError::internal(format!("{}: {}", context, e))
    }
}

#[async_trait]
impl RequestRepository for PostgresRequestTracker {
    async fn create(&self, record: &PipelineRequestRecord) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO pipeline_requests \
             (id, visit_id, patient_id, user_id, idempotency_key, status, input_encrypted, \
              stages_completed, degraded_services, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.id.as_uuid())
        .bind(Self::parse_visit_id(&record.visit_id)?)
        .bind(&record.patient_id)
        .bind(&record.user_id)
        .bind(record.idempotency_key.as_str())
        .bind(record.status.as_str())
        .bind(&record.input_encrypted)
        .bind(&record.stages_completed)
        .bind(&record.degraded_services)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to create request record", e))?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: RequestId,
        status: RequestStatus,
        completed_stages: Option<&[String]>,
    ) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "UPDATE pipeline_requests SET \
               status = $2, \
               stages_completed = COALESCE($3, stages_completed), \
               started_at = CASE WHEN $2 = 'IN_PROGRESS' AND started_at IS NULL THEN now() ELSE started_at END \
             WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'EXPIRED')",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(completed_stages)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to update request status", e))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::internal(format!(
                "request {} not found or already terminal",
                id
            )));
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: RequestId,
        result_encrypted: Vec<u8>,
        degraded_services: &[String],
        completed_stages: &[String],
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE pipeline_requests SET \
               status = 'COMPLETED', result_encrypted = $2, degraded_services = $3, \
               stages_completed = $4, completed_at = now() \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(result_encrypted)
        .bind(degraded_services)
        .bind(completed_stages)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to complete request", e))?;
        Ok(())
    }

    async fn fail(&self, id: RequestId, error: &RequestError) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(error)?;
        sqlx::query(
            "UPDATE pipeline_requests SET status = 'FAILED', error = $2, completed_at = now() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to fail request", e))?;
        Ok(())
    }

    async fn get_by_id(&self, id: RequestId) -> Result<Option<PipelineRequestRecord>, PipelineError> {
        let row = sqlx::query("SELECT * FROM pipeline_requests WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::db_err("failed to query request", e))?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn get_by_visit_id(&self, visit_id: &str) -> Result<Vec<PipelineRequestRecord>, PipelineError> {
        let rows = sqlx::query("SELECT * FROM pipeline_requests WHERE visit_id = $1 ORDER BY created_at DESC")
            .bind(Self::parse_visit_id(visit_id)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::db_err("failed to query requests by visit", e))?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn get_active_by_visit_id(&self, visit_id: &str) -> Result<Vec<PipelineRequestRecord>, PipelineError> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_requests \
             WHERE visit_id = $1 AND status IN ('PENDING', 'IN_PROGRESS') \
             ORDER BY created_at DESC",
        )
        .bind(Self::parse_visit_id(visit_id)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to query active requests", e))?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn get_by_user_id(&self, user_id: &str, limit: u32) -> Result<Vec<PipelineRequestRecord>, PipelineError> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_requests WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to query requests by user", e))?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn get_decrypted_input(&self, id: RequestId) -> Result<Option<PipelineInput>, PipelineError> {
        let Some(record) = self.get_by_id(id).await? else {
            return Ok(None);
        };
        let plaintext = self.encryption.decrypt(&record.input_encrypted)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    async fn get_decrypted_result(&self, id: RequestId) -> Result<Option<PipelineOutput>, PipelineError> {
        let Some(record) = self.get_by_id(id).await? else {
            return Ok(None);
        };
        let Some(blob) = record.result_encrypted else {
            return Ok(None);
        };
        let plaintext = self.encryption.decrypt(&blob)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    async fn expire_stale(&self, max_age: Duration) -> Result<u64, PipelineError> {
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| PipelineError::validation(format!("invalid max age: {}", e)))?;
        let result = sqlx::query(
            "UPDATE pipeline_requests SET status = 'EXPIRED' \
             WHERE status IN ('PENDING', 'IN_PROGRESS') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to expire stale requests", e))?;
        Ok(result.rows_affected())
    }

    async fn clean_old(&self, max_age: Duration) -> Result<u64, PipelineError> {
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| PipelineError::validation(format!("invalid max age: {}", e)))?;
        let result = sqlx::query(
            "DELETE FROM pipeline_requests \
             WHERE status IN ('COMPLETED', 'FAILED', 'EXPIRED') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to clean old requests", e))?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<RequestStats, PipelineError> {
        let row = sqlx::query(
            "SELECT \
               count(*) AS total, \
               count(*) FILTER (WHERE status = 'PENDING') AS pending, \
               count(*) FILTER (WHERE status = 'IN_PROGRESS') AS in_progress, \
               count(*) FILTER (WHERE status = 'COMPLETED') AS completed, \
               count(*) FILTER (WHERE status = 'FAILED') AS failed, \
               count(*) FILTER (WHERE status = 'EXPIRED') AS expired, \
               (avg(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000.0) \
                 FILTER (WHERE status = 'COMPLETED' AND started_at IS NOT NULL))::float8 AS avg_ms \
             FROM pipeline_requests WHERE created_at > now() - interval '24 hours'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::db_err("failed to compute request stats", e))?;

        Ok(RequestStats {
            total: row.get::<i64, _>("total") as u64,
            pending: row.get::<i64, _>("pending") as u64,
            in_progress: row.get::<i64, _>("in_progress") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            expired: row.get::<i64, _>("expired") as u64,
            avg_completed_duration_ms: row.get::<Option<f64>, _>("avg_ms"),
        })
    }
}
