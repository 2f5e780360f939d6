// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Idempotency Store
//!
//! Postgres-backed `IdempotencyRepository`. The exactly-once decision rides
//! on a single atomic statement: `INSERT … ON CONFLICT (key) DO NOTHING
//! RETURNING key`. A returned row means this caller inserted and owns the
//! execution; nothing returned means a record already exists and is
//! classified by status and hash.
//!
//! An existing record past its `expires_at` is treated as absent: it is
//! deleted and the insert retried once, so an expired key is reusable
//! without waiting for the sweeper.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use careplan_pipeline_domain::entities::{IdempotencyOutcome, IdempotencyRecord, IdempotencyStatus};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::repositories::IdempotencyRepository;
use careplan_pipeline_domain::value_objects::{IdempotencyKey, RequestId};

pub struct PostgresIdempotencyStore {
    pool: PgPool,
    expiration: chrono::Duration,
}

impl PostgresIdempotencyStore {
    /// `expiration_hours` is clamped to the 24-hour ceiling of the data
    /// model.
    pub fn new(pool: PgPool, expiration_hours: u64) -> Self {
        Self {
            pool,
            expiration: chrono::Duration::hours(expiration_hours.min(24) as i64),
        }
    }

    fn map_row(row: &PgRow) -> Result<IdempotencyRecord, PipelineError> {
        let status: String = row.get("status");
        let status = match status.as_str() {
            "PENDING" => IdempotencyStatus::Pending,
            "COMPLETED" => IdempotencyStatus::Completed,
            "FAILED" => IdempotencyStatus::Failed,
            other => {
                return Err(PipelineError::internal(format!(
                    "unknown idempotency status: {}",
                    other
                )))
            }
        };
        Ok(IdempotencyRecord {
            key: IdempotencyKey::new(row.get::<String, _>("key"))?,
            request_hash: row.get("request_hash"),
            request_id: RequestId::from_uuid(row.get::<Uuid, _>("request_id")),
            response: row.get("response"),
            status,
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        })
    }

    fn db_err(context: &str, e: sqlx::Error) -> PipelineError {
        PipelineError::internal(format!("{}: {}", context, e))
    }

    async fn try_insert(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        request_id: RequestId,
    ) -> Result<bool, PipelineError> {
        let expires_at: DateTime<Utc> = Utc::now() + self.expiration;
        let inserted = sqlx::query(
            "INSERT INTO idempotency_keys (key, request_hash, request_id, status, created_at, expires_at) \
             VALUES ($1, $2, $3, 'PENDING', now(), $4) \
             ON CONFLICT (key) DO NOTHING \
             RETURNING key",
        )
        .bind(key.as_str())
        .bind(request_hash)
        .bind(request_id.as_uuid())
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::db_err("idempotency insert failed", e))?;
        Ok(inserted.is_some())
    }

    async fn current_owner(&self, key: &IdempotencyKey) -> Result<Option<RequestId>, PipelineError> {
        let row = sqlx::query("SELECT request_id FROM idempotency_keys WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::db_err("idempotency owner lookup failed", e))?;
        Ok(row.map(|r| RequestId::from_uuid(r.get::<Uuid, _>("request_id"))))
    }
}

#[async_trait]
impl IdempotencyRepository for PostgresIdempotencyStore {
    async fn check_or_create(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        request_id: RequestId,
    ) -> Result<IdempotencyOutcome, PipelineError> {
        if self.try_insert(key, request_hash, request_id).await? {
            return Ok(IdempotencyOutcome::New);
        }

        let row = sqlx::query("SELECT * FROM idempotency_keys WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::db_err("idempotency lookup failed", e))?;

        let Some(row) = row else {
            // Insert conflicted but the row is gone (swept between the two
            // statements). One more insert attempt settles ownership; if
            // that also conflicts, someone else just took the key.
            return if self.try_insert(key, request_hash, request_id).await? {
                Ok(IdempotencyOutcome::New)
            } else {
                // Unknown owner degrades to the nil id: never equal to a
                // real request, so the caller waits instead of proceeding.
                let owner = self
                    .current_owner(key)
                    .await?
                    .unwrap_or_else(|| RequestId::from_uuid(Uuid::nil()));
                Ok(IdempotencyOutcome::Pending(owner))
            };
        };

        let record = Self::map_row(&row)?;

        if record.is_expired(Utc::now()) {
            sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND expires_at = $2")
                .bind(key.as_str())
                .bind(record.expires_at)
                .execute(&self.pool)
                .await
                .map_err(|e| Self::db_err("expired idempotency delete failed", e))?;
            return if self.try_insert(key, request_hash, request_id).await? {
                Ok(IdempotencyOutcome::New)
            } else {
                // Unknown owner degrades to the nil id: never equal to a
                // real request, so the caller waits instead of proceeding.
                let owner = self
                    .current_owner(key)
                    .await?
                    .unwrap_or_else(|| RequestId::from_uuid(Uuid::nil()));
                Ok(IdempotencyOutcome::Pending(owner))
            };
        }

        if record.request_hash != request_hash {
            return Err(PipelineError::validation(format!(
                "IDEMPOTENCY_KEY_REUSED: key {} was used with a different request body",
                key
            )));
        }

        match record.status {
            IdempotencyStatus::Completed => Ok(IdempotencyOutcome::Completed(
                record.response.unwrap_or(serde_json::Value::Null),
            )),
            IdempotencyStatus::Failed => Ok(IdempotencyOutcome::Failed(
                record.response.unwrap_or(serde_json::Value::Null),
            )),
            IdempotencyStatus::Pending => Ok(IdempotencyOutcome::Pending(record.request_id)),
        }
    }

    async fn complete(
        &self,
        key: &IdempotencyKey,
        request_id: RequestId,
        response: &serde_json::Value,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE idempotency_keys SET status = 'COMPLETED', response = $3, request_id = $2 WHERE key = $1",
        )
        .bind(key.as_str())
        .bind(request_id.as_uuid())
        .bind(response)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("idempotency complete failed", e))?;
        Ok(())
    }

    async fn fail(
        &self,
        key: &IdempotencyKey,
        request_id: RequestId,
        error: &serde_json::Value,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE idempotency_keys SET status = 'FAILED', response = $3, request_id = $2 WHERE key = $1",
        )
        .bind(key.as_str())
        .bind(request_id.as_uuid())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("idempotency fail failed", e))?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, PipelineError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < now()")
            .execute(&self.pool)
            .await
            .map_err(|e| Self::db_err("idempotency sweep failed", e))?;
        Ok(result.rows_affected())
    }

    async fn find_stale_pending(&self, older_than: Duration) -> Result<Vec<IdempotencyRecord>, PipelineError> {
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| PipelineError::validation(format!("invalid staleness window: {}", e)))?;
        let rows = sqlx::query(
            "SELECT * FROM idempotency_keys WHERE status = 'PENDING' AND created_at < $1 ORDER BY created_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::db_err("stale pending query failed", e))?;
        rows.iter().map(Self::map_row).collect()
    }
}
