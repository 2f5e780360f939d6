// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Saga Engine
//!
//! Forward-execute / reverse-compensate coordination for side effects that
//! do not share a transaction. A saga is an ordered list of named steps;
//! when step *k* fails, steps *[0..k-1]* are compensated in reverse order.
//! Compensation failures are logged but never halt the reverse sweep: a
//! half-compensated saga is still better than an abandoned one.
//!
//! The module also provides [`with_optimistic_lock`]: versioned row updates
//! with a `FOR UPDATE` check inside a transaction, failing with
//! `OPTIMISTIC_LOCK` when the stored version moved.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::value_objects::CorrelationId;

/// Mutable state threaded through a saga run. Steps communicate through
/// the JSON `data` document.
pub struct SagaContext {
    pub correlation_id: CorrelationId,
    pub data: serde_json::Value,
}

impl SagaContext {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// One compensable step.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the forward action, returning a result later handed to
    /// `compensate`.
    async fn execute(&self, ctx: &mut SagaContext) -> Result<serde_json::Value, PipelineError>;

    /// Undoes the forward action. `result` is what `execute` returned.
    async fn compensate(&self, ctx: &mut SagaContext, result: &serde_json::Value) -> Result<(), PipelineError>;
}

/// Failure report: the originating error plus what ran and what was undone.
#[derive(Debug)]
pub struct SagaFailure {
    pub error: PipelineError,
    pub failed_step: String,
    pub completed_steps: Vec<String>,
    pub compensated_steps: Vec<String>,
}

pub struct Saga {
    name: String,
    steps: Vec<Box<dyn SagaStep>>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Box<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Executes forward; on failure compensates completed steps in reverse
    /// order. Success yields the last step's result.
    pub async fn run(&self, ctx: &mut SagaContext) -> Result<serde_json::Value, Box<SagaFailure>> {
        let mut completed: Vec<(usize, serde_json::Value)> = Vec::new();
        let mut last_result = serde_json::Value::Null;

        for (index, step) in self.steps.iter().enumerate() {
            debug!(saga = %self.name, step = step.name(), "executing saga step");
            match step.execute(ctx).await {
                Ok(result) => {
                    last_result = result.clone();
                    completed.push((index, result));
                }
                Err(error) => {
                    warn!(
                        saga = %self.name,
                        step = step.name(),
                        correlation_id = %ctx.correlation_id,
                        error = %error,
                        "saga step failed, compensating"
                    );
                    let mut compensated = Vec::new();
                    for (done_index, result) in completed.iter().rev() {
                        let done = &self.steps[*done_index];
                        match done.compensate(ctx, result).await {
                            Ok(()) => compensated.push(done.name().to_string()),
                            Err(comp_err) => {
                                // Keep sweeping: remaining compensations
                                // must still run.
                                warn!(
                                    saga = %self.name,
                                    step = done.name(),
                                    error = %comp_err,
                                    "saga compensation failed"
                                );
                            }
                        }
                    }
                    return Err(Box::new(SagaFailure {
                        error,
                        failed_step: step.name().to_string(),
                        completed_steps: completed
                            .iter()
                            .map(|(i, _)| self.steps[*i].name().to_string())
                            .collect(),
                        compensated_steps: compensated,
                    }));
                }
            }
        }
        Ok(last_result)
    }
}

/// Runs `body` inside a transaction holding `FOR UPDATE` on the row,
/// verifying the stored version equals `expected_version` before and
/// incrementing it after. Fails with an `OPTIMISTIC_LOCK` error when the
/// version moved underneath the caller.
///
/// The table name is interpolated and must come from code, never input.
pub async fn with_optimistic_lock<T, F>(
    pool: &PgPool,
    table: &str,
    id: uuid::Uuid,
    expected_version: i64,
    body: F,
) -> Result<T, PipelineError>
where
    F: for<'t> FnOnce(
        &'t mut sqlx::Transaction<'static, sqlx::Postgres>,
    ) -> futures::future::BoxFuture<'t, Result<T, PipelineError>>,
{
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| PipelineError::internal(format!("failed to begin transaction: {}", e)))?;

    let query = format!("SELECT version FROM {} WHERE id = $1 FOR UPDATE", table);
    let row = sqlx::query(&query)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PipelineError::internal(format!("optimistic lock read failed: {}", e)))?;

    let current: i64 = row
        .ok_or_else(|| PipelineError::internal(format!("row {} not found in {}", id, table)))?
        .get("version");
    if current != expected_version {
        return Err(PipelineError::internal(format!(
            "OPTIMISTIC_LOCK: {} row {} is at version {}, expected {}",
            table, id, current, expected_version
        )));
    }

    let value = body(&mut tx).await?;

    let bump = format!("UPDATE {} SET version = version + 1 WHERE id = $1", table);
    sqlx::query(&bump)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| PipelineError::internal(format!("version bump failed: {}", e)))?;

    tx.commit()
        .await
        .map_err(|e| PipelineError::internal(format!("commit failed: {}", e)))?;
    Ok(value)
}
