// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Submit Request Use Case
//!
//! Acceptance of a client request: validate, run the idempotency guard,
//! then persist-and-enqueue as a saga so a half-accepted request cannot
//! leak. The two steps (create the tracker record, enqueue the job) are
//! compensable: if the enqueue fails, the record is failed rather than left
//! PENDING forever.
//!
//! Replays short-circuit here: a COMPLETED key returns the cached response
//! without touching the queue, a FAILED key returns the cached error, and
//! an in-flight key reports `REQUEST_IN_PROGRESS`.

use std::sync::Arc;

use async_trait::async_trait;
use careplan_pipeline_domain::entities::{IdempotencyOutcome, JobType, PipelineInput, PipelineRequestRecord, RequestError};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::repositories::{IdempotencyRepository, RequestRepository};
use careplan_pipeline_domain::services::{EncryptionService, GenerationJobPayload, JobEnvelope, JobQueueService, QueueName};
use careplan_pipeline_domain::value_objects::RequestId;

use crate::infrastructure::runtime::saga::{Saga, SagaContext, SagaStep};

/// What acceptance produced.
#[derive(Debug)]
pub enum SubmissionOutcome {
    /// The request was accepted and enqueued.
    Accepted { request_id: RequestId },
    /// The key already completed; the cached response is returned as-is.
    Replayed(serde_json::Value),
    /// The key already failed; the cached error is returned as-is.
    ReplayedFailure(serde_json::Value),
    /// Another execution of this key is in flight.
    InProgress,
}

pub struct SubmitPipelineRequest {
    requests: Arc<dyn RequestRepository>,
    idempotency: Arc<dyn IdempotencyRepository>,
    queue: Arc<dyn JobQueueService>,
    encryption: Arc<dyn EncryptionService>,
    job_attempts: u32,
}

impl SubmitPipelineRequest {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        idempotency: Arc<dyn IdempotencyRepository>,
        queue: Arc<dyn JobQueueService>,
        encryption: Arc<dyn EncryptionService>,
        job_attempts: u32,
    ) -> Self {
        Self {
            requests,
            idempotency,
            queue,
            encryption,
            job_attempts,
        }
    }

    pub async fn execute(&self, input: PipelineInput) -> Result<SubmissionOutcome, PipelineError> {
        input.validate()?;
        let request_id = RequestId::new();

        match self
            .idempotency
            .check_or_create(&input.idempotency_key, &input.canonical_hash(), request_id)
            .await?
        {
            IdempotencyOutcome::Completed(cached) => return Ok(SubmissionOutcome::Replayed(cached)),
            IdempotencyOutcome::Failed(cached) => return Ok(SubmissionOutcome::ReplayedFailure(cached)),
            IdempotencyOutcome::Pending(owner) if owner != request_id => {
                return Ok(SubmissionOutcome::InProgress)
            }
            IdempotencyOutcome::New | IdempotencyOutcome::Pending(_) => {}
        }

        let saga = Saga::new("submit-pipeline-request")
            .step(Box::new(CreateRecordStep {
                requests: Arc::clone(&self.requests),
                encryption: Arc::clone(&self.encryption),
                request_id,
                input: input.clone(),
            }))
            .step(Box::new(EnqueueStep {
                queue: Arc::clone(&self.queue),
                request_id,
                input: input.clone(),
                attempts: self.job_attempts,
            }));

        let mut ctx = SagaContext::new(input.correlation_id);
        match saga.run(&mut ctx).await {
            Ok(_) => Ok(SubmissionOutcome::Accepted { request_id }),
            Err(failure) => {
                // The record (if created) was compensated; release the key
                // so the caller can retry.
                let payload = serde_json::to_value(&failure.error).unwrap_or(serde_json::Value::Null);
                let _ = self.idempotency.fail(&input.idempotency_key, request_id, &payload).await;
                Err(failure.error)
            }
        }
    }
}

struct CreateRecordStep {
    requests: Arc<dyn RequestRepository>,
    encryption: Arc<dyn EncryptionService>,
    request_id: RequestId,
    input: PipelineInput,
}

#[async_trait]
impl SagaStep for CreateRecordStep {
    fn name(&self) -> &str {
        "create-request-record"
    }

    async fn execute(&self, _ctx: &mut SagaContext) -> Result<serde_json::Value, PipelineError> {
        let sealed = self.encryption.encrypt(&serde_json::to_vec(&self.input)?)?;
        let record = PipelineRequestRecord::accepted(
            self.request_id,
            self.input.visit_id.clone(),
            self.input.patient_id.clone(),
            self.input.user_id.clone(),
            self.input.idempotency_key.clone(),
            sealed,
        );
        self.requests.create(&record).await?;
        Ok(serde_json::json!({ "requestId": self.request_id }))
    }

    async fn compensate(&self, _ctx: &mut SagaContext, _result: &serde_json::Value) -> Result<(), PipelineError> {
        // Terminalize the orphaned record so sweepers and readers never see
        // a PENDING request that no worker will pick up.
        self.requests
            .fail(
                self.request_id,
                &RequestError {
                    message: "submission rolled back before enqueue".to_string(),
                    code: "PIPELINE_ERROR".to_string(),
                },
            )
            .await
    }
}

struct EnqueueStep {
    queue: Arc<dyn JobQueueService>,
    request_id: RequestId,
    input: PipelineInput,
    attempts: u32,
}

#[async_trait]
impl SagaStep for EnqueueStep {
    fn name(&self) -> &str {
        "enqueue-generation-job"
    }

    async fn execute(&self, _ctx: &mut SagaContext) -> Result<serde_json::Value, PipelineError> {
        let payload = GenerationJobPayload {
            request_id: self.request_id,
            input: self.input.clone(),
        };
        let envelope = JobEnvelope::new(
            self.request_id.to_string(),
            JobType::GeneratePlan,
            serde_json::to_value(&payload)?,
            self.attempts,
        );
        let enqueued = self.queue.enqueue(QueueName::Generation, envelope).await?;
        Ok(serde_json::json!({ "enqueued": enqueued }))
    }

    async fn compensate(&self, _ctx: &mut SagaContext, _result: &serde_json::Value) -> Result<(), PipelineError> {
        // Nothing to undo: the job id dedup marker expires on its own and a
        // failed enqueue left no entry behind.
        Ok(())
    }
}
