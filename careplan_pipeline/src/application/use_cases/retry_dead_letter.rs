// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dead-Letter Retry Use Case
//!
//! Operator-driven recovery: decrypt a dead-lettered payload, re-enqueue it
//! under a retry-suffixed job id (the original id's dedup marker may still
//! be live), and mark the entry RETRIED.

use std::sync::Arc;
use uuid::Uuid;

use careplan_pipeline_domain::entities::{DeadLetterResolution, JobType};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::repositories::DeadLetterRepository;
use careplan_pipeline_domain::services::{EncryptionService, JobEnvelope, JobQueueService, QueueName};

pub struct RetryDeadLetter {
    dead_letters: Arc<dyn DeadLetterRepository>,
    queue: Arc<dyn JobQueueService>,
    encryption: Arc<dyn EncryptionService>,
}

impl RetryDeadLetter {
    pub fn new(
        dead_letters: Arc<dyn DeadLetterRepository>,
        queue: Arc<dyn JobQueueService>,
        encryption: Arc<dyn EncryptionService>,
    ) -> Self {
        Self {
            dead_letters,
            queue,
            encryption,
        }
    }

    /// Returns `false` when the entry is unknown or already resolved.
    pub async fn execute(&self, entry_id: Uuid) -> Result<bool, PipelineError> {
        let Some(sealed) = self.dead_letters.payload_for_retry(entry_id).await? else {
            return Ok(false);
        };
        let plaintext = self.encryption.decrypt(&sealed)?;
        let original: JobEnvelope = serde_json::from_slice(&plaintext)?;

        let queue_name = match original.job_type {
            JobType::GeneratePlan => QueueName::Generation,
            JobType::ImportPdf => QueueName::PdfImport,
        };
        // Fresh job id: the original's dedup marker may still be live.
        let retry_envelope = JobEnvelope::new(
            format!("{}:retry:{}", original.job_id, Uuid::new_v4().simple()),
            original.job_type,
            original.payload.clone(),
            original.attempts_allowed,
        );
        self.queue.enqueue(queue_name, retry_envelope).await?;

        self.dead_letters.resolve(entry_id, DeadLetterResolution::Retried).await
    }
}
