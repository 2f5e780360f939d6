// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Job Queue Port
//!
//! At-least-once FIFO with named queues. The queue layer deduplicates on
//! `job_id` (set to the request id), encrypts payloads at rest, and delivers
//! each job to exactly one claimer at a time; redelivery after a crash is
//! possible and handlers must be idempotent.
//!
//! Retry scheduling (`retry_later`) is the queue's concern; converting an
//! exhausted job into a dead-letter entry is the worker's.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::entities::dead_letter::JobType;
use crate::entities::pipeline_input::PipelineInput;
use crate::error::PipelineError;
use crate::value_objects::request_id::RequestId;

/// The two worker queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Generation,
    PdfImport,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Generation => "generation",
            QueueName::PdfImport => "pdf-import",
        }
    }
}

/// A job as submitted. `job_id` doubles as the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub job_id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub attempts_allowed: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(job_id: impl Into<String>, job_type: JobType, payload: serde_json::Value, attempts_allowed: u32) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            payload,
            attempts_allowed,
            enqueued_at: Utc::now(),
        }
    }
}

/// A claimed delivery. `attempt` starts at 1.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub envelope: JobEnvelope,
    pub attempt: u32,
    /// Queue-internal delivery handle used for ack.
    pub delivery_tag: String,
}

#[async_trait]
pub trait JobQueueService: Send + Sync {
    /// Enqueues unless a job with the same id is already known. Returns
    /// `false` on a dedup hit.
    async fn enqueue(&self, queue: QueueName, envelope: JobEnvelope) -> Result<bool, PipelineError>;

    /// Claims the next ready job, blocking up to `wait` before returning
    /// `None`.
    async fn claim(&self, queue: QueueName, consumer: &str, wait: Duration) -> Result<Option<ClaimedJob>, PipelineError>;

    /// Acknowledges a finished delivery (success or terminal failure).
    async fn ack(&self, queue: QueueName, job: &ClaimedJob) -> Result<(), PipelineError>;

    /// Schedules a redelivery after `delay`, incrementing the attempt
    /// counter. The current delivery is acknowledged.
    async fn retry_later(&self, queue: QueueName, job: &ClaimedJob, delay: Duration) -> Result<(), PipelineError>;

    /// Ready + delayed jobs currently in the queue.
    async fn depth(&self, queue: QueueName) -> Result<u64, PipelineError>;

    /// Claims one delivery abandoned by a dead consumer, if the backend
    /// tracks pending deliveries. Default: nothing to reclaim.
    async fn reclaim_stale(&self, _queue: QueueName, _consumer: &str) -> Result<Option<ClaimedJob>, PipelineError> {
        Ok(None)
    }
}

/// Payload of a `GENERATE_PLAN` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJobPayload {
    pub request_id: RequestId,
    pub input: PipelineInput,
}

/// Payload of an `IMPORT_PDF` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfImportJobPayload {
    pub request_id: RequestId,
    pub file_key: String,
}
