// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dead-Letter Entries
//!
//! Durable records of jobs that exhausted their retry budget, awaiting
//! operator resolution. The payload stays encrypted with the pipeline key;
//! error messages are already PHI-scrubbed by the error carrier before they
//! reach the queue layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Job kinds handled by the worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    GeneratePlan,
    ImportPdf,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::GeneratePlan => "GENERATE_PLAN",
            JobType::ImportPdf => "IMPORT_PDF",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        match s {
            "GENERATE_PLAN" => Ok(JobType::GeneratePlan),
            "IMPORT_PDF" => Ok(JobType::ImportPdf),
            other => Err(PipelineError::internal(format!("unknown job type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterResolution {
    Retried,
    Discarded,
    Manual,
}

impl DeadLetterResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterResolution::Retried => "RETRIED",
            DeadLetterResolution::Discarded => "DISCARDED",
            DeadLetterResolution::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        match s {
            "RETRIED" => Ok(DeadLetterResolution::Retried),
            "DISCARDED" => Ok(DeadLetterResolution::Discarded),
            "MANUAL" => Ok(DeadLetterResolution::Manual),
            other => Err(PipelineError::internal(format!("unknown resolution: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub job_type: JobType,
    pub job_id: String,
    pub payload_encrypted: Vec<u8>,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<DeadLetterResolution>,
}

impl DeadLetterEntry {
    /// A fresh unresolved entry for a job that exhausted its attempts.
    pub fn unresolved(
        job_type: JobType,
        job_id: impl Into<String>,
        payload_encrypted: Vec<u8>,
        error_message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            job_id: job_id.into(),
            payload_encrypted,
            error_message: error_message.into(),
            error_stack: None,
            attempts,
            first_failed_at: now,
            last_failed_at: now,
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_entry_is_unresolved() {
        let entry = DeadLetterEntry::unresolved(JobType::ImportPdf, "job-1", vec![1], "file not found", 2);
        assert!(!entry.is_resolved());
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.job_type.as_str(), "IMPORT_PDF");
    }

    #[test]
    fn test_parse_round_trips() {
        for jt in [JobType::GeneratePlan, JobType::ImportPdf] {
            assert_eq!(JobType::parse(jt.as_str()).unwrap(), jt);
        }
        for res in [
            DeadLetterResolution::Retried,
            DeadLetterResolution::Discarded,
            DeadLetterResolution::Manual,
        ] {
            assert_eq!(DeadLetterResolution::parse(res.as_str()).unwrap(), res);
        }
    }
}
