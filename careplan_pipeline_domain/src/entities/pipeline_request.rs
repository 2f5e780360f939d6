// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Request Record
//!
//! The persisted state of one request. A record is created on acceptance,
//! moves `PENDING → IN_PROGRESS` on worker pickup, and transitions exactly
//! once to `COMPLETED`, `FAILED`, or `EXPIRED` (the last by the sweeper).
//!
//! Invariants enforced here and by the request tracker:
//!
//! - `COMPLETED` ⇒ encrypted result blob present
//! - `FAILED` ⇒ error present
//! - `EXPIRED` ⇒ no new worker may observe the record
//!
//! Input and result blobs are ciphertext; their plaintext is PHI and only
//! the tracker's decrypt operations may produce it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::value_objects::idempotency_key::IdempotencyKey;
use crate::value_objects::request_id::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "IN_PROGRESS" => Ok(RequestStatus::InProgress),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            "EXPIRED" => Ok(RequestStatus::Expired),
            other => Err(PipelineError::internal(format!("unknown request status: {}", other))),
        }
    }
}

/// Sanitized error payload stored on a FAILED record: public code plus
/// scrubbed message, nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestError {
    pub message: String,
    pub code: String,
}

impl From<&PipelineError> for RequestError {
    fn from(err: &PipelineError) -> Self {
        Self {
            message: err.message.clone(),
            code: err.public_code().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequestRecord {
    pub id: RequestId,
    pub visit_id: String,
    pub patient_id: String,
    pub user_id: String,
    pub idempotency_key: IdempotencyKey,
    pub status: RequestStatus,
    pub input_encrypted: Vec<u8>,
    pub result_encrypted: Option<Vec<u8>>,
    pub error: Option<RequestError>,
    pub stages_completed: Vec<String>,
    pub degraded_services: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PipelineRequestRecord {
    /// A fresh PENDING record for an accepted request.
    pub fn accepted(
        id: RequestId,
        visit_id: impl Into<String>,
        patient_id: impl Into<String>,
        user_id: impl Into<String>,
        idempotency_key: IdempotencyKey,
        input_encrypted: Vec<u8>,
    ) -> Self {
        Self {
            id,
            visit_id: visit_id.into(),
            patient_id: patient_id.into(),
            user_id: user_id.into(),
            idempotency_key,
            status: RequestStatus::Pending,
            input_encrypted,
            result_encrypted: None,
            error: None,
            stages_completed: Vec::new(),
            degraded_services: Vec::new(),
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Checks the status/blob invariants; used by tests and the tracker.
    pub fn check_invariants(&self) -> Result<(), PipelineError> {
        match self.status {
            RequestStatus::Completed if self.result_encrypted.is_none() => Err(PipelineError::internal(
                "COMPLETED request is missing its result blob",
            )),
            RequestStatus::Failed if self.error.is_none() => {
                Err(PipelineError::internal("FAILED request is missing its error"))
            }
            _ => Ok(()),
        }
    }
}

/// 24-hour rolling counters exposed by the request tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestStats {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
    pub avg_completed_duration_ms: Option<f64>,
}
