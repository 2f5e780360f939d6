// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Audit Collaborator Port
//!
//! The audit trail is consumed, not implemented, by this crate: the pipeline
//! populates typed entries and hands them to the collaborator. Entries carry
//! PHI field *names* and payload sizes, never values; the data minimizer
//! and PHI scrubber guarantee that upstream.
//!
//! Audit delivery is fire-and-forget: a failing audit sink must not fail a
//! patient-facing request, so the port returns `()` and implementations
//! swallow (and log) their own errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::pipeline_stage::MlService;
use crate::value_objects::correlation_id::CorrelationId;
use crate::value_objects::request_id::RequestId;

/// Recorded whenever PHI-bearing input enters processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhiAccessEntry {
    pub action: String,
    pub request_id: RequestId,
    pub correlation_id: CorrelationId,
    pub user_id: String,
    /// Names of the PHI fields present in the input. Names only.
    pub phi_fields: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Recorded for every outbound ML service call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlServiceCallEntry {
    pub service: MlService,
    pub operation: String,
    pub duration_ms: u64,
    pub success: bool,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
}

/// Recorded when a minimized payload is shared with a downstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSharingEntry {
    pub service: MlService,
    /// Sorted field names of the shared payload.
    pub field_names: Vec<String>,
    pub payload_bytes: usize,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
}

/// Recorded at job lifecycle boundaries in the worker pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAuditEntry {
    pub job_id: String,
    pub job_type: String,
    pub event: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait AuditService: Send + Sync {
    async fn log_phi_access(&self, entry: PhiAccessEntry);
    async fn log_ml_service_call(&self, entry: MlServiceCallEntry);
    async fn log_data_sharing(&self, entry: DataSharingEntry);
    async fn log_job(&self, entry: JobAuditEntry);
}
