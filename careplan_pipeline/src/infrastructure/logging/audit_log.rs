// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Tracing Audit Sink
//!
//! Default implementation of the audit collaborator: every entry is
//! serialized onto the `audit` tracing target, where the host's subscriber
//! routes it to durable storage. Entries reach this sink already PHI-safe
//! (field names and sizes only), so the sink does no further filtering.

use async_trait::async_trait;

use careplan_pipeline_domain::services::{
    AuditService, DataSharingEntry, JobAuditEntry, MlServiceCallEntry, PhiAccessEntry,
};

#[derive(Default)]
pub struct TracingAuditService;

fn render<T: serde::Serialize>(entry: &T) -> String {
    serde_json::to_string(entry).unwrap_or_else(|_| "<unserializable audit entry>".to_string())
}

#[async_trait]
impl AuditService for TracingAuditService {
    async fn log_phi_access(&self, entry: PhiAccessEntry) {
        tracing::info!(target: "audit", kind = "phi_access", entry = %render(&entry));
    }

    async fn log_ml_service_call(&self, entry: MlServiceCallEntry) {
        tracing::info!(target: "audit", kind = "ml_service_call", entry = %render(&entry));
    }

    async fn log_data_sharing(&self, entry: DataSharingEntry) {
        tracing::info!(target: "audit", kind = "data_sharing", entry = %render(&entry));
    }

    async fn log_job(&self, entry: JobAuditEntry) {
        tracing::info!(target: "audit", kind = "job", entry = %render(&entry));
    }
}
