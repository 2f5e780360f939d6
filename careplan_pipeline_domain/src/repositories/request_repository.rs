// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Request Repository Port
//!
//! Persistence abstraction over the `pipeline_requests` table. The
//! repository owns status transitions (PENDING → IN_PROGRESS stamps
//! `started_at`; COMPLETED/FAILED stamp `completed_at`) and the decrypt
//! operations; callers never touch ciphertext directly.

use async_trait::async_trait;
use std::time::Duration;

use crate::entities::pipeline_input::PipelineInput;
use crate::entities::pipeline_output::PipelineOutput;
use crate::entities::pipeline_request::{PipelineRequestRecord, RequestError, RequestStats, RequestStatus};
use crate::error::PipelineError;
use crate::value_objects::request_id::RequestId;

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn create(&self, record: &PipelineRequestRecord) -> Result<(), PipelineError>;

    /// Transitions status; PENDING → IN_PROGRESS stamps `started_at`.
    /// `completed_stages`, when given, replaces the stored list.
    async fn update_status(
        &self,
        id: RequestId,
        status: RequestStatus,
        completed_stages: Option<&[String]>,
    ) -> Result<(), PipelineError>;

    /// Terminal success: stores the encrypted result, degraded services,
    /// and stamps `completed_at`.
    async fn complete(
        &self,
        id: RequestId,
        result_encrypted: Vec<u8>,
        degraded_services: &[String],
        completed_stages: &[String],
    ) -> Result<(), PipelineError>;

    /// Terminal failure: stores the sanitized error and stamps
    /// `completed_at`.
    async fn fail(&self, id: RequestId, error: &RequestError) -> Result<(), PipelineError>;

    async fn get_by_id(&self, id: RequestId) -> Result<Option<PipelineRequestRecord>, PipelineError>;

    async fn get_by_visit_id(&self, visit_id: &str) -> Result<Vec<PipelineRequestRecord>, PipelineError>;

    /// PENDING and IN_PROGRESS records for a visit.
    async fn get_active_by_visit_id(&self, visit_id: &str) -> Result<Vec<PipelineRequestRecord>, PipelineError>;

    async fn get_by_user_id(&self, user_id: &str, limit: u32) -> Result<Vec<PipelineRequestRecord>, PipelineError>;

    /// Decrypts the stored input blob.
    async fn get_decrypted_input(&self, id: RequestId) -> Result<Option<PipelineInput>, PipelineError>;

    /// Decrypts the stored result blob, if the request completed.
    async fn get_decrypted_result(&self, id: RequestId) -> Result<Option<PipelineOutput>, PipelineError>;

    /// Marks non-terminal records older than `max_age` as EXPIRED. Returns
    /// the number of records swept.
    async fn expire_stale(&self, max_age: Duration) -> Result<u64, PipelineError>;

    /// Hard-deletes terminal records older than `max_age`.
    async fn clean_old(&self, max_age: Duration) -> Result<u64, PipelineError>;

    /// 24-hour rolling counters and average completed duration.
    async fn stats(&self) -> Result<RequestStats, PipelineError>;
}
