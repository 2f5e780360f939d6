// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Cache Port
//!
//! Two logical namespaces, both keyed on SHA-256 hashes:
//!
//! - **Extraction** (PHI): keyed on the transcript hash; values are
//!   encrypted at rest; TTL capped at one hour regardless of configuration.
//! - **Recommendations** (non-PHI): keyed on sorted condition codes plus a
//!   demographic segment; plaintext values; configurable TTL.
//!
//! Every operation emits a cache audit record. Key material in audit output
//! is the 16-hex-character truncation of the key hash: enough to correlate,
//! never enough to reverse.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::clinical_entity::ExtractedEntities;
use crate::entities::recommendation::TemplateRecommendation;
use crate::error::PipelineError;
use crate::services::ml_client::Demographics;
use crate::value_objects::condition_code::ConditionCode;
use crate::value_objects::correlation_id::CorrelationId;

/// Hard upper bound on the PHI (extraction) namespace TTL.
pub const PHI_MAX_TTL_SECS: u64 = 3600;

/// Correlation context threaded into cache audit records.
#[derive(Debug, Clone, Copy)]
pub struct CacheContext {
    pub correlation_id: CorrelationId,
}

/// Audit record emitted for every cache operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheAuditRecord {
    pub operation: String,
    /// First 16 hex chars of the key hash.
    pub key_hash: String,
    pub success: bool,
    pub contains_phi: bool,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
}

/// Running counters surfaced by `stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub extraction_hits: u64,
    pub extraction_misses: u64,
    pub recommendation_hits: u64,
    pub recommendation_misses: u64,
    pub early_refreshes: u64,
    pub invalidations: u64,
    pub errors: u64,
}

#[async_trait]
pub trait PipelineCacheService: Send + Sync {
    async fn get_extraction(
        &self,
        transcript: &str,
        ctx: &CacheContext,
    ) -> Result<Option<ExtractedEntities>, PipelineError>;

    async fn set_extraction(
        &self,
        transcript: &str,
        entities: &ExtractedEntities,
        ctx: &CacheContext,
    ) -> Result<(), PipelineError>;

    async fn get_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        ctx: &CacheContext,
    ) -> Result<Option<Vec<TemplateRecommendation>>, PipelineError>;

    async fn set_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        recommendations: &[TemplateRecommendation],
        ctx: &CacheContext,
    ) -> Result<(), PipelineError>;

    async fn invalidate_extraction(&self, transcript: &str, ctx: &CacheContext) -> Result<(), PipelineError>;

    async fn invalidate_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        ctx: &CacheContext,
    ) -> Result<(), PipelineError>;

    /// Clears the whole extraction namespace. Used on key rotation.
    async fn invalidate_all_phi(&self) -> Result<u64, PipelineError>;

    async fn stats(&self) -> CacheStats;
}
