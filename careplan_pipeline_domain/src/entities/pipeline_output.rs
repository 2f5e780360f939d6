// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Output
//!
//! The result surfaced to callers. Degradation is machine-readable: every
//! bypassed or failed service lands in `degraded_services`, and
//! `requires_manual_review` aggregates the review triggers (a CRITICAL red
//! flag, a degraded extraction service, a low-confidence draft, or two or
//! more HIGH red flags).

use serde::{Deserialize, Serialize};

use super::care_plan_draft::CarePlanDraft;
use super::clinical_entity::ExtractedEntities;
use super::pipeline_stage::{MlService, StageResult};
use super::recommendation::TemplateRecommendation;
use super::red_flag::{RedFlag, RedFlagSeverity};
use crate::value_objects::request_id::RequestId;

/// Draft confidence below this triggers manual review of the whole request
/// (distinct from the draft's own review threshold).
pub const MANUAL_REVIEW_DRAFT_CONFIDENCE: f64 = 0.5;

/// Number of HIGH red flags that triggers manual review.
pub const MANUAL_REVIEW_HIGH_FLAG_COUNT: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetadata {
    pub stage_results: Vec<StageResult>,
    pub total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutput {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extracted_entities: Option<ExtractedEntities>,
    pub recommendations: Vec<TemplateRecommendation>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub draft_care_plan: Option<CarePlanDraft>,
    pub red_flags: Vec<RedFlag>,
    pub processing_metadata: ProcessingMetadata,
    pub degraded_services: Vec<MlService>,
    pub requires_manual_review: bool,
}

impl PipelineOutput {
    /// Evaluates the manual-review rule against the assembled output parts.
    pub fn manual_review_required(
        red_flags: &[RedFlag],
        degraded_services: &[MlService],
        draft: Option<&CarePlanDraft>,
    ) -> bool {
        let critical = red_flags.iter().any(|f| f.severity == RedFlagSeverity::Critical);
        let high_count = red_flags
            .iter()
            .filter(|f| f.severity == RedFlagSeverity::High)
            .count();
        let extraction_degraded = degraded_services.contains(&MlService::AudioIntelligence);
        let shaky_draft = draft.is_some_and(|d| d.confidence < MANUAL_REVIEW_DRAFT_CONFIDENCE);

        critical || extraction_degraded || shaky_draft || high_count >= MANUAL_REVIEW_HIGH_FLAG_COUNT
    }
}
