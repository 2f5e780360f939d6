// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Recovery Policy
//!
//! Maps a classified failure to the action the orchestrator takes next.
//! The decision order is fixed:
//!
//! 1. FATAL severity → ABORT, unconditionally.
//! 2. Retryable category with retries remaining → RETRY.
//! 3. Otherwise the per-category (or per-stage, for exhausted transient
//!    errors) default:
//!
//! | Category | Action |
//! |---|---|
//! | `EXTRACTION_FAILED` | DEGRADE (empty entities + manual-review flag) |
//! | `EMBEDDING_FAILED` | SKIP (condition-only recommendation mode) |
//! | `RECOMMENDATION_FAILED` | USE_FALLBACK (code-prefix template table) |
//! | `DRAFT_GENERATION_FAILED` | SKIP (recommendations only) |
//!
//! Retry spacing is exponential: `base · 2^attempt`, capped.

use std::time::Duration;

use crate::entities::pipeline_stage::PipelineStage;
use crate::error::{ErrorCategory, PipelineError};

/// What the orchestrator does after a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Try the same call again after backoff.
    Retry,
    /// Substitute the stage's fallback generator output.
    UseFallback,
    /// Drop the stage's contribution and continue.
    Skip,
    /// Continue with an empty/default result and a degraded marker.
    Degrade,
    /// Fail the whole request.
    Abort,
}

/// Picks the recovery action for `error` at the given retry depth.
pub fn determine_recovery_action(error: &PipelineError, retry_count: u32, max_retries: u32) -> RecoveryAction {
    if error.is_fatal() {
        return RecoveryAction::Abort;
    }
    if error.is_retryable() && retry_count < max_retries {
        return RecoveryAction::Retry;
    }
    match error.category {
        ErrorCategory::ExtractionFailed => RecoveryAction::Degrade,
        ErrorCategory::EmbeddingFailed => RecoveryAction::Skip,
        ErrorCategory::RecommendationFailed => RecoveryAction::UseFallback,
        ErrorCategory::DraftGenerationFailed => RecoveryAction::Skip,
        // A transient error that exhausted its retries resolves to the
        // default action of the stage it happened in.
        ErrorCategory::ServiceUnavailable | ErrorCategory::Timeout | ErrorCategory::RateLimited => {
            match error.stage {
                Some(stage) => stage_default_action(stage),
                None => RecoveryAction::Degrade,
            }
        }
        _ => RecoveryAction::Abort,
    }
}

/// The action an exhausted transient failure resolves to, per stage.
pub fn stage_default_action(stage: PipelineStage) -> RecoveryAction {
    match stage {
        PipelineStage::Validation => RecoveryAction::Abort,
        PipelineStage::EntityExtraction => RecoveryAction::Degrade,
        PipelineStage::EmbeddingGeneration => RecoveryAction::Skip,
        PipelineStage::TemplateRecommendation => RecoveryAction::UseFallback,
        PipelineStage::DraftGeneration => RecoveryAction::Skip,
        // Safety validation is CRITICAL; its fallback is the conservative
        // "validation unavailable" flag, applied by the orchestrator.
        PipelineStage::SafetyValidation => RecoveryAction::UseFallback,
    }
}

/// Exponential backoff: `base · 2^attempt`, capped at `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(cap)
}
