// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! A single error carrier for the whole pipeline. Instead of a hierarchy of
//! error subclasses, every failure is a [`PipelineError`] holding a
//! [`ErrorCategory`], the [`ErrorSeverity`] derived from it, and the context
//! the orchestrator needs to pick a recovery action: the stage that failed,
//! the correlation id, the retry count so far, and whether a fallback was
//! already used.
//!
//! ## Categories and severities
//!
//! | Category | Severity |
//! |---|---|
//! | `VALIDATION_FAILED` | FATAL |
//! | `AUTHENTICATION_FAILED`, `AUTHORIZATION_FAILED` | FATAL |
//! | `INTERNAL_ERROR` | FATAL |
//! | `EXTRACTION_FAILED`, `EMBEDDING_FAILED` | DEGRADED |
//! | `RECOMMENDATION_FAILED`, `DRAFT_GENERATION_FAILED` | DEGRADED |
//! | `SERVICE_UNAVAILABLE`, `TIMEOUT`, `RATE_LIMITED` | RECOVERABLE |
//!
//! Only RECOVERABLE categories are retryable; FATAL aborts the pipeline
//! unconditionally.
//!
//! ## PHI safety
//!
//! Every constructor routes the message through the
//! [PHI scrubber](super::phi_scrubber), so a `PipelineError` can be logged,
//! persisted, or returned to a caller without further sanitization. Messages
//! are truncated at 500 characters.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::phi_scrubber::scrub_message;
use crate::entities::pipeline_stage::PipelineStage;
use crate::value_objects::correlation_id::CorrelationId;

/// Failure taxonomy. Serialized form matches the wire categories
/// (`VALIDATION_FAILED`, `TIMEOUT`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ValidationFailed,
    ExtractionFailed,
    EmbeddingFailed,
    RecommendationFailed,
    DraftGenerationFailed,
    ServiceUnavailable,
    AuthenticationFailed,
    AuthorizationFailed,
    RateLimited,
    Timeout,
    InternalError,
}

impl ErrorCategory {
    /// The severity this category maps to.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::ValidationFailed
            | ErrorCategory::AuthenticationFailed
            | ErrorCategory::AuthorizationFailed
            | ErrorCategory::InternalError => ErrorSeverity::Fatal,
            ErrorCategory::ExtractionFailed
            | ErrorCategory::EmbeddingFailed
            | ErrorCategory::RecommendationFailed
            | ErrorCategory::DraftGenerationFailed => ErrorSeverity::Degraded,
            ErrorCategory::ServiceUnavailable | ErrorCategory::RateLimited | ErrorCategory::Timeout => {
                ErrorSeverity::Recoverable
            }
        }
    }

    /// True for categories worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ServiceUnavailable | ErrorCategory::Timeout | ErrorCategory::RateLimited
        )
    }

    /// The sanitized machine-readable code surfaced to callers on failure.
    pub fn public_code(&self) -> &'static str {
        match self {
            ErrorCategory::ValidationFailed => "VALIDATION_ERROR",
            ErrorCategory::AuthenticationFailed | ErrorCategory::AuthorizationFailed => "AUTH_ERROR",
            ErrorCategory::ServiceUnavailable | ErrorCategory::RateLimited | ErrorCategory::Timeout => {
                "SERVICE_UNAVAILABLE"
            }
            _ => "PIPELINE_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::ValidationFailed => "VALIDATION_FAILED",
            ErrorCategory::ExtractionFailed => "EXTRACTION_FAILED",
            ErrorCategory::EmbeddingFailed => "EMBEDDING_FAILED",
            ErrorCategory::RecommendationFailed => "RECOMMENDATION_FAILED",
            ErrorCategory::DraftGenerationFailed => "DRAFT_GENERATION_FAILED",
            ErrorCategory::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCategory::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCategory::AuthorizationFailed => "AUTHORIZATION_FAILED",
            ErrorCategory::RateLimited => "RATE_LIMITED",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

/// How bad a failure is for the request as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    /// Abort the pipeline; surface the failure to the caller.
    Fatal,
    /// Continue with reduced output; mark the service degraded.
    Degraded,
    /// Transient; eligible for retry before any other action.
    Recoverable,
}

/// The single error carrier used across the pipeline.
///
/// Construct through the per-category helpers (`PipelineError::validation`,
/// `PipelineError::timeout`, …) so the PHI scrubber always runs. Context is
/// attached with the `with_*` builders:
///
/// ```
/// use careplan_pipeline_domain::error::PipelineError;
/// use careplan_pipeline_domain::entities::pipeline_stage::PipelineStage;
///
/// let err = PipelineError::service_unavailable("audio service returned 503")
///     .with_stage(PipelineStage::EntityExtraction)
///     .with_retry_count(2);
/// assert!(err.is_retryable());
/// ```
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{category}: {message}")]
pub struct PipelineError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stage: Option<PipelineStage>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<CorrelationId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub fallback_used: bool,
    pub message: String,
}

impl PipelineError {
    /// Creates an error in `category` with a scrubbed message.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            severity: category.severity(),
            stage: None,
            correlation_id: None,
            retry_count: None,
            fallback_used: false,
            message: scrub_message(&message.into()),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ValidationFailed, msg)
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ExtractionFailed, msg)
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::EmbeddingFailed, msg)
    }

    pub fn recommendation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RecommendationFailed, msg)
    }

    pub fn draft_generation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::DraftGenerationFailed, msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ServiceUnavailable, msg)
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::AuthenticationFailed, msg)
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::AuthorizationFailed, msg)
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RateLimited, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InternalError, msg)
    }

    /// Attaches the stage that produced this error.
    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Attaches the correlation id for tracing.
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Records how many retries were already spent on this failure.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Marks that a fallback path already ran for this failure.
    pub fn with_fallback_used(mut self) -> Self {
        self.fallback_used = true;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }

    /// Machine-readable code for the caller-facing failure surface.
    pub fn public_code(&self) -> &'static str {
        self.category.public_code()
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::internal(format!("serialization failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(ErrorCategory::ValidationFailed.severity(), ErrorSeverity::Fatal);
        assert_eq!(ErrorCategory::ExtractionFailed.severity(), ErrorSeverity::Degraded);
        assert_eq!(ErrorCategory::Timeout.severity(), ErrorSeverity::Recoverable);
    }

    #[test]
    fn test_retryable_categories() {
        assert!(PipelineError::service_unavailable("503").is_retryable());
        assert!(PipelineError::timeout("deadline").is_retryable());
        assert!(PipelineError::rate_limited("429").is_retryable());
        assert!(!PipelineError::validation("bad input").is_retryable());
        assert!(!PipelineError::extraction("parse").is_retryable());
    }

    #[test]
    fn test_public_codes() {
        assert_eq!(PipelineError::validation("x").public_code(), "VALIDATION_ERROR");
        assert_eq!(PipelineError::authentication("x").public_code(), "AUTH_ERROR");
        assert_eq!(PipelineError::timeout("x").public_code(), "SERVICE_UNAVAILABLE");
        assert_eq!(PipelineError::internal("x").public_code(), "PIPELINE_ERROR");
    }

    #[test]
    fn test_constructor_scrubs_phi() {
        let err = PipelineError::extraction("transcript for Jane Doe (555-123-4567) failed");
        assert!(!err.message.contains("Jane Doe"));
        assert!(!err.message.contains("555-123-4567"));
    }

    #[test]
    fn test_display_includes_category() {
        let err = PipelineError::timeout("stage deadline elapsed");
        assert_eq!(err.to_string(), "TIMEOUT: stage deadline elapsed");
    }

    #[test]
    fn test_serde_round_trip() {
        let err = PipelineError::recommendation("recommender 500").with_retry_count(3);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["category"], "RECOMMENDATION_FAILED");
        let back: PipelineError = serde_json::from_value(json).unwrap();
        assert_eq!(back.category, err.category);
        assert_eq!(back.retry_count, Some(3));
    }
}
