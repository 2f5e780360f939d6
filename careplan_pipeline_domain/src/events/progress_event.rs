// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Progress Events
//!
//! Stage-level progress messages published on the per-request channel. The
//! stream for one request always ends with a terminal event: `COMPLETE`
//! with status `COMPLETED`, or `ERROR` with status `FAILED`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::pipeline_stage::{PipelineStage, StageStatus};
use crate::value_objects::request_id::RequestId;

/// The stage axis of a progress event: one of the six pipeline stages, or
/// the two synthetic terminal markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStage {
    Validation,
    EntityExtraction,
    EmbeddingGeneration,
    TemplateRecommendation,
    DraftGeneration,
    SafetyValidation,
    Complete,
    Error,
}

impl From<PipelineStage> for ProgressStage {
    fn from(stage: PipelineStage) -> Self {
        match stage {
            PipelineStage::Validation => ProgressStage::Validation,
            PipelineStage::EntityExtraction => ProgressStage::EntityExtraction,
            PipelineStage::EmbeddingGeneration => ProgressStage::EmbeddingGeneration,
            PipelineStage::TemplateRecommendation => ProgressStage::TemplateRecommendation,
            PipelineStage::DraftGeneration => ProgressStage::DraftGeneration,
            PipelineStage::SafetyValidation => ProgressStage::SafetyValidation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub request_id: RequestId,
    pub stage: ProgressStage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partial_result: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn stage_started(request_id: RequestId, stage: PipelineStage) -> Self {
        Self::new(request_id, stage.into(), StageStatus::InProgress)
    }

    pub fn stage_completed(request_id: RequestId, stage: PipelineStage) -> Self {
        Self::new(request_id, stage.into(), StageStatus::Completed)
    }

    pub fn stage_skipped(request_id: RequestId, stage: PipelineStage) -> Self {
        Self::new(request_id, stage.into(), StageStatus::Skipped)
    }

    pub fn stage_failed(request_id: RequestId, stage: PipelineStage, message: impl Into<String>) -> Self {
        Self::new(request_id, stage.into(), StageStatus::Failed).with_message(message)
    }

    /// Terminal success marker.
    pub fn pipeline_completed(request_id: RequestId) -> Self {
        Self::new(request_id, ProgressStage::Complete, StageStatus::Completed)
    }

    /// Terminal failure marker.
    pub fn pipeline_failed(request_id: RequestId, message: impl Into<String>) -> Self {
        Self::new(request_id, ProgressStage::Error, StageStatus::Failed).with_message(message)
    }

    fn new(request_id: RequestId, stage: ProgressStage, status: StageStatus) -> Self {
        Self {
            request_id,
            stage,
            status,
            message: None,
            partial_result: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_partial_result(mut self, partial: serde_json::Value) -> Self {
        self.partial_result = Some(partial);
        self
    }

    /// True for the two events that end a subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(
            (self.stage, self.status),
            (ProgressStage::Complete, StageStatus::Completed) | (ProgressStage::Error, StageStatus::Failed)
        )
    }
}
