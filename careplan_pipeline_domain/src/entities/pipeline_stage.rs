// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Stage Model
//!
//! The processing DAG is fixed: six stages, each tagged with the external
//! service it calls (if any) and a criticality class that decides what a
//! failure does to the request as a whole.
//!
//! ```text
//! VALIDATION (local, CRITICAL)
//!  → ENTITY_EXTRACTION (audio-intelligence, IMPORTANT, iff transcript present)
//!  → EMBEDDING_GENERATION (rag-embeddings, NICE_TO_HAVE, parallel-eligible)
//!  → TEMPLATE_RECOMMENDATION (careplan-recommender, IMPORTANT)
//!  → DRAFT_GENERATION (careplan-recommender, IMPORTANT, iff drafting requested)
//!  → SAFETY_VALIDATION (local, CRITICAL)
//! ```
//!
//! Stage state transitions are `PENDING → IN_PROGRESS → (COMPLETED | SKIPPED
//! | FAILED)`; terminal states are absorbing within a request. Each executed
//! stage leaves a [`StageResult`] in the processing metadata.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::error::PipelineError;

/// The six stages of the care-plan pipeline, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Validation,
    EntityExtraction,
    EmbeddingGeneration,
    TemplateRecommendation,
    DraftGeneration,
    SafetyValidation,
}

impl PipelineStage {
    /// All stages in execution order.
    pub fn all() -> [PipelineStage; 6] {
        [
            PipelineStage::Validation,
            PipelineStage::EntityExtraction,
            PipelineStage::EmbeddingGeneration,
            PipelineStage::TemplateRecommendation,
            PipelineStage::DraftGeneration,
            PipelineStage::SafetyValidation,
        ]
    }

    /// The ML service this stage calls, if any. Validation and safety
    /// validation run locally.
    pub fn service(&self) -> Option<MlService> {
        match self {
            PipelineStage::Validation | PipelineStage::SafetyValidation => None,
            PipelineStage::EntityExtraction => Some(MlService::AudioIntelligence),
            PipelineStage::EmbeddingGeneration => Some(MlService::RagEmbeddings),
            PipelineStage::TemplateRecommendation | PipelineStage::DraftGeneration => {
                Some(MlService::CareplanRecommender)
            }
        }
    }

    /// Failure of a CRITICAL stage aborts the whole request.
    pub fn criticality(&self) -> ServiceCriticality {
        match self {
            PipelineStage::Validation | PipelineStage::SafetyValidation => ServiceCriticality::Critical,
            PipelineStage::EntityExtraction
            | PipelineStage::TemplateRecommendation
            | PipelineStage::DraftGeneration => ServiceCriticality::Important,
            PipelineStage::EmbeddingGeneration => ServiceCriticality::NiceToHave,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Validation => "VALIDATION",
            PipelineStage::EntityExtraction => "ENTITY_EXTRACTION",
            PipelineStage::EmbeddingGeneration => "EMBEDDING_GENERATION",
            PipelineStage::TemplateRecommendation => "TEMPLATE_RECOMMENDATION",
            PipelineStage::DraftGeneration => "DRAFT_GENERATION",
            PipelineStage::SafetyValidation => "SAFETY_VALIDATION",
        }
    }
}

impl Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineStage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VALIDATION" => Ok(PipelineStage::Validation),
            "ENTITY_EXTRACTION" => Ok(PipelineStage::EntityExtraction),
            "EMBEDDING_GENERATION" => Ok(PipelineStage::EmbeddingGeneration),
            "TEMPLATE_RECOMMENDATION" => Ok(PipelineStage::TemplateRecommendation),
            "DRAFT_GENERATION" => Ok(PipelineStage::DraftGeneration),
            "SAFETY_VALIDATION" => Ok(PipelineStage::SafetyValidation),
            other => Err(PipelineError::validation(format!("unknown pipeline stage: {}", other))),
        }
    }
}

/// External ML collaborators, identified by their wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MlService {
    #[serde(rename = "audio-intelligence")]
    AudioIntelligence,
    #[serde(rename = "careplan-recommender")]
    CareplanRecommender,
    #[serde(rename = "rag-embeddings")]
    RagEmbeddings,
    #[serde(rename = "pdf-parser")]
    PdfParser,
}

impl MlService {
    pub fn all() -> [MlService; 4] {
        [
            MlService::AudioIntelligence,
            MlService::CareplanRecommender,
            MlService::RagEmbeddings,
            MlService::PdfParser,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MlService::AudioIntelligence => "audio-intelligence",
            MlService::CareplanRecommender => "careplan-recommender",
            MlService::RagEmbeddings => "rag-embeddings",
            MlService::PdfParser => "pdf-parser",
        }
    }

    /// Service-level criticality, independent of any particular stage.
    pub fn criticality(&self) -> ServiceCriticality {
        match self {
            MlService::AudioIntelligence | MlService::CareplanRecommender => ServiceCriticality::Important,
            MlService::RagEmbeddings | MlService::PdfParser => ServiceCriticality::NiceToHave,
        }
    }
}

impl Display for MlService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a failure matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceCriticality {
    /// Failure aborts the pipeline.
    Critical,
    /// Failure degrades the output but the request completes.
    Important,
    /// Failure is absorbed silently beyond a degraded-service marker.
    NiceToHave,
}

/// Per-stage execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped | StageStatus::Failed)
    }
}

/// Outcome of one stage within one request, recorded in the processing
/// metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache_hit: Option<bool>,
}

impl StageResult {
    pub fn completed(stage: PipelineStage, duration_ms: u64) -> Self {
        Self {
            stage,
            status: StageStatus::Completed,
            duration_ms,
            error: None,
            cache_hit: None,
        }
    }

    pub fn skipped(stage: PipelineStage) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            duration_ms: 0,
            error: None,
            cache_hit: None,
        }
    }

    pub fn failed(stage: PipelineStage, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            duration_ms,
            error: Some(error.into()),
            cache_hit: None,
        }
    }

    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = Some(hit);
        self
    }
}
