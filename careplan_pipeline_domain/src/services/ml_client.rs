// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # ML Client Ports
//!
//! Typed collaborator interfaces for the four external ML services. This
//! crate consumes them; the HTTP implementations live with the host
//! application. Responses are tagged structs, one per call kind. Unknown
//! wire fields are dropped during deserialization, never passed through.
//!
//! Health and circuit state are exposed through [`MlClientFactory`] so the
//! degradation manager can decide skip/fallback per stage without knowing
//! transport details.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::entities::clinical_entity::ClinicalEntity;
use crate::entities::pipeline_stage::MlService;
use crate::entities::red_flag::RedFlag;
use crate::error::PipelineError;
use crate::value_objects::condition_code::ConditionCode;

// ---------------------------------------------------------------------------
// audio-intelligence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRequest {
    pub transcript_text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResponse {
    #[serde(default)]
    pub symptoms: Vec<ClinicalEntity>,
    #[serde(default)]
    pub medications: Vec<ClinicalEntity>,
    #[serde(default)]
    pub vitals: Vec<ClinicalEntity>,
    #[serde(default)]
    pub red_flags: Vec<RedFlag>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nlu_tier: Option<String>,
}

#[async_trait]
pub trait AudioIntelligenceClient: Send + Sync {
    async fn extract(&self, request: ExtractionRequest) -> Result<ExtractionResponse, PipelineError>;
}

// ---------------------------------------------------------------------------
// careplan-recommender
// ---------------------------------------------------------------------------

/// Optional demographics for the context-aware recommendation endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demographics {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sex: Option<Sex>,
}

impl Demographics {
    pub fn is_empty(&self) -> bool {
        self.age.is_none() && self.sex.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    M,
    F,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendRequest {
    pub condition_codes: Vec<ConditionCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendContextRequest {
    pub condition_codes: Vec<ConditionCode>,
    pub demographics: Demographics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedTemplate {
    pub template_id: String,
    pub name: String,
    pub confidence: f64,
    #[serde(default)]
    pub condition_codes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub match_factors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResponse {
    #[serde(default)]
    pub templates: Vec<RecommendedTemplate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    pub condition_codes: Vec<ConditionCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedDraft {
    pub title: String,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub interventions: Vec<String>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftResponse {
    #[serde(default)]
    pub drafts: Vec<GeneratedDraft>,
}

#[async_trait]
pub trait RecommenderClient: Send + Sync {
    /// Condition-only matching, used when embeddings are unavailable.
    async fn recommend(&self, request: RecommendRequest) -> Result<RecommendationResponse, PipelineError>;

    /// Context-aware matching with optional demographics.
    async fn recommend_with_context(
        &self,
        request: RecommendContextRequest,
    ) -> Result<RecommendationResponse, PipelineError>;

    async fn generate_draft(&self, template_id: &str, request: DraftRequest) -> Result<DraftResponse, PipelineError>;
}

// ---------------------------------------------------------------------------
// rag-embeddings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedRequest {
    pub condition_codes: Vec<ConditionCode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub symptoms: Option<Vec<String>>,
}

#[async_trait]
pub trait RagEmbeddingsClient: Send + Sync {
    async fn embed_patient_context(&self, request: EmbedRequest) -> Result<Vec<f32>, PipelineError>;
}

// ---------------------------------------------------------------------------
// pdf-parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfValidation {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub file_size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfParseResponse {
    pub care_plan: serde_json::Value,
    #[serde(default)]
    pub codes: Vec<String>,
    pub validation: PdfValidation,
    pub confidence: f64,
}

#[async_trait]
pub trait PdfParserClient: Send + Sync {
    async fn parse(&self, file_key: &str) -> Result<PdfParseResponse, PipelineError>;
}

// ---------------------------------------------------------------------------
// factory + health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service: MlService,
    pub status: String,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthReport {
    pub overall: String,
    pub services: Vec<ServiceStatus>,
    pub degraded_services: Vec<MlService>,
}

/// Hands out typed client handles and aggregated health state.
#[async_trait]
pub trait MlClientFactory: Send + Sync {
    fn audio_intelligence(&self) -> Arc<dyn AudioIntelligenceClient>;
    fn recommender(&self) -> Arc<dyn RecommenderClient>;
    fn rag_embeddings(&self) -> Arc<dyn RagEmbeddingsClient>;
    fn pdf_parser(&self) -> Arc<dyn PdfParserClient>;

    async fn check_all_services(&self) -> ServiceHealthReport;
    fn circuit_states(&self) -> HashMap<MlService, CircuitState>;
}
