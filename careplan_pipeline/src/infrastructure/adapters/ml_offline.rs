// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Offline ML Clients
//!
//! Stand-in implementation of the ML client factory for hosts that have
//! not bound real HTTP clients: every call fails with
//! `SERVICE_UNAVAILABLE`, which drives the pipeline down its fallback
//! paths end-to-end (fallback recommendations, minimal drafts, conservative
//! red flags). Used by the standalone binary and by degradation drills.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use careplan_pipeline_domain::entities::MlService;
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::services::{
    AudioIntelligenceClient, CircuitState, DraftRequest, DraftResponse, EmbedRequest, ExtractionRequest,
    ExtractionResponse, MlClientFactory, PdfParseResponse, PdfParserClient, RagEmbeddingsClient,
    RecommendContextRequest, RecommendRequest, RecommendationResponse, RecommenderClient, ServiceHealthReport,
    ServiceStatus,
};

fn offline(service: MlService) -> PipelineError {
    PipelineError::service_unavailable(format!("{} client is not configured", service))
}

struct OfflineClient;

#[async_trait]
impl AudioIntelligenceClient for OfflineClient {
    async fn extract(&self, _request: ExtractionRequest) -> Result<ExtractionResponse, PipelineError> {
        Err(offline(MlService::AudioIntelligence))
    }
}

#[async_trait]
impl RecommenderClient for OfflineClient {
    async fn recommend(&self, _request: RecommendRequest) -> Result<RecommendationResponse, PipelineError> {
        Err(offline(MlService::CareplanRecommender))
    }

    async fn recommend_with_context(
        &self,
        _request: RecommendContextRequest,
    ) -> Result<RecommendationResponse, PipelineError> {
        Err(offline(MlService::CareplanRecommender))
    }

    async fn generate_draft(&self, _template_id: &str, _request: DraftRequest) -> Result<DraftResponse, PipelineError> {
        Err(offline(MlService::CareplanRecommender))
    }
}

#[async_trait]
impl RagEmbeddingsClient for OfflineClient {
    async fn embed_patient_context(&self, _request: EmbedRequest) -> Result<Vec<f32>, PipelineError> {
        Err(offline(MlService::RagEmbeddings))
    }
}

#[async_trait]
impl PdfParserClient for OfflineClient {
    async fn parse(&self, _file_key: &str) -> Result<PdfParseResponse, PipelineError> {
        Err(offline(MlService::PdfParser))
    }
}

/// Factory handing out offline clients and an all-degraded health report.
#[derive(Default)]
pub struct OfflineMlClients;

#[async_trait]
impl MlClientFactory for OfflineMlClients {
    fn audio_intelligence(&self) -> Arc<dyn AudioIntelligenceClient> {
        Arc::new(OfflineClient)
    }

    fn recommender(&self) -> Arc<dyn RecommenderClient> {
        Arc::new(OfflineClient)
    }

    fn rag_embeddings(&self) -> Arc<dyn RagEmbeddingsClient> {
        Arc::new(OfflineClient)
    }

    fn pdf_parser(&self) -> Arc<dyn PdfParserClient> {
        Arc::new(OfflineClient)
    }

    async fn check_all_services(&self) -> ServiceHealthReport {
        ServiceHealthReport {
            overall: "degraded".to_string(),
            services: MlService::all()
                .into_iter()
                .map(|service| ServiceStatus {
                    service,
                    status: "unconfigured".to_string(),
                    latency_ms: None,
                    last_error: Some("client is not configured".to_string()),
                    last_success: None,
                })
                .collect(),
            degraded_services: MlService::all().to_vec(),
        }
    }

    fn circuit_states(&self) -> HashMap<MlService, CircuitState> {
        MlService::all().into_iter().map(|s| (s, CircuitState::Open)).collect()
    }
}
