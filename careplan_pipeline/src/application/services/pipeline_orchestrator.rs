// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Orchestrator
//!
//! The DAG executor at the center of the service. One call to
//! [`PipelineOrchestrator::process`] turns a validated clinical request
//! into a [`PipelineOutput`] by walking the six stages in dependency order:
//!
//! ```text
//! VALIDATION → ENTITY_EXTRACTION → { EMBEDDING ∥ recommendation prep }
//!            → TEMPLATE_RECOMMENDATION → DRAFT_GENERATION → SAFETY_VALIDATION
//! ```
//!
//! Per stage it enforces the timeout/retry envelope (via the stage
//! executor), consults the caches, minimizes payloads before any external
//! call, records audit entries and stage results, publishes progress, and
//! applies the recovery-action table on failure. EMBEDDING_GENERATION runs
//! concurrently with the recommendation cache probe; its failure flips the
//! recommender to condition-only matching.
//!
//! ## Exactly-once
//!
//! The idempotency guard wraps the whole body: a distributed lock on the
//! idempotency key is held from guard to completion (with TTL extension for
//! long bodies), so for a given key at most one request body executes past
//! the guard anywhere in the cluster. Completed keys replay the cached
//! response byte-for-byte; in-flight keys surface `REQUEST_IN_PROGRESS`.
//!
//! ## Construction
//!
//! Collaborators are closed over by the builder: no service locator, no
//! globals:
//!
//! ```ignore
//! let orchestrator = PipelineOrchestrator::builder()
//!     .settings(OrchestratorSettings::default())
//!     .clients(clients)
//!     .cache(cache)
//!     // … every collaborator …
//!     .build()?;
//! ```

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use careplan_pipeline_bootstrap::shutdown::CancellationToken;
use careplan_pipeline_domain::entities::{
    sort_by_severity, CarePlanDraft, ExtractedEntities, IdempotencyOutcome, MlService, PipelineInput,
    PipelineOutput, PipelineRequestRecord, PipelineStage, ProcessingMetadata, RedFlag, RedFlagSeverity,
    RedFlagSource, RequestError, RequestStatus, StageResult, StageStatus, TemplateRecommendation,
};
use careplan_pipeline_domain::error::{ErrorSeverity, PipelineError};
use careplan_pipeline_domain::events::ProgressEvent;
use careplan_pipeline_domain::repositories::{IdempotencyRepository, RequestRepository};
use careplan_pipeline_domain::services::recovery_policy::{determine_recovery_action, RecoveryAction};
use careplan_pipeline_domain::services::{
    AuditService, CacheContext, CancellationFlags, DataMinimizer, Demographics, DraftRequest, EmbedRequest,
    EncryptionService, ExtractionRequest, LockService, LockToken, MlClientFactory, MlServiceCallEntry,
    PhiAccessEntry, PipelineCacheService, ProgressService, RecommendContextRequest, RecommendRequest,
};
use careplan_pipeline_domain::value_objects::{CorrelationId, RequestId};

use crate::application::services::fallbacks;
use crate::infrastructure::metrics::MetricsService;
use crate::infrastructure::runtime::stage_executor::{StageExecutor, StagePolicy};
use crate::infrastructure::services::degradation_manager::DegradationManager;
use crate::infrastructure::services::pipeline_cache::{extraction_key, recommendation_key, RequestCoalescer};

/// Orchestrator tuning, resolved from the pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub stage_policy: StagePolicy,
    pub lock_ttl: Duration,
    pub lock_wait_interval: Duration,
    pub lock_wait_budget: u32,
    pub enable_idempotency: bool,
    pub enable_caching: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stage_policy: StagePolicy::default(),
            lock_ttl: Duration::from_secs(300),
            lock_wait_interval: Duration::from_millis(250),
            lock_wait_budget: 240,
            enable_idempotency: true,
            enable_caching: true,
        }
    }
}

/// Mutable state accumulated over one request.
struct RunState {
    stage_results: Vec<StageResult>,
    red_flags: Vec<RedFlag>,
    degraded: Vec<MlService>,
    use_condition_only: bool,
    model_version: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            stage_results: Vec::new(),
            red_flags: Vec::new(),
            degraded: Vec::new(),
            use_condition_only: false,
            model_version: None,
        }
    }

    fn mark_degraded(&mut self, service: MlService) {
        if !self.degraded.contains(&service) {
            self.degraded.push(service);
        }
    }

    fn completed_stage_names(&self) -> Vec<String> {
        self.stage_results
            .iter()
            .filter(|r| r.status == StageStatus::Completed)
            .map(|r| r.stage.as_str().to_string())
            .collect()
    }
}

/// Outcome slot for the embedding stage, which runs concurrently with the
/// recommendation cache probe and merges into the run state afterwards.
struct EmbeddingOutcome {
    result: Option<StageResult>,
    condition_only: bool,
    degraded: bool,
}

impl EmbeddingOutcome {
    fn slot() -> Mutex<Self> {
        Mutex::new(Self {
            result: None,
            condition_only: false,
            degraded: false,
        })
    }
}

pub struct PipelineOrchestrator {
    settings: OrchestratorSettings,
    clients: Arc<dyn MlClientFactory>,
    cache: Arc<dyn PipelineCacheService>,
    idempotency: Arc<dyn IdempotencyRepository>,
    requests: Arc<dyn RequestRepository>,
    locks: Arc<dyn LockService>,
    progress: Arc<dyn ProgressService>,
    audit: Arc<dyn AuditService>,
    degradation: Arc<DegradationManager>,
    encryption: Arc<dyn EncryptionService>,
    metrics: Arc<MetricsService>,
    cancellations: Arc<dyn CancellationFlags>,
    minimizer: DataMinimizer,
    executor: StageExecutor,
    extraction_flights: RequestCoalescer<(ExtractedEntities, Vec<RedFlag>)>,
    recommendation_flights: RequestCoalescer<(Vec<TemplateRecommendation>, Option<String>)>,
    shutdown: CancellationToken,
}

impl PipelineOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Accepts a new request: assigns a fresh request id, persists the
    /// PENDING record, and runs the pipeline to completion.
    pub async fn process(&self, input: PipelineInput) -> Result<PipelineOutput, PipelineError> {
        let request_id = RequestId::new();
        let sealed_input = self.encryption.encrypt(&serde_json::to_vec(&input)?)?;
        let record = PipelineRequestRecord::accepted(
            request_id,
            input.visit_id.clone(),
            input.patient_id.clone(),
            input.user_id.clone(),
            input.idempotency_key.clone(),
            sealed_input,
        );
        self.requests.create(&record).await?;
        self.process_assigned(request_id, input).await
    }

    /// Runs the pipeline for a request whose tracker record already exists
    /// (the worker path).
    pub async fn process_assigned(
        &self,
        request_id: RequestId,
        input: PipelineInput,
    ) -> Result<PipelineOutput, PipelineError> {
        let started = Instant::now();
        self.metrics.request_started();
        info!(
            request_id = %request_id,
            correlation_id = %input.correlation_id,
            visit_id = %input.visit_id,
            "pipeline started"
        );

        let result = self.run_request(request_id, &input).await;

        match &result {
            Ok(_) => {
                self.metrics.request_finished("completed", started.elapsed().as_secs_f64());
                info!(request_id = %request_id, correlation_id = %input.correlation_id, "pipeline completed");
            }
            Err(error) => {
                self.metrics.request_finished("failed", started.elapsed().as_secs_f64());
                let failure = RequestError::from(error);
                if let Err(e) = self.requests.fail(request_id, &failure).await {
                    warn!(request_id = %request_id, error = %e, "tracker failure update failed");
                }
                let _ = self.cancellations.clear(request_id).await;
                self.emit(ProgressEvent::pipeline_failed(request_id, error.message.clone()))
                    .await;
                warn!(
                    request_id = %request_id,
                    correlation_id = %input.correlation_id,
                    code = failure.code,
                    "pipeline failed"
                );
            }
        }
        result.map_err(|e| e.with_correlation_id(input.correlation_id))
    }

    async fn run_request(&self, request_id: RequestId, input: &PipelineInput) -> Result<PipelineOutput, PipelineError> {
        let mut state = RunState::new();
        let overall = Instant::now();

        // Stage 1: VALIDATION (local, CRITICAL). Aborts before anything
        // else happens.
        self.run_validation(request_id, input, &mut state).await?;

        // PHI access audit: names of the PHI fields present, never values.
        self.audit
            .log_phi_access(PhiAccessEntry {
                action: "PROCESS".to_string(),
                request_id,
                correlation_id: input.correlation_id,
                user_id: input.user_id.clone(),
                phi_fields: input.phi_fields_present().iter().map(|f| f.to_string()).collect(),
                timestamp: Utc::now(),
            })
            .await;

        if !self.settings.enable_idempotency {
            return self.execute_owned(request_id, input, state, overall).await;
        }

        // The guard and the body share one critical section per key.
        let lock_key = format!("idem:{}", input.idempotency_key);
        let token = self.acquire_processing_lock(&lock_key).await?;
        let extender = self.spawn_lock_extender(lock_key.clone(), token.clone());

        let outcome = self
            .idempotency
            .check_or_create(&input.idempotency_key, &input.canonical_hash(), request_id)
            .await;

        let result = match outcome {
            Err(e) => Err(e),
            Ok(IdempotencyOutcome::New) => self.execute_guarded(request_id, input, state, overall).await,
            Ok(IdempotencyOutcome::Pending(owner)) if owner == request_id => {
                // Our own record (inserted at submission, or a redelivery
                // of our job): we own the execution.
                self.execute_guarded(request_id, input, state, overall).await
            }
            Ok(IdempotencyOutcome::Completed(cached)) => self.replay_completed(request_id, cached).await,
            Ok(IdempotencyOutcome::Failed(cached)) => Err(Self::replay_failed(cached)),
            Ok(IdempotencyOutcome::Pending(_)) => Err(PipelineError::rate_limited(format!(
                "REQUEST_IN_PROGRESS: idempotency key {} is already executing",
                input.idempotency_key
            ))),
        };

        extender.abort();
        if let Err(e) = self.locks.release(&lock_key, &token).await {
            warn!(key = %lock_key, error = %e, "lock release failed; holding until TTL expiry");
        }
        result
    }

    /// The owned execution path plus idempotency completion bookkeeping.
    async fn execute_guarded(
        &self,
        request_id: RequestId,
        input: &PipelineInput,
        state: RunState,
        overall: Instant,
    ) -> Result<PipelineOutput, PipelineError> {
        let result = self.execute_owned(request_id, input, state, overall).await;
        match &result {
            Ok(output) => {
                let payload = serde_json::to_value(output)?;
                if let Err(e) = self
                    .idempotency
                    .complete(&input.idempotency_key, request_id, &payload)
                    .await
                {
                    warn!(request_id = %request_id, error = %e, "idempotency completion failed");
                }
            }
            Err(error) => {
                if let Ok(payload) = serde_json::to_value(error) {
                    if let Err(e) = self.idempotency.fail(&input.idempotency_key, request_id, &payload).await {
                        warn!(request_id = %request_id, error = %e, "idempotency failure update failed");
                    }
                }
            }
        }
        result
    }

    /// Stages 2–6 and output assembly, for the caller that owns the key.
    async fn execute_owned(
        &self,
        request_id: RequestId,
        input: &PipelineInput,
        mut state: RunState,
        overall: Instant,
    ) -> Result<PipelineOutput, PipelineError> {
        self.requests
            .update_status(request_id, RequestStatus::InProgress, None)
            .await?;

        // Stage 2: ENTITY_EXTRACTION (iff transcript present).
        let extracted = self.run_extraction(request_id, input, &mut state).await?;
        self.check_cancelled(request_id).await?;

        // Stage 3 ∥ recommendation preparation: the embedding call and the
        // recommendation cache probe have no data dependency.
        let ctx = CacheContext {
            correlation_id: input.correlation_id,
        };
        let demographics = Demographics::default();
        let embedding_slot = EmbeddingOutcome::slot();
        let (_, cached_recommendations) = tokio::join!(
            self.run_embedding(request_id, input, extracted.as_ref(), &embedding_slot),
            async {
                if self.caching_active() {
                    self.cache
                        .get_recommendations(&input.condition_codes, &demographics, &ctx)
                        .await
                        .unwrap_or_default()
                } else {
                    None
                }
            }
        );
        {
            let embedding = embedding_slot.into_inner();
            if let Some(result) = embedding.result {
                self.finish_stage(&mut state, result);
            }
            state.use_condition_only = embedding.condition_only;
            if embedding.degraded {
                state.mark_degraded(MlService::RagEmbeddings);
            }
        }
        self.check_cancelled(request_id).await?;

        // Stage 4: TEMPLATE_RECOMMENDATION.
        let recommendations = self
            .run_recommendation(request_id, input, &demographics, cached_recommendations, &mut state)
            .await?;
        self.check_cancelled(request_id).await?;

        // Stage 5: DRAFT_GENERATION (iff requested and ≥ 1 recommendation).
        let draft = self.run_draft(request_id, input, &recommendations, &mut state).await?;
        self.check_cancelled(request_id).await?;

        // Stage 6: SAFETY_VALIDATION (local, CRITICAL).
        self.run_safety_validation(request_id, extracted.as_ref(), draft.as_ref(), &mut state)
            .await?;

        // Red-flag merge: extraction + safety + system, severity-ordered.
        sort_by_severity(&mut state.red_flags);

        let requires_manual_review =
            PipelineOutput::manual_review_required(&state.red_flags, &state.degraded, draft.as_ref());

        let output = PipelineOutput {
            request_id,
            extracted_entities: extracted,
            recommendations,
            draft_care_plan: draft,
            red_flags: state.red_flags.clone(),
            processing_metadata: ProcessingMetadata {
                stage_results: state.stage_results.clone(),
                total_duration_ms: overall.elapsed().as_millis() as u64,
                model_version: state.model_version.clone(),
            },
            degraded_services: state.degraded.clone(),
            requires_manual_review,
        };

        let sealed = self.encryption.encrypt(&serde_json::to_vec(&output)?)?;
        let degraded_names: Vec<String> = state.degraded.iter().map(|s| s.as_str().to_string()).collect();
        self.requests
            .complete(request_id, sealed, &degraded_names, &state.completed_stage_names())
            .await?;
        let _ = self.cancellations.clear(request_id).await;

        self.emit(ProgressEvent::pipeline_completed(request_id)).await;
        Ok(output)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn run_validation(
        &self,
        request_id: RequestId,
        input: &PipelineInput,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        let stage = PipelineStage::Validation;
        self.emit(ProgressEvent::stage_started(request_id, stage)).await;
        let outcome = self
            .executor
            .run(stage, input.correlation_id, |_| async { input.validate() })
            .await;
        match outcome.result {
            Ok(()) => {
                self.finish_stage(state, StageResult::completed(stage, outcome.duration.as_millis() as u64));
                self.emit(ProgressEvent::stage_completed(request_id, stage)).await;
                Ok(())
            }
            Err(error) => {
                self.finish_stage(
                    state,
                    StageResult::failed(stage, outcome.duration.as_millis() as u64, error.message.clone()),
                );
                self.emit(ProgressEvent::stage_failed(request_id, stage, error.message.clone()))
                    .await;
                Err(error)
            }
        }
    }

    async fn run_extraction(
        &self,
        request_id: RequestId,
        input: &PipelineInput,
        state: &mut RunState,
    ) -> Result<Option<ExtractedEntities>, PipelineError> {
        let stage = PipelineStage::EntityExtraction;
        let Some(transcript) = input.transcript_text.clone() else {
            self.skip_stage(request_id, stage, state).await;
            return Ok(None);
        };
        if !self.degradation.should_execute_stage(stage) {
            self.skip_stage(request_id, stage, state).await;
            return Ok(None);
        }

        self.emit(ProgressEvent::stage_started(request_id, stage)).await;
        let ctx = CacheContext {
            correlation_id: input.correlation_id,
        };

        // Cache first.
        if self.caching_active() {
            if let Ok(Some(cached)) = self.cache.get_extraction(&transcript, &ctx).await {
                self.metrics.record_cache("extraction", "hit");
                self.finish_stage(state, StageResult::completed(stage, 0).with_cache_hit(true));
                self.emit(ProgressEvent::stage_completed(request_id, stage)).await;
                return Ok(Some(cached));
            }
            self.metrics.record_cache("extraction", "miss");
        }

        // Health-based bypass: go straight to the degraded path.
        if self.degradation.should_use_fallback(MlService::AudioIntelligence) {
            self.degrade_extraction(request_id, state, 0, "audio-intelligence bypassed by degradation manager")
                .await;
            return Ok(Some(fallbacks::empty_extraction()));
        }

        // Minimize and audit what leaves the process.
        let context = self.extraction_context(input);
        self.share_minimized(MlService::AudioIntelligence, &context, input.correlation_id)
            .await?;

        let started = Instant::now();
        let flight_key = extraction_key(&transcript);
        let correlation_id = input.correlation_id;
        let client = self.clients.audio_intelligence();

        let call = self
            .extraction_flights
            .run(&flight_key, || async {
                let outcome = self
                    .executor
                    .run(stage, correlation_id, |attempt| {
                        if attempt > 0 {
                            self.metrics.record_retry();
                        }
                        let client = Arc::clone(&client);
                        let transcript = transcript.clone();
                        async move {
                            client
                                .extract(ExtractionRequest {
                                    transcript_text: transcript,
                                })
                                .await
                        }
                    })
                    .await;
                outcome.result.map(|response| {
                    let entities = ExtractedEntities {
                        symptoms: response.symptoms,
                        medications: response.medications,
                        vitals: response.vitals,
                        ..ExtractedEntities::empty()
                    };
                    (entities, response.red_flags)
                })
            })
            .await;

        match call {
            Ok((entities, mut extraction_flags)) => {
                self.record_ml_call(MlService::AudioIntelligence, "extract", started, true, correlation_id)
                    .await;
                self.degradation.record_call_outcome(MlService::AudioIntelligence, true);
                state.red_flags.append(&mut extraction_flags);
                if self.caching_active() {
                    if let Err(e) = self.cache.set_extraction(&transcript, &entities, &ctx).await {
                        warn!(request_id = %request_id, error = %e, "extraction cache write failed");
                    }
                }
                self.finish_stage(
                    state,
                    StageResult::completed(stage, started.elapsed().as_millis() as u64).with_cache_hit(false),
                );
                self.emit(
                    ProgressEvent::stage_completed(request_id, stage)
                        .with_partial_result(serde_json::json!({ "entityCount": entities.total_count() })),
                )
                .await;
                Ok(Some(entities))
            }
            Err(error) => {
                self.record_ml_call(MlService::AudioIntelligence, "extract", started, false, correlation_id)
                    .await;
                self.degradation.record_call_outcome(MlService::AudioIntelligence, false);
                let retry_count = error.retry_count.unwrap_or(self.settings.stage_policy.max_retries);
                match determine_recovery_action(&error, retry_count, self.settings.stage_policy.max_retries) {
                    RecoveryAction::Abort => {
                        self.finish_stage(
                            state,
                            StageResult::failed(stage, started.elapsed().as_millis() as u64, error.message.clone()),
                        );
                        self.emit(ProgressEvent::stage_failed(request_id, stage, error.message.clone()))
                            .await;
                        Err(error)
                    }
                    _ => {
                        // DEGRADE: continue with empty entities and a
                        // manual-review flag.
                        self.degrade_extraction(
                            request_id,
                            state,
                            started.elapsed().as_millis() as u64,
                            &error.message,
                        )
                        .await;
                        Ok(Some(fallbacks::empty_extraction()))
                    }
                }
            }
        }
    }

    async fn degrade_extraction(&self, request_id: RequestId, state: &mut RunState, duration_ms: u64, reason: &str) {
        debug!(request_id = %request_id, reason, "extraction degraded");
        self.finish_stage(
            state,
            StageResult::failed(PipelineStage::EntityExtraction, duration_ms, reason),
        );
        state.mark_degraded(MlService::AudioIntelligence);
        state.red_flags.push(fallbacks::manual_review_flag());
        self.emit(ProgressEvent::stage_failed(
            request_id,
            PipelineStage::EntityExtraction,
            reason.to_string(),
        ))
        .await;
    }

    async fn run_embedding(
        &self,
        request_id: RequestId,
        input: &PipelineInput,
        extracted: Option<&ExtractedEntities>,
        slot: &Mutex<EmbeddingOutcome>,
    ) {
        let stage = PipelineStage::EmbeddingGeneration;
        if !self.degradation.should_execute_stage(stage)
            || self.degradation.should_use_fallback(MlService::RagEmbeddings)
        {
            self.emit(ProgressEvent::stage_skipped(request_id, stage)).await;
            let mut outcome = slot.lock();
            outcome.result = Some(StageResult::skipped(stage));
            outcome.condition_only = true;
            return;
        }

        self.emit(ProgressEvent::stage_started(request_id, stage)).await;

        let context = self.embedding_context(input, extracted);
        if let Err(error) = self
            .share_minimized(MlService::RagEmbeddings, &context, input.correlation_id)
            .await
        {
            // A projection failure here is a PHI guard trip; skip the stage
            // rather than sharing anything.
            warn!(request_id = %request_id, error = %error, "embedding payload projection failed");
            {
                let mut outcome = slot.lock();
                outcome.result = Some(StageResult::failed(stage, 0, error.message.clone()));
                outcome.condition_only = true;
                outcome.degraded = true;
            }
            self.emit(ProgressEvent::stage_failed(request_id, stage, error.message)).await;
            return;
        }

        let started = Instant::now();
        let client = self.clients.rag_embeddings();
        let symptoms: Option<Vec<String>> = extracted.map(|e| e.symptoms.iter().map(|s| s.text.clone()).collect());
        let codes = input.condition_codes.clone();
        let correlation_id = input.correlation_id;

        let outcome = self
            .executor
            .run(stage, correlation_id, |attempt| {
                if attempt > 0 {
                    self.metrics.record_retry();
                }
                let client = Arc::clone(&client);
                let request = EmbedRequest {
                    condition_codes: codes.clone(),
                    symptoms: symptoms.clone(),
                };
                async move { client.embed_patient_context(request).await }
            })
            .await;

        match outcome.result {
            Ok(_vector) => {
                self.record_ml_call(MlService::RagEmbeddings, "embedPatientContext", started, true, correlation_id)
                    .await;
                self.degradation.record_call_outcome(MlService::RagEmbeddings, true);
                {
                    let mut cell = slot.lock();
                    cell.result = Some(StageResult::completed(stage, outcome.duration.as_millis() as u64));
                    cell.condition_only = false;
                }
                self.emit(ProgressEvent::stage_completed(request_id, stage)).await;
            }
            Err(error) => {
                self.record_ml_call(MlService::RagEmbeddings, "embedPatientContext", started, false, correlation_id)
                    .await;
                self.degradation.record_call_outcome(MlService::RagEmbeddings, false);
                {
                    let mut cell = slot.lock();
                    cell.result = Some(StageResult::failed(
                        stage,
                        outcome.duration.as_millis() as u64,
                        error.message.clone(),
                    ));
                    cell.condition_only = true;
                    cell.degraded = true;
                }
                self.emit(ProgressEvent::stage_failed(request_id, stage, error.message)).await;
            }
        }
    }

    async fn run_recommendation(
        &self,
        request_id: RequestId,
        input: &PipelineInput,
        demographics: &Demographics,
        cached: Option<Vec<TemplateRecommendation>>,
        state: &mut RunState,
    ) -> Result<Vec<TemplateRecommendation>, PipelineError> {
        let stage = PipelineStage::TemplateRecommendation;
        self.emit(ProgressEvent::stage_started(request_id, stage)).await;

        if let Some(recommendations) = cached {
            self.metrics.record_cache("recommendation", "hit");
            self.finish_stage(state, StageResult::completed(stage, 0).with_cache_hit(true));
            self.emit(ProgressEvent::stage_completed(request_id, stage)).await;
            return Ok(recommendations);
        }
        if self.caching_active() {
            self.metrics.record_cache("recommendation", "miss");
        }

        if !self.degradation.should_execute_stage(stage)
            || self.degradation.should_use_fallback(MlService::CareplanRecommender)
        {
            return Ok(self
                .apply_recommendation_fallback(request_id, input, state, 0, "recommender bypassed")
                .await);
        }

        let context = self.recommendation_context(input, demographics);
        self.share_minimized(MlService::CareplanRecommender, &context, input.correlation_id)
            .await?;

        let started = Instant::now();
        let correlation_id = input.correlation_id;
        let condition_only = state.use_condition_only;
        let flight_key = recommendation_key(&input.condition_codes, demographics);
        let client = self.clients.recommender();
        let codes = input.condition_codes.clone();
        let demographics_copy = *demographics;

        let call = self
            .recommendation_flights
            .run(&flight_key, || async {
                let outcome = self
                    .executor
                    .run(stage, correlation_id, |attempt| {
                        if attempt > 0 {
                            self.metrics.record_retry();
                        }
                        let client = Arc::clone(&client);
                        let codes = codes.clone();
                        async move {
                            let response = if condition_only {
                                client.recommend(RecommendRequest { condition_codes: codes }).await?
                            } else {
                                client
                                    .recommend_with_context(RecommendContextRequest {
                                        condition_codes: codes,
                                        demographics: demographics_copy,
                                    })
                                    .await?
                            };
                            Ok(response)
                        }
                    })
                    .await;
                outcome.result.map(|response| {
                    let model_version = response.model_version.clone();
                    let recommendations: Vec<TemplateRecommendation> = response
                        .templates
                        .into_iter()
                        .map(|t| {
                            TemplateRecommendation::new(t.template_id, t.name, t.confidence)
                                .with_matched_conditions(t.condition_codes)
                        })
                        .collect();
                    (recommendations, model_version)
                })
            })
            .await;

        match call {
            Ok((recommendations, model_version)) => {
                state.model_version = model_version;
                self.record_ml_call(MlService::CareplanRecommender, "recommend", started, true, correlation_id)
                    .await;
                self.degradation.record_call_outcome(MlService::CareplanRecommender, true);
                if self.caching_active() {
                    let ctx = CacheContext { correlation_id };
                    if let Err(e) = self
                        .cache
                        .set_recommendations(&input.condition_codes, demographics, &recommendations, &ctx)
                        .await
                    {
                        warn!(request_id = %request_id, error = %e, "recommendation cache write failed");
                    }
                }
                self.finish_stage(
                    state,
                    StageResult::completed(stage, started.elapsed().as_millis() as u64).with_cache_hit(false),
                );
                self.emit(
                    ProgressEvent::stage_completed(request_id, stage)
                        .with_partial_result(serde_json::json!({ "recommendationCount": recommendations.len() })),
                )
                .await;
                Ok(recommendations)
            }
            Err(error) => {
                self.record_ml_call(MlService::CareplanRecommender, "recommend", started, false, correlation_id)
                    .await;
                self.degradation.record_call_outcome(MlService::CareplanRecommender, false);
                if error.severity == ErrorSeverity::Fatal {
                    self.finish_stage(
                        state,
                        StageResult::failed(stage, started.elapsed().as_millis() as u64, error.message.clone()),
                    );
                    self.emit(ProgressEvent::stage_failed(request_id, stage, error.message.clone()))
                        .await;
                    return Err(error);
                }
                Ok(self
                    .apply_recommendation_fallback(
                        request_id,
                        input,
                        state,
                        started.elapsed().as_millis() as u64,
                        &error.message,
                    )
                    .await)
            }
        }
    }

    async fn apply_recommendation_fallback(
        &self,
        request_id: RequestId,
        input: &PipelineInput,
        state: &mut RunState,
        duration_ms: u64,
        reason: &str,
    ) -> Vec<TemplateRecommendation> {
        debug!(request_id = %request_id, reason, "using fallback recommendations");
        self.finish_stage(
            state,
            StageResult::failed(PipelineStage::TemplateRecommendation, duration_ms, reason),
        );
        state.mark_degraded(MlService::CareplanRecommender);
        state.red_flags.push(fallbacks::fallback_recommendations_flag());
        self.emit(ProgressEvent::stage_failed(
            request_id,
            PipelineStage::TemplateRecommendation,
            reason.to_string(),
        ))
        .await;
        fallbacks::fallback_recommendations(&input.condition_codes)
    }

    async fn run_draft(
        &self,
        request_id: RequestId,
        input: &PipelineInput,
        recommendations: &[TemplateRecommendation],
        state: &mut RunState,
    ) -> Result<Option<CarePlanDraft>, PipelineError> {
        let stage = PipelineStage::DraftGeneration;
        if !input.wants_draft() || recommendations.is_empty() || !self.degradation.should_execute_stage(stage) {
            self.skip_stage(request_id, stage, state).await;
            return Ok(None);
        }

        self.emit(ProgressEvent::stage_started(request_id, stage)).await;
        let started = Instant::now();
        let correlation_id = input.correlation_id;

        // Caller-preferred templates win over the recommender's ranking.
        let template_id = input
            .preferred_template_ids
            .as_ref()
            .and_then(|ids| ids.first().cloned())
            .unwrap_or_else(|| recommendations[0].template_id.clone());

        let client = self.clients.recommender();
        let codes = input.condition_codes.clone();
        let outcome = self
            .executor
            .run(stage, correlation_id, |attempt| {
                if attempt > 0 {
                    self.metrics.record_retry();
                }
                let client = Arc::clone(&client);
                let template_id = template_id.clone();
                let codes = codes.clone();
                async move {
                    client
                        .generate_draft(&template_id, DraftRequest { condition_codes: codes })
                        .await
                }
            })
            .await;

        match outcome.result {
            Ok(response) => {
                self.record_ml_call(MlService::CareplanRecommender, "generateDraft", started, true, correlation_id)
                    .await;
                self.degradation.record_call_outcome(MlService::CareplanRecommender, true);
                let draft = response.drafts.into_iter().next().map(|d| {
                    CarePlanDraft::new(
                        d.title,
                        input.condition_codes.iter().map(|c| c.as_str().to_string()).collect(),
                        d.goals,
                        d.interventions,
                        d.confidence_score,
                    )
                    .with_template_id(&template_id)
                });
                self.finish_stage(state, StageResult::completed(stage, outcome.duration.as_millis() as u64));
                self.emit(ProgressEvent::stage_completed(request_id, stage)).await;
                Ok(draft)
            }
            Err(error) => {
                self.record_ml_call(MlService::CareplanRecommender, "generateDraft", started, false, correlation_id)
                    .await;
                self.degradation.record_call_outcome(MlService::CareplanRecommender, false);
                if error.severity == ErrorSeverity::Fatal {
                    self.finish_stage(
                        state,
                        StageResult::failed(stage, outcome.duration.as_millis() as u64, error.message.clone()),
                    );
                    self.emit(ProgressEvent::stage_failed(request_id, stage, error.message.clone()))
                        .await;
                    return Err(error);
                }
                // SKIP: recommendations-only output.
                state.mark_degraded(MlService::CareplanRecommender);
                self.finish_stage(
                    state,
                    StageResult::failed(stage, outcome.duration.as_millis() as u64, error.message.clone()),
                );
                self.emit(ProgressEvent::stage_failed(request_id, stage, error.message)).await;
                Ok(None)
            }
        }
    }

    async fn run_safety_validation(
        &self,
        request_id: RequestId,
        extracted: Option<&ExtractedEntities>,
        draft: Option<&CarePlanDraft>,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        let stage = PipelineStage::SafetyValidation;
        self.emit(ProgressEvent::stage_started(request_id, stage)).await;
        let started = Instant::now();

        if !self.degradation.safety_service_enabled() {
            state.red_flags.push(fallbacks::safety_unavailable_flag());
            self.finish_stage(state, StageResult::completed(stage, started.elapsed().as_millis() as u64));
            self.emit(ProgressEvent::stage_completed(request_id, stage)).await;
            return Ok(());
        }

        // Local safety pass. Errors here are CRITICAL and abort.
        let outcome = self
            .executor
            .run(stage, CorrelationId::new(), |_| async {
                let mut flags = Vec::new();
                if let Some(draft) = draft {
                    if draft.goals.is_empty() || draft.interventions.is_empty() {
                        flags.push(RedFlag::new(
                            RedFlagSeverity::Medium,
                            "Draft care plan is missing goals or interventions",
                            RedFlagSource::SafetyValidation,
                        ));
                    }
                }
                if let Some(entities) = extracted {
                    if entities.medications.iter().any(|m| m.confidence < 0.3) {
                        flags.push(RedFlag::new(
                            RedFlagSeverity::Low,
                            "Low-confidence medication extraction",
                            RedFlagSource::SafetyValidation,
                        ));
                    }
                }
                Ok::<_, PipelineError>(flags)
            })
            .await;

        match outcome.result {
            Ok(flags) => {
                state.red_flags.extend(flags);
                self.finish_stage(state, StageResult::completed(stage, outcome.duration.as_millis() as u64));
                self.emit(ProgressEvent::stage_completed(request_id, stage)).await;
                Ok(())
            }
            Err(error) => {
                self.finish_stage(
                    state,
                    StageResult::failed(stage, outcome.duration.as_millis() as u64, error.message.clone()),
                );
                self.emit(ProgressEvent::stage_failed(request_id, stage, error.message.clone()))
                    .await;
                Err(error)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn caching_active(&self) -> bool {
        self.settings.enable_caching && self.degradation.caching_enabled()
    }

    async fn skip_stage(&self, request_id: RequestId, stage: PipelineStage, state: &mut RunState) {
        self.finish_stage(state, StageResult::skipped(stage));
        self.emit(ProgressEvent::stage_skipped(request_id, stage)).await;
    }

    fn finish_stage(&self, state: &mut RunState, result: StageResult) {
        self.metrics
            .record_stage(result.stage, result.status, result.duration_ms as f64 / 1000.0);
        state.stage_results.push(result);
    }

    async fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.progress.publish(&event).await {
            warn!(request_id = %event.request_id, error = %e, "progress publish failed");
        }
    }

    async fn check_cancelled(&self, request_id: RequestId) -> Result<(), PipelineError> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::internal("cancelled by shutdown"));
        }
        match self.cancellations.is_cancelled(request_id).await {
            Ok(true) => Err(PipelineError::internal("cancelled by request")),
            Ok(false) => Ok(()),
            // A broken flag store never blocks a request.
            Err(_) => Ok(()),
        }
    }

    async fn record_ml_call(
        &self,
        service: MlService,
        operation: &str,
        started: Instant,
        success: bool,
        correlation_id: CorrelationId,
    ) {
        self.audit
            .log_ml_service_call(MlServiceCallEntry {
                service,
                operation: operation.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                success,
                correlation_id,
                timestamp: Utc::now(),
            })
            .await;
    }

    // Context maps fed to the minimizer before each external call. They
    // mirror what the typed requests carry, plus the identifying fields the
    // projection is proving it strips.
    fn extraction_context(&self, input: &PipelineInput) -> Map<String, Value> {
        let mut context = self.base_context(input);
        if let Some(transcript) = &input.transcript_text {
            context.insert("transcriptText".into(), Value::String(transcript.clone()));
        }
        if let Some(url) = &input.audio_url {
            context.insert("audioUrl".into(), Value::String(url.clone()));
        }
        context
    }

    fn embedding_context(&self, input: &PipelineInput, extracted: Option<&ExtractedEntities>) -> Map<String, Value> {
        let mut context = self.base_context(input);
        if let Some(entities) = extracted {
            let symptoms: Vec<Value> = entities
                .symptoms
                .iter()
                .map(|s| Value::String(s.text.clone()))
                .collect();
            context.insert("symptoms".into(), Value::Array(symptoms));
        }
        context
    }

    fn recommendation_context(&self, input: &PipelineInput, demographics: &Demographics) -> Map<String, Value> {
        let mut context = self.base_context(input);
        if let Some(age) = demographics.age {
            context.insert("age".into(), Value::from(age));
        }
        if let Some(sex) = demographics.sex {
            context.insert(
                "sex".into(),
                Value::String(match sex {
                    careplan_pipeline_domain::services::Sex::M => "M".into(),
                    careplan_pipeline_domain::services::Sex::F => "F".into(),
                }),
            );
        }
        context
    }

    fn base_context(&self, input: &PipelineInput) -> Map<String, Value> {
        let mut context = Map::new();
        context.insert("patientId".into(), Value::String(input.patient_id.clone()));
        context.insert(
            "conditionCodes".into(),
            Value::Array(
                input
                    .condition_codes
                    .iter()
                    .map(|c| Value::String(c.as_str().to_string()))
                    .collect(),
            ),
        );
        context
    }

    /// Minimizes `context` for `service`, records the data-sharing audit
    /// entry, and returns the minimal payload.
    async fn share_minimized(
        &self,
        service: MlService,
        context: &Map<String, Value>,
        correlation_id: CorrelationId,
    ) -> Result<Map<String, Value>, PipelineError> {
        let minimal = self.minimizer.project(service, context)?;
        let entry = self.minimizer.audit_entry(service, &minimal, correlation_id);
        self.audit.log_data_sharing(entry).await;
        Ok(minimal)
    }

    async fn acquire_processing_lock(&self, key: &str) -> Result<LockToken, PipelineError> {
        for attempt in 0..=self.settings.lock_wait_budget {
            if let Some(token) = self.locks.acquire(key, self.settings.lock_ttl).await? {
                return Ok(token);
            }
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::internal("cancelled by shutdown"));
            }
            if attempt < self.settings.lock_wait_budget {
                tokio::time::sleep(self.settings.lock_wait_interval).await;
            }
        }
        Err(PipelineError::rate_limited(
            "REQUEST_IN_PROGRESS: could not acquire the processing lock",
        ))
    }

    /// Keeps the processing lock alive for bodies that outlive the TTL.
    fn spawn_lock_extender(&self, key: String, token: LockToken) -> tokio::task::JoinHandle<()> {
        let locks = Arc::clone(&self.locks);
        let ttl = self.settings.lock_ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl / 2);
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                match locks.extend(&key, &token, ttl).await {
                    Ok(true) => {}
                    Ok(false) => break, // lost the lock; stop extending
                    Err(e) => {
                        warn!(key = %key, error = %e, "lock extension failed");
                        break;
                    }
                }
            }
        })
    }

    async fn replay_completed(
        &self,
        request_id: RequestId,
        cached: serde_json::Value,
    ) -> Result<PipelineOutput, PipelineError> {
        let output: PipelineOutput = serde_json::from_value(cached.clone())
            .map_err(|e| PipelineError::internal(format!("cached response is malformed: {}", e)))?;
        // Mirror the cached outcome onto this request's record so the
        // COMPLETED ⇒ result-blob invariant holds for replays too.
        let sealed = self.encryption.encrypt(&serde_json::to_vec(&cached)?)?;
        if let Err(e) = self.requests.complete(request_id, sealed, &[], &[]).await {
            warn!(request_id = %request_id, error = %e, "replay tracker completion failed");
        }
        self.emit(ProgressEvent::pipeline_completed(request_id)).await;
        Ok(output)
    }

    fn replay_failed(cached: serde_json::Value) -> PipelineError {
        serde_json::from_value::<PipelineError>(cached)
            .unwrap_or_else(|_| PipelineError::internal("request previously failed"))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct OrchestratorBuilder {
    settings: Option<OrchestratorSettings>,
    clients: Option<Arc<dyn MlClientFactory>>,
    cache: Option<Arc<dyn PipelineCacheService>>,
    idempotency: Option<Arc<dyn IdempotencyRepository>>,
    requests: Option<Arc<dyn RequestRepository>>,
    locks: Option<Arc<dyn LockService>>,
    progress: Option<Arc<dyn ProgressService>>,
    audit: Option<Arc<dyn AuditService>>,
    degradation: Option<Arc<DegradationManager>>,
    encryption: Option<Arc<dyn EncryptionService>>,
    metrics: Option<Arc<MetricsService>>,
    cancellations: Option<Arc<dyn CancellationFlags>>,
    shutdown: Option<CancellationToken>,
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn clients(mut self, clients: Arc<dyn MlClientFactory>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn PipelineCacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn idempotency(mut self, idempotency: Arc<dyn IdempotencyRepository>) -> Self {
        self.idempotency = Some(idempotency);
        self
    }

    pub fn requests(mut self, requests: Arc<dyn RequestRepository>) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressService>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditService>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn degradation(mut self, degradation: Arc<DegradationManager>) -> Self {
        self.degradation = Some(degradation);
        self
    }

    pub fn encryption(mut self, encryption: Arc<dyn EncryptionService>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cancellations(mut self, cancellations: Arc<dyn CancellationFlags>) -> Self {
        self.cancellations = Some(cancellations);
        self
    }

    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator, PipelineError> {
        fn missing(name: &str) -> PipelineError {
            PipelineError::internal(format!("orchestrator builder is missing {}", name))
        }
        let settings = self.settings.unwrap_or_default();
        let shutdown = self.shutdown.unwrap_or_default();
        Ok(PipelineOrchestrator {
            executor: StageExecutor::new(settings.stage_policy, shutdown.clone()),
            settings,
            clients: self.clients.ok_or_else(|| missing("clients"))?,
            cache: self.cache.ok_or_else(|| missing("cache"))?,
            idempotency: self.idempotency.ok_or_else(|| missing("idempotency"))?,
            requests: self.requests.ok_or_else(|| missing("requests"))?,
            locks: self.locks.ok_or_else(|| missing("locks"))?,
            progress: self.progress.ok_or_else(|| missing("progress"))?,
            audit: self.audit.ok_or_else(|| missing("audit"))?,
            degradation: self.degradation.ok_or_else(|| missing("degradation"))?,
            encryption: self.encryption.ok_or_else(|| missing("encryption"))?,
            metrics: self.metrics.ok_or_else(|| missing("metrics"))?,
            cancellations: self.cancellations.ok_or_else(|| missing("cancellations"))?,
            minimizer: DataMinimizer::new(),
            extraction_flights: RequestCoalescer::new(),
            recommendation_flights: RequestCoalescer::new(),
            shutdown,
        })
    }
}
