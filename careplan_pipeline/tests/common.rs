// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Common Test Helpers
//!
//! In-memory implementations of every domain port, plus scriptable ML
//! client stubs and a harness builder that wires a complete orchestrator
//! without Redis or Postgres. Semantics mirror the production adapters:
//! the idempotency store applies the same decision table, the extraction
//! cache encrypts at rest, and the progress bus delivers events in publish
//! order.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use careplan_pipeline::application::services::{OrchestratorSettings, PipelineOrchestrator};
use careplan_pipeline::infrastructure::adapters::encryption::{AeadAlgorithm, AeadEncryption};
use careplan_pipeline::infrastructure::adapters::feature_flags::InMemoryFlagStore;
use careplan_pipeline::infrastructure::metrics::MetricsService;
use careplan_pipeline::infrastructure::runtime::stage_executor::StagePolicy;
use careplan_pipeline::infrastructure::services::DegradationManager;
use careplan_pipeline_bootstrap::shutdown::CancellationToken;
use careplan_pipeline_domain::entities::{
    ClinicalEntity, DeadLetterEntry, DeadLetterResolution, ExtractedEntities, IdempotencyOutcome,
    IdempotencyRecord, IdempotencyStatus, PipelineInput, PipelineOutput, PipelineRequestRecord, RedFlag,
    RequestError, RequestStats, RequestStatus, TemplateRecommendation,
};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::events::ProgressEvent;
use careplan_pipeline_domain::repositories::{DeadLetterRepository, IdempotencyRepository, RequestRepository};
use careplan_pipeline_domain::entities::MlService;
use careplan_pipeline_domain::services::{
    AudioIntelligenceClient, AuditService, CacheContext, CancellationFlags, CircuitState, ClaimedJob,
    DataSharingEntry, Demographics, DraftRequest, DraftResponse, EmbedRequest, EncryptionService,
    ExtractionRequest, ExtractionResponse, GeneratedDraft, JobAuditEntry, JobEnvelope, JobQueueService,
    LockService, LockToken, MlClientFactory, MlServiceCallEntry, PdfParseResponse, PdfParserClient,
    PdfValidation, PhiAccessEntry, PipelineCacheService, ProgressService, ProgressStream, QueueName,
    RagEmbeddingsClient, RecommendContextRequest, RecommendRequest, RecommendationResponse, RecommendedTemplate,
    RecommenderClient, ServiceHealthReport,
};
use careplan_pipeline_domain::value_objects::{ConditionCode, CorrelationId, IdempotencyKey, RequestId};

pub fn test_encryption() -> Arc<dyn EncryptionService> {
    Arc::new(AeadEncryption::new(
        careplan_pipeline_domain::value_objects::EncryptionKey::from_bytes(vec![9u8; 32]).unwrap(),
        AeadAlgorithm::Aes256Gcm,
    ))
}

/// The scenario-1 input.
pub fn sample_input(key: &str) -> PipelineInput {
    PipelineInput {
        visit_id: Uuid::new_v4().to_string(),
        patient_id: "P1".to_string(),
        condition_codes: vec![ConditionCode::new("E11.9").unwrap()],
        transcript_text: Some("Patient reports fatigue.".to_string()),
        audio_url: None,
        preferred_template_ids: None,
        generate_draft: Some(true),
        idempotency_key: IdempotencyKey::new(key).unwrap(),
        correlation_id: CorrelationId::new(),
        user_id: "U1".to_string(),
        user_role: "PROVIDER".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Request tracker
// ---------------------------------------------------------------------------

pub struct InMemoryRequestTracker {
    records: Mutex<HashMap<RequestId, PipelineRequestRecord>>,
    encryption: Arc<dyn EncryptionService>,
}

impl InMemoryRequestTracker {
    pub fn new(encryption: Arc<dyn EncryptionService>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            encryption,
        }
    }

    pub fn record(&self, id: RequestId) -> Option<PipelineRequestRecord> {
        self.records.lock().get(&id).cloned()
    }
}

#[async_trait]
impl RequestRepository for InMemoryRequestTracker {
    async fn create(&self, record: &PipelineRequestRecord) -> Result<(), PipelineError> {
        self.records.lock().insert(record.id, record.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: RequestId,
        status: RequestStatus,
        completed_stages: Option<&[String]>,
    ) -> Result<(), PipelineError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| PipelineError::internal("request not found"))?;
        if record.status.is_terminal() {
            return Err(PipelineError::internal("request already terminal"));
        }
        if status == RequestStatus::InProgress && record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        record.status = status;
        if let Some(stages) = completed_stages {
            record.stages_completed = stages.to_vec();
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: RequestId,
        result_encrypted: Vec<u8>,
        degraded_services: &[String],
        completed_stages: &[String],
    ) -> Result<(), PipelineError> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&id) {
            record.status = RequestStatus::Completed;
            record.result_encrypted = Some(result_encrypted);
            record.degraded_services = degraded_services.to_vec();
            record.stages_completed = completed_stages.to_vec();
            record.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail(&self, id: RequestId, error: &RequestError) -> Result<(), PipelineError> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&id) {
            record.status = RequestStatus::Failed;
            record.error = Some(error.clone());
            record.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_by_id(&self, id: RequestId) -> Result<Option<PipelineRequestRecord>, PipelineError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn get_by_visit_id(&self, visit_id: &str) -> Result<Vec<PipelineRequestRecord>, PipelineError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.visit_id == visit_id)
            .cloned()
            .collect())
    }

    async fn get_active_by_visit_id(&self, visit_id: &str) -> Result<Vec<PipelineRequestRecord>, PipelineError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.visit_id == visit_id && !r.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn get_by_user_id(&self, user_id: &str, limit: u32) -> Result<Vec<PipelineRequestRecord>, PipelineError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.user_id == user_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_decrypted_input(&self, id: RequestId) -> Result<Option<PipelineInput>, PipelineError> {
        let Some(record) = self.record(id) else { return Ok(None) };
        let plaintext = self.encryption.decrypt(&record.input_encrypted)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    async fn get_decrypted_result(&self, id: RequestId) -> Result<Option<PipelineOutput>, PipelineError> {
        let Some(record) = self.record(id) else { return Ok(None) };
        let Some(blob) = record.result_encrypted else { return Ok(None) };
        let plaintext = self.encryption.decrypt(&blob)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    async fn expire_stale(&self, max_age: Duration) -> Result<u64, PipelineError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut swept = 0;
        for record in self.records.lock().values_mut() {
            if !record.status.is_terminal() && record.created_at < cutoff {
                record.status = RequestStatus::Expired;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn clean_old(&self, max_age: Duration) -> Result<u64, PipelineError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !(r.status.is_terminal() && r.created_at < cutoff));
        Ok((before - records.len()) as u64)
    }

    async fn stats(&self) -> Result<RequestStats, PipelineError> {
        let records = self.records.lock();
        let mut stats = RequestStats {
            total: records.len() as u64,
            ..RequestStats::default()
        };
        for record in records.values() {
            match record.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::InProgress => stats.in_progress += 1,
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Failed => stats.failed += 1,
                RequestStatus::Expired => stats.expired += 1,
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Idempotency store
// ---------------------------------------------------------------------------

pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn record(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records.lock().get(key).cloned()
    }
}

#[async_trait]
impl IdempotencyRepository for InMemoryIdempotencyStore {
    async fn check_or_create(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        request_id: RequestId,
    ) -> Result<IdempotencyOutcome, PipelineError> {
        let mut records = self.records.lock();
        match records.get(key.as_str()) {
            None => {
                records.insert(
                    key.as_str().to_string(),
                    IdempotencyRecord {
                        key: key.clone(),
                        request_hash: request_hash.to_string(),
                        request_id,
                        response: None,
                        status: IdempotencyStatus::Pending,
                        created_at: Utc::now(),
                        expires_at: Utc::now() + chrono::Duration::hours(24),
                    },
                );
                Ok(IdempotencyOutcome::New)
            }
            Some(existing) if existing.request_hash != request_hash => Err(PipelineError::validation(format!(
                "IDEMPOTENCY_KEY_REUSED: key {} was used with a different request body",
                key
            ))),
            Some(existing) => match existing.status {
                IdempotencyStatus::Completed => Ok(IdempotencyOutcome::Completed(
                    existing.response.clone().unwrap_or(serde_json::Value::Null),
                )),
                IdempotencyStatus::Failed => Ok(IdempotencyOutcome::Failed(
                    existing.response.clone().unwrap_or(serde_json::Value::Null),
                )),
                IdempotencyStatus::Pending => Ok(IdempotencyOutcome::Pending(existing.request_id)),
            },
        }
    }

    async fn complete(
        &self,
        key: &IdempotencyKey,
        request_id: RequestId,
        response: &serde_json::Value,
    ) -> Result<(), PipelineError> {
        if let Some(record) = self.records.lock().get_mut(key.as_str()) {
            record.status = IdempotencyStatus::Completed;
            record.response = Some(response.clone());
            record.request_id = request_id;
        }
        Ok(())
    }

    async fn fail(
        &self,
        key: &IdempotencyKey,
        request_id: RequestId,
        error: &serde_json::Value,
    ) -> Result<(), PipelineError> {
        if let Some(record) = self.records.lock().get_mut(key.as_str()) {
            record.status = IdempotencyStatus::Failed;
            record.response = Some(error.clone());
            record.request_id = request_id;
        }
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, PipelineError> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }

    async fn find_stale_pending(&self, older_than: Duration) -> Result<Vec<IdempotencyRecord>, PipelineError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.status == IdempotencyStatus::Pending && r.created_at < cutoff)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterQueue {
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl DeadLetterRepository for InMemoryDeadLetterQueue {
    async fn add(&self, entry: &DeadLetterEntry) -> Result<Uuid, PipelineError> {
        self.entries.lock().push(entry.clone());
        Ok(entry.id)
    }

    async fn get_unresolved(&self, limit: u32) -> Result<Vec<DeadLetterEntry>, PipelineError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| !e.is_resolved())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn resolve(&self, id: Uuid, resolution: DeadLetterResolution) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id && !e.is_resolved()) {
            entry.resolved_at = Some(Utc::now());
            entry.resolution = Some(resolution);
            return Ok(true);
        }
        Ok(false)
    }

    async fn depth(&self) -> Result<u64, PipelineError> {
        Ok(self.entries.lock().iter().filter(|e| !e.is_resolved()).count() as u64)
    }

    async fn payload_for_retry(&self, id: Uuid) -> Result<Option<Vec<u8>>, PipelineError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.payload_encrypted.clone()))
    }
}

// ---------------------------------------------------------------------------
// Lock service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryLockService {
    held: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(&self, key: &str, _ttl: Duration) -> Result<Option<LockToken>, PipelineError> {
        let mut held = self.held.lock();
        if held.contains_key(key) {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        held.insert(key.to_string(), token.clone());
        Ok(Some(LockToken(token)))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, PipelineError> {
        let mut held = self.held.lock();
        if held.get(key) == Some(&token.0) {
            held.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn extend(&self, key: &str, token: &LockToken, _ttl: Duration) -> Result<bool, PipelineError> {
        Ok(self.held.lock().get(key) == Some(&token.0))
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// In-memory cache honoring the encryption-at-rest contract: extraction
/// values are stored as ciphertext and the raw bytes are exposed for
/// PHI-leak assertions.
pub struct InMemoryCache {
    extraction: Mutex<HashMap<String, Vec<u8>>>,
    recommendations: Mutex<HashMap<String, String>>,
    encryption: Arc<dyn EncryptionService>,
}

impl InMemoryCache {
    pub fn new(encryption: Arc<dyn EncryptionService>) -> Self {
        Self {
            extraction: Mutex::new(HashMap::new()),
            recommendations: Mutex::new(HashMap::new()),
            encryption,
        }
    }

    pub fn raw_extraction_bytes(&self) -> Vec<Vec<u8>> {
        self.extraction.lock().values().cloned().collect()
    }

    pub fn extraction_len(&self) -> usize {
        self.extraction.lock().len()
    }
}

#[async_trait]
impl PipelineCacheService for InMemoryCache {
    async fn get_extraction(
        &self,
        transcript: &str,
        _ctx: &CacheContext,
    ) -> Result<Option<ExtractedEntities>, PipelineError> {
        let key = careplan_pipeline::infrastructure::services::pipeline_cache::extraction_key(transcript);
        let Some(sealed) = self.extraction.lock().get(&key).cloned() else {
            return Ok(None);
        };
        let plaintext = self.encryption.decrypt(&sealed)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    async fn set_extraction(
        &self,
        transcript: &str,
        entities: &ExtractedEntities,
        _ctx: &CacheContext,
    ) -> Result<(), PipelineError> {
        let key = careplan_pipeline::infrastructure::services::pipeline_cache::extraction_key(transcript);
        let sealed = self.encryption.encrypt(&serde_json::to_vec(entities)?)?;
        self.extraction.lock().insert(key, sealed);
        Ok(())
    }

    async fn get_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        _ctx: &CacheContext,
    ) -> Result<Option<Vec<TemplateRecommendation>>, PipelineError> {
        let key = careplan_pipeline::infrastructure::services::pipeline_cache::recommendation_key(codes, demographics);
        match self.recommendations.lock().get(&key) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn set_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        recommendations: &[TemplateRecommendation],
        _ctx: &CacheContext,
    ) -> Result<(), PipelineError> {
        let key = careplan_pipeline::infrastructure::services::pipeline_cache::recommendation_key(codes, demographics);
        self.recommendations
            .lock()
            .insert(key, serde_json::to_string(recommendations)?);
        Ok(())
    }

    async fn invalidate_extraction(&self, transcript: &str, _ctx: &CacheContext) -> Result<(), PipelineError> {
        let key = careplan_pipeline::infrastructure::services::pipeline_cache::extraction_key(transcript);
        self.extraction.lock().remove(&key);
        Ok(())
    }

    async fn invalidate_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        _ctx: &CacheContext,
    ) -> Result<(), PipelineError> {
        let key = careplan_pipeline::infrastructure::services::pipeline_cache::recommendation_key(codes, demographics);
        self.recommendations.lock().remove(&key);
        Ok(())
    }

    async fn invalidate_all_phi(&self) -> Result<u64, PipelineError> {
        let mut extraction = self.extraction.lock();
        let count = extraction.len() as u64;
        extraction.clear();
        Ok(count)
    }

    async fn stats(&self) -> careplan_pipeline_domain::services::CacheStats {
        careplan_pipeline_domain::services::CacheStats::default()
    }
}

// ---------------------------------------------------------------------------
// Progress bus
// ---------------------------------------------------------------------------

pub struct ChannelProgressBus {
    channels: Mutex<HashMap<RequestId, broadcast::Sender<ProgressEvent>>>,
}

impl ChannelProgressBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, request_id: RequestId) -> broadcast::Sender<ProgressEvent> {
        self.channels
            .lock()
            .entry(request_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl ProgressService for ChannelProgressBus {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), PipelineError> {
        // Send errors just mean nobody is listening.
        let _ = self.sender(event.request_id).send(event.clone());
        Ok(())
    }

    async fn subscribe(&self, request_id: RequestId) -> Result<ProgressStream, PipelineError> {
        let mut rx = self.sender(request_id).subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingAudit {
    pub phi_access: Mutex<Vec<PhiAccessEntry>>,
    pub ml_calls: Mutex<Vec<MlServiceCallEntry>>,
    pub data_sharing: Mutex<Vec<DataSharingEntry>>,
    pub jobs: Mutex<Vec<JobAuditEntry>>,
}

#[async_trait]
impl AuditService for RecordingAudit {
    async fn log_phi_access(&self, entry: PhiAccessEntry) {
        self.phi_access.lock().push(entry);
    }

    async fn log_ml_service_call(&self, entry: MlServiceCallEntry) {
        self.ml_calls.lock().push(entry);
    }

    async fn log_data_sharing(&self, entry: DataSharingEntry) {
        self.data_sharing.lock().push(entry);
    }

    async fn log_job(&self, entry: JobAuditEntry) {
        self.jobs.lock().push(entry);
    }
}

// ---------------------------------------------------------------------------
// Cancellation flags
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryCancellationFlags {
    cancelled: Mutex<HashSet<Uuid>>,
}

#[async_trait]
impl CancellationFlags for InMemoryCancellationFlags {
    async fn request_cancel(&self, request_id: RequestId) -> Result<(), PipelineError> {
        self.cancelled.lock().insert(request_id.as_uuid());
        Ok(())
    }

    async fn is_cancelled(&self, request_id: RequestId) -> Result<bool, PipelineError> {
        Ok(self.cancelled.lock().contains(&request_id.as_uuid()))
    }

    async fn clear(&self, request_id: RequestId) -> Result<(), PipelineError> {
        self.cancelled.lock().remove(&request_id.as_uuid());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

struct QueueEntry {
    envelope: JobEnvelope,
    attempt: u32,
    ready_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    ready: Mutex<HashMap<QueueName, VecDeque<QueueEntry>>>,
    known_ids: Mutex<HashSet<String>>,
}

#[async_trait]
impl JobQueueService for InMemoryJobQueue {
    async fn enqueue(&self, queue: QueueName, envelope: JobEnvelope) -> Result<bool, PipelineError> {
        if !self.known_ids.lock().insert(envelope.job_id.clone()) {
            return Ok(false);
        }
        self.ready.lock().entry(queue).or_default().push_back(QueueEntry {
            envelope,
            attempt: 1,
            ready_at: Utc::now(),
        });
        Ok(true)
    }

    async fn claim(&self, queue: QueueName, _consumer: &str, wait: Duration) -> Result<Option<ClaimedJob>, PipelineError> {
        let deadline = tokio::time::Instant::now() + wait.min(Duration::from_millis(200));
        loop {
            {
                let mut queues = self.ready.lock();
                if let Some(entries) = queues.get_mut(&queue) {
                    let now = Utc::now();
                    if let Some(index) = entries.iter().position(|e| e.ready_at <= now) {
                        let entry = entries.remove(index).expect("indexed entry exists");
                        return Ok(Some(ClaimedJob {
                            envelope: entry.envelope,
                            attempt: entry.attempt,
                            delivery_tag: Uuid::new_v4().to_string(),
                        }));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, _queue: QueueName, _job: &ClaimedJob) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn retry_later(&self, queue: QueueName, job: &ClaimedJob, delay: Duration) -> Result<(), PipelineError> {
        self.ready.lock().entry(queue).or_default().push_back(QueueEntry {
            envelope: job.envelope.clone(),
            attempt: job.attempt + 1,
            ready_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
        });
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<u64, PipelineError> {
        Ok(self.ready.lock().get(&queue).map(|q| q.len()).unwrap_or(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// ML client stubs
// ---------------------------------------------------------------------------

/// Scriptable behavior and call counters shared by all stub clients.
pub struct StubState {
    pub extract_calls: AtomicU32,
    pub embed_calls: AtomicU32,
    pub recommend_calls: AtomicU32,
    pub recommend_context_calls: AtomicU32,
    pub draft_calls: AtomicU32,
    pub pdf_calls: AtomicU32,

    pub extraction_fails: AtomicBool,
    pub embedding_fails: AtomicBool,
    pub recommender_fails: AtomicBool,
    pub draft_fails: AtomicBool,
    pub pdf_fails: AtomicBool,

    pub extraction_red_flags: Mutex<Vec<RedFlag>>,
    pub draft_confidence: Mutex<f64>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            extract_calls: AtomicU32::new(0),
            embed_calls: AtomicU32::new(0),
            recommend_calls: AtomicU32::new(0),
            recommend_context_calls: AtomicU32::new(0),
            draft_calls: AtomicU32::new(0),
            pdf_calls: AtomicU32::new(0),
            extraction_fails: AtomicBool::new(false),
            embedding_fails: AtomicBool::new(false),
            recommender_fails: AtomicBool::new(false),
            draft_fails: AtomicBool::new(false),
            pdf_fails: AtomicBool::new(false),
            extraction_red_flags: Mutex::new(Vec::new()),
            draft_confidence: Mutex::new(0.9),
        }
    }
}

pub struct StubMlClients(pub Arc<StubState>);

struct StubAudio(Arc<StubState>);
struct StubRecommender(Arc<StubState>);
struct StubEmbeddings(Arc<StubState>);
struct StubPdf(Arc<StubState>);

#[async_trait]
impl AudioIntelligenceClient for StubAudio {
    async fn extract(&self, _request: ExtractionRequest) -> Result<ExtractionResponse, PipelineError> {
        self.0.extract_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.extraction_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::service_unavailable("audio-intelligence returned 503"));
        }
        Ok(ExtractionResponse {
            symptoms: vec![ClinicalEntity::new("fatigue", "symptom", 0.92)],
            medications: vec![],
            vitals: vec![],
            red_flags: self.0.extraction_red_flags.lock().clone(),
            nlu_tier: Some("standard".to_string()),
        })
    }
}

#[async_trait]
impl RecommenderClient for StubRecommender {
    async fn recommend(&self, request: RecommendRequest) -> Result<RecommendationResponse, PipelineError> {
        self.0.recommend_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.recommender_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::service_unavailable("careplan-recommender returned 503"));
        }
        Ok(stub_recommendations(&request.condition_codes))
    }

    async fn recommend_with_context(
        &self,
        request: RecommendContextRequest,
    ) -> Result<RecommendationResponse, PipelineError> {
        self.0.recommend_context_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.recommender_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::service_unavailable("careplan-recommender returned 503"));
        }
        Ok(stub_recommendations(&request.condition_codes))
    }

    async fn generate_draft(&self, _template_id: &str, _request: DraftRequest) -> Result<DraftResponse, PipelineError> {
        self.0.draft_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.draft_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::service_unavailable("careplan-recommender returned 503"));
        }
        Ok(DraftResponse {
            drafts: vec![GeneratedDraft {
                title: "Diabetes Management Plan".to_string(),
                goals: vec!["HbA1c below 7%".to_string(), "Daily glucose monitoring".to_string()],
                interventions: vec![
                    "Metformin review".to_string(),
                    "Nutrition counselling referral".to_string(),
                ],
                confidence_score: *self.0.draft_confidence.lock(),
            }],
        })
    }
}

fn stub_recommendations(codes: &[ConditionCode]) -> RecommendationResponse {
    RecommendationResponse {
        templates: vec![RecommendedTemplate {
            template_id: "tpl-diabetes".to_string(),
            name: "Diabetes Management".to_string(),
            confidence: 0.88,
            condition_codes: codes.iter().map(|c| c.as_str().to_string()).collect(),
            match_factors: None,
        }],
        model_version: Some("recommender-v3".to_string()),
    }
}

#[async_trait]
impl RagEmbeddingsClient for StubEmbeddings {
    async fn embed_patient_context(&self, _request: EmbedRequest) -> Result<Vec<f32>, PipelineError> {
        self.0.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.embedding_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::service_unavailable("rag-embeddings returned 503"));
        }
        Ok(vec![0.1, 0.2, 0.3])
    }
}

#[async_trait]
impl PdfParserClient for StubPdf {
    async fn parse(&self, file_key: &str) -> Result<PdfParseResponse, PipelineError> {
        self.0.pdf_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.pdf_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::service_unavailable("file not found"));
        }
        Ok(PdfParseResponse {
            care_plan: serde_json::json!({"source": file_key}),
            codes: vec!["E11.9".to_string()],
            validation: PdfValidation {
                valid: true,
                errors: vec![],
                warnings: vec![],
                file_size: 1024,
                mime_type: "application/pdf".to_string(),
            },
            confidence: 0.9,
        })
    }
}

#[async_trait]
impl MlClientFactory for StubMlClients {
    fn audio_intelligence(&self) -> Arc<dyn AudioIntelligenceClient> {
        Arc::new(StubAudio(Arc::clone(&self.0)))
    }

    fn recommender(&self) -> Arc<dyn RecommenderClient> {
        Arc::new(StubRecommender(Arc::clone(&self.0)))
    }

    fn rag_embeddings(&self) -> Arc<dyn RagEmbeddingsClient> {
        Arc::new(StubEmbeddings(Arc::clone(&self.0)))
    }

    fn pdf_parser(&self) -> Arc<dyn PdfParserClient> {
        Arc::new(StubPdf(Arc::clone(&self.0)))
    }

    async fn check_all_services(&self) -> ServiceHealthReport {
        ServiceHealthReport {
            overall: "healthy".to_string(),
            services: vec![],
            degraded_services: vec![],
        }
    }

    fn circuit_states(&self) -> HashMap<MlService, CircuitState> {
        MlService::all().into_iter().map(|s| (s, CircuitState::Closed)).collect()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub stubs: Arc<StubState>,
    pub requests: Arc<InMemoryRequestTracker>,
    pub idempotency: Arc<InMemoryIdempotencyStore>,
    pub cache: Arc<InMemoryCache>,
    pub progress: Arc<ChannelProgressBus>,
    pub audit: Arc<RecordingAudit>,
    pub cancellations: Arc<InMemoryCancellationFlags>,
    pub degradation: Arc<DegradationManager>,
    pub encryption: Arc<dyn EncryptionService>,
    pub shutdown: CancellationToken,
}

/// Wires a full orchestrator against in-memory ports with fast timings.
pub fn harness() -> Harness {
    let encryption = test_encryption();
    let stubs = Arc::new(StubState::default());
    let requests = Arc::new(InMemoryRequestTracker::new(Arc::clone(&encryption)));
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let cache = Arc::new(InMemoryCache::new(Arc::clone(&encryption)));
    let progress = Arc::new(ChannelProgressBus::new());
    let audit = Arc::new(RecordingAudit::default());
    let cancellations = Arc::new(InMemoryCancellationFlags::default());
    let degradation = Arc::new(DegradationManager::new(Arc::new(InMemoryFlagStore::default())));
    let shutdown = CancellationToken::never();

    let orchestrator = PipelineOrchestrator::builder()
        .settings(OrchestratorSettings {
            stage_policy: StagePolicy {
                timeout: Duration::from_secs(2),
                max_retries: 3,
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(4),
            },
            lock_ttl: Duration::from_secs(30),
            lock_wait_interval: Duration::from_millis(5),
            lock_wait_budget: 400,
            enable_idempotency: true,
            enable_caching: true,
        })
        .clients(Arc::new(StubMlClients(Arc::clone(&stubs))))
        .cache(Arc::clone(&cache) as Arc<dyn PipelineCacheService>)
        .idempotency(Arc::clone(&idempotency) as Arc<dyn IdempotencyRepository>)
        .requests(Arc::clone(&requests) as Arc<dyn RequestRepository>)
        .locks(Arc::new(InMemoryLockService::default()))
        .progress(Arc::clone(&progress) as Arc<dyn ProgressService>)
        .audit(Arc::clone(&audit) as Arc<dyn AuditService>)
        .degradation(Arc::clone(&degradation))
        .encryption(Arc::clone(&encryption))
        .metrics(Arc::new(MetricsService::new().expect("metrics")))
        .cancellations(Arc::clone(&cancellations) as Arc<dyn CancellationFlags>)
        .shutdown(shutdown.clone())
        .build()
        .expect("orchestrator builds");

    Harness {
        orchestrator: Arc::new(orchestrator),
        stubs,
        requests,
        idempotency,
        cache,
        progress,
        audit,
        cancellations,
        degradation,
        encryption,
        shutdown,
    }
}
