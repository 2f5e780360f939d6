// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Worker pool behavior over the in-memory queue: successful jobs complete
//! their tracker records, and jobs that exhaust their attempts become
//! dead-letter entries with the tracker FAILED.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use careplan_pipeline::application::services::job_handlers::{GenerationJobHandler, PdfImportJobHandler};
use careplan_pipeline::infrastructure::runtime::worker::WorkerPool;
use careplan_pipeline_bootstrap::shutdown::CancellationToken;
use careplan_pipeline_domain::entities::{JobType, PipelineRequestRecord, RequestStatus};
use careplan_pipeline_domain::repositories::{DeadLetterRepository, RequestRepository};
use careplan_pipeline_domain::services::{
    GenerationJobPayload, JobEnvelope, JobQueueService, MlClientFactory, PdfImportJobPayload, QueueName,
};
use careplan_pipeline_domain::value_objects::RequestId;

use crate::common::{harness, sample_input, InMemoryDeadLetterQueue, InMemoryJobQueue, StubMlClients};

macro_rules! wait_until {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }};
}

#[tokio::test]
async fn test_pdf_job_exhausting_attempts_lands_in_dlq() {
    let h = harness();
    h.stubs.pdf_fails.store(true, Ordering::SeqCst);

    let queue = Arc::new(InMemoryJobQueue::default());
    let dead_letters = Arc::new(InMemoryDeadLetterQueue::default());
    let shutdown = CancellationToken::never();
    let factory = StubMlClients(Arc::clone(&h.stubs));

    let request_id = RequestId::new();
    let input = sample_input("K-pdf");
    let sealed = h.encryption.encrypt(&serde_json::to_vec(&input).unwrap()).unwrap();
    h.requests
        .create(&PipelineRequestRecord::accepted(
            request_id,
            input.visit_id.clone(),
            input.patient_id.clone(),
            input.user_id.clone(),
            input.idempotency_key.clone(),
            sealed,
        ))
        .await
        .unwrap();

    let pool = Arc::new(WorkerPool {
        queue_name: QueueName::PdfImport,
        concurrency: 1,
        queue: Arc::clone(&queue) as Arc<dyn JobQueueService>,
        handler: Arc::new(PdfImportJobHandler::new(
            factory.pdf_parser(),
            h.requests.clone() as Arc<dyn RequestRepository>,
            h.encryption.clone(),
        )),
        requests: h.requests.clone() as Arc<dyn RequestRepository>,
        dead_letters: Arc::clone(&dead_letters) as Arc<dyn DeadLetterRepository>,
        audit: h.audit.clone() as Arc<dyn careplan_pipeline_domain::services::AuditService>,
        encryption: h.encryption.clone(),
        rate_limiter: None,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(2),
        shutdown: shutdown.clone(),
    });

    let payload = PdfImportJobPayload {
        request_id,
        file_key: "uploads/missing.pdf".to_string(),
    };
    // attempts = 2 = max attempts for the PDF pool.
    let envelope = JobEnvelope::new(
        request_id.to_string(),
        JobType::ImportPdf,
        serde_json::to_value(&payload).unwrap(),
        2,
    );
    queue.enqueue(QueueName::PdfImport, envelope).await.unwrap();

    let handles = pool.spawn();
    wait_until!(dead_letters.depth().await.unwrap_or(0) == 1);
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    // Both attempts ran, then the job dead-lettered unresolved.
    assert_eq!(h.stubs.pdf_calls.load(Ordering::SeqCst), 2);
    let entries = dead_letters.entries();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.job_type, JobType::ImportPdf);
    assert_eq!(entry.attempts, 2);
    assert!(entry.resolved_at.is_none());

    // The tracker record failed with the import code.
    let record = h.requests.record(request_id).unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
    assert_eq!(record.error.unwrap().code, "IMPORT_ERROR");
}

#[tokio::test]
async fn test_generation_job_completes_through_worker() {
    let h = harness();
    let queue = Arc::new(InMemoryJobQueue::default());
    let dead_letters = Arc::new(InMemoryDeadLetterQueue::default());
    let shutdown = CancellationToken::never();

    let request_id = RequestId::new();
    let input = sample_input("K-worker");
    let sealed = h.encryption.encrypt(&serde_json::to_vec(&input).unwrap()).unwrap();
    h.requests
        .create(&PipelineRequestRecord::accepted(
            request_id,
            input.visit_id.clone(),
            input.patient_id.clone(),
            input.user_id.clone(),
            input.idempotency_key.clone(),
            sealed,
        ))
        .await
        .unwrap();

    let pool = Arc::new(WorkerPool {
        queue_name: QueueName::Generation,
        concurrency: 2,
        queue: Arc::clone(&queue) as Arc<dyn JobQueueService>,
        handler: Arc::new(GenerationJobHandler::new(h.orchestrator.clone())),
        requests: h.requests.clone() as Arc<dyn RequestRepository>,
        dead_letters: Arc::clone(&dead_letters) as Arc<dyn DeadLetterRepository>,
        audit: h.audit.clone() as Arc<dyn careplan_pipeline_domain::services::AuditService>,
        encryption: h.encryption.clone(),
        rate_limiter: None,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(2),
        shutdown: shutdown.clone(),
    });

    let payload = GenerationJobPayload {
        request_id,
        input: input.clone(),
    };
    let envelope = JobEnvelope::new(
        request_id.to_string(),
        JobType::GeneratePlan,
        serde_json::to_value(&payload).unwrap(),
        3,
    );
    queue.enqueue(QueueName::Generation, envelope).await.unwrap();

    let handles = pool.spawn();
    wait_until!(h
        .requests
        .record(request_id)
        .map(|r| r.status == RequestStatus::Completed)
        .unwrap_or(false));
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    let record = h.requests.record(request_id).unwrap();
    record.check_invariants().unwrap();
    assert!(dead_letters.entries().is_empty());

    // Job lifecycle audit entries were published.
    let jobs = h.audit.jobs.lock();
    assert!(jobs.iter().any(|j| j.event == "STARTED"));
    assert!(jobs.iter().any(|j| j.event == "COMPLETED"));
}
