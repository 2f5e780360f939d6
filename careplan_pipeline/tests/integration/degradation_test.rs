// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Partial-failure behavior: degraded services keep the request alive with
//! machine-readable markers, fallbacks substitute for dead services, and
//! cancellation aborts at the next stage boundary.

use std::sync::atomic::Ordering;

use careplan_pipeline::infrastructure::adapters::feature_flags::FeatureFlags;
use careplan_pipeline_domain::entities::{
    MlService, PipelineRequestRecord, RedFlagSeverity, RequestStatus,
};
use careplan_pipeline_domain::repositories::RequestRepository;
use careplan_pipeline_domain::services::CancellationFlags;
use careplan_pipeline_domain::value_objects::{ConditionCode, RequestId};

use crate::common::{harness, sample_input};

#[tokio::test]
async fn test_extraction_unavailable_degrades_with_manual_review() {
    let h = harness();
    h.stubs.extraction_fails.store(true, Ordering::SeqCst);

    let output = h.orchestrator.process(sample_input("K-degraded")).await.unwrap();

    // max_retries = 3 ⇒ exactly four attempts before the error is final.
    assert_eq!(h.stubs.extract_calls.load(Ordering::SeqCst), 4);

    let entities = output.extracted_entities.as_ref().expect("empty-default entities");
    assert!(entities.is_empty());

    let manual_review: Vec<_> = output
        .red_flags
        .iter()
        .filter(|f| f.severity == RedFlagSeverity::Medium && f.label.to_lowercase().contains("manual review"))
        .collect();
    assert_eq!(manual_review.len(), 1);

    assert!(output.degraded_services.contains(&MlService::AudioIntelligence));
    assert!(!output.recommendations.is_empty(), "recommendation still produced");
    assert!(output.draft_care_plan.is_some(), "draft still produced");
    assert!(output.requires_manual_review);
}

#[tokio::test]
async fn test_embedding_failure_switches_to_condition_only_matching() {
    let h = harness();
    h.stubs.embedding_fails.store(true, Ordering::SeqCst);

    let output = h.orchestrator.process(sample_input("K-embed")).await.unwrap();

    // Condition-only endpoint used instead of the context endpoint.
    assert_eq!(h.stubs.recommend_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.stubs.recommend_context_calls.load(Ordering::SeqCst), 0);
    assert!(output.degraded_services.contains(&MlService::RagEmbeddings));
    assert!(!output.requires_manual_review, "embedding loss alone is not reviewable");
}

#[tokio::test]
async fn test_recommender_down_uses_code_prefix_fallback_table() {
    let h = harness();
    h.stubs.recommender_fails.store(true, Ordering::SeqCst);

    let mut input = sample_input("K-fallback");
    input.condition_codes = vec![
        ConditionCode::new("E11.9").unwrap(),
        ConditionCode::new("Z00.00").unwrap(),
    ];
    let output = h.orchestrator.process(input).await.unwrap();

    let ids: Vec<&str> = output.recommendations.iter().map(|r| r.template_id.as_str()).collect();
    assert!(ids.contains(&"fallback-diabetes"));
    assert!(ids.contains(&"fallback-general"));
    for rec in &output.recommendations {
        assert!(rec.confidence <= 0.5);
        assert!(rec.reasoning.as_deref().unwrap_or_default().starts_with("[FALLBACK]"));
    }
    assert!(output.degraded_services.contains(&MlService::CareplanRecommender));
}

#[tokio::test]
async fn test_draft_failure_returns_recommendations_only() {
    let h = harness();
    h.stubs.draft_fails.store(true, Ordering::SeqCst);

    let output = h.orchestrator.process(sample_input("K-draftless")).await.unwrap();

    assert!(output.draft_care_plan.is_none());
    assert!(!output.recommendations.is_empty());
    assert!(output.degraded_services.contains(&MlService::CareplanRecommender));
}

#[tokio::test]
async fn test_force_fallback_mode_bypasses_every_service() {
    let h = harness();
    let mut flags = FeatureFlags::default();
    flags.force_fallback_mode = true;
    h.degradation.update_flags(flags).await.unwrap();

    let output = h.orchestrator.process(sample_input("K-forced")).await.unwrap();

    assert_eq!(h.stubs.extract_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.stubs.embed_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.stubs.recommend_context_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.stubs.draft_calls.load(Ordering::SeqCst), 0);

    assert!(output.extracted_entities.is_none(), "extraction skipped outright");
    assert!(!output.recommendations.is_empty(), "fallback table still answers");
    assert!(output.draft_care_plan.is_none());
}

#[tokio::test]
async fn test_cancellation_flag_aborts_at_next_stage_boundary() {
    let h = harness();
    let input = sample_input("K-cancelled");
    let request_id = RequestId::new();
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

    h.cancellations.request_cancel(request_id).await.unwrap();

    let err = h.orchestrator.process_assigned(request_id, input).await.unwrap_err();
    assert!(err.message.contains("cancelled"));
    let record = h.requests.record(request_id).unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
}
