// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Exactly-once semantics over the idempotency key: concurrent duplicates
//! collapse to one execution, replays return the original bytes, and key
//! reuse with a different body is rejected.

use std::sync::atomic::Ordering;

use careplan_pipeline_domain::entities::IdempotencyStatus;
use careplan_pipeline_domain::repositories::IdempotencyRepository;
use careplan_pipeline_domain::value_objects::{ConditionCode, RequestId};

use crate::common::{harness, sample_input};

#[tokio::test]
async fn test_concurrent_duplicates_execute_once_with_identical_outputs() {
    let h = harness();
    let input = sample_input("K-dup");

    let a = {
        let orchestrator = h.orchestrator.clone();
        let input = input.clone();
        tokio::spawn(async move { orchestrator.process(input).await })
    };
    let b = {
        let orchestrator = h.orchestrator.clone();
        let input = input.clone();
        tokio::spawn(async move { orchestrator.process(input).await })
    };

    let out_a = a.await.unwrap().expect("caller A succeeds");
    let out_b = b.await.unwrap().expect("caller B succeeds");

    // The ML clients ran exactly once in total.
    assert_eq!(h.stubs.extract_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.stubs.recommend_context_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.stubs.draft_calls.load(Ordering::SeqCst), 1);

    // Both callers see byte-identical outputs.
    assert_eq!(
        serde_json::to_value(&out_a).unwrap(),
        serde_json::to_value(&out_b).unwrap()
    );

    // Exactly one COMPLETED idempotency row.
    assert_eq!(h.idempotency.len(), 1);
    assert_eq!(
        h.idempotency.record("K-dup").unwrap().status,
        IdempotencyStatus::Completed
    );
}

#[tokio::test]
async fn test_sequential_replay_returns_cached_response() {
    let h = harness();
    let input = sample_input("K-replay");

    let first = h.orchestrator.process(input.clone()).await.unwrap();
    let second = h.orchestrator.process(input).await.unwrap();

    assert_eq!(h.stubs.extract_calls.load(Ordering::SeqCst), 1, "no second execution");
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
}

#[tokio::test]
async fn test_key_reuse_with_different_body_is_rejected() {
    let h = harness();
    let input = sample_input("K-reuse");
    let original = h.orchestrator.process(input.clone()).await.unwrap();
    let calls_after_first = h.stubs.extract_calls.load(Ordering::SeqCst);

    // Same key, different condition codes.
    let mut attack = input.clone();
    attack.condition_codes = vec![ConditionCode::new("E10.9").unwrap()];
    let err = h.orchestrator.process(attack).await.unwrap_err();

    assert!(err.message.contains("IDEMPOTENCY_KEY_REUSED"), "got: {}", err.message);
    assert_eq!(
        h.stubs.extract_calls.load(Ordering::SeqCst),
        calls_after_first,
        "no new ML calls"
    );

    // The original record is unchanged.
    let record = h.idempotency.record("K-reuse").unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    let cached: careplan_pipeline_domain::entities::PipelineOutput =
        serde_json::from_value(record.response.unwrap()).unwrap();
    assert_eq!(cached.request_id, original.request_id);
}

#[tokio::test]
async fn test_previously_failed_key_replays_the_stored_error() {
    let h = harness();
    let input = sample_input("K-failed");

    // Seed a FAILED record for the key, as a prior run would have left it.
    let owner = RequestId::new();
    h.idempotency
        .check_or_create(&input.idempotency_key, &input.canonical_hash(), owner)
        .await
        .unwrap();
    let stored = serde_json::to_value(
        careplan_pipeline_domain::error::PipelineError::service_unavailable("recommender was down"),
    )
    .unwrap();
    h.idempotency.fail(&input.idempotency_key, owner, &stored).await.unwrap();

    let err = h.orchestrator.process(input).await.unwrap_err();
    assert!(err.message.contains("recommender was down"));
    assert_eq!(h.stubs.extract_calls.load(Ordering::SeqCst), 0, "no execution happened");
}
