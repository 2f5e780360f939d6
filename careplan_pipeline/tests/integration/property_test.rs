// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Property tests for the pipeline's algebraic guarantees: canonical
//! hashing, authenticated encryption round-trips, red-flag ordering, and
//! PHI scrubbing.

use proptest::prelude::*;

use careplan_pipeline::infrastructure::adapters::encryption::{AeadAlgorithm, AeadEncryption};
use careplan_pipeline_domain::entities::{sort_by_severity, RedFlag, RedFlagSeverity, RedFlagSource};
use careplan_pipeline_domain::error::phi_scrubber::scrub_message;
use careplan_pipeline_domain::services::EncryptionService;
use careplan_pipeline_domain::value_objects::{ConditionCode, CorrelationId, EncryptionKey, IdempotencyKey};

use crate::common::sample_input;

fn code_pool() -> Vec<&'static str> {
    vec!["E11.9", "E10.1", "I10", "J44.1", "M54.5", "F32.9", "Z00.00"]
}

fn arb_codes() -> impl Strategy<Value = Vec<ConditionCode>> {
    proptest::sample::subsequence(code_pool(), 1..=5)
        .prop_shuffle()
        .prop_map(|codes| codes.into_iter().map(|c| ConditionCode::new(c).unwrap()).collect())
}

fn arb_severity() -> impl Strategy<Value = RedFlagSeverity> {
    prop_oneof![
        Just(RedFlagSeverity::Critical),
        Just(RedFlagSeverity::High),
        Just(RedFlagSeverity::Medium),
        Just(RedFlagSeverity::Low),
    ]
}

proptest! {
    #[test]
    fn prop_canonical_hash_is_order_independent(codes in arb_codes()) {
        let mut input_a = sample_input("K-prop");
        input_a.condition_codes = codes.clone();
        let mut reversed = codes.clone();
        reversed.reverse();
        let mut input_b = sample_input("K-prop");
        input_b.condition_codes = reversed;
        // Identity fields never participate in the hash.
        input_b.idempotency_key = IdempotencyKey::new("K-other").unwrap();
        input_b.correlation_id = CorrelationId::new();

        prop_assert_eq!(input_a.canonical_hash(), input_b.canonical_hash());
    }

    #[test]
    fn prop_canonical_hash_sees_body_changes(codes in arb_codes()) {
        let mut input_a = sample_input("K-prop");
        input_a.condition_codes = codes;
        let mut input_b = input_a.clone();
        input_b.transcript_text = Some("a different transcript".to_string());

        prop_assert_ne!(input_a.canonical_hash(), input_b.canonical_hash());
    }

    #[test]
    fn prop_encrypt_decrypt_round_trips(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let service = AeadEncryption::new(
            EncryptionKey::from_bytes(vec![11u8; 32]).unwrap(),
            AeadAlgorithm::Aes256Gcm,
        );
        let sealed = service.encrypt(&plaintext).unwrap();
        prop_assert_eq!(service.decrypt(&sealed).unwrap(), plaintext.clone());

        let text = service.encrypt_to_text(&plaintext).unwrap();
        prop_assert_eq!(service.decrypt_from_text(&text).unwrap(), plaintext);
    }

    #[test]
    fn prop_ciphertext_never_contains_plaintext_run(
        seed in proptest::collection::vec(any::<u8>(), 16..512)
    ) {
        let service = AeadEncryption::new(
            EncryptionKey::from_bytes(vec![12u8; 32]).unwrap(),
            AeadAlgorithm::Aes256Gcm,
        );
        let sealed = service.encrypt(&seed).unwrap();
        prop_assert!(!sealed.windows(seed.len()).any(|w| w == seed.as_slice()));
    }

    #[test]
    fn prop_red_flags_sort_by_severity(severities in proptest::collection::vec(arb_severity(), 0..32)) {
        let mut flags: Vec<RedFlag> = severities
            .iter()
            .enumerate()
            .map(|(i, s)| RedFlag::new(*s, format!("flag-{}", i), RedFlagSource::System))
            .collect();
        sort_by_severity(&mut flags);

        // Severity is non-decreasing (CRITICAL < HIGH < MEDIUM < LOW in
        // sort order), and equal severities keep insertion order.
        prop_assert!(flags.windows(2).all(|w| w[0].severity <= w[1].severity));
        for window in flags.windows(2) {
            if window[0].severity == window[1].severity {
                let a: usize = window[0].label[5..].parse().unwrap();
                let b: usize = window[1].label[5..].parse().unwrap();
                prop_assert!(a < b);
            }
        }
    }

    #[test]
    fn prop_scrubber_removes_ssn_like_sequences(prefix in "[a-z ]{0,40}", suffix in "[a-z ]{0,40}") {
        let message = format!("{}123-45-6789{}", prefix, suffix);
        let scrubbed = scrub_message(&message);
        prop_assert!(!scrubbed.contains("123-45-6789"));
    }
}
