// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Input
//!
//! The immutable per-request input. Validation is the first (CRITICAL)
//! pipeline stage: an invalid input aborts before any external call.
//!
//! ## Canonical hashing
//!
//! The idempotency store enforces "same key ⇒ same request body" by
//! comparing SHA-256 hashes of the canonical form: object keys in fixed
//! lexicographic order, condition codes sorted and deduplicated, absent
//! optionals omitted entirely, and the `generate_draft` default (`true`)
//! materialized. Two inputs that differ only in field order or code order
//! hash identically; any semantic difference changes the hash.
//!
//! The idempotency key, correlation id, and user identity are **excluded**
//! from the hash: it binds the clinical payload only, while key collisions
//! are caught by the key itself being the store's primary key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::value_objects::condition_code::{canonical_codes, ConditionCode};
use crate::value_objects::correlation_id::CorrelationId;
use crate::value_objects::idempotency_key::IdempotencyKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInput {
    pub visit_id: String,
    pub patient_id: String,
    pub condition_codes: Vec<ConditionCode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transcript_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub preferred_template_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub generate_draft: Option<bool>,
    pub idempotency_key: IdempotencyKey,
    pub correlation_id: CorrelationId,
    pub user_id: String,
    pub user_role: String,
}

impl PipelineInput {
    /// Validates the input shape. Failures are FATAL (`VALIDATION_FAILED`).
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.visit_id.trim().is_empty() {
            return Err(PipelineError::validation("visit id must not be empty"));
        }
        if self.patient_id.trim().is_empty() {
            return Err(PipelineError::validation("patient id must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(PipelineError::validation("user id must not be empty"));
        }
        if self.condition_codes.is_empty() {
            return Err(PipelineError::validation("at least one condition code is required"));
        }
        if let Some(transcript) = &self.transcript_text {
            if transcript.trim().is_empty() {
                return Err(PipelineError::validation("transcript text, when present, must not be blank"));
            }
        }
        Ok(())
    }

    /// Drafting defaults to on; only an explicit `false` disables it.
    pub fn wants_draft(&self) -> bool {
        self.generate_draft.unwrap_or(true)
    }

    /// True when the input carries PHI (currently: a transcript).
    pub fn contains_phi(&self) -> bool {
        self.transcript_text.is_some()
    }

    /// Names of the PHI-bearing fields actually present, for the PHI-access
    /// audit entry. Field *names* only, never values.
    pub fn phi_fields_present(&self) -> Vec<&'static str> {
        let mut fields = vec!["patientId"];
        if self.transcript_text.is_some() {
            fields.push("transcriptText");
        }
        if self.audio_url.is_some() {
            fields.push("audioUrl");
        }
        fields
    }

    /// SHA-256 hex digest of the canonical request body.
    pub fn canonical_hash(&self) -> String {
        let canonical = self.canonical_json();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    // Canonical form: fixed field order, sorted codes, absent optionals
    // omitted, generate_draft default materialized.
    fn canonical_json(&self) -> String {
        let mut map = serde_json::Map::new();
        let codes: Vec<serde_json::Value> = canonical_codes(&self.condition_codes)
            .iter()
            .map(|c| serde_json::Value::String(c.as_str().to_string()))
            .collect();
        if let Some(url) = &self.audio_url {
            map.insert("audioUrl".into(), serde_json::Value::String(url.clone()));
        }
        map.insert("conditionCodes".into(), serde_json::Value::Array(codes));
        map.insert("generateDraft".into(), serde_json::Value::Bool(self.wants_draft()));
        map.insert("patientId".into(), serde_json::Value::String(self.patient_id.clone()));
        if let Some(ids) = &self.preferred_template_ids {
            let mut sorted = ids.clone();
            sorted.sort();
            map.insert(
                "preferredTemplateIds".into(),
                serde_json::Value::Array(sorted.into_iter().map(serde_json::Value::String).collect()),
            );
        }
        if let Some(text) = &self.transcript_text {
            map.insert("transcriptText".into(), serde_json::Value::String(text.clone()));
        }
        map.insert("visitId".into(), serde_json::Value::String(self.visit_id.clone()));
        // serde_json::Map preserves insertion order; keys above are inserted
        // lexicographically.
        serde_json::Value::Object(map).to_string()
    }
}
