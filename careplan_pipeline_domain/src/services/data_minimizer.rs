// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Data Minimizer
//!
//! Projects the full patient context into the minimal per-service payload
//! each ML collaborator is allowed to see, and produces the PHI-safe
//! variants used for logging and auditing.
//!
//! ## Field tables
//!
//! Two compile-time tables drive everything: an allow-list per service and
//! the set of PHI field names. The allow-lists never include a PHI field,
//! and [`DataMinimizer::project`] re-checks that property on its own output
//! before returning: a disallowed field surviving projection fails the
//! request with `PHI_LEAK_DETECTED` rather than leaking.
//!
//! The transcript is deliberately *not* in the PHI field table: it is the
//! working payload of the audio-intelligence service and is allow-listed
//! for that service alone. Logging still truncates it at 100 characters.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::audit_service::DataSharingEntry;
use crate::entities::pipeline_stage::MlService;
use crate::error::PipelineError;
use crate::value_objects::correlation_id::CorrelationId;

/// Fields each service may receive. Anything not listed is dropped.
fn allowed_fields(service: MlService) -> &'static [&'static str] {
    match service {
        MlService::AudioIntelligence => &["transcriptText", "audioUrl", "language"],
        MlService::CareplanRecommender => &["conditionCodes", "age", "sex", "symptoms", "medications"],
        MlService::RagEmbeddings => &["conditionCodes", "symptoms"],
        MlService::PdfParser => &["fileKey", "mimeType"],
    }
}

/// Field names that identify or describe a specific patient. Never shared,
/// never logged with values.
pub const PHI_FIELDS: &[&str] = &[
    "patientId",
    "patientName",
    "firstName",
    "lastName",
    "dateOfBirth",
    "ssn",
    "mrn",
    "address",
    "phone",
    "email",
    "insuranceId",
];

/// Logged transcripts are cut at this many characters.
pub const TRANSCRIPT_LOG_LIMIT: usize = 100;

/// Stateless projection and masking over JSON patient-context maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataMinimizer;

impl DataMinimizer {
    pub fn new() -> Self {
        Self
    }

    /// Projects `full_context` down to the fields `service` is allowed to
    /// see, then self-checks the result for PHI field names.
    pub fn project(
        &self,
        service: MlService,
        full_context: &Map<String, Value>,
    ) -> Result<Map<String, Value>, PipelineError> {
        let allowed = allowed_fields(service);
        let minimal: Map<String, Value> = full_context
            .iter()
            .filter(|(k, _)| allowed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // Self-check before return: no PHI field name may survive
        // projection, whatever the input looked like.
        if let Some(leaked) = minimal.keys().find(|k| PHI_FIELDS.contains(&k.as_str())) {
            return Err(PipelineError::internal(format!(
                "PHI_LEAK_DETECTED: field {:?} survived projection for {}",
                leaked, service
            )));
        }
        Ok(minimal)
    }

    /// Removes every PHI field from an arbitrary map.
    pub fn strip_phi(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .filter(|(k, _)| !PHI_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// PHI-safe rendering for log output: PHI fields become length-only
    /// placeholders, the transcript is truncated at
    /// [`TRANSCRIPT_LOG_LIMIT`] characters with a length annotation.
    pub fn mask_for_logging(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| {
                let masked = if PHI_FIELDS.contains(&k.as_str()) {
                    Value::String(format!("<redacted len={}>", value_len(v)))
                } else if k == "transcriptText" {
                    Value::String(truncate_transcript(v.as_str().unwrap_or_default()))
                } else {
                    v.clone()
                };
                (k.clone(), masked)
            })
            .collect()
    }

    /// Builds the data-sharing audit entry for a minimized payload. Field
    /// names and payload size only.
    pub fn audit_entry(
        &self,
        service: MlService,
        payload: &Map<String, Value>,
        correlation_id: CorrelationId,
    ) -> DataSharingEntry {
        let mut field_names: Vec<String> = payload.keys().cloned().collect();
        field_names.sort();
        let payload_bytes = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0);
        DataSharingEntry {
            service,
            field_names,
            payload_bytes,
            correlation_id,
            timestamp: Utc::now(),
        }
    }
}

fn value_len(v: &Value) -> usize {
    match v {
        Value::String(s) => s.chars().count(),
        other => other.to_string().len(),
    }
}

fn truncate_transcript(text: &str) -> String {
    let total = text.chars().count();
    if total <= TRANSCRIPT_LOG_LIMIT {
        text.to_string()
    } else {
        let head: String = text.chars().take(TRANSCRIPT_LOG_LIMIT).collect();
        format!("{}… ({} chars)", head, total)
    }
}

/// Convenience wrapper for tests and callers assembling a context map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientContext(pub Map<String, Value>);

#[cfg(test)]
mod tests {
    use super::*;

    fn full_context() -> Map<String, Value> {
        serde_json::from_value(serde_json::json!({
            "patientId": "P1",
            "patientName": "Jane Doe",
            "dateOfBirth": "1984-02-29",
            "conditionCodes": ["E11.9"],
            "transcriptText": "Patient reports fatigue.",
            "symptoms": ["fatigue"],
            "language": "en"
        }))
        .unwrap()
    }

    #[test]
    fn test_project_keeps_only_allowed_fields() {
        let minimal = DataMinimizer::new()
            .project(MlService::RagEmbeddings, &full_context())
            .unwrap();
        let mut keys: Vec<_> = minimal.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["conditionCodes", "symptoms"]);
    }

    #[test]
    fn test_project_never_emits_phi_fields() {
        for service in MlService::all() {
            let minimal = DataMinimizer::new().project(service, &full_context()).unwrap();
            for phi in PHI_FIELDS {
                assert!(!minimal.contains_key(*phi), "{phi} leaked for {service}");
            }
        }
    }

    #[test]
    fn test_project_allows_transcript_for_audio_only() {
        let audio = DataMinimizer::new()
            .project(MlService::AudioIntelligence, &full_context())
            .unwrap();
        assert!(audio.contains_key("transcriptText"));

        let recommender = DataMinimizer::new()
            .project(MlService::CareplanRecommender, &full_context())
            .unwrap();
        assert!(!recommender.contains_key("transcriptText"));
    }

    #[test]
    fn test_strip_phi() {
        let stripped = DataMinimizer::new().strip_phi(&full_context());
        assert!(!stripped.contains_key("patientName"));
        assert!(!stripped.contains_key("patientId"));
        assert!(stripped.contains_key("conditionCodes"));
    }

    #[test]
    fn test_mask_replaces_phi_with_length_placeholders() {
        let masked = DataMinimizer::new().mask_for_logging(&full_context());
        assert_eq!(masked["patientName"], Value::String("<redacted len=8>".into()));
        assert!(masked["conditionCodes"].is_array());
    }

    #[test]
    fn test_mask_keeps_short_transcript_whole() {
        let masked = DataMinimizer::new().mask_for_logging(&full_context());
        assert_eq!(masked["transcriptText"], Value::String("Patient reports fatigue.".into()));
    }

    #[test]
    fn test_mask_truncates_long_transcript_with_annotation() {
        let mut ctx = full_context();
        let long = "word ".repeat(60);
        ctx.insert("transcriptText".into(), Value::String(long.clone()));
        let masked = DataMinimizer::new().mask_for_logging(&ctx);
        let rendered = masked["transcriptText"].as_str().unwrap();
        assert!(rendered.len() < long.len());
        assert!(rendered.contains(&format!("({} chars)", long.chars().count())));
    }

    #[test]
    fn test_audit_entry_lists_sorted_field_names() {
        let minimizer = DataMinimizer::new();
        let payload = minimizer.project(MlService::AudioIntelligence, &full_context()).unwrap();
        let entry = minimizer.audit_entry(MlService::AudioIntelligence, &payload, CorrelationId::new());
        assert_eq!(entry.service, MlService::AudioIntelligence);
        assert!(entry.field_names.windows(2).all(|w| w[0] <= w[1]));
        assert!(entry.payload_bytes > 0);
        // Audit entries carry names, never the transcript itself.
        assert!(entry.field_names.iter().all(|f| f != "Patient reports fatigue."));
    }
}
