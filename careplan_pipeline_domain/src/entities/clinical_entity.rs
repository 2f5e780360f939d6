// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Extracted Clinical Entities
//!
//! Typed projection of the audio-intelligence extraction result. Each entity
//! carries the matched text span, a type tag, a confidence in `[0, 1]`, and
//! optional coding information. The six category lists are always present;
//! categories the extraction service does not populate stay empty.

use serde::{Deserialize, Serialize};

/// One extracted span.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalEntity {
    pub text: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub length: Option<usize>,
}

impl ClinicalEntity {
    pub fn new(text: impl Into<String>, entity_type: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            entity_type: entity_type.into(),
            confidence: confidence.clamp(0.0, 1.0),
            code: None,
            code_system: None,
            offset: None,
            length: None,
        }
    }
}

/// The full extraction result grouped by clinical category. Unknown fields
/// from the wire are dropped during deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedEntities {
    #[serde(default)]
    pub symptoms: Vec<ClinicalEntity>,
    #[serde(default)]
    pub medications: Vec<ClinicalEntity>,
    #[serde(default)]
    pub vitals: Vec<ClinicalEntity>,
    #[serde(default)]
    pub procedures: Vec<ClinicalEntity>,
    #[serde(default)]
    pub diagnoses: Vec<ClinicalEntity>,
    #[serde(default)]
    pub allergies: Vec<ClinicalEntity>,
}

impl ExtractedEntities {
    /// The empty-default result used when extraction is skipped or degraded.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.symptoms.is_empty()
            && self.medications.is_empty()
            && self.vitals.is_empty()
            && self.procedures.is_empty()
            && self.diagnoses.is_empty()
            && self.allergies.is_empty()
    }

    pub fn total_count(&self) -> usize {
        self.symptoms.len()
            + self.medications.len()
            + self.vitals.len()
            + self.procedures.len()
            + self.diagnoses.len()
            + self.allergies.len()
    }
}
