// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Draft Care Plan
//!
//! The generated draft surfaced in the pipeline output. Drafts below the
//! review threshold are marked `requires_review`; the flag is derived at
//! construction so it can never drift from the confidence value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Draft confidence below this requires clinician review.
pub const REVIEW_CONFIDENCE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarePlanDraft {
    pub id: Uuid,
    pub title: String,
    pub condition_codes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub template_id: Option<String>,
    pub goals: Vec<String>,
    pub interventions: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub confidence: f64,
    pub requires_review: bool,
}

impl CarePlanDraft {
    pub fn new(
        title: impl Into<String>,
        condition_codes: Vec<String>,
        goals: Vec<String>,
        interventions: Vec<String>,
        confidence: f64,
    ) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            condition_codes,
            template_id: None,
            goals,
            interventions,
            generated_at: Utc::now(),
            confidence,
            requires_review: confidence < REVIEW_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_template_id(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }
}
