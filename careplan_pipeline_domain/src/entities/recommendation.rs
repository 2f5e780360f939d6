// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Care-plan template recommendations, ordered best-first as returned by the
//! recommender (or by the fallback table when the recommender is down).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRecommendation {
    pub template_id: String,
    pub title: String,
    pub confidence: f64,
    pub matched_conditions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub guideline_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub evidence_grade: Option<String>,
}

impl TemplateRecommendation {
    pub fn new(template_id: impl Into<String>, title: impl Into<String>, confidence: f64) -> Self {
        Self {
            template_id: template_id.into(),
            title: title.into(),
            confidence: confidence.clamp(0.0, 1.0),
            matched_conditions: Vec::new(),
            reasoning: None,
            guideline_source: None,
            evidence_grade: None,
        }
    }

    pub fn with_matched_conditions(mut self, conditions: Vec<String>) -> Self {
        self.matched_conditions = conditions;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}
