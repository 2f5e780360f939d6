// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Fallback Generators
//!
//! Deterministic stand-ins used when an ML service is down or bypassed.
//! Every fallback is deliberately conservative: low confidence, a
//! `[FALLBACK]` marker in the reasoning, and a red flag where clinical
//! judgment is being substituted.

use careplan_pipeline_domain::entities::{
    CarePlanDraft, ExtractedEntities, RedFlag, RedFlagSeverity, RedFlagSource, TemplateRecommendation,
};
use careplan_pipeline_domain::value_objects::ConditionCode;

/// Empty extraction result for a degraded audio-intelligence service.
pub fn empty_extraction() -> ExtractedEntities {
    ExtractedEntities::empty()
}

/// The manual-review flag attached whenever extraction degrades.
pub fn manual_review_flag() -> RedFlag {
    RedFlag::new(
        RedFlagSeverity::Medium,
        "Manual review required: entity extraction unavailable",
        RedFlagSource::System,
    )
    .with_detail("Clinical entities could not be extracted from the transcript; review the visit notes directly.")
}

/// The conservative flag attached when safety validation cannot run.
pub fn safety_unavailable_flag() -> RedFlag {
    RedFlag::new(
        RedFlagSeverity::High,
        "Safety validation unavailable",
        RedFlagSource::System,
    )
    .with_detail("Automated safety checks did not run; treat all recommendations as unreviewed.")
}

/// Marker flag recorded when fallback recommendations substitute for the
/// recommender service.
pub fn fallback_recommendations_flag() -> RedFlag {
    RedFlag::new(
        RedFlagSeverity::Low,
        "Recommendations generated from fallback template table",
        RedFlagSource::System,
    )
}

/// One row of the code-prefix fallback table.
struct PrefixTemplate {
    prefixes: &'static [&'static str],
    template_id: &'static str,
    title: &'static str,
    confidence: f64,
}

const PREFIX_TABLE: &[PrefixTemplate] = &[
    PrefixTemplate {
        prefixes: &["E10", "E11"],
        template_id: "fallback-diabetes",
        title: "Diabetes Management",
        confidence: 0.5,
    },
    PrefixTemplate {
        prefixes: &["I10", "I11"],
        template_id: "fallback-hypertension",
        title: "Hypertension Management",
        confidence: 0.5,
    },
    PrefixTemplate {
        prefixes: &["J44", "J45"],
        template_id: "fallback-respiratory",
        title: "Respiratory Care",
        confidence: 0.4,
    },
    PrefixTemplate {
        prefixes: &["M54", "M79"],
        template_id: "fallback-pain",
        title: "Pain Management",
        confidence: 0.4,
    },
    PrefixTemplate {
        prefixes: &["F32", "F33"],
        template_id: "fallback-depression",
        title: "Depression Care",
        confidence: 0.4,
    },
];

const GENERAL_TEMPLATE_ID: &str = "fallback-general";

/// Code-prefix lookup producing conservative template stubs. Codes sharing
/// a template collapse into one recommendation; unmatched codes fall back
/// to the general template.
pub fn fallback_recommendations(codes: &[ConditionCode]) -> Vec<TemplateRecommendation> {
    let mut recommendations: Vec<TemplateRecommendation> = Vec::new();
    let mut unmatched: Vec<String> = Vec::new();

    for code in codes {
        let row = PREFIX_TABLE.iter().find(|row| row.prefixes.contains(&code.prefix()));
        match row {
            Some(row) => {
                if let Some(existing) = recommendations.iter_mut().find(|r| r.template_id == row.template_id) {
                    existing.matched_conditions.push(code.as_str().to_string());
                } else {
                    recommendations.push(
                        TemplateRecommendation::new(row.template_id, row.title, row.confidence)
                            .with_matched_conditions(vec![code.as_str().to_string()])
                            .with_reasoning(format!("[FALLBACK] matched condition prefix {}", code.prefix())),
                    );
                }
            }
            None => unmatched.push(code.as_str().to_string()),
        }
    }

    if recommendations.is_empty() || !unmatched.is_empty() {
        recommendations.push(
            TemplateRecommendation::new(GENERAL_TEMPLATE_ID, "General Care Plan", 0.3)
                .with_matched_conditions(unmatched)
                .with_reasoning("[FALLBACK] no specific template for these condition codes"),
        );
    }
    recommendations
}

/// Minimal two-goal / two-intervention draft when draft generation must be
/// substituted entirely.
pub fn minimal_draft(codes: &[ConditionCode], template_id: Option<&str>) -> CarePlanDraft {
    let mut draft = CarePlanDraft::new(
        "Preliminary Care Plan (requires clinician completion)",
        codes.iter().map(|c| c.as_str().to_string()).collect(),
        vec![
            "Stabilize presenting conditions".to_string(),
            "Schedule clinician follow-up within 7 days".to_string(),
        ],
        vec![
            "Review current medications and adjust per clinical judgment".to_string(),
            "Document patient-reported symptoms at next encounter".to_string(),
        ],
        0.3,
    );
    if let Some(template_id) = template_id {
        draft = draft.with_template_id(template_id);
    }
    draft
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(raw: &[&str]) -> Vec<ConditionCode> {
        raw.iter().map(|c| ConditionCode::new(*c).unwrap()).collect()
    }

    #[test]
    fn test_prefix_table_maps_known_categories() {
        let recs = fallback_recommendations(&codes(&["E11.9"]));
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].template_id, "fallback-diabetes");
        assert!(recs[0].reasoning.as_ref().unwrap().starts_with("[FALLBACK]"));
        assert!(recs[0].confidence >= 0.3 && recs[0].confidence <= 0.5);
    }

    #[test]
    fn test_sibling_prefixes_share_template() {
        let recs = fallback_recommendations(&codes(&["E10.1", "E11.9"]));
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].matched_conditions.len(), 2);
    }

    #[test]
    fn test_unknown_codes_get_general_template() {
        let recs = fallback_recommendations(&codes(&["Z00.00"]));
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].template_id, GENERAL_TEMPLATE_ID);
        assert_eq!(recs[0].confidence, 0.3);
    }

    #[test]
    fn test_mixed_codes_get_specific_plus_general() {
        let recs = fallback_recommendations(&codes(&["I10", "Z00.00"]));
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].template_id, "fallback-hypertension");
        assert_eq!(recs[1].template_id, GENERAL_TEMPLATE_ID);
    }

    #[test]
    fn test_minimal_draft_shape() {
        let draft = minimal_draft(&codes(&["E11.9"]), Some("fallback-diabetes"));
        assert_eq!(draft.goals.len(), 2);
        assert_eq!(draft.interventions.len(), 2);
        assert!(draft.requires_review);
        assert_eq!(draft.template_id.as_deref(), Some("fallback-diabetes"));
    }

    #[test]
    fn test_flags() {
        assert_eq!(manual_review_flag().severity, RedFlagSeverity::Medium);
        assert_eq!(safety_unavailable_flag().severity, RedFlagSeverity::High);
        assert_eq!(fallback_recommendations_flag().severity, RedFlagSeverity::Low);
    }
}
