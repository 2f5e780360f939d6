// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Red Flags
//!
//! Structured clinical alerts surfaced in the pipeline output. Flags come
//! from three sources: the extraction service, safety validation, and the
//! system itself (when a fallback path ran). The output list is totally
//! ordered by severity, CRITICAL first; insertion order is preserved among
//! equal severities and duplicates are kept.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Severity ranking. Variant order is the sort order: CRITICAL sorts before
/// HIGH before MEDIUM before LOW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedFlagSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl Display for RedFlagSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RedFlagSeverity::Critical => "CRITICAL",
            RedFlagSeverity::High => "HIGH",
            RedFlagSeverity::Medium => "MEDIUM",
            RedFlagSeverity::Low => "LOW",
        };
        f.write_str(s)
    }
}

/// Where a flag came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedFlagSource {
    Extraction,
    SafetyValidation,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedFlag {
    pub severity: RedFlagSeverity,
    pub label: String,
    pub source: RedFlagSource,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

impl RedFlag {
    pub fn new(severity: RedFlagSeverity, label: impl Into<String>, source: RedFlagSource) -> Self {
        Self {
            severity,
            label: label.into(),
            source,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Sorts flags by severity, CRITICAL first. The sort is stable, so insertion
/// order is preserved among flags of equal severity.
pub fn sort_by_severity(flags: &mut [RedFlag]) {
    flags.sort_by_key(|f| f.severity);
}
