// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Condition Code Value Object
//!
//! ICD-10-shaped diagnosis code: an uppercase letter, two alphanumerics, and
//! an optional dotted extension of one to four alphanumerics (`E11.9`,
//! `I10`, `M54.5`). Codes are normalized to uppercase on construction so
//! hashing and cache keys are case-insensitive.
//!
//! The three-character prefix (`E11`, `I10`) is the unit the fallback
//! recommendation table matches on; [`ConditionCode::prefix`] exposes it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::error::PipelineError;

static ICD10_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z][0-9][0-9A-Z](\.[0-9A-Z]{1,4})?$")
        .unwrap_or_else(|_| Regex::new(r"[^\s\S]").unwrap_or_else(|_| unsafe { std::hint::unreachable_unchecked() }))
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConditionCode(String);

// Deserialization must go through `new()`: every `ConditionCode` in the
// process, including those arriving as JSON from the job queue, carries the
// validated-and-normalized invariant that `prefix()` relies on.
impl<'de> Deserialize<'de> for ConditionCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ConditionCode::new(raw).map_err(serde::de::Error::custom)
    }
}

impl ConditionCode {
    /// Validates an ICD-10-shaped code, normalizing to uppercase.
    pub fn new(code: impl Into<String>) -> Result<Self, PipelineError> {
        let code = code.into().trim().to_uppercase();
        if !ICD10_SHAPE.is_match(&code) {
            return Err(PipelineError::validation(format!(
                "condition code {:?} is not ICD-10 shaped",
                code
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The three-character category prefix (`E11.9` → `E11`).
    pub fn prefix(&self) -> &str {
        &self.0[..3]
    }
}

impl Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ConditionCode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Sorts and deduplicates codes into the canonical order used by request
/// hashing and recommendation cache keys.
pub fn canonical_codes(codes: &[ConditionCode]) -> Vec<ConditionCode> {
    let mut sorted = codes.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}
