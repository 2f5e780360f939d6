// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # PHI Scrubber
//!
//! One-way sanitization of free-form text before it leaves the pipeline in an
//! error message, a log line, or a dead-letter record. Every
//! [`PipelineError`](super::PipelineError) constructor routes its message
//! through [`scrub_message`], so downstream code never has to remember to
//! sanitize.
//!
//! ## Patterns
//!
//! The scrubber removes, in order:
//!
//! - **SSNs**: `123-45-6789` and bare nine-digit runs
//! - **Dates**: ISO (`2025-03-01`) and US (`3/1/2025`) forms
//! - **Emails**: `user@example.com`
//! - **Phone numbers**: ten-digit sequences with optional separators
//! - **Medical record numbers**: `MRN: 12345678` style markers
//! - **Names**: two adjacent capitalized words
//!
//! Matches are replaced with `[REDACTED]` and the result is truncated at 500
//! characters. Ordering matters: SSN and date patterns run before the phone
//! pattern so a dashed SSN is not half-consumed as a phone number.

use once_cell::sync::Lazy;
use regex::Regex;

/// Hard cap on a sanitized message, annotation included. Longer messages
/// are cut at a char boundary and end with [`TRUNCATION_SUFFIX`].
pub const MAX_MESSAGE_LEN: usize = 500;

const TRUNCATION_SUFFIX: &str = "… (truncated)";

const REDACTED: &str = "[REDACTED]";

// Compiled once at startup and reused for all scrubbing operations.
//
// Note: these patterns are known-good at compile time. If compilation fails,
// we fall back to a regex that matches nothing rather than panicking. The
// fallback pattern `[^\s\S]` matches nothing (neither whitespace nor
// non-whitespace).
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern)
        .unwrap_or_else(|_| Regex::new(r"[^\s\S]").unwrap_or_else(|_| unsafe { std::hint::unreachable_unchecked() }))
}

static SSN_DASHED: Lazy<Regex> = Lazy::new(|| compile(r"\b\d{3}-\d{2}-\d{4}\b"));
static SSN_BARE: Lazy<Regex> = Lazy::new(|| compile(r"\b\d{9}\b"));
static DATE_ISO: Lazy<Regex> = Lazy::new(|| compile(r"\b\d{4}-\d{2}-\d{2}\b"));
static DATE_US: Lazy<Regex> = Lazy::new(|| compile(r"\b\d{1,2}/\d{1,2}/\d{2,4}\b"));
static EMAIL: Lazy<Regex> = Lazy::new(|| compile(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"));
static PHONE: Lazy<Regex> = Lazy::new(|| compile(r"\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b"));
static MRN: Lazy<Regex> = Lazy::new(|| compile(r"(?i)\bMRN[:\s#]*\d{5,12}\b"));
static NAME_PAIR: Lazy<Regex> = Lazy::new(|| compile(r"\b[A-Z][a-z]+ [A-Z][a-z]+\b"));

/// Scrubs PHI-shaped substrings out of `message` and truncates the result.
///
/// Deterministic and idempotent: scrubbing an already-scrubbed message is a
/// no-op (modulo truncation).
pub fn scrub_message(message: &str) -> String {
    let mut scrubbed = message.to_string();
    // Date and SSN patterns must run before the phone pattern.
    for pattern in [
        &*SSN_DASHED,
        &*SSN_BARE,
        &*DATE_ISO,
        &*DATE_US,
        &*EMAIL,
        &*PHONE,
        &*MRN,
        &*NAME_PAIR,
    ] {
        scrubbed = pattern.replace_all(&scrubbed, REDACTED).into_owned();
    }
    truncate_message(&scrubbed)
}

/// Truncates `message` so the result, annotation included, never exceeds
/// [`MAX_MESSAGE_LEN`] bytes. Cuts respect char boundaries.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    // Reserve room for the suffix so the cap holds for the final string.
    let mut cut = MAX_MESSAGE_LEN - TRUNCATION_SUFFIX.len();
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &message[..cut], TRUNCATION_SUFFIX)
}
