// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Idempotency Key Value Object
//!
//! Caller-supplied opaque token binding one logical operation to exactly one
//! outcome. The key is the primary key of the idempotency store and the
//! namespace component of the processing lock, so its shape is constrained:
//! non-empty, at most 255 bytes, and free of whitespace and control
//! characters.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::error::PipelineError;

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validates and wraps a caller-supplied key.
    pub fn new(key: impl Into<String>) -> Result<Self, PipelineError> {
        let key = key.into();
        if key.is_empty() {
            return Err(PipelineError::validation("idempotency key must not be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(PipelineError::validation(format!(
                "idempotency key exceeds {} bytes",
                MAX_KEY_LEN
            )));
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(PipelineError::validation(
                "idempotency key must not contain whitespace or control characters",
            ));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for IdempotencyKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
