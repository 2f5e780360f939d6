// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Request Identifier Value Object
//!
//! Type-safe identifier for a pipeline request. A fresh `RequestId` is
//! assigned by the orchestrator for every accepted request and threads
//! through the request tracker, the job queue (as the queue-level
//! deduplication id), progress channels, and audit entries.
//!
//! UUIDv4-backed: request ids are system-generated and carry no ordering
//! semantics; chronological queries go through `created_at` timestamps on
//! the persisted record instead.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

use crate::error::PipelineError;

/// Strongly-typed pipeline request identifier.
///
/// Cannot be confused with visit or correlation identifiers at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh random request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID (e.g. loaded from the database).
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses from the canonical hyphenated string form.
    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PipelineError::validation(format!("invalid request id: {}", e)))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<RequestId> for Uuid {
    fn from(id: RequestId) -> Self {
        id.0
    }
}
