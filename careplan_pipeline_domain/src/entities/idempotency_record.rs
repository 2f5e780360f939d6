// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Idempotency Record
//!
//! One row per idempotency key. The record pins the canonical request hash
//! so a reused key with a different body is rejected, and caches the final
//! response (success or failure) so replays return the exact original bytes.
//! Records expire at most 24 hours after creation and are removed by the
//! sweeper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::idempotency_key::IdempotencyKey;
use crate::value_objects::request_id::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "PENDING",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub request_hash: String,
    pub request_id: RequestId,
    pub response: Option<serde_json::Value>,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of the atomic check-or-create against the store.
#[derive(Debug, Clone)]
pub enum IdempotencyOutcome {
    /// No prior record: this caller owns the execution.
    New,
    /// A completed record exists; the cached response must be returned as-is.
    Completed(serde_json::Value),
    /// A failed record exists; the cached error must be returned as-is.
    Failed(serde_json::Value),
    /// An execution is in flight. The owning request id lets the worker
    /// that inserted the record recognize its own row and proceed; every
    /// other caller waits and retries.
    Pending(RequestId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_and_expiry() {
        let now = Utc::now();
        let record = IdempotencyRecord {
            key: IdempotencyKey::new("K1").unwrap(),
            request_hash: "ab".repeat(32),
            request_id: RequestId::new(),
            response: None,
            status: IdempotencyStatus::Pending,
            created_at: now - chrono::Duration::seconds(30),
            expires_at: now + chrono::Duration::hours(24),
        };
        assert!(record.age(now) >= chrono::Duration::seconds(30));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + chrono::Duration::hours(25)));
    }
}
