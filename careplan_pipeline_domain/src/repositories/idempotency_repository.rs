// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Idempotency Store Port
//!
//! The atomic check-or-create is the heart of exactly-once semantics: one
//! insert-with-on-conflict decides whether a caller owns the execution or
//! observes someone else's. The decision table:
//!
//! | Existing row | Hash matches | Status | Outcome |
//! |---|---|---|---|
//! | none | any | any | `New` (row inserted as PENDING) |
//! | yes | yes | COMPLETED | `Completed` with cached response |
//! | yes | yes | FAILED | `Failed` with cached error |
//! | yes | yes | PENDING | `Pending` (wait-and-retry) |
//! | yes | no | any | error `IDEMPOTENCY_KEY_REUSED` |
//!
//! With the atomic insert the "PENDING and age < 1 s ⇒ the inserter itself"
//! row of the original table collapses into `New`: the inserter knows it
//! owns the row because its insert succeeded, and every other observer of a
//! PENDING row waits regardless of age.

use async_trait::async_trait;
use std::time::Duration;

use crate::entities::idempotency_record::{IdempotencyOutcome, IdempotencyRecord};
use crate::error::PipelineError;
use crate::value_objects::idempotency_key::IdempotencyKey;
use crate::value_objects::request_id::RequestId;

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Atomically inserts a PENDING record or classifies the existing one.
    /// A hash mismatch fails with `IDEMPOTENCY_KEY_REUSED`.
    async fn check_or_create(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        request_id: RequestId,
    ) -> Result<IdempotencyOutcome, PipelineError>;

    /// Stores the successful response and flips the record to COMPLETED.
    async fn complete(
        &self,
        key: &IdempotencyKey,
        request_id: RequestId,
        response: &serde_json::Value,
    ) -> Result<(), PipelineError>;

    /// Stores the error payload and flips the record to FAILED.
    async fn fail(
        &self,
        key: &IdempotencyKey,
        request_id: RequestId,
        error: &serde_json::Value,
    ) -> Result<(), PipelineError>;

    /// Deletes records past `expires_at`. Returns the number removed.
    async fn sweep_expired(&self) -> Result<u64, PipelineError>;

    /// PENDING records older than `older_than`, for operator alerts.
    async fn find_stale_pending(&self, older_than: Duration) -> Result<Vec<IdempotencyRecord>, PipelineError>;
}
