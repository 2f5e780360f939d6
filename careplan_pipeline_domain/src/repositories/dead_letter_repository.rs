// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Dead-letter queue port: the durable store of jobs that exhausted their
//! retries, awaiting operator resolution.

use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::dead_letter::{DeadLetterEntry, DeadLetterResolution};
use crate::error::PipelineError;

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// Persists an entry, returning its id.
    async fn add(&self, entry: &DeadLetterEntry) -> Result<Uuid, PipelineError>;

    /// Oldest-first unresolved entries.
    async fn get_unresolved(&self, limit: u32) -> Result<Vec<DeadLetterEntry>, PipelineError>;

    /// Marks an entry resolved. Returns `false` if unknown or already
    /// resolved.
    async fn resolve(&self, id: Uuid, resolution: DeadLetterResolution) -> Result<bool, PipelineError>;

    /// Number of unresolved entries.
    async fn depth(&self) -> Result<u64, PipelineError>;

    /// The encrypted payload of an entry, for operator-driven retry.
    async fn payload_for_retry(&self, id: Uuid) -> Result<Option<Vec<u8>>, PipelineError>;
}
