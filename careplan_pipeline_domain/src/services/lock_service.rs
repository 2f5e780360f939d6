// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Distributed Lock Port
//!
//! Mutual exclusion across processes, keyed by string. Acquisition is
//! token-based: release and TTL extension succeed only for the holder of
//! the matching token, so an expired-and-reacquired lock cannot be released
//! by its previous owner.
//!
//! The higher-order `with_lock` helper (acquire with bounded retries, run
//! the body, release on all exit paths) lives in the infrastructure layer,
//! where a timer is available for the wait interval.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::PipelineError;

/// Opaque ownership token returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

#[async_trait]
pub trait LockService: Send + Sync {
    /// Tries to take the lock once. `None` means another holder exists.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, PipelineError>;

    /// Releases if and only if `token` still owns the lock.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, PipelineError>;

    /// Extends the TTL if and only if `token` still owns the lock. Bodies
    /// that may outlive the TTL must call this before it elapses.
    async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool, PipelineError>;
}

/// Retry/wait parameters for lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub ttl: Duration,
    pub wait_interval: Duration,
    pub retries: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            wait_interval: Duration::from_millis(200),
            retries: 10,
        }
    }
}
