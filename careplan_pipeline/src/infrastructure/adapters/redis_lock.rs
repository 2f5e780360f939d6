// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Redis Distributed Lock
//!
//! Token-based mutual exclusion on `lock:{key}`. Acquisition is a single
//! `SET key token NX PX ttl`; release and TTL extension are Lua scripts
//! that compare the stored token before acting, so a lock that expired and
//! was re-acquired by another process cannot be released or extended by the
//! previous holder. Scripts are loaded once and invoked by SHA thereafter
//! (`redis::Script` handles the EVALSHA/EVAL fallback).
//!
//! [`with_lock`] is the entry point used by the orchestrator: bounded-retry
//! acquisition, run the body, release on all exit paths.

use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use async_trait::async_trait;
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::services::{LockOptions, LockService, LockToken};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLock {
    conn: ConnectionManager,
    release: Script,
    extend: Script,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }

    fn lock_key(key: &str) -> String {
        format!("lock:{}", key)
    }
}

#[async_trait]
impl LockService for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, PipelineError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(Self::lock_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("lock acquire failed: {}", e)))?;
        Ok(set.map(|_| LockToken(token)))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, PipelineError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(Self::lock_key(key))
            .arg(&token.0)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("lock release failed: {}", e)))?;
        Ok(deleted == 1)
    }

    async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool, PipelineError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend
            .key(Self::lock_key(key))
            .arg(&token.0)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("lock extend failed: {}", e)))?;
        Ok(extended == 1)
    }
}

/// Runs `body` under the lock at `key`, releasing on all exit paths.
///
/// Acquisition retries up to `options.retries` times with
/// `options.wait_interval` sleeps in between; exhaustion fails with
/// `RATE_LIMITED` so callers can retry the whole operation later. A failed
/// release is tolerated; the lock then falls back to TTL expiry.
pub async fn with_lock<F, Fut, T>(
    locks: &dyn LockService,
    key: &str,
    options: LockOptions,
    body: F,
) -> Result<T, PipelineError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut token = None;
    for attempt in 0..=options.retries {
        if let Some(t) = locks.acquire(key, options.ttl).await? {
            token = Some(t);
            break;
        }
        if attempt < options.retries {
            tokio::time::sleep(options.wait_interval).await;
        }
    }
    let token = token.ok_or_else(|| {
        PipelineError::rate_limited(format!("could not acquire lock {:?} within retry budget", key))
    })?;

    let result = body().await;
    if let Err(e) = locks.release(key, &token).await {
        tracing::warn!(key, error = %e, "lock release failed; holding until TTL expiry");
    }
    result
}
