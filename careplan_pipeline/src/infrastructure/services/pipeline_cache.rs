// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Cache
//!
//! Redis-backed implementation of the two cache namespaces:
//!
//! - `pipeline:extraction:{sha256(transcript)}`: PHI. Values are
//!   AEAD-encrypted before they reach Redis; TTL is capped at one hour no
//!   matter what configuration says.
//! - `pipeline:recommendation:{sha256(codes|demographics)}`: non-PHI,
//!   plaintext JSON, configurable TTL (default 300 s).
//!
//! The recommendation key always carries a demographic segment; when age
//! and sex are both absent the segment is the literal `none`, so the two
//! key forms cannot collide.
//!
//! ## Stampede protection
//!
//! Two mechanisms compose:
//!
//! - [`RequestCoalescer`]: a process-local map of in-flight computations.
//!   Concurrent callers for the same key await the first caller's result
//!   instead of issuing duplicate backend work.
//! - Probabilistic early refresh: a hit is demoted to a miss with
//!   probability `exp(-β · ttl_remaining / max_ttl)`. The chance rises as
//!   the entry ages, so recomputation is spread out instead of cliffing at
//!   expiry.
//!
//! Every operation emits a cache audit record (16-hex-char key hash, no key
//! material) on the `audit` tracing target and bumps the stats counters.

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use async_trait::async_trait;
use careplan_pipeline_domain::entities::ExtractedEntities;
use careplan_pipeline_domain::entities::TemplateRecommendation;
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::services::{
    CacheAuditRecord, CacheContext, CacheStats, Demographics, EncryptionService, PipelineCacheService,
    PHI_MAX_TTL_SECS,
};
use careplan_pipeline_domain::value_objects::{canonical_codes, ConditionCode};

/// Cache tuning knobs, resolved from the pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// Recommendation namespace TTL.
    pub default_ttl_secs: u64,
    /// Extraction namespace TTL; clamped to [`PHI_MAX_TTL_SECS`].
    pub phi_ttl_secs: u64,
    /// Early-refresh steepness. Zero disables early refresh.
    pub refresh_beta: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            phi_ttl_secs: PHI_MAX_TTL_SECS,
            refresh_beta: 1.0,
        }
    }
}

impl CacheSettings {
    /// Extraction TTL after the PHI cap.
    pub fn effective_phi_ttl(&self) -> u64 {
        self.phi_ttl_secs.min(PHI_MAX_TTL_SECS)
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `pipeline:extraction:{hash(transcript)}`
pub fn extraction_key(transcript: &str) -> String {
    format!("pipeline:extraction:{}", sha256_hex(transcript.as_bytes()))
}

/// `pipeline:recommendation:{hash(sorted codes | age bucket | sex)}`
pub fn recommendation_key(codes: &[ConditionCode], demographics: &Demographics) -> String {
    let codes = canonical_codes(codes);
    let joined: String = codes.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(",");
    let demo_part = demographic_segment(demographics);
    format!(
        "pipeline:recommendation:{}",
        sha256_hex(format!("{}|{}", joined, demo_part).as_bytes())
    )
}

/// Demographic key segment: `40-49/M`, `none/F`, or the literal `none` when
/// both components are absent.
fn demographic_segment(demographics: &Demographics) -> String {
    if demographics.is_empty() {
        return "none".to_string();
    }
    let age = match demographics.age {
        Some(age) => {
            let lo = (age / 10) * 10;
            format!("{}-{}", lo, lo + 9)
        }
        None => "none".to_string(),
    };
    let sex = match demographics.sex {
        Some(careplan_pipeline_domain::services::Sex::M) => "M",
        Some(careplan_pipeline_domain::services::Sex::F) => "F",
        None => "none",
    };
    format!("{}/{}", age, sex)
}

/// Early-refresh decision: `true` demotes a hit to a miss so the caller
/// recomputes and rewrites before expiry.
pub fn should_refresh_early(ttl_remaining_secs: i64, max_ttl_secs: u64, beta: f64) -> bool {
    if beta <= 0.0 || max_ttl_secs == 0 || ttl_remaining_secs < 0 {
        return false;
    }
    let probability = (-beta * ttl_remaining_secs as f64 / max_ttl_secs as f64).exp();
    rand::random::<f64>() < probability
}

// ---------------------------------------------------------------------------
// Coalescer
// ---------------------------------------------------------------------------

type Slot<V> = watch::Receiver<Option<Result<V, PipelineError>>>;

/// Process-local single-flight map. The first caller for a key runs the
/// computation; concurrent callers for the same key await its result.
pub struct RequestCoalescer<V: Clone + Send + Sync + 'static> {
    inflight: Mutex<HashMap<String, Slot<V>>>,
}

impl<V: Clone + Send + Sync + 'static> Default for RequestCoalescer<V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> RequestCoalescer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, compute: F) -> Result<V, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, PipelineError>>,
    {
        enum Role<V> {
            Leader(watch::Sender<Option<Result<V, PipelineError>>>),
            Follower(Slot<V>),
        }

        let role = {
            let mut map = self.inflight.lock().await;
            match map.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let result = compute().await;
                let _ = tx.send(Some(result.clone()));
                self.inflight.lock().await.remove(key);
                result
            }
            Role::Follower(mut rx) => loop {
                let current = rx.borrow().clone();
                if let Some(result) = current {
                    return result;
                }
                if rx.changed().await.is_err() {
                    // Leader died without publishing; clear the stale slot
                    // so the next caller becomes leader.
                    self.inflight.lock().await.remove(key);
                    return Err(PipelineError::internal("coalesced computation abandoned"));
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Redis cache
// ---------------------------------------------------------------------------

pub struct RedisPipelineCache {
    conn: ConnectionManager,
    encryption: Arc<dyn EncryptionService>,
    settings: CacheSettings,
    stats: SyncMutex<CacheStats>,
}

impl RedisPipelineCache {
    pub fn new(conn: ConnectionManager, encryption: Arc<dyn EncryptionService>, settings: CacheSettings) -> Self {
        Self {
            conn,
            encryption,
            settings,
            stats: SyncMutex::new(CacheStats::default()),
        }
    }

    fn audit(&self, operation: &str, key: &str, success: bool, contains_phi: bool, ctx: &CacheContext) {
        // Key material never appears in audit output; the hash suffix of
        // the namespaced key is truncated to 16 hex chars.
        let key_hash: String = key.rsplit(':').next().unwrap_or_default().chars().take(16).collect();
        let record = CacheAuditRecord {
            operation: operation.to_string(),
            key_hash,
            success,
            contains_phi,
            timestamp: Utc::now(),
            correlation_id: ctx.correlation_id,
        };
        tracing::info!(
            target: "audit",
            operation = %record.operation,
            key_hash = %record.key_hash,
            success = record.success,
            contains_phi = record.contains_phi,
            correlation_id = %record.correlation_id,
            "cache access"
        );
    }

    async fn read_with_ttl(&self, key: &str) -> Result<(Option<String>, i64), PipelineError> {
        let mut conn = self.conn.clone();
        let (value, ttl): (Option<String>, i64) = redis::pipe()
            .get(key)
            .ttl(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("cache read failed: {}", e)))?;
        Ok((value, ttl))
    }

    async fn write(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("cache write failed: {}", e)))
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("cache delete failed: {}", e)))
    }
}

#[async_trait]
impl PipelineCacheService for RedisPipelineCache {
    async fn get_extraction(
        &self,
        transcript: &str,
        ctx: &CacheContext,
    ) -> Result<Option<ExtractedEntities>, PipelineError> {
        let key = extraction_key(transcript);
        let (value, ttl) = match self.read_with_ttl(&key).await {
            Ok(v) => v,
            Err(e) => {
                self.stats.lock().errors += 1;
                self.audit("get_extraction", &key, false, true, ctx);
                return Err(e);
            }
        };

        let Some(ciphertext) = value else {
            self.stats.lock().extraction_misses += 1;
            self.audit("get_extraction", &key, true, true, ctx);
            return Ok(None);
        };

        if should_refresh_early(ttl, self.settings.effective_phi_ttl(), self.settings.refresh_beta) {
            let mut stats = self.stats.lock();
            stats.early_refreshes += 1;
            stats.extraction_misses += 1;
            drop(stats);
            self.audit("get_extraction", &key, true, true, ctx);
            return Ok(None);
        }

        let plaintext = self.encryption.decrypt_from_text(&ciphertext)?;
        let entities: ExtractedEntities = serde_json::from_slice(&plaintext)?;
        self.stats.lock().extraction_hits += 1;
        self.audit("get_extraction", &key, true, true, ctx);
        Ok(Some(entities))
    }

    async fn set_extraction(
        &self,
        transcript: &str,
        entities: &ExtractedEntities,
        ctx: &CacheContext,
    ) -> Result<(), PipelineError> {
        let key = extraction_key(transcript);
        let plaintext = serde_json::to_vec(entities)?;
        let ciphertext = self.encryption.encrypt_to_text(&plaintext)?;
        let result = self.write(&key, ciphertext, self.settings.effective_phi_ttl()).await;
        if result.is_err() {
            self.stats.lock().errors += 1;
        }
        self.audit("set_extraction", &key, result.is_ok(), true, ctx);
        result
    }

    async fn get_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        ctx: &CacheContext,
    ) -> Result<Option<Vec<TemplateRecommendation>>, PipelineError> {
        let key = recommendation_key(codes, demographics);
        let (value, ttl) = match self.read_with_ttl(&key).await {
            Ok(v) => v,
            Err(e) => {
                self.stats.lock().errors += 1;
                self.audit("get_recommendations", &key, false, false, ctx);
                return Err(e);
            }
        };

        let Some(json) = value else {
            self.stats.lock().recommendation_misses += 1;
            self.audit("get_recommendations", &key, true, false, ctx);
            return Ok(None);
        };

        if should_refresh_early(ttl, self.settings.default_ttl_secs, self.settings.refresh_beta) {
            let mut stats = self.stats.lock();
            stats.early_refreshes += 1;
            stats.recommendation_misses += 1;
            drop(stats);
            self.audit("get_recommendations", &key, true, false, ctx);
            return Ok(None);
        }

        let recommendations: Vec<TemplateRecommendation> = serde_json::from_str(&json)?;
        self.stats.lock().recommendation_hits += 1;
        self.audit("get_recommendations", &key, true, false, ctx);
        Ok(Some(recommendations))
    }

    async fn set_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        recommendations: &[TemplateRecommendation],
        ctx: &CacheContext,
    ) -> Result<(), PipelineError> {
        let key = recommendation_key(codes, demographics);
        let json = serde_json::to_string(recommendations)?;
        let result = self.write(&key, json, self.settings.default_ttl_secs).await;
        if result.is_err() {
            self.stats.lock().errors += 1;
        }
        self.audit("set_recommendations", &key, result.is_ok(), false, ctx);
        result
    }

    async fn invalidate_extraction(&self, transcript: &str, ctx: &CacheContext) -> Result<(), PipelineError> {
        let key = extraction_key(transcript);
        let result = self.delete(&key).await;
        self.stats.lock().invalidations += 1;
        self.audit("invalidate_extraction", &key, result.is_ok(), true, ctx);
        result
    }

    async fn invalidate_recommendations(
        &self,
        codes: &[ConditionCode],
        demographics: &Demographics,
        ctx: &CacheContext,
    ) -> Result<(), PipelineError> {
        let key = recommendation_key(codes, demographics);
        let result = self.delete(&key).await;
        self.stats.lock().invalidations += 1;
        self.audit("invalidate_recommendations", &key, result.is_ok(), false, ctx);
        result
    }

    async fn invalidate_all_phi(&self) -> Result<u64, PipelineError> {
        let mut scan_conn = self.conn.clone();
        let keys: Vec<String> = {
            let mut iter = scan_conn
                .scan_match::<_, String>("pipeline:extraction:*")
                .await
                .map_err(|e| PipelineError::service_unavailable(format!("cache scan failed: {}", e)))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .del(keys)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("cache purge failed: {}", e)))?;
        self.stats.lock().invalidations += removed;
        Ok(removed)
    }

    async fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_extraction_key_shape() {
        let key = extraction_key("Patient reports fatigue.");
        assert!(key.starts_with("pipeline:extraction:"));
        assert_eq!(key.len(), "pipeline:extraction:".len() + 64);
        assert_eq!(key, extraction_key("Patient reports fatigue."));
    }

    #[test]
    fn test_recommendation_key_is_code_order_independent() {
        let a = vec![
            ConditionCode::new("I10").unwrap(),
            ConditionCode::new("E11.9").unwrap(),
        ];
        let b = vec![
            ConditionCode::new("E11.9").unwrap(),
            ConditionCode::new("I10").unwrap(),
        ];
        let demo = Demographics::default();
        assert_eq!(recommendation_key(&a, &demo), recommendation_key(&b, &demo));
    }

    #[test]
    fn test_recommendation_key_demographic_segments() {
        let codes = vec![ConditionCode::new("E11.9").unwrap()];
        let none = Demographics::default();
        let aged = Demographics {
            age: Some(54),
            sex: None,
        };
        let full = Demographics {
            age: Some(54),
            sex: Some(careplan_pipeline_domain::services::Sex::F),
        };
        let k_none = recommendation_key(&codes, &none);
        let k_aged = recommendation_key(&codes, &aged);
        let k_full = recommendation_key(&codes, &full);
        assert_ne!(k_none, k_aged);
        assert_ne!(k_aged, k_full);
        // Same decade bucket hashes identically.
        let same_bucket = Demographics {
            age: Some(57),
            sex: None,
        };
        assert_eq!(k_aged, recommendation_key(&codes, &same_bucket));
    }

    #[test]
    fn test_early_refresh_probability_shape() {
        // A fresh entry essentially never refreshes; an expiring one
        // essentially always does.
        let fresh = (0..200).filter(|_| should_refresh_early(3600, 3600, 8.0)).count();
        let dying = (0..200).filter(|_| should_refresh_early(1, 3600, 8.0)).count();
        assert!(fresh < 10, "fresh entries refreshed {fresh}/200 times");
        assert!(dying > 150, "dying entries refreshed only {dying}/200 times");
    }

    #[test]
    fn test_early_refresh_disabled_by_zero_beta() {
        assert!(!should_refresh_early(0, 3600, 0.0));
    }

    #[test]
    fn test_phi_ttl_is_capped() {
        let settings = CacheSettings {
            phi_ttl_secs: 86_400,
            ..CacheSettings::default()
        };
        assert_eq!(settings.effective_phi_ttl(), PHI_MAX_TTL_SECS);
    }

    #[tokio::test]
    async fn test_coalescer_runs_computation_once() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("key", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(7u32)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_coalescer_propagates_leader_error() {
        let coalescer = RequestCoalescer::<u32>::new();
        let result = coalescer
            .run("key", || async { Err(PipelineError::service_unavailable("503")) })
            .await;
        assert!(result.is_err());
        // Slot cleared: the next computation runs fresh.
        let ok = coalescer.run("key", || async { Ok(1u32) }).await;
        assert_eq!(ok.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_coalescer_distinct_keys_run_independently() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());
        let a = coalescer.run("a", || async { Ok(1u32) }).await.unwrap();
        let b = coalescer.run("b", || async { Ok(2u32) }).await.unwrap();
        assert_eq!((a, b), (1, 2));
    }
}
