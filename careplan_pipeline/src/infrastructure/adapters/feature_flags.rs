// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Feature Flag Store
//!
//! Runtime pipeline flags, persisted in Redis at `pipeline:flags:current`
//! as a single JSON document so every process converges on the same
//! snapshot. Admin operations write through [`FlagStore::save`]; the
//! degradation manager re-reads on its refresh interval.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use careplan_pipeline_domain::error::PipelineError;

const FLAGS_KEY: &str = "pipeline:flags:current";

/// The mutable pipeline switches. All stages default on; fallback-forcing
/// defaults off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    pub enable_extraction: bool,
    pub enable_embedding: bool,
    pub enable_recommendation: bool,
    pub enable_draft_generation: bool,
    pub enable_safety_validation: bool,
    pub force_fallback_mode: bool,
    pub enable_caching: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_extraction: true,
            enable_embedding: true,
            enable_recommendation: true,
            enable_draft_generation: true,
            enable_safety_validation: true,
            force_fallback_mode: false,
            enable_caching: true,
        }
    }
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    /// The persisted snapshot, or `None` if never written.
    async fn load(&self) -> Result<Option<FeatureFlags>, PipelineError>;

    async fn save(&self, flags: &FeatureFlags) -> Result<(), PipelineError>;
}

pub struct RedisFlagStore {
    conn: ConnectionManager,
}

impl RedisFlagStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl FlagStore for RedisFlagStore {
    async fn load(&self) -> Result<Option<FeatureFlags>, PipelineError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(FLAGS_KEY)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("flag load failed: {}", e)))?;
        match raw {
            Some(json) => {
                let flags = serde_json::from_str(&json)?;
                Ok(Some(flags))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, flags: &FeatureFlags) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(flags)?;
        conn.set::<_, _, ()>(FLAGS_KEY, json)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("flag save failed: {}", e)))
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryFlagStore {
    flags: parking_lot::RwLock<Option<FeatureFlags>>,
}

#[async_trait]
impl FlagStore for InMemoryFlagStore {
    async fn load(&self) -> Result<Option<FeatureFlags>, PipelineError> {
        Ok(*self.flags.read())
    }

    async fn save(&self, flags: &FeatureFlags) -> Result<(), PipelineError> {
        *self.flags.write() = Some(*flags);
        Ok(())
    }
}
