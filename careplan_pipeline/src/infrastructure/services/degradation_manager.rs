// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Degradation Manager
//!
//! The runtime switchboard: feature flags decide whether a stage runs at
//! all, and per-service health (fed by the ML client layer) decides whether
//! a stage goes straight to its fallback instead of calling out.
//!
//! Flags live in Redis so multiple processes converge; a periodic refresher
//! re-reads them at the configured interval (0 disables). Readers always
//! see a consistent snapshot: the flag map is copied out under a read lock
//! per call.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use careplan_pipeline_bootstrap::shutdown::CancellationToken;
use careplan_pipeline_domain::entities::pipeline_stage::{MlService, PipelineStage, ServiceCriticality};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::services::CircuitState;

use crate::infrastructure::adapters::feature_flags::{FeatureFlags, FlagStore};

/// Health snapshot for one ML service, updated by the client layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub last_check: DateTime<Utc>,
    pub error_rate: f64,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            circuit_state: CircuitState::Closed,
            failure_count: 0,
            last_check: Utc::now(),
            error_rate: 0.0,
        }
    }
}

/// Operator-facing summary of the current degradation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradationSummary {
    pub flags: FeatureFlags,
    pub services: HashMap<String, ServiceHealth>,
    pub unhealthy_services: Vec<MlService>,
}

pub struct DegradationManager {
    flags: RwLock<FeatureFlags>,
    health: RwLock<HashMap<MlService, ServiceHealth>>,
    store: Arc<dyn FlagStore>,
}

impl DegradationManager {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self {
            flags: RwLock::new(FeatureFlags::default()),
            health: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Current flag snapshot.
    pub fn flags(&self) -> FeatureFlags {
        *self.flags.read()
    }

    /// Replaces the flag snapshot and persists it for other processes.
    pub async fn update_flags(&self, flags: FeatureFlags) -> Result<(), PipelineError> {
        self.store.save(&flags).await?;
        *self.flags.write() = flags;
        Ok(())
    }

    /// Re-reads the persisted snapshot. Missing snapshot keeps the current
    /// in-memory flags.
    pub async fn refresh_from_store(&self) -> Result<(), PipelineError> {
        if let Some(flags) = self.store.load().await? {
            *self.flags.write() = flags;
        }
        Ok(())
    }

    /// Spawns the periodic flag refresher. `interval` of zero disables it.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        if interval.is_zero() {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = manager.refresh_from_store().await {
                            tracing::warn!(error = %e, "feature flag refresh failed");
                        }
                    }
                }
            }
        });
    }

    /// False iff force-fallback mode is on or the stage's flag is off.
    /// Validation and safety validation are CRITICAL and always execute.
    pub fn should_execute_stage(&self, stage: PipelineStage) -> bool {
        let flags = self.flags();
        match stage {
            // CRITICAL local stages always run; enable_safety_validation
            // only gates the optional service pass inside the stage.
            PipelineStage::Validation | PipelineStage::SafetyValidation => true,
            _ if flags.force_fallback_mode => false,
            PipelineStage::EntityExtraction => flags.enable_extraction,
            PipelineStage::EmbeddingGeneration => flags.enable_embedding,
            PipelineStage::TemplateRecommendation => flags.enable_recommendation,
            PipelineStage::DraftGeneration => flags.enable_draft_generation,
            _ => true,
        }
    }

    /// True iff the safety-validation service pass is enabled.
    pub fn safety_service_enabled(&self) -> bool {
        let flags = self.flags();
        flags.enable_safety_validation && !flags.force_fallback_mode
    }

    /// Caching can be disabled globally at runtime.
    pub fn caching_enabled(&self) -> bool {
        self.flags().enable_caching
    }

    /// True iff force-mode is on, the service is unhealthy, or its circuit
    /// breaker is open.
    pub fn should_use_fallback(&self, service: MlService) -> bool {
        if self.flags().force_fallback_mode {
            return true;
        }
        let health = self.health.read();
        match health.get(&service) {
            Some(h) => !h.healthy || h.circuit_state == CircuitState::Open,
            None => false,
        }
    }

    /// Records a health observation from the ML client layer.
    pub fn record_health(&self, service: MlService, health: ServiceHealth) {
        self.health.write().insert(service, health);
    }

    /// Convenience: mark a service failed/recovered after a call outcome.
    pub fn record_call_outcome(&self, service: MlService, success: bool) {
        let mut map = self.health.write();
        let entry = map.entry(service).or_default();
        if success {
            entry.healthy = true;
            entry.failure_count = 0;
            entry.circuit_state = CircuitState::Closed;
        } else {
            entry.failure_count += 1;
            if entry.failure_count >= 3 {
                entry.healthy = false;
                entry.circuit_state = CircuitState::Open;
            }
        }
        entry.last_check = Utc::now();
    }

    /// Aborting criticality check: CRITICAL services failing hard abort the
    /// pipeline; others degrade.
    pub fn is_critical(service: MlService) -> bool {
        service.criticality() == ServiceCriticality::Critical
    }

    pub fn degradation_summary(&self) -> DegradationSummary {
        let health = self.health.read().clone();
        let unhealthy = health
            .iter()
            .filter(|(_, h)| !h.healthy || h.circuit_state == CircuitState::Open)
            .map(|(s, _)| *s)
            .collect();
        DegradationSummary {
            flags: self.flags(),
            services: health.iter().map(|(s, h)| (s.as_str().to_string(), h.clone())).collect(),
            unhealthy_services: unhealthy,
        }
    }
}
