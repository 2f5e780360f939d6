// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Configuration
//!
//! The full configuration surface of the service, loaded from an optional
//! TOML file overlaid with `CAREPLAN_`-prefixed environment variables
//! (`CAREPLAN_STAGE_TIMEOUT_MS=10000`, `CAREPLAN_ENCRYPTION_KEY_HEX=…`).
//! Every knob has the documented default; `validate()` runs once at boot
//! and rejects configurations the pipeline cannot operate under.
//!
//! The encryption key is configuration-supplied (64 hex chars → 32 bytes)
//! and required; there is no insecure default.

pub mod config_defaults {
    pub const MAX_RETRIES: u32 = 3;
    pub const STAGE_TIMEOUT_MS: u64 = 30_000;
    pub const CACHE_DEFAULT_TTL_SECS: u64 = 300;
    pub const CACHE_PHI_MAX_TTL_SECS: u64 = 3_600;
    pub const IDEMPOTENCY_EXPIRATION_HOURS: u64 = 24;
    pub const WORKER_GENERATION_CONCURRENCY: usize = 5;
    pub const WORKER_PDF_CONCURRENCY: usize = 3;
    pub const RATE_LIMIT_PER_SEC: u32 = 10;
    pub const LOCK_DEFAULT_TTL_MS: u64 = 300_000;
    pub const FLAG_REFRESH_MS: u64 = 0;
    pub const BACKOFF_BASE_MS: u64 = 100;
    pub const BACKOFF_CAP_MS: u64 = 10_000;
    pub const SUBSCRIPTION_IDLE_TIMEOUT_SECS: u64 = 300;
    pub const GENERATION_JOB_ATTEMPTS: u32 = 3;
    pub const PDF_JOB_ATTEMPTS: u32 = 2;
    pub const DB_MAX_CONNECTIONS: u32 = 10;
}

use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::value_objects::EncryptionKey;

use super::adapters::encryption::AeadAlgorithm;
use config_defaults as defaults;

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Retry and timeout behavior
    pub max_retries: u32,
    pub stage_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,

    // Feature toggles (boot defaults; runtime state lives in the flag store)
    pub enable_caching: bool,
    pub enable_idempotency: bool,

    // Cache TTLs
    pub cache_default_ttl_secs: u64,
    pub cache_phi_max_ttl_secs: u64,
    pub cache_refresh_beta: f64,

    // Idempotency
    pub idempotency_expiration_hours: u64,

    // Workers
    pub worker_generation_concurrency: usize,
    pub worker_pdf_concurrency: usize,
    pub rate_limit_per_sec: u32,
    pub generation_job_attempts: u32,
    pub pdf_job_attempts: u32,

    // Locks and subscriptions
    pub lock_default_ttl_ms: u64,
    pub subscription_idle_timeout_secs: u64,

    // Flag refresher (0 disables)
    pub flag_refresh_ms: u64,

    // Connections
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,

    // Encryption
    /// 64 hex characters (32 bytes). Required.
    pub encryption_key_hex: String,
    pub encryption_algorithm: AeadAlgorithm,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            stage_timeout_ms: defaults::STAGE_TIMEOUT_MS,
            backoff_base_ms: defaults::BACKOFF_BASE_MS,
            backoff_cap_ms: defaults::BACKOFF_CAP_MS,
            enable_caching: true,
            enable_idempotency: true,
            cache_default_ttl_secs: defaults::CACHE_DEFAULT_TTL_SECS,
            cache_phi_max_ttl_secs: defaults::CACHE_PHI_MAX_TTL_SECS,
            cache_refresh_beta: 1.0,
            idempotency_expiration_hours: defaults::IDEMPOTENCY_EXPIRATION_HOURS,
            worker_generation_concurrency: defaults::WORKER_GENERATION_CONCURRENCY,
            worker_pdf_concurrency: defaults::WORKER_PDF_CONCURRENCY,
            rate_limit_per_sec: defaults::RATE_LIMIT_PER_SEC,
            generation_job_attempts: defaults::GENERATION_JOB_ATTEMPTS,
            pdf_job_attempts: defaults::PDF_JOB_ATTEMPTS,
            lock_default_ttl_ms: defaults::LOCK_DEFAULT_TTL_MS,
            subscription_idle_timeout_secs: defaults::SUBSCRIPTION_IDLE_TIMEOUT_SECS,
            flag_refresh_ms: defaults::FLAG_REFRESH_MS,
            database_url: "postgres://localhost/careplan".to_string(),
            database_max_connections: defaults::DB_MAX_CONNECTIONS,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            encryption_key_hex: String::new(),
            encryption_algorithm: AeadAlgorithm::Aes256Gcm,
        }
    }
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("max_retries", &self.max_retries)
            .field("stage_timeout_ms", &self.stage_timeout_ms)
            .field("enable_caching", &self.enable_caching)
            .field("enable_idempotency", &self.enable_idempotency)
            .field("worker_generation_concurrency", &self.worker_generation_concurrency)
            .field("worker_pdf_concurrency", &self.worker_pdf_concurrency)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("encryption_key_hex", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl PipelineConfig {
    /// Loads from `path` (optional file) overlaid with `CAREPLAN_*`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, PipelineError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("CAREPLAN"))
            .build()
            .map_err(|e| PipelineError::validation(format!("configuration load failed: {}", e)))?;
        let config: PipelineConfig = settings
            .try_deserialize()
            .map_err(|e| PipelineError::validation(format!("configuration is malformed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Boot-time sanity checks.
    pub fn validate(&self) -> Result<(), PipelineError> {
        // Fails unless the key decodes to exactly 32 bytes.
        self.encryption_key()?;
        if self.stage_timeout_ms == 0 {
            return Err(PipelineError::validation("stage_timeout_ms must be positive"));
        }
        if self.worker_generation_concurrency == 0 || self.worker_pdf_concurrency == 0 {
            return Err(PipelineError::validation("worker concurrency must be positive"));
        }
        if self.rate_limit_per_sec == 0 {
            return Err(PipelineError::validation("rate_limit_per_sec must be positive"));
        }
        if self.generation_job_attempts == 0 || self.pdf_job_attempts == 0 {
            return Err(PipelineError::validation("job attempts must be positive"));
        }
        if self.cache_refresh_beta < 0.0 {
            return Err(PipelineError::validation("cache_refresh_beta must be non-negative"));
        }
        Ok(())
    }

    pub fn encryption_key(&self) -> Result<EncryptionKey, PipelineError> {
        EncryptionKey::from_hex(&self.encryption_key_hex)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_default_ttl_ms)
    }

    pub fn subscription_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.subscription_idle_timeout_secs)
    }

    pub fn flag_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.flag_refresh_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key() -> PipelineConfig {
        PipelineConfig {
            encryption_key_hex: "ab".repeat(32),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stage_timeout_ms, 30_000);
        assert_eq!(config.cache_default_ttl_secs, 300);
        assert_eq!(config.cache_phi_max_ttl_secs, 3_600);
        assert_eq!(config.idempotency_expiration_hours, 24);
        assert_eq!(config.worker_generation_concurrency, 5);
        assert_eq!(config.worker_pdf_concurrency, 3);
        assert_eq!(config.rate_limit_per_sec, 10);
        assert_eq!(config.lock_default_ttl_ms, 300_000);
        assert_eq!(config.flag_refresh_ms, 0);
    }

    #[test]
    fn test_validate_requires_key() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_err());
        assert!(with_key().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = PipelineConfig {
            stage_timeout_ms: 0,
            ..with_key()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_document_parses() {
        let document = r#"
            stage_timeout_ms = 10000
            rate_limit_per_sec = 25
            encryption_key_hex = "0000000000000000000000000000000000000000000000000000000000000000"
        "#;
        let config: PipelineConfig = ::toml::from_str(document).unwrap();
        assert_eq!(config.stage_timeout_ms, 10_000);
        assert_eq!(config.rate_limit_per_sec, 25);
        // Unspecified fields keep their defaults.
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }
}
