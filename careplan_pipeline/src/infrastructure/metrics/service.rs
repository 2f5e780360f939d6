// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Metrics Service
//!
//! Prometheus counters and histograms for the pipeline. Exposition wiring
//! is the host's concern; this service owns a private registry that the
//! host gathers from.

use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

use careplan_pipeline_domain::entities::{PipelineStage, StageStatus};
use careplan_pipeline_domain::error::PipelineError;

pub struct MetricsService {
    registry: Registry,

    requests_total: IntCounterVec,
    request_duration: Histogram,
    stage_duration: HistogramVec,
    stage_outcomes: IntCounterVec,
    retries_total: IntCounter,
    cache_operations: IntCounterVec,
    queue_depth: IntGaugeVec,
    dlq_depth: IntGauge,
    active_requests: IntGauge,
}

impl MetricsService {
    pub fn new() -> Result<Self, PipelineError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("pipeline_requests_total", "Pipeline requests by terminal status"),
            &["status"],
        )
        .map_err(Self::metric_err)?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new("pipeline_request_duration_seconds", "End-to-end request duration")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .map_err(Self::metric_err)?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new("pipeline_stage_duration_seconds", "Per-stage duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0]),
            &["stage"],
        )
        .map_err(Self::metric_err)?;

        let stage_outcomes = IntCounterVec::new(
            Opts::new("pipeline_stage_outcomes_total", "Stage results by status"),
            &["stage", "status"],
        )
        .map_err(Self::metric_err)?;

        let retries_total =
            IntCounter::with_opts(Opts::new("pipeline_retries_total", "Stage retry attempts")).map_err(Self::metric_err)?;

        let cache_operations = IntCounterVec::new(
            Opts::new("pipeline_cache_operations_total", "Cache operations by namespace and result"),
            &["namespace", "result"],
        )
        .map_err(Self::metric_err)?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("pipeline_queue_depth", "Ready plus delayed jobs per queue"),
            &["queue"],
        )
        .map_err(Self::metric_err)?;

        let dlq_depth =
            IntGauge::with_opts(Opts::new("pipeline_dlq_depth", "Unresolved dead-letter entries")).map_err(Self::metric_err)?;

        let active_requests =
            IntGauge::with_opts(Opts::new("pipeline_active_requests", "Requests currently in the orchestrator"))
                .map_err(Self::metric_err)?;

        registry
            .register(Box::new(requests_total.clone()))
            .map_err(Self::metric_err)?;
        registry
            .register(Box::new(request_duration.clone()))
            .map_err(Self::metric_err)?;
        registry
            .register(Box::new(stage_duration.clone()))
            .map_err(Self::metric_err)?;
        registry
            .register(Box::new(stage_outcomes.clone()))
            .map_err(Self::metric_err)?;
        registry
            .register(Box::new(retries_total.clone()))
            .map_err(Self::metric_err)?;
        registry
            .register(Box::new(cache_operations.clone()))
            .map_err(Self::metric_err)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(Self::metric_err)?;
        registry.register(Box::new(dlq_depth.clone())).map_err(Self::metric_err)?;
        registry
            .register(Box::new(active_requests.clone()))
            .map_err(Self::metric_err)?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            stage_duration,
            stage_outcomes,
            retries_total,
            cache_operations,
            queue_depth,
            dlq_depth,
            active_requests,
        })
    }

    fn metric_err<E: std::fmt::Display>(e: E) -> PipelineError {
        PipelineError::internal(format!("failed to build metrics: {}", e))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition for scraping by the host.
    pub fn get_metrics(&self) -> Result<String, PipelineError> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| PipelineError::internal(format!("failed to encode metrics: {}", e)))
    }

    pub fn request_started(&self) {
        self.active_requests.inc();
    }

    pub fn request_finished(&self, status: &str, duration_secs: f64) {
        self.active_requests.dec();
        self.requests_total.with_label_values(&[status]).inc();
        self.request_duration.observe(duration_secs);
    }

    pub fn record_stage(&self, stage: PipelineStage, status: StageStatus, duration_secs: f64) {
        let status_label = match status {
            StageStatus::Completed => "completed",
            StageStatus::Skipped => "skipped",
            StageStatus::Failed => "failed",
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
        };
        self.stage_duration
            .with_label_values(&[stage.as_str()])
            .observe(duration_secs);
        self.stage_outcomes
            .with_label_values(&[stage.as_str(), status_label])
            .inc();
    }

    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    pub fn record_cache(&self, namespace: &str, result: &str) {
        self.cache_operations.with_label_values(&[namespace, result]).inc();
    }

    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        self.queue_depth.with_label_values(&[queue]).set(depth as i64);
    }

    pub fn set_dlq_depth(&self, depth: u64) {
        self.dlq_depth.set(depth as i64);
    }
}
