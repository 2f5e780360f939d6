// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Observability Service
//!
//! Lightweight operation tracking on top of the metrics service: active
//! request count, rolling error rate, and a health score operators can
//! alert on. Complements tracing; it does not replace it.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::infrastructure::metrics::service::MetricsService;

/// Error rate above this flips the health status to degraded.
const DEGRADED_ERROR_RATE: f64 = 0.05;

/// Error rate above this flips the health status to unhealthy.
const UNHEALTHY_ERROR_RATE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub active_operations: u32,
    pub total_operations: u64,
    pub error_rate: f64,
    pub uptime_seconds: u64,
}

#[derive(Debug)]
struct Tracker {
    active_operations: u32,
    total_operations: u64,
    failed_operations: u64,
}

pub struct ObservabilityService {
    metrics: Arc<MetricsService>,
    tracker: RwLock<Tracker>,
    started: Instant,
}

impl ObservabilityService {
    pub fn new(metrics: Arc<MetricsService>) -> Self {
        Self {
            metrics,
            tracker: RwLock::new(Tracker {
                active_operations: 0,
                total_operations: 0,
                failed_operations: 0,
            }),
            started: Instant::now(),
        }
    }

    /// Marks an operation started; complete the returned tracker on every
    /// path (it assumes failure if dropped without completion).
    pub fn start_operation(self: &Arc<Self>, name: &'static str) -> OperationTracker {
        {
            let mut tracker = self.tracker.write();
            tracker.active_operations += 1;
        }
        self.metrics.request_started();
        info!(operation = name, "operation started");
        OperationTracker {
            service: Arc::clone(self),
            name,
            started: Instant::now(),
            completed: false,
        }
    }

    fn complete_operation(&self, name: &'static str, success: bool, duration_secs: f64) {
        {
            let mut tracker = self.tracker.write();
            tracker.active_operations = tracker.active_operations.saturating_sub(1);
            tracker.total_operations += 1;
            if !success {
                tracker.failed_operations += 1;
            }
        }
        let status = if success { "completed" } else { "failed" };
        self.metrics.request_finished(status, duration_secs);
        if success {
            info!(operation = name, duration_secs, "operation completed");
        } else {
            warn!(operation = name, duration_secs, "operation failed");
        }
    }

    pub fn system_health(&self) -> SystemHealth {
        let tracker = self.tracker.read();
        let error_rate = if tracker.total_operations == 0 {
            0.0
        } else {
            tracker.failed_operations as f64 / tracker.total_operations as f64
        };
        let status = if error_rate >= UNHEALTHY_ERROR_RATE {
            HealthStatus::Unhealthy
        } else if error_rate >= DEGRADED_ERROR_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        SystemHealth {
            status,
            active_operations: tracker.active_operations,
            total_operations: tracker.total_operations,
            error_rate,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

/// RAII handle for one tracked operation.
pub struct OperationTracker {
    service: Arc<ObservabilityService>,
    name: &'static str,
    started: Instant,
    completed: bool,
}

impl OperationTracker {
    pub fn complete(mut self, success: bool) {
        self.completed = true;
        self.service
            .complete_operation(self.name, success, self.started.elapsed().as_secs_f64());
    }
}

impl Drop for OperationTracker {
    fn drop(&mut self) {
        if !self.completed {
            // Dropped without an explicit completion: count as a failure.
            self.service
                .complete_operation(self.name, false, self.started.elapsed().as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<ObservabilityService> {
        Arc::new(ObservabilityService::new(Arc::new(MetricsService::new().unwrap())))
    }

    #[test]
    fn test_tracks_success_and_failure() {
        let svc = service();
        svc.start_operation("process").complete(true);
        svc.start_operation("process").complete(false);

        let health = svc.system_health();
        assert_eq!(health.total_operations, 2);
        assert_eq!(health.active_operations, 0);
        assert!((health.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_dropped_tracker_counts_as_failure() {
        let svc = service();
        drop(svc.start_operation("process"));
        assert_eq!(svc.system_health().total_operations, 1);
        assert!(svc.system_health().error_rate > 0.0);
    }

    #[test]
    fn test_healthy_when_quiet() {
        let svc = service();
        assert_eq!(svc.system_health().status, HealthStatus::Healthy);
    }
}
