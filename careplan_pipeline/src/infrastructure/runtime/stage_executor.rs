// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Executor
//!
//! The timeout/retry envelope around every stage body. One call to
//! [`StageExecutor::run`] gives a stage:
//!
//! - a per-attempt deadline (default 30 s): the body races a timer, and a
//!   lost race classifies as `TIMEOUT`;
//! - bounded retries with exponential backoff for retryable categories,
//!   exactly `max_retries + 1` attempts before the error is final;
//! - cancellation: a cancelled shutdown token or raised request flag stops
//!   the stage at the next suspension point.
//!
//! Recovery-action selection on the final error stays with the
//! orchestrator; this module only produces the classified error and the
//! timing data for the stage result.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use careplan_pipeline_bootstrap::shutdown::CancellationToken;
use careplan_pipeline_domain::entities::PipelineStage;
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::services::recovery_policy::backoff_delay;
use careplan_pipeline_domain::value_objects::CorrelationId;

/// Tuning for one executor instance, shared by all stages of a request.
#[derive(Debug, Clone, Copy)]
pub struct StagePolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(10),
        }
    }
}

/// Outcome of a stage run: the result plus wall-clock duration and the
/// number of attempts spent.
pub struct StageOutcome<T> {
    pub result: Result<T, PipelineError>,
    pub duration: Duration,
    pub attempts: u32,
}

pub struct StageExecutor {
    policy: StagePolicy,
    shutdown: CancellationToken,
}

impl StageExecutor {
    pub fn new(policy: StagePolicy, shutdown: CancellationToken) -> Self {
        Self { policy, shutdown }
    }

    /// Runs `body` under the stage envelope. `body` is called once per
    /// attempt with the zero-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        stage: PipelineStage,
        correlation_id: CorrelationId,
        body: F,
    ) -> StageOutcome<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return StageOutcome {
                    result: Err(PipelineError::internal("cancelled by shutdown")
                        .with_stage(stage)
                        .with_correlation_id(correlation_id)),
                    duration: started.elapsed(),
                    attempts: attempt,
                };
            }

            let attempt_result = tokio::select! {
                _ = self.shutdown.cancelled() => Err(PipelineError::internal("cancelled by shutdown")),
                raced = tokio::time::timeout(self.policy.timeout, body(attempt)) => match raced {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::timeout(format!(
                        "stage deadline of {} ms elapsed",
                        self.policy.timeout.as_millis()
                    ))),
                },
            };
            attempt += 1;

            match attempt_result {
                Ok(value) => {
                    return StageOutcome {
                        result: Ok(value),
                        duration: started.elapsed(),
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    let error = error.with_stage(stage).with_correlation_id(correlation_id);
                    let retries_spent = attempt - 1;
                    if error.is_retryable() && retries_spent < self.policy.max_retries {
                        let delay = backoff_delay(retries_spent, self.policy.backoff_base, self.policy.backoff_cap);
                        debug!(
                            stage = %stage,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            correlation_id = %correlation_id,
                            "retrying stage after backoff"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(
                        stage = %stage,
                        attempts = attempt,
                        correlation_id = %correlation_id,
                        error = %error,
                        "stage failed"
                    );
                    return StageOutcome {
                        result: Err(error.with_retry_count(retries_spent)),
                        duration: started.elapsed(),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
