// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Worker Pools
//!
//! Each pool runs N concurrent worker loops against one queue. A loop
//! claims a job, runs the handler, and settles the delivery:
//!
//! - success → ack
//! - failure with attempts remaining → schedule redelivery with
//!   exponential backoff
//! - failure with attempts exhausted → dead-letter entry + tracker FAILED +
//!   ack
//!
//! The generation pool is throttled by a cluster-wide Redis token bucket
//! (default 10 jobs/s); the PDF pool is bounded by concurrency alone. Every
//! loop observes the shutdown token between jobs, and job lifecycle events
//! go to the audit collaborator.

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;
use careplan_pipeline_bootstrap::shutdown::CancellationToken;
use careplan_pipeline_domain::entities::{DeadLetterEntry, JobType, RequestError};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::repositories::{DeadLetterRepository, RequestRepository};
use careplan_pipeline_domain::services::recovery_policy::backoff_delay;
use careplan_pipeline_domain::services::{
    AuditService, ClaimedJob, EncryptionService, JobAuditEntry, JobQueueService, QueueName,
};

/// Handles one job kind. Implementations live in the application layer.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    /// The tracker error code recorded when this job dead-letters.
    fn failure_code(&self) -> &'static str;

    /// Processes one delivery. The handler owns request-tracker updates for
    /// the happy path; terminal failure bookkeeping is the pool's.
    async fn handle(&self, job: &ClaimedJob) -> Result<(), PipelineError>;

    /// The request id a job payload refers to, for terminal bookkeeping.
    fn request_id_of(&self, job: &ClaimedJob) -> Option<careplan_pipeline_domain::value_objects::RequestId>;
}

/// Cluster-wide token bucket at `pipeline:ratelimit:{name}`. Refill and
/// spend are a single Lua script, so concurrent workers across processes
/// share one budget.
pub struct RedisTokenBucket {
    conn: ConnectionManager,
    key: String,
    rate_per_sec: u32,
    script: Script,
}

const TOKEN_BUCKET_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local now_ms = tonumber(ARGV[2])
local state = redis.call("HMGET", KEYS[1], "tokens", "ts")
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then tokens = rate end
if ts == nil then ts = now_ms end
tokens = math.min(rate, tokens + (now_ms - ts) * rate / 1000)
local granted = 0
if tokens >= 1 then
    tokens = tokens - 1
    granted = 1
end
redis.call("HMSET", KEYS[1], "tokens", tokens, "ts", now_ms)
redis.call("PEXPIRE", KEYS[1], 5000)
return granted
"#;

impl RedisTokenBucket {
    pub fn new(conn: ConnectionManager, name: &str, rate_per_sec: u32) -> Self {
        Self {
            conn,
            key: format!("pipeline:ratelimit:{}", name),
            rate_per_sec: rate_per_sec.max(1),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

    /// Waits until a token is granted or the shutdown token cancels.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<(), PipelineError> {
        let pause = Duration::from_millis(1000 / u64::from(self.rate_per_sec).max(1));
        loop {
            if shutdown.is_cancelled() {
                return Err(PipelineError::internal("cancelled by shutdown"));
            }
            let mut conn = self.conn.clone();
            let granted: i64 = self
                .script
                .key(&self.key)
                .arg(self.rate_per_sec)
                .arg(Utc::now().timestamp_millis())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| PipelineError::service_unavailable(format!("rate limiter failed: {}", e)))?;
            if granted == 1 {
                return Ok(());
            }
            tokio::time::sleep(pause).await;
        }
    }
}

pub struct WorkerPool {
    pub queue_name: QueueName,
    pub concurrency: usize,
    pub queue: Arc<dyn JobQueueService>,
    pub handler: Arc<dyn JobHandler>,
    pub requests: Arc<dyn RequestRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub audit: Arc<dyn AuditService>,
    pub encryption: Arc<dyn EncryptionService>,
    pub rate_limiter: Option<Arc<RedisTokenBucket>>,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawns the pool's worker loops.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|index| {
                let pool = Arc::clone(&self);
                let consumer = format!("{}-worker-{}", pool.queue_name.as_str(), index);
                tokio::spawn(async move {
                    info!(consumer = %consumer, "worker started");
                    pool.worker_loop(&consumer).await;
                    info!(consumer = %consumer, "worker stopped");
                })
            })
            .collect()
    }

    async fn worker_loop(&self, consumer: &str) {
        while !self.shutdown.is_cancelled() {
            if let Some(limiter) = &self.rate_limiter {
                if limiter.acquire(&self.shutdown).await.is_err() {
                    break;
                }
            }

            let claimed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                claimed = self.queue.claim(self.queue_name, consumer, Duration::from_secs(5)) => claimed,
            };

            match claimed {
                Ok(Some(job)) => self.process_one(consumer, job).await,
                Ok(None) => {
                    // Idle tick: pick up deliveries abandoned by dead
                    // consumers.
                    match self.queue.reclaim_stale(self.queue_name, consumer).await {
                        Ok(Some(job)) => self.process_one(consumer, job).await,
                        Ok(None) => {}
                        Err(e) => warn!(consumer, error = %e, "stale reclaim failed"),
                    }
                }
                Err(e) => {
                    warn!(consumer, error = %e, "queue claim failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process_one(&self, consumer: &str, job: ClaimedJob) {
        let job_id = job.envelope.job_id.clone();
        debug!(consumer, job_id = %job_id, attempt = job.attempt, "processing job");
        self.audit_job(&job, "STARTED", None).await;

        match self.handler.handle(&job).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack(self.queue_name, &job).await {
                    warn!(job_id = %job_id, error = %e, "ack failed; job may redeliver");
                }
                self.audit_job(&job, "COMPLETED", None).await;
            }
            Err(handler_err) => {
                if job.attempt < job.envelope.attempts_allowed {
                    let delay = backoff_delay(job.attempt - 1, self.backoff_base, self.backoff_cap);
                    warn!(
                        job_id = %job_id,
                        attempt = job.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %handler_err,
                        "job failed, scheduling retry"
                    );
                    if let Err(e) = self.queue.retry_later(self.queue_name, &job, delay).await {
                        error!(job_id = %job_id, error = %e, "retry scheduling failed");
                    }
                    self.audit_job(&job, "RETRY_SCHEDULED", Some(handler_err.message.clone())).await;
                } else {
                    self.dead_letter(&job, &handler_err).await;
                    if let Err(e) = self.queue.ack(self.queue_name, &job).await {
                        warn!(job_id = %job_id, error = %e, "terminal ack failed");
                    }
                    self.audit_job(&job, "DEAD_LETTERED", Some(handler_err.message.clone())).await;
                }
            }
        }
    }

    /// Converts an exhausted job into a DLQ entry and fails the tracker
    /// record with the handler's failure code.
    async fn dead_letter(&self, job: &ClaimedJob, handler_err: &PipelineError) {
        let payload = match serde_json::to_vec(&job.envelope)
            .map_err(PipelineError::from)
            .and_then(|bytes| self.encryption.encrypt(&bytes))
        {
            Ok(sealed) => sealed,
            Err(e) => {
                error!(job_id = %job.envelope.job_id, error = %e, "DLQ payload sealing failed");
                Vec::new()
            }
        };
        let mut entry = DeadLetterEntry::unresolved(
            self.handler.job_type(),
            &job.envelope.job_id,
            payload,
            handler_err.message.clone(),
            job.attempt,
        );
        entry.first_failed_at = job.envelope.enqueued_at;
        if let Err(e) = self.dead_letters.add(&entry).await {
            error!(job_id = %job.envelope.job_id, error = %e, "dead-letter insert failed");
        }

        if let Some(request_id) = self.handler.request_id_of(job) {
            let failure = RequestError {
                message: handler_err.message.clone(),
                code: self.handler.failure_code().to_string(),
            };
            if let Err(e) = self.requests.fail(request_id, &failure).await {
                warn!(request_id = %request_id, error = %e, "tracker fail update failed");
            }
        }
    }

    async fn audit_job(&self, job: &ClaimedJob, event: &str, detail: Option<String>) {
        self.audit
            .log_job(JobAuditEntry {
                job_id: job.envelope.job_id.clone(),
                job_type: self.handler.job_type().as_str().to_string(),
                event: event.to_string(),
                attempt: job.attempt,
                detail,
                timestamp: Utc::now(),
            })
            .await;
    }
}
