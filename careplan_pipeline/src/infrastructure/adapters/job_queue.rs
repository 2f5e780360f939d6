// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Redis Job Queue
//!
//! At-least-once delivery over Redis streams with consumer groups.
//!
//! Per queue, three keys under `pipeline:jobs:{queue}:`:
//!
//! - `…:stream`: the stream read via `XREADGROUP`; entries are acked with
//!   `XACK` + `XDEL`. The stream is trimmed with `MAXLEN ~` on add, which
//!   bounds completed/failed history.
//! - `…:id:{job_id}`: dedup markers (`SET NX` with a 24 h TTL). The job id
//!   is the request id, so double submission of one request collapses at
//!   the queue layer.
//! - `…:delayed`: a sorted set of encrypted payloads scored by ready time;
//!   [`RedisJobQueue::claim`] promotes due members before reading.
//!
//! Payloads are AEAD-encrypted before they reach Redis, since queue entries are
//! PHI-bearing (they carry the pipeline input).
//!
//! Delivery semantics: a worker crash between claim and ack leaves the
//! entry pending in the consumer group; [`RedisJobQueue::reclaim_stale`]
//! hands it to a live consumer after a minute idle. Handlers must be
//! idempotent. The idempotency store makes the pipeline body so.

use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::services::{ClaimedJob, EncryptionService, JobEnvelope, JobQueueService, QueueName};

const GROUP: &str = "pipeline-workers";
const DEDUP_TTL_SECS: u64 = 86_400;
const STREAM_MAXLEN: usize = 10_000;
const STALE_IDLE_MS: u64 = 60_000;

/// On-wire job: the envelope plus its delivery attempt counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedJob {
    envelope: JobEnvelope,
    attempt: u32,
}

pub struct RedisJobQueue {
    conn: ConnectionManager,
    encryption: Arc<dyn EncryptionService>,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager, encryption: Arc<dyn EncryptionService>) -> Self {
        Self { conn, encryption }
    }

    fn stream_key(queue: QueueName) -> String {
        format!("pipeline:jobs:{}:stream", queue.as_str())
    }

    fn dedup_key(queue: QueueName, job_id: &str) -> String {
        format!("pipeline:jobs:{}:id:{}", queue.as_str(), job_id)
    }

    fn delayed_key(queue: QueueName) -> String {
        format!("pipeline:jobs:{}:delayed", queue.as_str())
    }

    fn redis_err(context: &str, e: redis::RedisError) -> PipelineError {
        PipelineError::service_unavailable(format!("{}: {}", context, e))
    }

    /// Creates the consumer group if missing. Call once per queue at boot.
    pub async fn ensure_group(&self, queue: QueueName) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(Self::stream_key(queue), GROUP, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Self::redis_err("consumer group creation failed", e)),
        }
    }

    fn seal(&self, job: &QueuedJob) -> Result<String, PipelineError> {
        let plaintext = serde_json::to_vec(job)?;
        self.encryption.encrypt_to_text(&plaintext)
    }

    fn unseal(&self, sealed: &str) -> Result<QueuedJob, PipelineError> {
        let plaintext = self.encryption.decrypt_from_text(sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn add_to_stream(&self, queue: QueueName, sealed: &str) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        redis::cmd("XADD")
            .arg(Self::stream_key(queue))
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("payload")
            .arg(sealed)
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| Self::redis_err("stream add failed", e))?;
        Ok(())
    }

    /// Moves due delayed jobs back onto the stream.
    async fn promote_due(&self, queue: QueueName) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(Self::delayed_key(queue), "-inf", now_ms, 0, 16)
            .await
            .map_err(|e| Self::redis_err("delayed scan failed", e))?;
        for member in due {
            self.add_to_stream(queue, &member).await?;
            let mut conn = self.conn.clone();
            conn.zrem::<_, _, ()>(Self::delayed_key(queue), &member)
                .await
                .map_err(|e| Self::redis_err("delayed removal failed", e))?;
        }
        Ok(())
    }

    fn claimed_from_entry(&self, entry: &StreamId) -> Result<ClaimedJob, PipelineError> {
        let sealed: String = entry
            .get("payload")
            .ok_or_else(|| PipelineError::internal("stream entry is missing its payload field"))?;
        let job = self.unseal(&sealed)?;
        Ok(ClaimedJob {
            envelope: job.envelope,
            attempt: job.attempt,
            delivery_tag: entry.id.clone(),
        })
    }

}

#[async_trait]
impl JobQueueService for RedisJobQueue {
    async fn enqueue(&self, queue: QueueName, envelope: JobEnvelope) -> Result<bool, PipelineError> {
        let mut conn = self.conn.clone();
        // Dedup on job id: only the first submission passes.
        let fresh: Option<String> = redis::cmd("SET")
            .arg(Self::dedup_key(queue, &envelope.job_id))
            .arg(1u8)
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::redis_err("dedup marker failed", e))?;
        if fresh.is_none() {
            return Ok(false);
        }

        let sealed = self.seal(&QueuedJob { envelope, attempt: 1 })?;
        self.add_to_stream(queue, &sealed).await?;
        Ok(true)
    }

    async fn claim(&self, queue: QueueName, consumer: &str, wait: Duration) -> Result<Option<ClaimedJob>, PipelineError> {
        self.promote_due(queue).await?;

        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(GROUP, consumer)
            .count(1)
            .block(wait.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[Self::stream_key(queue)], &[">"], &options)
            .await
            .map_err(|e| Self::redis_err("stream read failed", e))?;

        let entry = reply.keys.first().and_then(|key| key.ids.first());
        match entry {
            Some(entry) => Ok(Some(self.claimed_from_entry(entry)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, queue: QueueName, job: &ClaimedJob) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let stream = Self::stream_key(queue);
        redis::pipe()
            .xack(&stream, GROUP, &[&job.delivery_tag])
            .xdel(&stream, &[&job.delivery_tag])
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Self::redis_err("ack failed", e))?;
        Ok(())
    }

    async fn retry_later(&self, queue: QueueName, job: &ClaimedJob, delay: Duration) -> Result<(), PipelineError> {
        let sealed = self.seal(&QueuedJob {
            envelope: job.envelope.clone(),
            attempt: job.attempt + 1,
        })?;
        let ready_at = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(Self::delayed_key(queue), sealed, ready_at)
            .await
            .map_err(|e| Self::redis_err("retry scheduling failed", e))?;
        self.ack(queue, job).await
    }

    async fn depth(&self, queue: QueueName) -> Result<u64, PipelineError> {
        let mut conn = self.conn.clone();
        let (ready, delayed): (u64, u64) = redis::pipe()
            .xlen(Self::stream_key(queue))
            .zcard(Self::delayed_key(queue))
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::redis_err("depth query failed", e))?;
        Ok(ready + delayed)
    }

    /// Claims one entry abandoned by a dead consumer (pending longer than a
    /// minute). Workers call this on their idle ticks.
    async fn reclaim_stale(&self, queue: QueueName, consumer: &str) -> Result<Option<ClaimedJob>, PipelineError> {
        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                Self::stream_key(queue),
                GROUP,
                consumer,
                STALE_IDLE_MS,
                "0-0",
                StreamAutoClaimOptions::default().count(1),
            )
            .await
            .map_err(|e| Self::redis_err("stale reclaim failed", e))?;
        match reply.claimed.first() {
            Some(entry) => Ok(Some(self.claimed_from_entry(entry)?)),
            None => Ok(None),
        }
    }
}
