// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Progress Bus
//!
//! Redis pub/sub fan-out of stage-level progress, one channel per request:
//! `pipeline:progress:{requestId}`. Publishing is fire-and-forget from the
//! orchestrator's perspective; subscribers get an ordered stream that ends
//! on the terminal event or an inactivity timeout (default 5 minutes).
//!
//! The subscriber stream owns its pub/sub connection. Ending the stream
//! (terminal event, timeout, or the caller dropping it mid-iteration) drops
//! the connection, which closes the Redis subscription server-side. No
//! orphan subscriptions survive a cancelled caller.

use async_stream::stream;
use futures::StreamExt;
use redis::Client;
use std::time::Duration;
use tracing::{debug, warn};

use async_trait::async_trait;
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::events::ProgressEvent;
use careplan_pipeline_domain::services::{ProgressService, ProgressStream};
use careplan_pipeline_domain::value_objects::RequestId;

pub fn channel_for(request_id: RequestId) -> String {
    format!("pipeline:progress:{}", request_id)
}

pub struct RedisProgressBus {
    client: Client,
    publish_conn: redis::aio::ConnectionManager,
    idle_timeout: Duration,
}

impl RedisProgressBus {
    pub fn new(client: Client, publish_conn: redis::aio::ConnectionManager, idle_timeout: Duration) -> Self {
        Self {
            client,
            publish_conn,
            idle_timeout,
        }
    }
}

#[async_trait]
impl ProgressService for RedisProgressBus {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), PipelineError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.publish_conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel_for(event.request_id))
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("progress publish failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, request_id: RequestId) -> Result<ProgressStream, PipelineError> {
        // A dedicated connection per subscription: pub/sub connections
        // cannot multiplex with regular commands.
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("subscription connect failed: {}", e)))?;
        pubsub
            .subscribe(channel_for(request_id))
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("subscribe failed: {}", e)))?;

        let idle_timeout = self.idle_timeout;
        let mut messages = pubsub.into_on_message();

        let stream = stream! {
            loop {
                let next = tokio::time::timeout(idle_timeout, messages.next()).await;
                match next {
                    Err(_) => {
                        debug!(request_id = %request_id, "progress subscription idle timeout");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(msg)) => {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(request_id = %request_id, error = %e, "unreadable progress message");
                                continue;
                            }
                        };
                        let event: ProgressEvent = match serde_json::from_str(&payload) {
                            Ok(e) => e,
                            Err(e) => {
                                warn!(request_id = %request_id, error = %e, "malformed progress message");
                                continue;
                            }
                        };
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                }
            }
            // `messages` (and its connection) drop here, closing the Redis
            // subscription on every exit path.
        };
        Ok(Box::pin(stream))
    }
}
