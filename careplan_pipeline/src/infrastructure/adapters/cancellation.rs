// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Redis-backed cancellation flags. A raised flag lives at
//! `pipeline:cancel:{requestId}` with a one-hour TTL so abandoned flags
//! clean themselves up; workers poll it at stage boundaries.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::services::CancellationFlags;
use careplan_pipeline_domain::value_objects::RequestId;

const FLAG_TTL_SECS: u64 = 3600;

pub struct RedisCancellationFlags {
    conn: ConnectionManager,
}

impl RedisCancellationFlags {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(request_id: RequestId) -> String {
        format!("pipeline:cancel:{}", request_id)
    }
}

#[async_trait]
impl CancellationFlags for RedisCancellationFlags {
    async fn request_cancel(&self, request_id: RequestId) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::key(request_id), 1u8, FLAG_TTL_SECS)
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("cancel flag write failed: {}", e)))
    }

    async fn is_cancelled(&self, request_id: RequestId) -> Result<bool, PipelineError> {
        let mut conn = self.conn.clone();
        conn.exists(Self::key(request_id))
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("cancel flag read failed: {}", e)))
    }

    async fn clear(&self, request_id: RequestId) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(request_id))
            .await
            .map_err(|e| PipelineError::service_unavailable(format!("cancel flag clear failed: {}", e)))
    }
}
