// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Cancel Request Use Case
//!
//! Raises the cross-process cancellation flag for an active request. The
//! worker observes the flag at its next suspension point (a stage
//! boundary), aborts, and emits `pipelineFailed`; a request that already
//! reached a terminal state is not cancellable.

use std::sync::Arc;

use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::repositories::RequestRepository;
use careplan_pipeline_domain::services::CancellationFlags;
use careplan_pipeline_domain::value_objects::RequestId;

pub struct CancelPipelineRequest {
    requests: Arc<dyn RequestRepository>,
    cancellations: Arc<dyn CancellationFlags>,
}

impl CancelPipelineRequest {
    pub fn new(requests: Arc<dyn RequestRepository>, cancellations: Arc<dyn CancellationFlags>) -> Self {
        Self {
            requests,
            cancellations,
        }
    }

    /// Returns `true` if the flag was raised, `false` if the request is
    /// unknown or already terminal.
    pub async fn execute(&self, request_id: RequestId) -> Result<bool, PipelineError> {
        let Some(record) = self.requests.get_by_id(request_id).await? else {
            return Ok(false);
        };
        if record.status.is_terminal() {
            return Ok(false);
        }
        self.cancellations.request_cancel(request_id).await?;
        Ok(true)
    }
}
