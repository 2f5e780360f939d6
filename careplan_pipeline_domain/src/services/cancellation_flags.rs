// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Cross-process cancellation flags. `cancel_pipeline_request` raises the
//! flag; the worker observes it at the next suspension point (stage
//! boundary) and aborts with a `pipelineFailed` event.

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::value_objects::request_id::RequestId;

#[async_trait]
pub trait CancellationFlags: Send + Sync {
    /// Raises the cancellation flag for a request.
    async fn request_cancel(&self, request_id: RequestId) -> Result<(), PipelineError>;

    /// True if cancellation has been requested.
    async fn is_cancelled(&self, request_id: RequestId) -> Result<bool, PipelineError>;

    /// Clears the flag once the request reaches a terminal state.
    async fn clear(&self, request_id: RequestId) -> Result<(), PipelineError>;
}
