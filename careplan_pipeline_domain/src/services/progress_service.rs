// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Progress Bus Port
//!
//! One publish/subscribe channel per request id. Subscribers receive events
//! in publish order until the terminal event (`COMPLETE`/`ERROR`) or an
//! inactivity timeout, whichever comes first. Implementations guarantee
//! cleanup (unsubscribe and connection close) on every exit path,
//! including the subscriber dropping the stream mid-way.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::PipelineError;
use crate::events::progress_event::ProgressEvent;
use crate::value_objects::request_id::RequestId;

/// Ordered stream of progress events for one request.
pub type ProgressStream = BoxStream<'static, ProgressEvent>;

#[async_trait]
pub trait ProgressService: Send + Sync {
    /// Publishes one event. Best-effort: a failing bus degrades progress
    /// reporting, never the pipeline.
    async fn publish(&self, event: &ProgressEvent) -> Result<(), PipelineError>;

    /// Opens an ordered subscription for `request_id`.
    async fn subscribe(&self, request_id: RequestId) -> Result<ProgressStream, PipelineError>;
}
