// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Entry-point operations: submission, cancellation, dead-letter retry.

pub mod cancel_request;
pub mod retry_dead_letter;
pub mod submit_request;

pub use cancel_request::CancelPipelineRequest;
pub use retry_dead_letter::RetryDeadLetter;
pub use submit_request::{SubmissionOutcome, SubmitPipelineRequest};
