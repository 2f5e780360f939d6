// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Error carrier and PHI scrubbing for the pipeline domain.

pub mod phi_scrubber;
pub mod pipeline_error;

pub use phi_scrubber::{scrub_message, truncate_message, MAX_MESSAGE_LEN};
pub use pipeline_error::{ErrorCategory, ErrorSeverity, PipelineError};
