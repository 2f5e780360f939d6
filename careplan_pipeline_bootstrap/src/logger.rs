// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Logging Initialization
//!
//! Installs the global tracing subscriber for the service. Level selection
//! follows `RUST_LOG` with an `info` default; structured fields carry the
//! correlation id through the pipeline so one request can be followed
//! across workers, cache, and queue.
//!
//! PHI never reaches a log line by construction: the data minimizer masks
//! context maps before they are logged and the error carrier scrubs
//! messages at creation.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global subscriber. Safe to call once per process;
/// repeated calls are ignored.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
