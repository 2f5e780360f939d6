// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Careplan Pipeline Bootstrap
//!
//! Entry-point concerns kept out of the application crates: graceful
//! shutdown coordination, process signal handling, logging initialization,
//! and exit codes. The worker pools and background sweepers all observe the
//! [`shutdown::CancellationToken`] issued here.

pub mod exit_code;
pub mod logger;
pub mod shutdown;
pub mod signals;

pub use exit_code::ExitCode;
pub use shutdown::{CancellationToken, ShutdownCoordinator};
