// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Observability and audit sinks on top of tracing and metrics.

pub mod audit_log;
pub mod observability;

pub use audit_log::TracingAuditService;
pub use observability::{ObservabilityService, OperationTracker, SystemHealth};
