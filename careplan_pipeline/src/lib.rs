// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Careplan Pipeline
//!
//! Multi-stage pipeline orchestrator for draft clinical care plans. The
//! crate coordinates four external ML services behind strict correctness
//! and privacy requirements: idempotent request handling over an
//! at-least-once Redis queue, PHI-minimized payloads to every downstream
//! call, encrypted caching and persistence, per-stage retries with
//! fallbacks, real-time progress over pub/sub, and dead-letter recovery for
//! exhausted jobs.
//!
//! ## Layers
//!
//! - [`application`]: the orchestrator DAG, fallback generators, job
//!   handlers, and entry-point use cases.
//! - [`infrastructure`]: Postgres repositories, Redis adapters (lock,
//!   queue, cache, pub/sub, flags), AEAD encryption, metrics, and the
//!   worker runtime.
//! - Domain types and ports live in the `careplan-pipeline-domain` crate;
//!   process concerns (shutdown, signals, logging) in
//!   `careplan-pipeline-bootstrap`.
//!
//! ## Wiring
//!
//! Hosts construct the orchestrator through its builder, supplying the ML
//! client factory and audit sink alongside the infrastructure built here.
//! The `careplan_pipeline` binary wires a complete worker host from
//! configuration.

pub mod application;
pub mod infrastructure;

pub use application::services::{OrchestratorSettings, PipelineOrchestrator};
pub use infrastructure::config::PipelineConfig;
