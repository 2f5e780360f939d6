// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Careplan Pipeline Domain
//!
//! The domain layer of the care-plan pipeline orchestrator: the business
//! rules of turning one clinical request into one draft care plan, with
//! nothing about Postgres, Redis, HTTP, or the tokio runtime. It follows
//! Domain-Driven Design and is consumed by the `careplan-pipeline` crate,
//! which supplies the infrastructure behind every port defined here.
//!
//! ## Module Structure
//!
//! ### Entities
//! Objects with identity and lifecycle:
//!
//! - `PipelineInput` / `PipelineOutput`: the per-request contract
//! - `PipelineRequestRecord`: persisted request state and its transitions
//! - `IdempotencyRecord`: one row per idempotency key
//! - `DeadLetterEntry`: a job that exhausted its retries
//! - `PipelineStage` / `StageResult`: the fixed six-stage DAG and its
//!   per-stage outcomes
//! - Clinical artifacts: `ExtractedEntities`, `TemplateRecommendation`,
//!   `CarePlanDraft`, `RedFlag`
//!
//! ### Value Objects
//! Immutable, self-validating:
//!
//! - `RequestId`, `CorrelationId`: typed UUID identifiers
//! - `IdempotencyKey`: the caller-supplied exactly-once token
//! - `ConditionCode`: ICD-10-shaped diagnosis codes
//! - `EncryptionKey`: the 32-byte process-wide key, zeroized on drop
//!
//! ### Domain Services
//! Pure logic plus async collaborator ports:
//!
//! - `DataMinimizer`: per-service payload projection and PHI masking
//! - `recovery_policy`: failure → recovery-action mapping and backoff
//! - Ports: cache, distributed lock, job queue, progress bus, encryption,
//!   cancellation flags, audit, and the four ML clients
//!
//! ### Repositories
//! Persistence ports for requests, idempotency records, and dead letters.
//!
//! ### Events
//! `ProgressEvent`: stage-level progress published per request.
//!
//! ## Business Rules and Invariants
//!
//! - A COMPLETED request has a result blob; a FAILED request has an error.
//! - Same idempotency key ⇒ same canonical request hash, or the request is
//!   rejected.
//! - Plaintext PHI never exists in a cache entry or DLQ payload.
//! - Red-flag lists are totally ordered by severity, CRITICAL first.
//! - Error messages are PHI-scrubbed at construction and capped at 500
//!   characters.

pub mod entities;
pub mod error;
pub mod events;
pub mod repositories;
pub mod services;
pub mod value_objects;

// Re-export commonly used types for convenient access
// These exports provide a clean API surface for consumers of the domain layer
pub use entities::{
    CarePlanDraft, ExtractedEntities, MlService, PipelineInput, PipelineOutput, PipelineRequestRecord,
    PipelineStage, RedFlag, RedFlagSeverity, RequestStatus, StageResult, StageStatus, TemplateRecommendation,
};
pub use error::{ErrorCategory, ErrorSeverity, PipelineError};
pub use events::{ProgressEvent, ProgressStage};
pub use value_objects::{ConditionCode, CorrelationId, EncryptionKey, IdempotencyKey, RequestId};
