// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Domain entities of the care-plan pipeline: the per-request input and
//! output, the stage model, clinical artifacts (entities, recommendations,
//! drafts, red flags), and the persisted request / idempotency / dead-letter
//! records.

pub mod care_plan_draft;
pub mod clinical_entity;
pub mod dead_letter;
pub mod idempotency_record;
pub mod pipeline_input;
pub mod pipeline_output;
pub mod pipeline_request;
pub mod pipeline_stage;
pub mod recommendation;
pub mod red_flag;

pub use care_plan_draft::CarePlanDraft;
pub use clinical_entity::{ClinicalEntity, ExtractedEntities};
pub use dead_letter::{DeadLetterEntry, DeadLetterResolution, JobType};
pub use idempotency_record::{IdempotencyOutcome, IdempotencyRecord, IdempotencyStatus};
pub use pipeline_input::PipelineInput;
pub use pipeline_output::{PipelineOutput, ProcessingMetadata};
pub use pipeline_request::{PipelineRequestRecord, RequestError, RequestStats, RequestStatus};
pub use pipeline_stage::{MlService, PipelineStage, ServiceCriticality, StageResult, StageStatus};
pub use recommendation::TemplateRecommendation;
pub use red_flag::{sort_by_severity, RedFlag, RedFlagSeverity, RedFlagSource};
