// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Job Handlers
//!
//! The two job kinds the worker pools execute. The generation handler wraps
//! the orchestrator; the PDF-import handler wraps the parser client. Both
//! parse their typed payloads out of the queue envelope and keep the
//! request tracker in step.

use std::sync::Arc;

use async_trait::async_trait;
use careplan_pipeline_domain::entities::{JobType, RequestStatus};
use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::repositories::RequestRepository;
use careplan_pipeline_domain::services::{
    ClaimedJob, EncryptionService, GenerationJobPayload, PdfImportJobPayload, PdfParserClient,
};
use careplan_pipeline_domain::value_objects::RequestId;

use crate::application::services::pipeline_orchestrator::PipelineOrchestrator;
use crate::infrastructure::runtime::worker::JobHandler;

/// Runs the full pipeline for a `GENERATE_PLAN` job.
pub struct GenerationJobHandler {
    orchestrator: Arc<PipelineOrchestrator>,
}

impl GenerationJobHandler {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self { orchestrator }
    }

    fn payload(job: &ClaimedJob) -> Result<GenerationJobPayload, PipelineError> {
        serde_json::from_value(job.envelope.payload.clone())
            .map_err(|e| PipelineError::internal(format!("generation payload is malformed: {}", e)))
    }
}

#[async_trait]
impl JobHandler for GenerationJobHandler {
    fn job_type(&self) -> JobType {
        JobType::GeneratePlan
    }

    fn failure_code(&self) -> &'static str {
        "PIPELINE_ERROR"
    }

    fn request_id_of(&self, job: &ClaimedJob) -> Option<RequestId> {
        Self::payload(job).ok().map(|p| p.request_id)
    }

    async fn handle(&self, job: &ClaimedJob) -> Result<(), PipelineError> {
        let payload = Self::payload(job)?;
        self.orchestrator
            .process_assigned(payload.request_id, payload.input)
            .await
            .map(|_| ())
    }
}

/// Parses an uploaded PDF care plan for an `IMPORT_PDF` job.
pub struct PdfImportJobHandler {
    parser: Arc<dyn PdfParserClient>,
    requests: Arc<dyn RequestRepository>,
    encryption: Arc<dyn EncryptionService>,
}

impl PdfImportJobHandler {
    pub fn new(
        parser: Arc<dyn PdfParserClient>,
        requests: Arc<dyn RequestRepository>,
        encryption: Arc<dyn EncryptionService>,
    ) -> Self {
        Self {
            parser,
            requests,
            encryption,
        }
    }

    fn payload(job: &ClaimedJob) -> Result<PdfImportJobPayload, PipelineError> {
        serde_json::from_value(job.envelope.payload.clone())
            .map_err(|e| PipelineError::internal(format!("pdf import payload is malformed: {}", e)))
    }
}

#[async_trait]
impl JobHandler for PdfImportJobHandler {
    fn job_type(&self) -> JobType {
        JobType::ImportPdf
    }

    fn failure_code(&self) -> &'static str {
        "IMPORT_ERROR"
    }

    fn request_id_of(&self, job: &ClaimedJob) -> Option<RequestId> {
        Self::payload(job).ok().map(|p| p.request_id)
    }

    async fn handle(&self, job: &ClaimedJob) -> Result<(), PipelineError> {
        let payload = Self::payload(job)?;
        self.requests
            .update_status(payload.request_id, RequestStatus::InProgress, None)
            .await?;

        let parsed = self.parser.parse(&payload.file_key).await?;
        if !parsed.validation.valid {
            return Err(PipelineError::validation(format!(
                "pdf failed validation: {}",
                parsed.validation.errors.join("; ")
            )));
        }

        let sealed = self.encryption.encrypt(&serde_json::to_vec(&parsed)?)?;
        self.requests
            .complete(payload.request_id, sealed, &[], &["PDF_IMPORT".to_string()])
            .await?;
        Ok(())
    }
}
