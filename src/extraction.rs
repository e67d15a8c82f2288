//! Extraction orchestration.
//!
//! `trigger` only records a job and moves the document to QUEUED; it never waits
//! for the extractor. Workers pick jobs up with `process`, which calls the
//! external [`Extractor`] and turns its proposal into a DRAFT revision, or parks
//! the document in SPLIT_PENDING when the file turned out to be a bundle.
use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::blob::BlobStore;
use crate::config::ServiceConfig;
use crate::document::ProcessingDocument;
use crate::error::DocumentError;
use crate::guard::{Endpoint, Guard, Guarded, Preconditions};
use crate::pages::{PageRange, validate_ranges};
use crate::pipeline::{FailureKind, PipelineEvent, PipelineStatus};
use crate::revision::{
    DocumentRevision, FieldEvidence, LineItemInput, RevisionHeader, RevisionSource,
    RevisionStatus, ValidationReport, validate,
};
use crate::revisions::stage_revision;
use crate::store::{Store, abort, keys};
use crate::types::TimeStamp;
use crate::utils::{new_job_id, new_revision_id};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOptions {
    #[n(0)]
    pub language_hint: Option<String>,
    /// Park multi-document files in SPLIT_PENDING instead of extracting them whole
    #[n(1)]
    pub detect_bundles: bool,
    #[n(2)]
    pub priority: u8,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            language_hint: None,
            detect_bundles: true,
            priority: 0,
        }
    }
}

/// What the extractor is told about the file it receives.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionContext {
    pub document_id: String,
    pub tenant_id: String,
    pub company_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub page_count: u32,
    pub options: ExtractionOptions,
}

/// The extractor's reading of a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    pub header: RevisionHeader,
    pub line_items: Vec<LineItemInput>,
    pub evidence: Vec<FieldEvidence>,
    /// Page ranges of separate documents found inside one file
    pub bundle_ranges: Vec<PageRange>,
    pub model: Option<String>,
}

/// The external OCR/AI capability.
pub trait Extractor: Send + Sync {
    fn submit(&self, bytes: &[u8], context: &ExtractionContext) -> anyhow::Result<Proposal>;
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    #[n(0)]
    Queued,
    #[n(1)]
    Running,
    #[n(2)]
    Completed,
    #[n(3)]
    SplitSuggested,
    #[n(4)]
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::SplitSuggested => "SPLIT_SUGGESTED",
            JobStatus::Failed => "FAILED",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct ExtractionJob {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub status: JobStatus,
    #[n(3)]
    pub options: ExtractionOptions,
    #[n(4)]
    pub attempts: u32,
    #[n(5)]
    pub queued_at: TimeStamp<Utc>,
    #[n(6)]
    pub started_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub finished_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub revision_id: Option<String>,
    #[n(9)]
    pub suggested_ranges: Vec<PageRange>,
    #[n(10)]
    pub last_error: Option<String>,
}

/// Immediate answer to a trigger; this is what an idempotent retry replays.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct ExtractionTicket {
    #[n(0)]
    pub job_id: String,
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub status: JobStatus,
    #[n(3)]
    pub queued_at: TimeStamp<Utc>,
    #[n(4)]
    pub estimated_completion: TimeStamp<Utc>,
    #[n(5)]
    pub lock_version: u64,
}

/// Outcome of a worker step.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct JobReport {
    #[n(0)]
    pub job_id: String,
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub job_status: JobStatus,
    #[n(3)]
    pub pipeline_status: PipelineStatus,
    #[n(4)]
    pub revision_id: Option<String>,
    #[n(5)]
    pub suggested_ranges: Vec<PageRange>,
}

impl JobReport {
    fn of(job: &ExtractionJob, document: &ProcessingDocument) -> Self {
        Self {
            job_id: job.id.clone(),
            document_id: document.id.clone(),
            job_status: job.status,
            pipeline_status: document.pipeline_status,
            revision_id: job.revision_id.clone(),
            suggested_ranges: job.suggested_ranges.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ExtractionOrchestrator {
    store: Store,
    guard: Guard,
    blobs: Arc<dyn BlobStore>,
    extractor: Arc<dyn Extractor>,
    config: Arc<ServiceConfig>,
}

impl ExtractionOrchestrator {
    pub fn new(
        store: Store,
        guard: Guard,
        blobs: Arc<dyn BlobStore>,
        extractor: Arc<dyn Extractor>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            guard,
            blobs,
            extractor,
            config,
        }
    }

    fn estimate(&self, queued_at: &TimeStamp<Utc>, page_count: u32) -> TimeStamp<Utc> {
        let seconds = (i64::from(page_count) * self.config.extraction_seconds_per_page)
            .max(self.config.extraction_min_eta_seconds);
        queued_at.plus(Duration::seconds(seconds))
    }

    /// Queues extraction for a fresh upload, or re-queues a failed one.
    pub fn trigger(
        &self,
        document_id: &str,
        options: &ExtractionOptions,
        preconditions: &Preconditions,
    ) -> Result<Guarded<ExtractionTicket>, DocumentError> {
        let job_id = new_job_id()?;
        let now = self.guard.now();

        let ticket = self.guard.mutate(
            document_id,
            Endpoint::TriggerExtraction,
            self.config.extraction_idempotency_ttl,
            preconditions,
            |unit, document| {
                document.ensure_editable().map_err(abort)?;
                let event = match document.pipeline_status {
                    PipelineStatus::Uploaded => PipelineEvent::Enqueue,
                    PipelineStatus::FailedRetryable => PipelineEvent::Retry,
                    other => {
                        return Err(abort(DocumentError::InvalidState(format!(
                            "extraction cannot be triggered while {other}"
                        ))));
                    }
                };
                document.advance(event).map_err(abort)?;

                let job = ExtractionJob {
                    id: job_id.clone(),
                    document_id: document.id.clone(),
                    status: JobStatus::Queued,
                    options: options.clone(),
                    attempts: document.retry_count,
                    queued_at: now.clone(),
                    started_at: None,
                    finished_at: None,
                    revision_id: None,
                    suggested_ranges: vec![],
                    last_error: None,
                };
                unit.put(&keys::job(&job.id), &job)?;

                Ok(ExtractionTicket {
                    job_id: job.id.clone(),
                    document_id: document.id.clone(),
                    status: job.status,
                    queued_at: now.clone(),
                    estimated_completion: self.estimate(&now, document.page_count),
                    lock_version: document.lock_version,
                })
            },
        )?;

        if !ticket.replayed {
            tracing::info!(document_id, job_id = %ticket.value.job_id, "extraction queued");
        }
        Ok(ticket)
    }

    pub fn job(&self, job_id: &str) -> Result<ExtractionJob, DocumentError> {
        self.store
            .get(&keys::job(job_id))?
            .ok_or_else(|| DocumentError::not_found("extraction job", job_id))
    }

    /// Jobs waiting for a worker, oldest first.
    pub fn queued_jobs(&self) -> Result<Vec<ExtractionJob>, DocumentError> {
        let mut jobs: Vec<ExtractionJob> = self
            .store
            .scan::<ExtractionJob>(keys::JOB_PREFIX)?
            .into_iter()
            .filter(|job| job.status == JobStatus::Queued)
            .collect();
        jobs.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(jobs)
    }

    /// Runs one queued job to completion. Failures are recorded against the job
    /// before they are returned.
    pub fn process(&self, job_id: &str) -> Result<JobReport, DocumentError> {
        let job = self.job(job_id)?;
        let document_id = job.document_id.clone();

        let started = self.guard.mutate(
            &document_id,
            Endpoint::WorkerReport,
            self.config.extraction_idempotency_ttl,
            &Preconditions::none(),
            |unit, document| {
                let mut job: ExtractionJob = unit.require(&keys::job(job_id), "extraction job", job_id)?;
                if job.status != JobStatus::Queued {
                    return Err(abort(DocumentError::InvalidState(format!(
                        "job {job_id} is {} and cannot be started",
                        job.status.as_str()
                    ))));
                }
                document.advance(PipelineEvent::Start).map_err(abort)?;
                job.status = JobStatus::Running;
                job.started_at = Some(document.updated_at.clone());
                unit.put(&keys::job(job_id), &job)?;
                Ok(JobReport::of(&job, document))
            },
        )?;
        tracing::info!(document_id = %started.value.document_id, job_id, "extraction started");

        let document: ProcessingDocument = self
            .store
            .get(&keys::document(&document_id))?
            .ok_or_else(|| DocumentError::not_found("document", &document_id))?;

        let bytes = match self.blobs.get(&document.file_key) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_failure(job_id, FailureKind::Transient, &e.to_string())?;
                return Err(e);
            }
        };

        let context = ExtractionContext {
            document_id: document.id.clone(),
            tenant_id: document.tenant_id.clone(),
            company_id: document.company_id.clone(),
            file_name: document.file_name.clone(),
            mime_type: document.mime_type.clone(),
            page_count: document.page_count,
            options: job.options.clone(),
        };
        let proposal = match self.extractor.submit(&bytes, &context) {
            Ok(proposal) => proposal,
            Err(e) => {
                let message = format!("extractor failed: {e:#}");
                self.report_failure(job_id, FailureKind::Transient, &message)?;
                return Err(DocumentError::Internal(message));
            }
        };

        match self.complete(job_id, &document, proposal) {
            // a malformed proposal or a failed write is a failed attempt
            Err(e @ (DocumentError::Validation(_) | DocumentError::Storage(_))) => {
                self.report_failure(job_id, FailureKind::Transient, &format!("unusable proposal: {e}"))?;
                Err(e)
            }
            other => other,
        }
    }

    fn complete(
        &self,
        job_id: &str,
        snapshot: &ProcessingDocument,
        proposal: Proposal,
    ) -> Result<JobReport, DocumentError> {
        let revision_id = new_revision_id()?;
        let bundle = if proposal.bundle_ranges.len() >= 2 {
            match validate_ranges(&proposal.bundle_ranges, snapshot.page_count) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(document_id = %snapshot.id, error = %e, "ignoring unusable bundle ranges");
                    false
                }
            }
        } else {
            false
        };

        let report = self.guard.mutate(
            &snapshot.id,
            Endpoint::WorkerReport,
            self.config.extraction_idempotency_ttl,
            &Preconditions::none(),
            |unit, document| {
                let mut job: ExtractionJob = unit.require(&keys::job(job_id), "extraction job", job_id)?;
                if job.status != JobStatus::Running {
                    return Err(abort(DocumentError::InvalidState(format!(
                        "job {job_id} is {} and cannot complete",
                        job.status.as_str()
                    ))));
                }
                let now = document.updated_at.clone();
                job.finished_at = Some(now.clone());

                if bundle && job.options.detect_bundles {
                    document.advance(PipelineEvent::BundleDetected).map_err(abort)?;
                    job.status = JobStatus::SplitSuggested;
                    job.suggested_ranges = proposal.bundle_ranges.clone();
                } else {
                    let mut revision = DocumentRevision {
                        id: revision_id.clone(),
                        document_id: document.id.clone(),
                        revision_number: 0,
                        status: RevisionStatus::Draft,
                        source: RevisionSource::Extraction,
                        based_on: None,
                        header: proposal.header.clone(),
                        counterparty_contact_id: None,
                        line_items: vec![],
                        home: None,
                        validation: ValidationReport::default(),
                        evidence: proposal.evidence.clone(),
                        created_by: proposal
                            .model
                            .clone()
                            .unwrap_or_else(|| "extraction".to_string()),
                        reason: None,
                        created_at: now.clone(),
                        updated_at: now.clone(),
                        approved_at: None,
                        approved_by: None,
                    };
                    revision
                        .apply_line_changes(&proposal.line_items, &[])
                        .map_err(abort)?;
                    revision.validation = validate(&revision, self.config.total_tolerance);
                    stage_revision(unit, &mut revision)?;

                    document.advance(PipelineEvent::ExtractionSucceeded).map_err(abort)?;
                    job.status = JobStatus::Completed;
                    job.revision_id = Some(revision.id.clone());
                }
                unit.put(&keys::job(job_id), &job)?;
                Ok(JobReport::of(&job, document))
            },
        )?;

        tracing::info!(
            document_id = %snapshot.id,
            job_id,
            status = report.value.job_status.as_str(),
            "extraction finished"
        );
        Ok(report.value)
    }

    /// Records a failed attempt. Transient failures are re-queued while the retry
    /// budget lasts; otherwise the document lands in a failure terminal.
    pub fn report_failure(
        &self,
        job_id: &str,
        kind: FailureKind,
        message: &str,
    ) -> Result<JobReport, DocumentError> {
        let job = self.job(job_id)?;
        let policy = self.config.retry;

        let report = self.guard.mutate(
            &job.document_id,
            Endpoint::WorkerReport,
            self.config.extraction_idempotency_ttl,
            &Preconditions::none(),
            |unit, document| {
                let mut job: ExtractionJob = unit.require(&keys::job(job_id), "extraction job", job_id)?;
                if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
                    return Err(abort(DocumentError::InvalidState(format!(
                        "job {job_id} is {} and cannot fail",
                        job.status.as_str()
                    ))));
                }
                document.advance(PipelineEvent::TransientFailure).map_err(abort)?;
                document.retry_count += 1;
                document.last_error = Some(message.to_string());

                let next = document
                    .advance(policy.next_event(document.retry_count, kind))
                    .map_err(abort)?;
                job.attempts = document.retry_count;
                job.last_error = Some(message.to_string());
                if next == PipelineStatus::Queued {
                    job.status = JobStatus::Queued;
                    job.started_at = None;
                } else {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(document.updated_at.clone());
                }
                unit.put(&keys::job(job_id), &job)?;
                Ok(JobReport::of(&job, document))
            },
        )?;

        tracing::warn!(
            document_id = %job.document_id,
            job_id,
            job_status = report.value.job_status.as_str(),
            pipeline_status = %report.value.pipeline_status,
            error = message,
            "extraction attempt failed"
        );
        Ok(report.value)
    }
}
