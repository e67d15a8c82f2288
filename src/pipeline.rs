//! Processing lifecycle of a document.
//!
//! The status only ever moves along the edges listed in [`PipelineStatus::apply`].
//! SPLIT_DONE and EXTRACTION_DONE are the success terminals, FAILED_PERMANENT and
//! DEAD_LETTER the failure terminals. Anything else is rejected with INVALID_STATE.
use crate::error::DocumentError;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStatus {
    #[n(0)]
    Uploaded,
    #[n(1)]
    Queued,
    #[n(2)]
    Processing,
    #[n(3)]
    SplitPending,
    #[n(4)]
    SplitDone,
    #[n(5)]
    ExtractionDone,
    #[n(6)]
    FailedRetryable,
    #[n(7)]
    FailedPermanent,
    #[n(8)]
    DeadLetter,
}

/// Which failure terminal an exhausted retry budget lands in.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTerminal {
    #[n(0)]
    Permanent,
    #[n(1)]
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Extraction requested for a fresh upload
    Enqueue,
    /// A worker picked the job up
    Start,
    /// Extraction found several documents in one file
    BundleDetected,
    ExtractionSucceeded,
    /// Split into child documents finished
    SplitCompleted,
    TransientFailure,
    Retry,
    Exhausted(FailureTerminal),
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 9] = [
        PipelineStatus::Uploaded,
        PipelineStatus::Queued,
        PipelineStatus::Processing,
        PipelineStatus::SplitPending,
        PipelineStatus::SplitDone,
        PipelineStatus::ExtractionDone,
        PipelineStatus::FailedRetryable,
        PipelineStatus::FailedPermanent,
        PipelineStatus::DeadLetter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Uploaded => "UPLOADED",
            PipelineStatus::Queued => "QUEUED",
            PipelineStatus::Processing => "PROCESSING",
            PipelineStatus::SplitPending => "SPLIT_PENDING",
            PipelineStatus::SplitDone => "SPLIT_DONE",
            PipelineStatus::ExtractionDone => "EXTRACTION_DONE",
            PipelineStatus::FailedRetryable => "FAILED_RETRYABLE",
            PipelineStatus::FailedPermanent => "FAILED_PERMANENT",
            PipelineStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn is_terminal(self) -> bool {
        self.is_success() || self.is_failure()
    }

    pub fn is_success(self) -> bool {
        matches!(self, PipelineStatus::SplitDone | PipelineStatus::ExtractionDone)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, PipelineStatus::FailedPermanent | PipelineStatus::DeadLetter)
    }

    /// Returns the status reached by `event`, or INVALID_STATE if the edge does not exist.
    pub fn apply(self, event: PipelineEvent) -> Result<PipelineStatus, DocumentError> {
        use PipelineEvent as E;
        use PipelineStatus as S;

        let next = match (self, event) {
            (S::Uploaded, E::Enqueue) => S::Queued,
            (S::Queued, E::Start) => S::Processing,
            (S::Processing, E::BundleDetected) => S::SplitPending,
            (S::Processing, E::ExtractionSucceeded) => S::ExtractionDone,
            // a bundle can be split by hand before it is ever queued
            (S::Uploaded | S::SplitPending, E::SplitCompleted) => S::SplitDone,
            (S::Uploaded | S::Queued | S::Processing | S::SplitPending, E::TransientFailure) => {
                S::FailedRetryable
            }
            (S::FailedRetryable, E::Retry) => S::Queued,
            (S::FailedRetryable, E::Exhausted(FailureTerminal::Permanent)) => S::FailedPermanent,
            (S::FailedRetryable, E::Exhausted(FailureTerminal::DeadLetter)) => S::DeadLetter,
            (from, event) => {
                return Err(DocumentError::InvalidState(format!(
                    "pipeline cannot handle {event:?} while {}",
                    from.as_str()
                )));
            }
        };

        Ok(next)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker classified a failure.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    #[n(0)]
    Transient,
    #[n(1)]
    Permanent,
}

/// Bounded automatic retry for FAILED_RETRYABLE documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed in total, including the first one
    pub max_attempts: u32,
    /// Where a transient failure goes once the budget is spent
    pub on_exhausted: FailureTerminal,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            on_exhausted: FailureTerminal::DeadLetter,
        }
    }
}

impl RetryPolicy {
    /// The event that follows FAILED_RETRYABLE after `attempts` failed attempts.
    pub fn next_event(&self, attempts: u32, kind: FailureKind) -> PipelineEvent {
        match kind {
            FailureKind::Permanent => PipelineEvent::Exhausted(FailureTerminal::Permanent),
            FailureKind::Transient if attempts < self.max_attempts => PipelineEvent::Retry,
            FailureKind::Transient => PipelineEvent::Exhausted(self.on_exhausted),
        }
    }
}
