//! Duplicate detection gate.
//!
//! Deciding whether two submissions are the same document belongs to an external
//! matcher. This module keeps the status it reports, records the human decision
//! and answers the single question approval asks: may this document be approved?
use chrono::Utc;

use crate::document::ProcessingDocument;
use crate::error::DocumentError;
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateStatus {
    #[n(0)]
    #[default]
    None,
    #[n(1)]
    Suspected,
    #[n(2)]
    Confirmed,
    #[n(3)]
    Rejected,
}

impl DuplicateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DuplicateStatus::None => "NONE",
            DuplicateStatus::Suspected => "SUSPECTED",
            DuplicateStatus::Confirmed => "CONFIRMED",
            DuplicateStatus::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for DuplicateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reviewer's verdict on a suspected duplicate.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DuplicateDecision {
    #[n(0)]
    pub status: DuplicateStatus,
    #[n(1)]
    pub decided_by: String,
    #[n(2)]
    pub decided_at: TimeStamp<Utc>,
    #[n(3)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub can_approve: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            can_approve: true,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            can_approve: false,
            reason: Some(reason.into()),
        }
    }

    /// Turns a refusal into DUPLICATE_DECISION_REQUIRED.
    pub fn into_result(self) -> Result<(), DocumentError> {
        if self.can_approve {
            return Ok(());
        }
        Err(DocumentError::DuplicateDecisionRequired(
            self.reason
                .unwrap_or_else(|| "duplicate review pending".to_string()),
        ))
    }
}

/// Answers whether a document may be approved. Swap in a matcher specific
/// implementation through the service builder.
pub trait DuplicateGate: Send + Sync {
    fn can_approve(&self, document: &ProcessingDocument) -> GateDecision;
}

/// Default gate driven purely by the recorded duplicate status.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusGate;

impl DuplicateGate for StatusGate {
    fn can_approve(&self, document: &ProcessingDocument) -> GateDecision {
        let of = document.duplicate_of.as_deref().unwrap_or("another document");
        match document.duplicate_status {
            DuplicateStatus::None | DuplicateStatus::Rejected => GateDecision::allow(),
            DuplicateStatus::Suspected => GateDecision::block(format!(
                "document {} is a suspected duplicate of {of}; record a decision first",
                document.id
            )),
            DuplicateStatus::Confirmed => GateDecision::block(format!(
                "document {} is a confirmed duplicate of {of}",
                document.id
            )),
        }
    }
}

/// Marks a document as suspected. A recorded decision is cleared, since it
/// was made against a different match.
pub fn flag_suspected(
    document: &mut ProcessingDocument,
    duplicate_of: &str,
) -> Result<(), DocumentError> {
    if duplicate_of == document.id {
        return Err(DocumentError::Validation(
            "a document cannot duplicate itself".to_string(),
        ));
    }
    document.duplicate_status = DuplicateStatus::Suspected;
    document.duplicate_of = Some(duplicate_of.to_string());
    document.duplicate_decision = None;
    Ok(())
}

/// Applies a reviewer decision. Only CONFIRMED and REJECTED are decisions.
pub fn record_decision(
    document: &mut ProcessingDocument,
    decision: DuplicateDecision,
) -> Result<(), DocumentError> {
    match decision.status {
        DuplicateStatus::Confirmed | DuplicateStatus::Rejected => {}
        other => {
            return Err(DocumentError::Validation(format!(
                "duplicate decision must be CONFIRMED or REJECTED, got {other}"
            )));
        }
    }
    if document.duplicate_status == DuplicateStatus::None {
        return Err(DocumentError::InvalidState(format!(
            "document {} has not been flagged as a duplicate",
            document.id
        )));
    }
    document.duplicate_status = decision.status;
    document.duplicate_decision = Some(decision);
    Ok(())
}

/// Response of the duplicate mutations.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DuplicateState {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub status: DuplicateStatus,
    #[n(2)]
    pub duplicate_of: Option<String>,
    #[n(3)]
    pub lock_version: u64,
}

impl DuplicateState {
    pub fn of(document: &ProcessingDocument) -> Self {
        Self {
            document_id: document.id.clone(),
            status: document.duplicate_status,
            duplicate_of: document.duplicate_of.clone(),
            lock_version: document.lock_version,
        }
    }
}
