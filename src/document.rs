//! Processing documents, their page rows and the links between them
use chrono::Utc;

use crate::duplicate::{DuplicateDecision, DuplicateStatus};
use crate::error::DocumentError;
use crate::pages::PDF_MIME;
use crate::pipeline::{PipelineEvent, PipelineStatus};
use crate::types::TimeStamp;

/// One processing unit for a stored file, or a page range of one.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct ProcessingDocument {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub tenant_id: String,
    #[n(2)]
    pub company_id: String,
    #[n(3)]
    pub file_key: String, // blob store location of the current bytes
    #[n(4)]
    pub file_name: String,
    #[n(5)]
    pub mime_type: String,
    #[n(6)]
    pub file_size: u64,
    #[n(7)]
    pub pipeline_status: PipelineStatus,
    #[n(8)]
    pub duplicate_status: DuplicateStatus,
    #[n(9)]
    pub duplicate_of: Option<String>,
    #[n(10)]
    pub duplicate_decision: Option<DuplicateDecision>,
    #[n(11)]
    pub is_container: bool,
    #[n(12)]
    pub parent_id: Option<String>,
    #[n(13)]
    pub page_from: Option<u32>,
    #[n(14)]
    pub page_to: Option<u32>,
    #[n(15)]
    pub page_count: u32,
    #[n(16)]
    pub current_revision_id: Option<String>, // always an APPROVED revision
    #[n(17)]
    pub lock_version: u64,
    #[n(18)]
    pub version: u32,
    #[n(19)]
    pub root_document_id: String,
    #[n(20)]
    pub retry_count: u32,
    #[n(21)]
    pub last_error: Option<String>,
    #[n(22)]
    pub created_at: TimeStamp<Utc>,
    #[n(23)]
    pub updated_at: TimeStamp<Utc>,
    #[n(24)]
    pub deleted_at: Option<TimeStamp<Utc>>,
}

impl ProcessingDocument {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_paginated(&self) -> bool {
        self.mime_type == PDF_MIME
    }

    /// Containers were split into children and no longer take direct edits.
    pub fn ensure_editable(&self) -> Result<(), DocumentError> {
        if self.is_container {
            return Err(DocumentError::InvalidState(format!(
                "document {} was split into child documents and is read-only",
                self.id
            )));
        }
        Ok(())
    }

    pub fn advance(&mut self, event: PipelineEvent) -> Result<PipelineStatus, DocumentError> {
        let next = self.pipeline_status.apply(event)?;
        tracing::info!(
            document_id = %self.id,
            from = %self.pipeline_status,
            to = %next,
            "pipeline transition"
        );
        self.pipeline_status = next;
        Ok(next)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DocumentPage {
    #[n(0)]
    pub number: u32,
    #[n(1)]
    pub width: f32,
    #[n(2)]
    pub height: f32,
    #[n(3)]
    pub rotation: u16,
    #[n(4)]
    pub fingerprint: String,
}

/// Page rows of one document, ordered by page number.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq)]
pub struct PageSet {
    #[n(0)]
    pub pages: Vec<DocumentPage>,
}

pub const ROTATIONS: [u16; 4] = [0, 90, 180, 270];

impl PageSet {
    pub fn set_rotation(&mut self, page_number: u32, degrees: u16) -> Result<(), DocumentError> {
        if !ROTATIONS.contains(&degrees) {
            return Err(DocumentError::Validation(format!(
                "rotation must be one of 0, 90, 180 or 270 degrees, got {degrees}"
            )));
        }
        let page = self
            .pages
            .iter_mut()
            .find(|p| p.number == page_number)
            .ok_or_else(|| {
                DocumentError::Validation(format!("page {page_number} does not exist"))
            })?;
        page.rotation = degrees;
        Ok(())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    #[n(0)]
    SplitChild,
    #[n(1)]
    Related,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DocumentLink {
    #[n(0)]
    pub from_id: String,
    #[n(1)]
    pub to_id: String,
    #[n(2)]
    pub kind: LinkKind,
    #[n(3)]
    pub created_at: TimeStamp<Utc>,
}

/// An upload as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub tenant_id: String,
    pub company_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}
