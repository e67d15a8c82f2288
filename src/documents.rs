//! Document level operations: upload, split, append, rotation, links and soft delete.
//!
//! Byte work (reading, merging, uploading) happens before the guarded
//! transaction opens, because sled may run a transaction body more than once.
//! Blob keys are derived from content, so repeating that work is harmless.
use chrono::Utc;
use std::sync::Arc;

use crate::blob::BlobStore;
use crate::config::ServiceConfig;
use crate::document::{DocumentLink, DocumentPage, LinkKind, NewDocument, PageSet, ProcessingDocument};
use crate::duplicate::DuplicateStatus;
use crate::error::DocumentError;
use crate::guard::{Endpoint, Guard, Guarded, Preconditions, load_live};
use crate::pages::{self, PDF_MIME, PageInfo, PageRange, SourceFile, SourceKind};
use crate::pipeline::{PipelineEvent, PipelineStatus};
use crate::store::{Store, UnitOfWork, TxResult, abort, keys};
use crate::types::TimeStamp;
use crate::utils::{content_key, new_document_id};

const BLOB_NAMESPACE: &str = "documents";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct SplitChild {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub page_from: u32,
    #[n(2)]
    pub page_to: u32,
    #[n(3)]
    pub page_count: u32,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct SplitOutcome {
    #[n(0)]
    pub parent_id: String,
    #[n(1)]
    pub children: Vec<SplitChild>,
    #[n(2)]
    pub lock_version: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    #[n(0)]
    pub pages_added: u32,
    #[n(1)]
    pub new_total_pages: u32,
    #[n(2)]
    pub file_size: u64,
    #[n(3)]
    pub lock_version: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DeletedDocument {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub deleted_at: TimeStamp<Utc>,
    #[n(2)]
    pub lock_version: u64,
}

/// Outgoing and incoming links of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentLinks {
    pub outgoing: Vec<DocumentLink>,
    pub incoming: Vec<DocumentLink>,
}

fn page_rows(infos: &[PageInfo]) -> Vec<DocumentPage> {
    infos
        .iter()
        .map(|info| DocumentPage {
            number: info.number,
            width: info.width,
            height: info.height,
            rotation: 0,
            fingerprint: info.fingerprint.clone(),
        })
        .collect()
}

fn put_link(unit: &UnitOfWork<'_>, link: &DocumentLink) -> TxResult<()> {
    unit.put(&keys::link(&link.from_id, &link.to_id), link)?;
    unit.put(&keys::backlink(&link.to_id, &link.from_id), link)
}

// a file whose bytes moved since the caller's snapshot must be re-read
fn ensure_same_bytes(
    document: &ProcessingDocument,
    snapshot: &ProcessingDocument,
) -> Result<(), DocumentError> {
    if document.file_key != snapshot.file_key {
        return Err(DocumentError::ConcurrentModification {
            document_id: document.id.clone(),
            expected: snapshot.lock_version,
            actual: document.lock_version.saturating_sub(1),
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct DocumentManager {
    store: Store,
    guard: Guard,
    blobs: Arc<dyn BlobStore>,
    config: Arc<ServiceConfig>,
}

impl DocumentManager {
    pub fn new(
        store: Store,
        guard: Guard,
        blobs: Arc<dyn BlobStore>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            guard,
            blobs,
            config,
        }
    }

    fn check_size(&self, file_name: &str, size: usize) -> Result<(), DocumentError> {
        let size = size as u64;
        if size > self.config.max_upload_bytes {
            return Err(DocumentError::FileTooLarge {
                name: file_name.to_string(),
                size,
                limit: self.config.max_upload_bytes,
            });
        }
        Ok(())
    }

    /// Returns a live document; deleted documents are reported missing.
    pub fn get(&self, document_id: &str) -> Result<ProcessingDocument, DocumentError> {
        match self.store.get::<ProcessingDocument>(&keys::document(document_id))? {
            Some(document) if !document.is_deleted() => Ok(document),
            _ => Err(DocumentError::not_found("document", document_id)),
        }
    }

    pub fn pages(&self, document_id: &str) -> Result<PageSet, DocumentError> {
        self.get(document_id)?;
        Ok(self
            .store
            .get(&keys::pages(document_id))?
            .unwrap_or_default())
    }

    pub fn upload(&self, upload: NewDocument) -> Result<ProcessingDocument, DocumentError> {
        self.check_size(&upload.file_name, upload.bytes.len())?;
        SourceKind::from_mime(&upload.mime_type)?;
        if upload.tenant_id.is_empty() || upload.company_id.is_empty() {
            return Err(DocumentError::Validation(
                "tenant and company are required".to_string(),
            ));
        }
        let infos = pages::describe(&upload.mime_type, &upload.bytes)?;

        let file_key = content_key(
            BLOB_NAMESPACE,
            &upload.bytes,
            SourceKind::extension(&upload.mime_type),
        );
        self.blobs.put(&file_key, &upload.bytes)?;

        let id = new_document_id()?;
        let now = self.guard.now();
        let document = ProcessingDocument {
            id: id.clone(),
            tenant_id: upload.tenant_id,
            company_id: upload.company_id,
            file_key,
            file_name: upload.file_name,
            mime_type: upload.mime_type,
            file_size: upload.bytes.len() as u64,
            pipeline_status: PipelineStatus::Uploaded,
            duplicate_status: DuplicateStatus::None,
            duplicate_of: None,
            duplicate_decision: None,
            is_container: false,
            parent_id: None,
            page_from: None,
            page_to: None,
            page_count: infos.len() as u32,
            current_revision_id: None,
            lock_version: 0,
            version: 1,
            root_document_id: id.clone(),
            retry_count: 0,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        };
        let page_set = PageSet {
            pages: page_rows(&infos),
        };

        self.store.transact(|unit| {
            unit.put(&keys::document(&id), &document)?;
            unit.put(&keys::pages(&id), &page_set)
        })?;

        tracing::info!(
            document_id = %id,
            mime_type = %document.mime_type,
            page_count = document.page_count,
            "document uploaded"
        );
        Ok(document)
    }

    /// Copies each range into a child document and turns the source into a container.
    pub fn split(
        &self,
        document_id: &str,
        ranges: &[PageRange],
        preconditions: &Preconditions,
    ) -> Result<Guarded<SplitOutcome>, DocumentError> {
        if let Some(cached) = self.guard.replay(document_id, Endpoint::SplitDocument, preconditions)? {
            return Ok(cached);
        }
        let snapshot = self.get(document_id)?;
        if snapshot.mime_type != PDF_MIME {
            return Err(DocumentError::InvalidState(format!(
                "only {PDF_MIME} documents can be split, {} is {}",
                snapshot.id, snapshot.mime_type
            )));
        }
        snapshot.ensure_editable()?;
        pages::validate_ranges(ranges, snapshot.page_count)?;

        let bytes = self.blobs.get(&snapshot.file_key)?;
        let parts = pages::split(&bytes, ranges)?;

        let mut prepared = Vec::with_capacity(parts.len());
        for part in parts {
            let file_key = content_key(BLOB_NAMESPACE, &part.bytes, "pdf");
            self.blobs.put(&file_key, &part.bytes)?;
            prepared.push((new_document_id()?, file_key, part));
        }

        let stem = snapshot
            .file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&snapshot.file_name)
            .to_string();

        let outcome = self.guard.mutate(
            document_id,
            Endpoint::SplitDocument,
            self.config.revision_idempotency_ttl,
            preconditions,
            |unit, document| {
                document.ensure_editable().map_err(abort)?;
                ensure_same_bytes(document, &snapshot).map_err(abort)?;
                document.advance(PipelineEvent::SplitCompleted).map_err(abort)?;
                document.is_container = true;
                let now = document.updated_at.clone();

                let mut children = Vec::with_capacity(prepared.len());
                for (child_id, file_key, part) in &prepared {
                    let child = ProcessingDocument {
                        id: child_id.clone(),
                        tenant_id: document.tenant_id.clone(),
                        company_id: document.company_id.clone(),
                        file_key: file_key.clone(),
                        file_name: format!("{stem}_p{}-{}.pdf", part.range.from, part.range.to),
                        mime_type: PDF_MIME.to_string(),
                        file_size: part.bytes.len() as u64,
                        pipeline_status: PipelineStatus::Uploaded,
                        duplicate_status: DuplicateStatus::None,
                        duplicate_of: None,
                        duplicate_decision: None,
                        is_container: false,
                        parent_id: Some(document.id.clone()),
                        page_from: Some(part.range.from),
                        page_to: Some(part.range.to),
                        page_count: part.pages.len() as u32,
                        current_revision_id: None,
                        lock_version: 0,
                        version: document.version + 1,
                        root_document_id: document.root_document_id.clone(),
                        retry_count: 0,
                        last_error: None,
                        created_at: now.clone(),
                        updated_at: now.clone(),
                        deleted_at: None,
                    };
                    unit.put(&keys::document(child_id), &child)?;
                    unit.put(
                        &keys::pages(child_id),
                        &PageSet {
                            pages: page_rows(&part.pages),
                        },
                    )?;
                    put_link(
                        unit,
                        &DocumentLink {
                            from_id: document.id.clone(),
                            to_id: child_id.clone(),
                            kind: LinkKind::SplitChild,
                            created_at: now.clone(),
                        },
                    )?;
                    children.push(SplitChild {
                        document_id: child_id.clone(),
                        page_from: part.range.from,
                        page_to: part.range.to,
                        page_count: child.page_count,
                    });
                }

                Ok(SplitOutcome {
                    parent_id: document.id.clone(),
                    children,
                    lock_version: document.lock_version,
                })
            },
        )?;

        if !outcome.replayed {
            tracing::info!(
                document_id,
                children = outcome.value.children.len(),
                "document split"
            );
        }
        Ok(outcome)
    }

    /// Appends files as new pages at the end of a PDF document.
    pub fn append(
        &self,
        document_id: &str,
        files: &[SourceFile],
        preconditions: &Preconditions,
    ) -> Result<Guarded<AppendOutcome>, DocumentError> {
        if let Some(cached) = self.guard.replay(document_id, Endpoint::AppendPages, preconditions)? {
            return Ok(cached);
        }
        let snapshot = self.get(document_id)?;
        if !snapshot.is_paginated() {
            return Err(DocumentError::InvalidType(format!(
                "pages can only be appended to {PDF_MIME} documents, {} is {}",
                snapshot.id, snapshot.mime_type
            )));
        }
        snapshot.ensure_editable()?;
        if files.is_empty() {
            return Err(DocumentError::Validation(
                "at least one file is required".to_string(),
            ));
        }
        for file in files {
            self.check_size(&file.file_name, file.bytes.len())?;
            SourceKind::from_mime(&file.mime_type)?;
        }

        let bytes = self.blobs.get(&snapshot.file_key)?;
        let merged = pages::append(&bytes, files)?;
        let file_key = content_key(BLOB_NAMESPACE, &merged.bytes, "pdf");
        self.blobs.put(&file_key, &merged.bytes)?;
        let added = page_rows(&merged.added);

        let outcome = self.guard.mutate(
            document_id,
            Endpoint::AppendPages,
            self.config.revision_idempotency_ttl,
            preconditions,
            |unit, document| {
                document.ensure_editable().map_err(abort)?;
                ensure_same_bytes(document, &snapshot).map_err(abort)?;

                let mut page_set: PageSet = unit.get(&keys::pages(document_id))?.unwrap_or_default();
                page_set.pages.extend(added.iter().cloned());
                unit.put(&keys::pages(document_id), &page_set)?;

                document.file_key = file_key.clone();
                document.file_size = merged.bytes.len() as u64;
                document.page_count = merged.total_pages;

                Ok(AppendOutcome {
                    pages_added: added.len() as u32,
                    new_total_pages: merged.total_pages,
                    file_size: document.file_size,
                    lock_version: document.lock_version,
                })
            },
        )?;

        if !outcome.replayed {
            tracing::info!(
                document_id,
                pages_added = outcome.value.pages_added,
                total_pages = outcome.value.new_total_pages,
                "pages appended"
            );
        }
        Ok(outcome)
    }

    pub fn rotate(
        &self,
        document_id: &str,
        page_number: u32,
        degrees: u16,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DocumentPage>, DocumentError> {
        self.guard.mutate(
            document_id,
            Endpoint::RotatePage,
            self.config.revision_idempotency_ttl,
            preconditions,
            |unit, document| {
                document.ensure_editable().map_err(abort)?;
                let mut page_set: PageSet = unit.get(&keys::pages(document_id))?.unwrap_or_default();
                page_set.set_rotation(page_number, degrees).map_err(abort)?;
                unit.put(&keys::pages(document_id), &page_set)?;

                page_set
                    .pages
                    .into_iter()
                    .find(|page| page.number == page_number)
                    .ok_or_else(|| abort(DocumentError::Internal("rotated page vanished".to_string())))
            },
        )
    }

    /// Soft delete. Children, revisions and links stay in place.
    pub fn delete(
        &self,
        document_id: &str,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DeletedDocument>, DocumentError> {
        let deleted = self.guard.mutate(
            document_id,
            Endpoint::DeleteDocument,
            self.config.revision_idempotency_ttl,
            preconditions,
            |_, document| {
                let now = document.updated_at.clone();
                document.deleted_at = Some(now.clone());
                Ok(DeletedDocument {
                    document_id: document.id.clone(),
                    deleted_at: now,
                    lock_version: document.lock_version,
                })
            },
        )?;
        if !deleted.replayed {
            tracing::info!(document_id, "document deleted");
        }
        Ok(deleted)
    }

    pub fn link(
        &self,
        from_id: &str,
        to_id: &str,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DocumentLink>, DocumentError> {
        if from_id == to_id {
            return Err(DocumentError::Validation(
                "a document cannot be linked to itself".to_string(),
            ));
        }
        self.guard.mutate(
            from_id,
            Endpoint::LinkDocuments,
            self.config.revision_idempotency_ttl,
            preconditions,
            |unit, document| {
                let target = load_live(unit, to_id)?;
                if target.tenant_id != document.tenant_id || target.company_id != document.company_id {
                    return Err(abort(DocumentError::Validation(format!(
                        "{to_id} belongs to a different company"
                    ))));
                }
                let link = DocumentLink {
                    from_id: from_id.to_string(),
                    to_id: to_id.to_string(),
                    kind: LinkKind::Related,
                    created_at: document.updated_at.clone(),
                };
                put_link(unit, &link)?;
                Ok(link)
            },
        )
    }

    pub fn links(&self, document_id: &str) -> Result<DocumentLinks, DocumentError> {
        self.get(document_id)?;
        Ok(DocumentLinks {
            outgoing: self.store.scan(&keys::links_from(document_id))?,
            incoming: self.store.scan(&keys::backlinks_to(document_id))?,
        })
    }
}
