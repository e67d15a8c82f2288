//! Service layer API for the document intake pipeline
use std::sync::Arc;

use crate::alias::{AliasMatch, AliasService, Contact};
use crate::blob::{BlobStore, SledBlobStore};
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    Actor, AllowAll, AuditEntry, AuditSink, Authorizer, ExchangeRates, Permission, RateTable,
    TracingAuditSink,
};
use crate::config::ServiceConfig;
use crate::document::{DocumentLink, DocumentPage, NewDocument, PageSet, ProcessingDocument};
use crate::documents::{
    AppendOutcome, DeletedDocument, DocumentLinks, DocumentManager, SplitOutcome,
};
use crate::duplicate::{
    DuplicateDecision, DuplicateGate, DuplicateState, DuplicateStatus, GateDecision, StatusGate,
    flag_suspected, record_decision,
};
use crate::error::DocumentError;
use crate::events::{EventBus, RevisionEventHandler};
use crate::extraction::{
    ExtractionJob, ExtractionOptions, ExtractionOrchestrator, ExtractionTicket, Extractor,
    JobReport,
};
use crate::guard::{Endpoint, Guard, Guarded, Preconditions};
use crate::pages::{PageRange, SourceFile};
use crate::pipeline::FailureKind;
use crate::revision::{DocumentRevision, LineItemInput, RevisionPatch, ValidationReport};
use crate::revisions::{Approval, ApprovalInput, RevisionManager};
use crate::store::{Store, abort};

pub struct DocumentServiceBuilder {
    instance: Arc<sled::Db>,
    extractor: Arc<dyn Extractor>,
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    blobs: Option<Arc<dyn BlobStore>>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    rates: Arc<dyn ExchangeRates>,
    gate: Arc<dyn DuplicateGate>,
    handlers: Vec<Arc<dyn RevisionEventHandler>>,
}

impl DocumentServiceBuilder {
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }
    pub fn with_exchange_rates(mut self, rates: Arc<dyn ExchangeRates>) -> Self {
        self.rates = rates;
        self
    }
    pub fn with_duplicate_gate(mut self, gate: Arc<dyn DuplicateGate>) -> Self {
        self.gate = gate;
        self
    }
    /// Extra subscriber for revision events; alias learning is always subscribed.
    pub fn subscribe(mut self, handler: Arc<dyn RevisionEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<DocumentService, DocumentError> {
        let store = Store::new(self.instance.clone());
        let config = Arc::new(self.config);
        let guard = Guard::new(store.clone(), self.clock);
        let blobs = match self.blobs {
            Some(blobs) => blobs,
            None => Arc::new(SledBlobStore::open(&self.instance)?),
        };

        let aliases = AliasService::new(store.clone(), config.alias.clone());
        let mut events = EventBus::new();
        events.subscribe(Arc::new(aliases.clone()));
        for handler in self.handlers {
            events.subscribe(handler);
        }

        Ok(DocumentService {
            documents: DocumentManager::new(
                store.clone(),
                guard.clone(),
                blobs.clone(),
                config.clone(),
            ),
            extraction: ExtractionOrchestrator::new(
                store.clone(),
                guard.clone(),
                blobs,
                self.extractor,
                config.clone(),
            ),
            revisions: RevisionManager::new(
                store,
                guard.clone(),
                self.gate.clone(),
                self.rates,
                events,
                config.clone(),
            ),
            aliases,
            gate: self.gate,
            guard,
            authorizer: self.authorizer,
            audit: self.audit,
            config,
        })
    }
}

pub struct DocumentService {
    documents: DocumentManager,
    extraction: ExtractionOrchestrator,
    revisions: RevisionManager,
    aliases: AliasService,
    gate: Arc<dyn DuplicateGate>,
    guard: Guard,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    config: Arc<ServiceConfig>,
}

impl DocumentService {
    pub fn builder(instance: Arc<sled::Db>, extractor: Arc<dyn Extractor>) -> DocumentServiceBuilder {
        DocumentServiceBuilder {
            instance,
            extractor,
            config: ServiceConfig::default(),
            clock: Arc::new(SystemClock),
            blobs: None,
            authorizer: Arc::new(AllowAll),
            audit: Arc::new(TracingAuditSink),
            rates: Arc::new(RateTable::new()),
            gate: Arc::new(StatusGate),
            handlers: vec![],
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Loads the document and checks the actor may act on its company.
    fn authorize(
        &self,
        actor: &Actor,
        document_id: &str,
        permission: Permission,
    ) -> Result<ProcessingDocument, DocumentError> {
        let document = self.documents.get(document_id)?;
        self.authorizer
            .check(actor, &document.tenant_id, &document.company_id, permission)
            .inspect_err(|e| {
                tracing::warn!(actor = %actor.user_id, document_id, error = %e, "authorization refused");
            })?;
        Ok(document)
    }

    /// Records an accepted mutation. Replays committed nothing and are not audited.
    fn audit(
        &self,
        actor: &Actor,
        action: &'static str,
        document_id: &str,
        revision_id: Option<&str>,
        committed_version: Option<u64>,
    ) {
        let Some(lock_version) = committed_version else {
            return;
        };
        let entry = AuditEntry {
            actor: actor.user_id.clone(),
            action,
            document_id: document_id.to_string(),
            revision_id: revision_id.map(str::to_string),
            lock_version,
            detail: None,
            at: self.guard.now(),
        };
        if let Err(e) = self.audit.append(&entry) {
            tracing::warn!(action, document_id, error = %e, "audit append failed");
        }
    }

    // documents

    pub fn upload_document(
        &self,
        actor: &Actor,
        upload: NewDocument,
    ) -> Result<ProcessingDocument, DocumentError> {
        self.authorizer.check(
            actor,
            &upload.tenant_id,
            &upload.company_id,
            Permission::Update,
        )?;
        let document = self.documents.upload(upload)?;
        self.audit(
            actor,
            "document.upload",
            &document.id,
            None,
            Some(document.lock_version),
        );
        Ok(document)
    }

    pub fn get_document(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<ProcessingDocument, DocumentError> {
        self.authorize(actor, document_id, Permission::Read)
    }

    pub fn document_pages(&self, actor: &Actor, document_id: &str) -> Result<PageSet, DocumentError> {
        self.authorize(actor, document_id, Permission::Read)?;
        self.documents.pages(document_id)
    }

    pub fn update_page_rotation(
        &self,
        actor: &Actor,
        document_id: &str,
        page_number: u32,
        degrees: u16,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DocumentPage>, DocumentError> {
        self.authorize(actor, document_id, Permission::Update)?;
        let outcome = self
            .documents
            .rotate(document_id, page_number, degrees, preconditions)?;
        self.audit(actor, "document.rotate_page", document_id, None, outcome.committed_version);
        Ok(outcome)
    }

    pub fn append_pages(
        &self,
        actor: &Actor,
        document_id: &str,
        files: &[SourceFile],
        preconditions: &Preconditions,
    ) -> Result<Guarded<AppendOutcome>, DocumentError> {
        self.authorize(actor, document_id, Permission::Update)?;
        let outcome = self.documents.append(document_id, files, preconditions)?;
        self.audit(
            actor,
            "document.append_pages",
            document_id,
            None,
            outcome.committed_version,
        );
        Ok(outcome)
    }

    pub fn split_document(
        &self,
        actor: &Actor,
        document_id: &str,
        ranges: &[PageRange],
        preconditions: &Preconditions,
    ) -> Result<Guarded<SplitOutcome>, DocumentError> {
        self.authorize(actor, document_id, Permission::Update)?;
        let outcome = self.documents.split(document_id, ranges, preconditions)?;
        self.audit(
            actor,
            "document.split",
            document_id,
            None,
            outcome.committed_version,
        );
        Ok(outcome)
    }

    pub fn delete_document(
        &self,
        actor: &Actor,
        document_id: &str,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DeletedDocument>, DocumentError> {
        // a replayed delete finds the document already gone
        if preconditions.idempotency_key.is_none() {
            self.authorize(actor, document_id, Permission::Update)?;
        } else if let Ok(document) = self.documents.get(document_id) {
            self.authorizer.check(
                actor,
                &document.tenant_id,
                &document.company_id,
                Permission::Update,
            )?;
        }
        let outcome = self.documents.delete(document_id, preconditions)?;
        self.audit(
            actor,
            "document.delete",
            document_id,
            None,
            outcome.committed_version,
        );
        Ok(outcome)
    }

    pub fn link_documents(
        &self,
        actor: &Actor,
        from_id: &str,
        to_id: &str,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DocumentLink>, DocumentError> {
        self.authorize(actor, from_id, Permission::Update)?;
        self.authorize(actor, to_id, Permission::Read)?;
        let outcome = self.documents.link(from_id, to_id, preconditions)?;
        self.audit(actor, "document.link", from_id, None, outcome.committed_version);
        Ok(outcome)
    }

    pub fn document_links(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<DocumentLinks, DocumentError> {
        self.authorize(actor, document_id, Permission::Read)?;
        self.documents.links(document_id)
    }

    // extraction

    pub fn trigger_extraction(
        &self,
        actor: &Actor,
        document_id: &str,
        options: &ExtractionOptions,
        preconditions: &Preconditions,
    ) -> Result<Guarded<ExtractionTicket>, DocumentError> {
        self.authorize(actor, document_id, Permission::Update)?;
        let ticket = self
            .extraction
            .trigger(document_id, options, preconditions)?;
        self.audit(
            actor,
            "extraction.trigger",
            document_id,
            None,
            ticket.committed_version,
        );
        Ok(ticket)
    }

    pub fn queued_jobs(&self) -> Result<Vec<ExtractionJob>, DocumentError> {
        self.extraction.queued_jobs()
    }

    pub fn extraction_job(&self, job_id: &str) -> Result<ExtractionJob, DocumentError> {
        self.extraction.job(job_id)
    }

    /// Worker entry point: runs a queued job through the extractor.
    pub fn process_extraction_job(&self, job_id: &str) -> Result<JobReport, DocumentError> {
        self.extraction.process(job_id)
    }

    pub fn report_extraction_failure(
        &self,
        job_id: &str,
        kind: FailureKind,
        message: &str,
    ) -> Result<JobReport, DocumentError> {
        self.extraction.report_failure(job_id, kind, message)
    }

    // revisions

    pub fn list_revisions(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<Vec<DocumentRevision>, DocumentError> {
        self.authorize(actor, document_id, Permission::Read)?;
        self.revisions.list(document_id)
    }

    pub fn get_revision(
        &self,
        actor: &Actor,
        document_id: &str,
        revision_id: &str,
        revalidate: bool,
    ) -> Result<DocumentRevision, DocumentError> {
        self.authorize(actor, document_id, Permission::Read)?;
        self.revisions.get(document_id, revision_id, revalidate)
    }

    pub fn validate_revision(
        &self,
        actor: &Actor,
        document_id: &str,
        revision_id: &str,
    ) -> Result<ValidationReport, DocumentError> {
        self.authorize(actor, document_id, Permission::Read)?;
        self.revisions.validate(document_id, revision_id)
    }

    pub fn create_revision(
        &self,
        actor: &Actor,
        document_id: &str,
        based_on: Option<&str>,
        patch: &RevisionPatch,
        reason: Option<&str>,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DocumentRevision>, DocumentError> {
        self.authorize(actor, document_id, Permission::Update)?;
        let created = self.revisions.create_from_edit(
            document_id,
            based_on,
            patch,
            actor,
            reason,
            preconditions,
        )?;
        self.audit(
            actor,
            "revision.create",
            document_id,
            Some(&created.value.id),
            created.committed_version,
        );
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_revision(
        &self,
        actor: &Actor,
        document_id: &str,
        revision_id: &str,
        header: &RevisionPatch,
        upserts: &[LineItemInput],
        deletes: &[u32],
        preconditions: &Preconditions,
    ) -> Result<Guarded<DocumentRevision>, DocumentError> {
        self.authorize(actor, document_id, Permission::Update)?;
        let updated = self.revisions.update_draft(
            document_id,
            revision_id,
            header,
            upserts,
            deletes,
            actor,
            preconditions,
        )?;
        self.audit(
            actor,
            "revision.update",
            document_id,
            Some(revision_id),
            updated.committed_version,
        );
        Ok(updated)
    }

    pub fn approve_revision(
        &self,
        actor: &Actor,
        document_id: &str,
        revision_id: &str,
        input: &ApprovalInput,
        preconditions: &Preconditions,
    ) -> Result<Guarded<Approval>, DocumentError> {
        self.authorize(actor, document_id, Permission::Update)?;
        let approval = self
            .revisions
            .approve(document_id, revision_id, input, actor, preconditions)?;
        self.audit(
            actor,
            "revision.approve",
            document_id,
            Some(revision_id),
            approval.committed_version,
        );
        Ok(approval)
    }

    // duplicates

    pub fn can_approve(&self, actor: &Actor, document_id: &str) -> Result<GateDecision, DocumentError> {
        let document = self.authorize(actor, document_id, Permission::Read)?;
        Ok(self.gate.can_approve(&document))
    }

    /// Called by the external matcher when it suspects `document_id` repeats `duplicate_of`.
    pub fn flag_duplicate_suspected(
        &self,
        document_id: &str,
        duplicate_of: &str,
    ) -> Result<Guarded<DuplicateState>, DocumentError> {
        let flagged = self.guard.mutate(
            document_id,
            Endpoint::WorkerReport,
            self.config.revision_idempotency_ttl,
            &Preconditions::none(),
            |_, document| {
                flag_suspected(document, duplicate_of).map_err(abort)?;
                Ok(DuplicateState::of(document))
            },
        )?;
        tracing::info!(document_id, duplicate_of, "duplicate suspected");
        self.audit(
            &Actor::system(),
            "duplicate.flag",
            document_id,
            None,
            flagged.committed_version,
        );
        Ok(flagged)
    }

    pub fn record_duplicate_decision(
        &self,
        actor: &Actor,
        document_id: &str,
        status: DuplicateStatus,
        note: Option<&str>,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DuplicateState>, DocumentError> {
        self.authorize(actor, document_id, Permission::Update)?;
        let decided_at = self.guard.now();
        let decided = self.guard.mutate(
            document_id,
            Endpoint::DuplicateDecision,
            self.config.revision_idempotency_ttl,
            preconditions,
            |_, document| {
                let decision = DuplicateDecision {
                    status,
                    decided_by: actor.user_id.clone(),
                    decided_at: decided_at.clone(),
                    note: note.map(str::to_string),
                };
                record_decision(document, decision).map_err(abort)?;
                Ok(DuplicateState::of(document))
            },
        )?;
        if !decided.replayed {
            tracing::info!(document_id, status = %status, actor = %actor.user_id, "duplicate decision recorded");
        }
        self.audit(
            actor,
            "duplicate.decide",
            document_id,
            None,
            decided.committed_version,
        );
        Ok(decided)
    }

    // aliases

    /// Resolves `raw_name`, or the revision's vendor name when none is given.
    pub fn resolve_alias(
        &self,
        actor: &Actor,
        document_id: &str,
        revision_id: &str,
        raw_name: Option<&str>,
    ) -> Result<AliasMatch, DocumentError> {
        let document = self.authorize(actor, document_id, Permission::Read)?;
        let revision = self.revisions.get(document_id, revision_id, false)?;
        let name = raw_name
            .map(str::to_string)
            .or(revision.header.vendor_name)
            .unwrap_or_default();
        self.aliases
            .resolve(&document.tenant_id, &document.company_id, &name)
    }

    pub fn add_contact(
        &self,
        actor: &Actor,
        tenant_id: &str,
        company_id: &str,
        canonical_name: &str,
    ) -> Result<Contact, DocumentError> {
        self.authorizer
            .check(actor, tenant_id, company_id, Permission::Update)?;
        self.aliases.add_contact(tenant_id, company_id, canonical_name)
    }

    // maintenance

    pub fn purge_expired_idempotency(&self) -> Result<usize, DocumentError> {
        self.guard.purge_expired()
    }
}
