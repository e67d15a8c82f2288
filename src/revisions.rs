//! Revision manager: the only writer of revision records.
//!
//! Every write goes through the guard, so a revision change and the owning
//! document's version bump commit together. Approval is one transaction: the
//! new revision becomes APPROVED, the previous one SUPERSEDED and the document
//! pointer moves, or nothing happens.
use chrono::Utc;
use std::sync::Arc;

use crate::alias::AliasLearningMode;
use crate::collaborators::{Actor, ExchangeRates};
use crate::config::ServiceConfig;
use crate::currency::{HomeValueOverrides, RateRequest, convert, resolve_rate};
use crate::document::ProcessingDocument;
use crate::duplicate::DuplicateGate;
use crate::error::DocumentError;
use crate::events::{ApprovedEvent, EventBus, RevisionEvent};
use crate::guard::{Endpoint, Guard, Guarded, Preconditions};
use crate::revision::{
    DocumentRevision, LineItemInput, RevisionHeader, RevisionPatch, RevisionSource,
    RevisionStatus, ValidationReport, ValidationStatus, validate,
};
use crate::store::{Store, TxResult, UnitOfWork, abort, keys};
use crate::types::TimeStamp;
use crate::utils::new_revision_id;

/// Revision ids of one document in creation order.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Default)]
pub struct RevisionIndex {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub revision_ids: Vec<String>,
}

/// Numbers `revision` after the latest one of its document and stores it.
pub fn stage_revision(unit: &UnitOfWork<'_>, revision: &mut DocumentRevision) -> TxResult<()> {
    let key = keys::revision_index(&revision.document_id);
    let mut index = unit
        .get::<RevisionIndex>(&key)?
        .unwrap_or_else(|| RevisionIndex {
            document_id: revision.document_id.clone(),
            revision_ids: vec![],
        });
    revision.revision_number = index.revision_ids.len() as u32 + 1;
    index.revision_ids.push(revision.id.clone());
    unit.put(&key, &index)?;
    unit.put(&keys::revision(&revision.id), revision)
}

fn load_revision(
    unit: &UnitOfWork<'_>,
    document_id: &str,
    revision_id: &str,
) -> TxResult<DocumentRevision> {
    let revision: DocumentRevision =
        unit.require(&keys::revision(revision_id), "revision", revision_id)?;
    if revision.document_id != document_id {
        return Err(abort(DocumentError::not_found("revision", revision_id)));
    }
    Ok(revision)
}

/// Everything an approver supplies besides the revision itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalInput {
    /// Falls back to the configured default home currency
    pub home_currency: Option<String>,
    pub rate: RateRequest,
    pub overrides: HomeValueOverrides,
    pub alias_learning: AliasLearningMode,
    /// Contact the approver matched the counterparty to
    pub contact_id: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Approval {
    #[n(0)]
    pub revision: DocumentRevision,
    #[n(1)]
    pub superseded_revision_id: Option<String>,
    #[n(2)]
    pub lock_version: u64,
    #[n(3)]
    pub tenant_id: String,
    #[n(4)]
    pub company_id: String,
}

#[derive(Clone)]
pub struct RevisionManager {
    store: Store,
    guard: Guard,
    gate: Arc<dyn DuplicateGate>,
    rates: Arc<dyn ExchangeRates>,
    events: EventBus,
    config: Arc<ServiceConfig>,
}

impl RevisionManager {
    pub fn new(
        store: Store,
        guard: Guard,
        gate: Arc<dyn DuplicateGate>,
        rates: Arc<dyn ExchangeRates>,
        events: EventBus,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            guard,
            gate,
            rates,
            events,
            config,
        }
    }

    fn live_document(&self, document_id: &str) -> Result<ProcessingDocument, DocumentError> {
        match self.store.get::<ProcessingDocument>(&keys::document(document_id))? {
            Some(document) if !document.is_deleted() => Ok(document),
            _ => Err(DocumentError::not_found("document", document_id)),
        }
    }

    pub fn list(&self, document_id: &str) -> Result<Vec<DocumentRevision>, DocumentError> {
        self.live_document(document_id)?;
        let index: RevisionIndex = self
            .store
            .get(&keys::revision_index(document_id))?
            .unwrap_or_default();

        index
            .revision_ids
            .iter()
            .map(|id| -> Result<DocumentRevision, DocumentError> {
                self.store
                    .get(&keys::revision(id))?
                    .ok_or_else(|| DocumentError::Internal(format!("revision index points at missing {id}")))
            })
            .collect()
    }

    /// Fetches a revision; `revalidate` refreshes the validation result on the returned copy only.
    pub fn get(
        &self,
        document_id: &str,
        revision_id: &str,
        revalidate: bool,
    ) -> Result<DocumentRevision, DocumentError> {
        self.live_document(document_id)?;
        let mut revision: DocumentRevision = self
            .store
            .get(&keys::revision(revision_id))?
            .filter(|r: &DocumentRevision| r.document_id == document_id)
            .ok_or_else(|| DocumentError::not_found("revision", revision_id))?;
        if revalidate {
            revision.validation = validate(&revision, self.config.total_tolerance);
        }
        Ok(revision)
    }

    pub fn validate(
        &self,
        document_id: &str,
        revision_id: &str,
    ) -> Result<ValidationReport, DocumentError> {
        let revision = self.get(document_id, revision_id, false)?;
        Ok(validate(&revision, self.config.total_tolerance))
    }

    /// Creates a new DRAFT from `based_on` (or the latest revision) with `patch` applied.
    pub fn create_from_edit(
        &self,
        document_id: &str,
        based_on: Option<&str>,
        patch: &RevisionPatch,
        actor: &Actor,
        reason: Option<&str>,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DocumentRevision>, DocumentError> {
        let revision_id = new_revision_id()?;

        let created = self.guard.mutate(
            document_id,
            Endpoint::CreateRevision,
            self.config.revision_idempotency_ttl,
            preconditions,
            |unit, document| {
                document.ensure_editable().map_err(abort)?;
                let now = document.updated_at.clone();

                let base_id = match based_on {
                    Some(id) => Some(id.to_string()),
                    None => unit
                        .get::<RevisionIndex>(&keys::revision_index(document_id))?
                        .and_then(|index| index.revision_ids.last().cloned()),
                };
                let mut revision = match base_id {
                    Some(base_id) => load_revision(unit, document_id, &base_id)?.derive_draft(
                        &revision_id,
                        0,
                        &actor.user_id,
                        reason.map(str::to_string),
                        now,
                    ),
                    None => blank_draft(&revision_id, document_id, actor, reason, now),
                };

                patch.apply(&mut revision);
                revision.validation = validate(&revision, self.config.total_tolerance);
                stage_revision(unit, &mut revision)?;
                Ok(revision)
            },
        )?;

        if !created.replayed {
            tracing::info!(
                document_id,
                revision_id = %created.value.id,
                revision_number = created.value.revision_number,
                based_on = ?created.value.based_on,
                "draft revision created"
            );
        }
        Ok(created)
    }

    /// Applies header changes, line deletes and line upserts to a DRAFT as one unit.
    #[allow(clippy::too_many_arguments)]
    pub fn update_draft(
        &self,
        document_id: &str,
        revision_id: &str,
        header: &RevisionPatch,
        upserts: &[LineItemInput],
        deletes: &[u32],
        actor: &Actor,
        preconditions: &Preconditions,
    ) -> Result<Guarded<DocumentRevision>, DocumentError> {
        let updated = self.guard.mutate(
            document_id,
            Endpoint::UpdateRevision,
            self.config.revision_idempotency_ttl,
            preconditions,
            |unit, document| {
                document.ensure_editable().map_err(abort)?;
                let mut revision = load_revision(unit, document_id, revision_id)?;
                revision.ensure_draft().map_err(abort)?;

                header.apply(&mut revision);
                revision.apply_line_changes(upserts, deletes).map_err(abort)?;
                revision.validation = validate(&revision, self.config.total_tolerance);
                revision.updated_at = document.updated_at.clone();
                unit.put(&keys::revision(revision_id), &revision)?;
                Ok(revision)
            },
        )?;

        if !updated.replayed {
            tracing::info!(
                document_id,
                revision_id,
                actor = %actor.user_id,
                validation = updated.value.validation.status.as_str(),
                "draft revision updated"
            );
        }
        Ok(updated)
    }

    /// Approves a DRAFT, superseding the current approved revision in the same unit.
    pub fn approve(
        &self,
        document_id: &str,
        revision_id: &str,
        input: &ApprovalInput,
        actor: &Actor,
        preconditions: &Preconditions,
    ) -> Result<Guarded<Approval>, DocumentError> {
        let home_currency = input
            .home_currency
            .clone()
            .unwrap_or_else(|| self.config.default_home_currency.clone())
            .to_uppercase();

        let approval = self.guard.mutate(
            document_id,
            Endpoint::ApproveRevision,
            self.config.revision_idempotency_ttl,
            preconditions,
            |unit, document| {
                document.ensure_editable().map_err(abort)?;
                self.gate.can_approve(document).into_result().map_err(abort)?;

                let mut revision = load_revision(unit, document_id, revision_id)?;
                revision.ensure_draft().map_err(abort)?;

                let report = validate(&revision, self.config.total_tolerance);
                if report.status == ValidationStatus::Invalid {
                    let reasons: Vec<&str> =
                        report.issues.iter().map(|i| i.message.as_str()).collect();
                    return Err(abort(DocumentError::Validation(format!(
                        "revision {revision_id} cannot be approved: {}",
                        reasons.join("; ")
                    ))));
                }
                revision.validation = report;

                let currency = revision.header.currency.clone().unwrap_or_default();
                let now = document.updated_at.clone();
                let quote = resolve_rate(
                    self.rates.as_ref(),
                    &currency,
                    &home_currency,
                    &input.rate,
                    revision.header.issue_date.map(|d| d.date()),
                    now.to_datetime_utc().date_naive(),
                )
                .map_err(abort)?;
                convert(
                    &mut revision,
                    &home_currency,
                    &quote,
                    &input.overrides,
                    self.config.home_override_tolerance,
                )
                .map_err(abort)?;

                if let Some(contact_id) = &input.contact_id {
                    revision.counterparty_contact_id = Some(contact_id.clone());
                }
                revision.status = RevisionStatus::Approved;
                revision.approved_at = Some(now.clone());
                revision.approved_by = Some(actor.user_id.clone());
                revision.updated_at = now.clone();

                let superseded = match document.current_revision_id.clone() {
                    Some(previous_id) if previous_id != revision.id => {
                        let mut previous = load_revision(unit, document_id, &previous_id)?;
                        previous.status = RevisionStatus::Superseded;
                        previous.updated_at = now.clone();
                        unit.put(&keys::revision(&previous_id), &previous)?;
                        Some(previous_id)
                    }
                    _ => None,
                };

                document.current_revision_id = Some(revision.id.clone());
                unit.put(&keys::revision(revision_id), &revision)?;

                Ok(Approval {
                    revision,
                    superseded_revision_id: superseded,
                    lock_version: document.lock_version,
                    tenant_id: document.tenant_id.clone(),
                    company_id: document.company_id.clone(),
                })
            },
        )?;

        if !approval.replayed {
            let revision = &approval.value.revision;
            tracing::info!(
                document_id,
                revision_id,
                superseded = ?approval.value.superseded_revision_id,
                lock_version = approval.value.lock_version,
                "revision approved"
            );
            self.events.publish(&RevisionEvent::Approved(ApprovedEvent {
                tenant_id: approval.value.tenant_id.clone(),
                company_id: approval.value.company_id.clone(),
                document_id: document_id.to_string(),
                revision_id: revision.id.clone(),
                superseded_revision_id: approval.value.superseded_revision_id.clone(),
                vendor_name: revision.header.vendor_name.clone(),
                contact_id: input.contact_id.clone(),
                alias_learning: input.alias_learning,
                approved_by: actor.user_id.clone(),
            }));
        }
        Ok(approval)
    }
}

fn blank_draft(
    revision_id: &str,
    document_id: &str,
    actor: &Actor,
    reason: Option<&str>,
    now: TimeStamp<Utc>,
) -> DocumentRevision {
    DocumentRevision {
        id: revision_id.to_string(),
        document_id: document_id.to_string(),
        revision_number: 0,
        status: RevisionStatus::Draft,
        source: RevisionSource::Edit,
        based_on: None,
        header: RevisionHeader::default(),
        counterparty_contact_id: None,
        line_items: vec![],
        home: None,
        validation: ValidationReport::default(),
        evidence: vec![],
        created_by: actor.user_id.clone(),
        reason: reason.map(str::to_string),
        created_at: now.clone(),
        updated_at: now,
        approved_at: None,
        approved_by: None,
    }
}
