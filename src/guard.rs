//! Idempotency and optimistic concurrency for document mutations.
//!
//! [`Guard::mutate`] wraps every operation that changes a document. Inside one
//! transaction it
//!
//! 1. replays a stored response when the caller's idempotency key is still live,
//! 2. loads the document and compares its `lock_version` with the caller's
//!    expected version,
//! 3. bumps `lock_version` by exactly one and runs the operation against the
//!    unit of work,
//! 4. stores the document and caches the response under the key.
//!
//! A failing step aborts the transaction, so a rejected call leaves no trace
//! and is never cached.
use chrono::{Duration, Utc};
use minicbor::{Decode, Encode};
use std::sync::Arc;

use crate::clock::Clock;
use crate::document::ProcessingDocument;
use crate::error::DocumentError;
use crate::store::{Store, TxResult, UnitOfWork, abort, keys};
use crate::types::TimeStamp;

/// Caller supplied preconditions; both are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    /// The `lock_version` the caller last read (If-Match)
    pub expected_version: Option<u64>,
    pub idempotency_key: Option<String>,
}

impl Preconditions {
    pub fn none() -> Self {
        Self::default()
    }
    pub fn if_match(version: u64) -> Self {
        Self {
            expected_version: Some(version),
            idempotency_key: None,
        }
    }
    pub fn with_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }
    pub fn with_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    TriggerExtraction,
    CreateRevision,
    UpdateRevision,
    ApproveRevision,
    SplitDocument,
    AppendPages,
    RotatePage,
    DuplicateDecision,
    DeleteDocument,
    LinkDocuments,
    /// Status reported by extraction workers and matchers; never keyed.
    WorkerReport,
}

impl Endpoint {
    pub fn method(self) -> &'static str {
        match self {
            Endpoint::UpdateRevision | Endpoint::RotatePage | Endpoint::DuplicateDecision => {
                "PATCH"
            }
            Endpoint::DeleteDocument => "DELETE",
            _ => "POST",
        }
    }

    pub fn route(self, document_id: &str) -> String {
        let tail = match self {
            Endpoint::TriggerExtraction => "extract",
            Endpoint::CreateRevision => "revisions",
            Endpoint::UpdateRevision => "revisions/update",
            Endpoint::ApproveRevision => "revisions/approve",
            Endpoint::SplitDocument => "split",
            Endpoint::AppendPages => "pages",
            Endpoint::RotatePage => "pages/rotation",
            Endpoint::DuplicateDecision => "duplicate",
            Endpoint::DeleteDocument => "",
            Endpoint::LinkDocuments => "links",
            Endpoint::WorkerReport => "status",
        };
        format!("/documents/{document_id}/{tail}")
    }

    pub fn status_code(self) -> u16 {
        match self {
            Endpoint::TriggerExtraction => 202,
            Endpoint::CreateRevision | Endpoint::SplitDocument | Endpoint::LinkDocuments => 201,
            _ => 200,
        }
    }
}

/// Cached response of a keyed mutation.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    #[n(0)]
    pub key: String,
    #[n(1)]
    pub endpoint: String,
    #[n(2)]
    pub method: String,
    #[cbor(n(3), with = "minicbor::bytes")]
    pub response: Vec<u8>,
    #[n(4)]
    pub status_code: u16,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub expires_at: TimeStamp<Utc>,
}

impl IdempotencyRecord {
    /// Expired records are treated as absent.
    pub fn is_live(&self, now: &TimeStamp<Utc>) -> bool {
        *now < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Guarded<R> {
    pub value: R,
    /// True when `value` came from the idempotency cache and nothing changed
    pub replayed: bool,
    /// The document version this call committed; `None` for replays
    pub committed_version: Option<u64>,
}

#[derive(Clone)]
pub struct Guard {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl Guard {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::from(self.clock.now())
    }

    pub fn mutate<R, F>(
        &self,
        document_id: &str,
        endpoint: Endpoint,
        ttl: Duration,
        preconditions: &Preconditions,
        apply: F,
    ) -> Result<Guarded<R>, DocumentError>
    where
        R: Encode<()> + for<'b> Decode<'b, ()>,
        F: Fn(&UnitOfWork<'_>, &mut ProcessingDocument) -> TxResult<R>,
    {
        let route = endpoint.route(document_id);
        let method = endpoint.method();
        let cache_key = cache_key(endpoint, &route, preconditions);
        let now = self.now();

        let guarded = self.store.transact(|unit| {
            if let Some(cache_key) = cache_key.as_deref() {
                if let Some(record) = unit.get::<IdempotencyRecord>(cache_key)? {
                    if record.is_live(&now) {
                        let value = minicbor::decode(&record.response).map_err(|e| abort(e.into()))?;
                        return Ok(Guarded {
                            value,
                            replayed: true,
                            committed_version: None,
                        });
                    }
                }
            }

            let mut document = load_live(unit, document_id)?;
            check_version(&document, preconditions.expected_version).map_err(abort)?;

            // apply sees the version this mutation commits
            document.lock_version += 1;
            document.updated_at = now.clone();
            let value = apply(unit, &mut document)?;
            unit.put(&keys::document(document_id), &document)?;

            if let (Some(cache_key), Some(key)) =
                (cache_key.as_deref(), preconditions.idempotency_key.as_deref())
            {
                let record = IdempotencyRecord {
                    key: key.to_string(),
                    endpoint: route.clone(),
                    method: method.to_string(),
                    response: minicbor::to_vec(&value).map_err(|e| abort(e.into()))?,
                    status_code: endpoint.status_code(),
                    created_at: now.clone(),
                    expires_at: now.plus(ttl),
                };
                unit.put(cache_key, &record)?;
            }

            Ok(Guarded {
                value,
                replayed: false,
                committed_version: Some(document.lock_version),
            })
        })?;

        if guarded.replayed {
            tracing::debug!(document_id, route = %route, "replayed idempotent response");
        } else {
            tracing::info!(document_id, route = %route, method, "mutation accepted");
        }
        Ok(guarded)
    }

    /// Looks up a live cached response without opening a transaction.
    ///
    /// Operations that touch blobs before [`Guard::mutate`] must call this first.
    pub fn replay<R>(
        &self,
        document_id: &str,
        endpoint: Endpoint,
        preconditions: &Preconditions,
    ) -> Result<Option<Guarded<R>>, DocumentError>
    where
        R: for<'b> Decode<'b, ()>,
    {
        let route = endpoint.route(document_id);
        let Some(cache_key) = cache_key(endpoint, &route, preconditions) else {
            return Ok(None);
        };
        let Some(record) = self.store.get::<IdempotencyRecord>(&cache_key)? else {
            return Ok(None);
        };
        if !record.is_live(&self.now()) {
            return Ok(None);
        }
        let value = minicbor::decode(&record.response)?;
        tracing::debug!(document_id, route = %route, "replayed idempotent response");
        Ok(Some(Guarded {
            value,
            replayed: true,
            committed_version: None,
        }))
    }

    /// Removes idempotency records whose window has closed. Returns how many went.
    pub fn purge_expired(&self) -> Result<usize, DocumentError> {
        let now = self.now();
        let mut purged = 0;
        for entry in self
            .store
            .instance()
            .scan_prefix(keys::IDEMPOTENCY_PREFIX.as_bytes())
        {
            let (key, raw) = entry?;
            let record: IdempotencyRecord = minicbor::decode(&raw)?;
            if !record.is_live(&now) && self.remove_unchanged(&key, &raw)? {
                purged += 1;
            }
        }
        tracing::debug!(purged, "purged expired idempotency records");
        Ok(purged)
    }

    /// Removes `key` only if it still holds `seen`; a record rewritten since the scan stays.
    fn remove_unchanged(&self, key: &[u8], seen: &[u8]) -> Result<bool, DocumentError> {
        let swapped = self
            .store
            .instance()
            .compare_and_swap(key, Some(seen), None::<&[u8]>)?;
        Ok(swapped.is_ok())
    }
}

fn cache_key(endpoint: Endpoint, route: &str, preconditions: &Preconditions) -> Option<String> {
    preconditions
        .idempotency_key
        .as_deref()
        .map(|key| keys::idempotency(endpoint.method(), route, key))
}

/// Loads a document inside a transaction; soft-deleted documents count as missing.
pub fn load_live(unit: &UnitOfWork<'_>, document_id: &str) -> TxResult<ProcessingDocument> {
    let document: ProcessingDocument =
        unit.require(&keys::document(document_id), "document", document_id)?;
    if document.is_deleted() {
        return Err(abort(DocumentError::not_found("document", document_id)));
    }
    Ok(document)
}

/// A missing expectation skips the check (last writer wins).
pub fn check_version(
    document: &ProcessingDocument,
    expected: Option<u64>,
) -> Result<(), DocumentError> {
    match expected {
        Some(expected) if expected != document.lock_version => {
            Err(DocumentError::ConcurrentModification {
                document_id: document.id.clone(),
                expected,
                actual: document.lock_version,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_include_the_document() {
        assert_eq!(
            Endpoint::TriggerExtraction.route("doc_1abc"),
            "/documents/doc_1abc/extract"
        );
        assert_eq!(Endpoint::ApproveRevision.method(), "POST");
        assert_eq!(Endpoint::UpdateRevision.method(), "PATCH");
    }

    #[test]
    fn records_expire_at_the_boundary() {
        let created = TimeStamp::from_ymd_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let record = IdempotencyRecord {
            key: "k".into(),
            endpoint: "/documents/d/extract".into(),
            method: "POST".into(),
            response: vec![],
            status_code: 202,
            created_at: created.clone(),
            expires_at: created.plus(Duration::hours(1)),
        };
        assert!(record.is_live(&created.plus(Duration::minutes(59))));
        assert!(!record.is_live(&created.plus(Duration::hours(1))));
    }

    #[test]
    fn purge_keeps_a_record_rewritten_after_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("guard.db")).unwrap();
        let store = Store::new(Arc::new(db));
        let guard = Guard::new(store.clone(), Arc::new(crate::clock::SystemClock));

        let key = b"idem/POST/documents/d/extract/k";
        store.instance().insert(key, b"fresh".to_vec()).unwrap();
        assert!(!guard.remove_unchanged(key, b"stale").unwrap());
        assert_eq!(
            store.instance().get(key).unwrap().as_deref(),
            Some(&b"fresh"[..])
        );

        assert!(guard.remove_unchanged(key, b"fresh").unwrap());
        assert!(store.instance().get(key).unwrap().is_none());
    }
}
