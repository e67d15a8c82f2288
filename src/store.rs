//! Record persistence on top of sled.
//!
//! Records are CBOR encoded and stored under readable string keys. Every
//! mutation goes through [`Store::transact`], which runs the closure inside a
//! serialisable sled transaction: either every write the closure made is
//! committed, or none of them is. sled may run the closure more than once when
//! it detects a conflict, so closures must not have effects outside the
//! [`UnitOfWork`] they are given.
use minicbor::{Decode, Encode};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use std::sync::Arc;

use crate::error::DocumentError;

pub type TxResult<T> = Result<T, ConflictableTransactionError<DocumentError>>;

/// Aborts the surrounding transaction with a domain error.
pub fn abort(error: DocumentError) -> ConflictableTransactionError<DocumentError> {
    ConflictableTransactionError::Abort(error)
}

pub mod keys {
    pub fn document(id: &str) -> String {
        format!("doc/{id}")
    }
    pub const DOCUMENT_PREFIX: &str = "doc/";

    pub fn revision(id: &str) -> String {
        format!("rev/{id}")
    }
    pub fn revision_index(document_id: &str) -> String {
        format!("revidx/{document_id}")
    }
    pub fn pages(document_id: &str) -> String {
        format!("pages/{document_id}")
    }
    pub fn link(from: &str, to: &str) -> String {
        format!("link/{from}/{to}")
    }
    pub fn links_from(from: &str) -> String {
        format!("link/{from}/")
    }
    pub fn backlink(to: &str, from: &str) -> String {
        format!("backlink/{to}/{from}")
    }
    pub fn backlinks_to(to: &str) -> String {
        format!("backlink/{to}/")
    }
    pub fn idempotency(method: &str, route: &str, key: &str) -> String {
        format!("idem/{method} {route}/{key}")
    }
    pub const IDEMPOTENCY_PREFIX: &str = "idem/";

    pub fn job(id: &str) -> String {
        format!("job/{id}")
    }
    pub const JOB_PREFIX: &str = "job/";

    /// Tenant and company are caller supplied, so they are hex encoded to keep keys unambiguous.
    pub fn scope(tenant_id: &str, company_id: &str) -> String {
        format!("{}.{}", hex::encode(tenant_id), hex::encode(company_id))
    }
    pub fn contact(scope: &str, id: &str) -> String {
        format!("contact/{scope}/{id}")
    }
    pub fn contacts(scope: &str) -> String {
        format!("contact/{scope}/")
    }
    pub fn alias(scope: &str, normalized: &str) -> String {
        format!("alias/{scope}/{normalized}")
    }
    pub fn aliases(scope: &str) -> String {
        format!("alias/{scope}/")
    }
}

#[derive(Clone)]
pub struct Store {
    instance: Arc<sled::Db>,
}

impl Store {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<sled::Db> {
        &self.instance
    }

    pub fn get<T>(&self, key: &str) -> Result<Option<T>, DocumentError>
    where
        T: for<'b> Decode<'b, ()>,
    {
        match self.instance.get(key.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put<T>(&self, key: &str, value: &T) -> Result<(), DocumentError>
    where
        T: Encode<()>,
    {
        let bytes = minicbor::to_vec(value)?;
        self.instance.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Decodes every record whose key starts with `prefix`, in key order.
    pub fn scan<T>(&self, prefix: &str) -> Result<Vec<T>, DocumentError>
    where
        T: for<'b> Decode<'b, ()>,
    {
        let mut records = Vec::new();
        for entry in self.instance.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = entry?;
            records.push(minicbor::decode(&raw)?);
        }
        Ok(records)
    }

    /// Runs `work` as one atomic unit. Domain errors abort with nothing written.
    pub fn transact<A, F>(&self, work: F) -> Result<A, DocumentError>
    where
        F: Fn(&UnitOfWork<'_>) -> TxResult<A>,
    {
        let outcome = self.instance.transaction(|tree| {
            let unit = UnitOfWork { tree };
            work(&unit)
        });

        match outcome {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(error)) => Err(error),
            Err(TransactionError::Storage(error)) => Err(error.into()),
        }
    }
}

/// Transactional view handed to mutation closures.
pub struct UnitOfWork<'t> {
    tree: &'t TransactionalTree,
}

impl UnitOfWork<'_> {
    pub fn get<T>(&self, key: &str) -> TxResult<Option<T>>
    where
        T: for<'b> Decode<'b, ()>,
    {
        match self.tree.get(key.as_bytes())? {
            Some(raw) => minicbor::decode(&raw)
                .map(Some)
                .map_err(|e| abort(e.into())),
            None => Ok(None),
        }
    }

    /// Like [`UnitOfWork::get`] but a missing record aborts with RESOURCE_NOT_FOUND.
    pub fn require<T>(&self, key: &str, kind: &'static str, id: &str) -> TxResult<T>
    where
        T: for<'b> Decode<'b, ()>,
    {
        self.get(key)?
            .ok_or_else(|| abort(DocumentError::not_found(kind, id)))
    }

    pub fn put<T>(&self, key: &str, value: &T) -> TxResult<()>
    where
        T: Encode<()>,
    {
        let bytes = minicbor::to_vec(value).map_err(|e| abort(e.into()))?;
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq)]
    struct Counter {
        #[n(0)]
        value: u64,
    }

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("store.db")).unwrap();
        (dir, Store::new(Arc::new(db)))
    }

    #[test]
    fn aborted_unit_leaves_nothing_behind() {
        let (_dir, store) = open_store();
        store.put("counter/a", &Counter { value: 1 }).unwrap();

        let result: Result<(), DocumentError> = store.transact(|unit| {
            unit.put("counter/a", &Counter { value: 2 })?;
            unit.put("counter/b", &Counter { value: 7 })?;
            Err(abort(DocumentError::Validation("nope".into())))
        });

        assert!(matches!(result, Err(DocumentError::Validation(_))));
        assert_eq!(
            store.get::<Counter>("counter/a").unwrap(),
            Some(Counter { value: 1 })
        );
        assert_eq!(store.get::<Counter>("counter/b").unwrap(), None);
    }

    #[test]
    fn scan_returns_prefix_in_order() {
        let (_dir, store) = open_store();
        store.put("counter/b", &Counter { value: 2 }).unwrap();
        store.put("counter/a", &Counter { value: 1 }).unwrap();
        store.put("other/a", &Counter { value: 9 }).unwrap();

        let values: Vec<u64> = store
            .scan::<Counter>("counter/")
            .unwrap()
            .into_iter()
            .map(|c| c.value)
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn scope_keys_are_unambiguous() {
        assert_ne!(keys::scope("a/b", "c"), keys::scope("a", "b/c"));
    }
}
