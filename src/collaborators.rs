//! Interfaces to the systems this core consults but does not own.
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::error::DocumentError;
use crate::types::TimeStamp;

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
}

impl Actor {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
        }
    }

    /// Used for transitions driven by workers rather than people.
    pub fn system() -> Self {
        Self::new("system")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Update,
}

/// Per-company permission check.
pub trait Authorizer: Send + Sync {
    fn check(
        &self,
        actor: &Actor,
        tenant_id: &str,
        company_id: &str,
        permission: Permission,
    ) -> Result<(), DocumentError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check(&self, _: &Actor, _: &str, _: &str, _: Permission) -> Result<(), DocumentError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub actor: String,
    pub action: &'static str,
    pub document_id: String,
    pub revision_id: Option<String>,
    pub lock_version: u64,
    pub detail: Option<String>,
    pub at: TimeStamp<Utc>,
}

/// Append-only audit log.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> anyhow::Result<()>;
}

/// Writes audit entries as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        tracing::info!(
            target: "audit",
            actor = %entry.actor,
            action = entry.action,
            document_id = %entry.document_id,
            revision_id = ?entry.revision_id,
            lock_version = entry.lock_version,
            detail = ?entry.detail,
            "audit"
        );
        Ok(())
    }
}

/// Exchange rate by date: units of `to` per unit of `from`.
pub trait ExchangeRates: Send + Sync {
    fn rate_on(&self, from: &str, to: &str, date: NaiveDate) -> Option<Decimal>;
}

/// Pinned rates. A lookup takes the latest rate on or before the requested date.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    rates: BTreeMap<(String, String), BTreeMap<NaiveDate, Decimal>>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(mut self, from: &str, to: &str, date: NaiveDate, rate: Decimal) -> Self {
        self.rates
            .entry((from.to_string(), to.to_string()))
            .or_default()
            .insert(date, rate);
        self
    }
}

impl ExchangeRates for RateTable {
    fn rate_on(&self, from: &str, to: &str, date: NaiveDate) -> Option<Decimal> {
        self.rates
            .get(&(from.to_string(), to.to_string()))?
            .range(..=date)
            .next_back()
            .map(|(_, rate)| *rate)
    }
}
