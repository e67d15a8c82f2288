//! Counterparty name resolution against a tenant and company's contacts.
//!
//! Resolution is read-only. New aliases are only written by [`AliasService`]
//! acting as a subscriber to revision approval events.
use chrono::Utc;

use crate::config::AliasConfig;
use crate::error::DocumentError;
use crate::events::{ApprovedEvent, RevisionEvent, RevisionEventHandler};
use crate::store::{Store, keys};
use crate::types::TimeStamp;
use crate::utils::{bigram_similarity, new_contact_id, normalize_name};

const EXACT_CONFIDENCE: f64 = 1.0;
const NORMALIZED_CONFIDENCE: f64 = 0.95;
const FUZZY_WEIGHT: f64 = 0.9;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Contact {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub tenant_id: String,
    #[n(2)]
    pub company_id: String,
    #[n(3)]
    pub canonical_name: String,
    #[n(4)]
    pub normalized_name: String,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

/// A learned spelling of a contact's name.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Alias {
    #[n(0)]
    pub raw_name: String,
    #[n(1)]
    pub normalized_name: String,
    #[n(2)]
    pub contact_id: String,
    #[n(3)]
    pub learned_from: Option<String>, // revision whose approval taught it
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
}

/// Matching techniques, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    Exact,
    Normalized,
    Fuzzy,
    None,
}

impl MatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::Exact => "EXACT",
            MatchStrategy::Normalized => "NORMALIZED",
            MatchStrategy::Fuzzy => "FUZZY",
            MatchStrategy::None => "NONE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AliasMatch {
    pub matched: bool,
    pub canonical_name: Option<String>,
    pub contact_id: Option<String>,
    pub strategy: MatchStrategy,
    pub confidence: f64,
}

impl AliasMatch {
    fn none() -> Self {
        Self {
            matched: false,
            canonical_name: None,
            contact_id: None,
            strategy: MatchStrategy::None,
            confidence: 0.0,
        }
    }

    fn hit(contact: &Contact, strategy: MatchStrategy, confidence: f64) -> Self {
        Self {
            matched: true,
            canonical_name: Some(contact.canonical_name.clone()),
            contact_id: Some(contact.id.clone()),
            strategy,
            confidence,
        }
    }
}

/// What approval may teach the alias directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AliasLearningMode {
    /// Learn only when the approver named a contact or the match is confident
    #[default]
    Auto,
    /// Always learn, creating a contact if nothing matches
    Force,
    Skip,
}

#[derive(Clone)]
pub struct AliasService {
    store: Store,
    config: AliasConfig,
}

impl AliasService {
    pub fn new(store: Store, config: AliasConfig) -> Self {
        Self { store, config }
    }

    pub fn add_contact(
        &self,
        tenant_id: &str,
        company_id: &str,
        canonical_name: &str,
    ) -> Result<Contact, DocumentError> {
        let canonical_name = canonical_name.trim();
        let normalized_name = normalize_name(canonical_name);
        if normalized_name.is_empty() {
            return Err(DocumentError::Validation(
                "contact name must contain letters or digits".to_string(),
            ));
        }

        let scope = keys::scope(tenant_id, company_id);
        if let Some(existing) = self
            .contacts(&scope)?
            .into_iter()
            .find(|c| c.normalized_name == normalized_name)
        {
            return Ok(existing);
        }

        let contact = Contact {
            id: new_contact_id()?,
            tenant_id: tenant_id.to_string(),
            company_id: company_id.to_string(),
            canonical_name: canonical_name.to_string(),
            normalized_name,
            created_at: TimeStamp::new(),
        };
        self.store.put(&keys::contact(&scope, &contact.id), &contact)?;
        tracing::info!(contact_id = %contact.id, name = %contact.canonical_name, "contact added");
        Ok(contact)
    }

    pub fn resolve(
        &self,
        tenant_id: &str,
        company_id: &str,
        raw_name: &str,
    ) -> Result<AliasMatch, DocumentError> {
        let raw = raw_name.trim();
        let normalized = normalize_name(raw);
        if normalized.is_empty() {
            return Ok(AliasMatch::none());
        }

        let scope = keys::scope(tenant_id, company_id);
        let contacts = self.contacts(&scope)?;
        let aliases: Vec<Alias> = self.store.scan(&keys::aliases(&scope))?;
        let contact_of = |id: &str| contacts.iter().find(|c| c.id == id);

        let exact = contacts.iter().find(|c| c.canonical_name == raw).or_else(|| {
            aliases
                .iter()
                .find(|a| a.raw_name == raw)
                .and_then(|a| contact_of(&a.contact_id))
        });
        if let Some(contact) = exact {
            return Ok(AliasMatch::hit(contact, MatchStrategy::Exact, EXACT_CONFIDENCE));
        }

        let normalized_hit = contacts
            .iter()
            .find(|c| c.normalized_name == normalized)
            .or_else(|| {
                aliases
                    .iter()
                    .find(|a| a.normalized_name == normalized)
                    .and_then(|a| contact_of(&a.contact_id))
            });
        if let Some(contact) = normalized_hit {
            return Ok(AliasMatch::hit(
                contact,
                MatchStrategy::Normalized,
                NORMALIZED_CONFIDENCE,
            ));
        }

        let candidates = contacts
            .iter()
            .map(|c| (c.normalized_name.as_str(), Some(c)))
            .chain(
                aliases
                    .iter()
                    .map(|a| (a.normalized_name.as_str(), contact_of(&a.contact_id))),
            );
        let mut best: Option<(f64, &Contact)> = None;
        for (name, contact) in candidates {
            let Some(contact) = contact else { continue };
            let similarity = bigram_similarity(&normalized, name);
            if best.is_none_or(|(top, _)| similarity > top) {
                best = Some((similarity, contact));
            }
        }

        match best {
            Some((similarity, contact)) if similarity >= self.config.fuzzy_threshold => {
                Ok(AliasMatch::hit(
                    contact,
                    MatchStrategy::Fuzzy,
                    FUZZY_WEIGHT * similarity,
                ))
            }
            _ => {
                tracing::debug!(raw_name = raw, "no alias match");
                Ok(AliasMatch::none())
            }
        }
    }

    fn contacts(&self, scope: &str) -> Result<Vec<Contact>, DocumentError> {
        self.store.scan(&keys::contacts(scope))
    }

    fn learn(
        &self,
        scope: &str,
        raw_name: &str,
        contact_id: &str,
        revision_id: &str,
    ) -> Result<(), DocumentError> {
        if self.store.get::<Contact>(&keys::contact(scope, contact_id))?.is_none() {
            return Err(DocumentError::not_found("contact", contact_id));
        }
        let normalized_name = normalize_name(raw_name);
        let alias = Alias {
            raw_name: raw_name.trim().to_string(),
            normalized_name: normalized_name.clone(),
            contact_id: contact_id.to_string(),
            learned_from: Some(revision_id.to_string()),
            created_at: TimeStamp::new(),
        };
        self.store.put(&keys::alias(scope, &normalized_name), &alias)?;
        tracing::info!(contact_id, alias = %alias.raw_name, "alias learned");
        Ok(())
    }

    fn on_approved(&self, event: &ApprovedEvent) -> Result<(), DocumentError> {
        let Some(raw_name) = event.vendor_name.as_deref() else {
            return Ok(());
        };
        if normalize_name(raw_name).is_empty() {
            return Ok(());
        }
        let scope = keys::scope(&event.tenant_id, &event.company_id);

        match event.alias_learning {
            AliasLearningMode::Skip => Ok(()),
            AliasLearningMode::Auto => {
                if let Some(contact_id) = event.contact_id.as_deref() {
                    return self.learn(&scope, raw_name, contact_id, &event.revision_id);
                }
                let found = self.resolve(&event.tenant_id, &event.company_id, raw_name)?;
                // the threshold applies to similarity, not the weighted confidence
                let floor = match found.strategy {
                    MatchStrategy::Fuzzy => FUZZY_WEIGHT * self.config.auto_learn_confidence,
                    _ => self.config.auto_learn_confidence,
                };
                match (found.strategy, found.contact_id) {
                    (MatchStrategy::Normalized | MatchStrategy::Fuzzy, Some(contact_id))
                        if found.confidence >= floor =>
                    {
                        self.learn(&scope, raw_name, &contact_id, &event.revision_id)
                    }
                    _ => Ok(()),
                }
            }
            AliasLearningMode::Force => {
                if let Some(contact_id) = event.contact_id.as_deref() {
                    return self.learn(&scope, raw_name, contact_id, &event.revision_id);
                }
                let found = self.resolve(&event.tenant_id, &event.company_id, raw_name)?;
                match (found.strategy, found.contact_id) {
                    (MatchStrategy::Exact, _) => Ok(()),
                    (_, Some(contact_id)) => {
                        self.learn(&scope, raw_name, &contact_id, &event.revision_id)
                    }
                    (_, None) => self
                        .add_contact(&event.tenant_id, &event.company_id, raw_name)
                        .map(|_| ()),
                }
            }
        }
    }
}

impl RevisionEventHandler for AliasService {
    fn handle(&self, event: &RevisionEvent) -> Result<(), DocumentError> {
        match event {
            RevisionEvent::Approved(approved) => self.on_approved(approved),
        }
    }
}
