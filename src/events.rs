//! Events raised by the revision manager after a commit.
//!
//! Handlers run synchronously once the approving transaction has committed.
//! A failing handler is logged; it never undoes the approval.
use std::sync::Arc;

use crate::alias::AliasLearningMode;
use crate::error::DocumentError;

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovedEvent {
    pub tenant_id: String,
    pub company_id: String,
    pub document_id: String,
    pub revision_id: String,
    pub superseded_revision_id: Option<String>,
    /// Counterparty name as written on the document
    pub vendor_name: Option<String>,
    /// Contact the approver attached, if any
    pub contact_id: Option<String>,
    pub alias_learning: AliasLearningMode,
    pub approved_by: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RevisionEvent {
    Approved(ApprovedEvent),
}

impl RevisionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RevisionEvent::Approved(_) => "revision.approved",
        }
    }
}

pub trait RevisionEventHandler: Send + Sync {
    fn handle(&self, event: &RevisionEvent) -> Result<(), DocumentError>;
}

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<Arc<dyn RevisionEventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, handler: Arc<dyn RevisionEventHandler>) {
        self.handlers.push(handler);
    }

    /// Delivers `event` to every handler and returns how many failed.
    pub fn publish(&self, event: &RevisionEvent) -> usize {
        let mut failed = 0;
        for handler in &self.handlers {
            if let Err(e) = handler.handle(event) {
                failed += 1;
                tracing::warn!(event = event.name(), error = %e, "event handler failed");
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl RevisionEventHandler for Recorder {
        fn handle(&self, event: &RevisionEvent) -> Result<(), DocumentError> {
            let RevisionEvent::Approved(approved) = event;
            self.0.lock().unwrap().push(approved.revision_id.clone());
            Ok(())
        }
    }

    struct Failing;

    impl RevisionEventHandler for Failing {
        fn handle(&self, _: &RevisionEvent) -> Result<(), DocumentError> {
            Err(DocumentError::Internal("boom".into()))
        }
    }

    #[test]
    fn failures_do_not_stop_delivery() {
        let recorder = Arc::new(Recorder(Mutex::new(vec![])));
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(recorder.clone());

        let event = RevisionEvent::Approved(ApprovedEvent {
            tenant_id: "t".into(),
            company_id: "c".into(),
            document_id: "doc_a".into(),
            revision_id: "rev_a".into(),
            superseded_revision_id: None,
            vendor_name: None,
            contact_id: None,
            alias_learning: AliasLearningMode::Skip,
            approved_by: "u".into(),
        });
        assert_eq!(bus.publish(&event), 1);
        assert_eq!(*recorder.0.lock().unwrap(), vec!["rev_a".to_string()]);
    }
}
