//! Intake pipeline for financial source documents.
//!
//! Documents are uploaded, optionally split or extended page-wise, sent to an
//! external extractor and reviewed as revisions until one is approved. Every
//! mutation carries an optional expected version and idempotency key, checked by
//! [`guard::Guard`] inside a single sled transaction.
//!
//! [`service::DocumentService`] is the entry point.

pub mod alias;
pub mod blob;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod currency;
pub mod document;
pub mod documents;
pub mod duplicate;
pub mod error;
pub mod events;
pub mod extraction;
pub mod guard;
pub mod pages;
pub mod pipeline;
pub mod revision;
pub mod revisions;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

pub use error::{DocumentError, ErrorCode};
pub use guard::{Guarded, Preconditions};
pub use service::DocumentService;
