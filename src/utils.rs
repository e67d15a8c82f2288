//! Utility functions for identifiers, content keys and name matching

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::DocumentError;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, DocumentError> {
    let hrp = bech32::Hrp::parse(hrp)
        .map_err(|e| DocumentError::Internal(format!("invalid id prefix {hrp:?}: {e}")))?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| DocumentError::Internal(format!("failed to encode id: {e}")))
}

pub fn new_document_id() -> Result<String, DocumentError> {
    new_uuid_to_bech32("doc_")
}

pub fn new_revision_id() -> Result<String, DocumentError> {
    new_uuid_to_bech32("rev_")
}

pub fn new_job_id() -> Result<String, DocumentError> {
    new_uuid_to_bech32("job_")
}

pub fn new_contact_id() -> Result<String, DocumentError> {
    new_uuid_to_bech32("contact_")
}

/// Storage location derived from the bytes, so re-uploading identical content is a no-op.
pub fn content_key(namespace: &str, bytes: &[u8], extension: &str) -> String {
    format!("{namespace}/{}.{extension}", sha256::digest(bytes))
}

// common company-form suffixes that carry no identity
const LEGAL_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "llc",
    "llp",
    "ltd",
    "limited",
    "corp",
    "corporation",
    "co",
    "company",
    "gmbh",
    "ag",
    "sa",
    "sarl",
    "bv",
    "nv",
    "plc",
    "pty",
    "kk",
];

/// Lower-cases, strips punctuation, collapses whitespace and drops trailing legal suffixes.
pub fn normalize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();

    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    while tokens.len() > 1 {
        match tokens.last() {
            Some(last) if LEGAL_SUFFIXES.contains(last) => {
                tokens.pop();
            }
            _ => break,
        }
    }

    tokens.join(" ")
}

/// Dice coefficient over character bigrams, 0.0 to 1.0.
pub fn bigram_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return if a.is_empty() { 0.0 } else { 1.0 };
    }

    let left = bigrams(a);
    let mut right = bigrams(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let total = (left.len() + right.len()) as f64;
    let mut shared = 0usize;
    for pair in &left {
        if let Some(pos) = right.iter().position(|other| other == pair) {
            right.swap_remove(pos);
            shared += 1;
        }
    }

    (2 * shared) as f64 / total
}

fn bigrams(text: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}
