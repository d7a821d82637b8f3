//! Policy loading and evaluation.
//!
//! Policies are YAML rule documents evaluated under a **default-deny** model:
//! rules are checked in order, the first matching rule determines the
//! decision, and an unmatched request falls through to the document's default
//! verdict (deny unless the document says otherwise).
//!
//! The loaded policy carries the SHA-256 content hash of its source bytes.
//! That hash is what decisions and receipts pin, and retries re-evaluate the
//! exact stored bytes rather than whatever is on disk at retry time.

mod engine;
mod schema;

pub use engine::{DEFAULT_DENY_REASON, DEFAULT_DENY_RULE_ID, EvalInput, PolicyDecision, evaluate};
pub use schema::{MatchSpec, PolicyDoc, Rule, RuleEffect};

use std::path::Path;

use thiserror::Error;

use crate::canonical;

/// Errors from policy loading.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy file could not be read.
    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),

    /// The policy document is not valid YAML or does not match the schema.
    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A rule is structurally valid but unusable.
    #[error("invalid rule '{rule_id}': {reason}")]
    InvalidRule {
        /// Id of the offending rule.
        rule_id: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// A parsed policy plus the content hash of its source bytes.
#[derive(Debug, Clone)]
pub struct LoadedPolicy {
    /// The parsed document.
    pub doc: PolicyDoc,
    /// `sha256:<hex>` of the raw source bytes.
    pub hash: String,
    /// The raw source bytes, persisted to the ledger on first use.
    pub raw: Vec<u8>,
}

impl LoadedPolicy {
    /// Parses a policy from YAML source bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] on parse failure or an unusable rule.
    pub fn from_yaml(source: &[u8]) -> Result<Self, PolicyError> {
        let doc: PolicyDoc = serde_yaml::from_slice(source)?;
        doc.validate()?;
        Ok(Self {
            doc,
            hash: canonical::digest_prefix(source),
            raw: source.to_vec(),
        })
    }

    /// Reads and parses a policy file.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] on I/O or parse failure.
    pub fn from_path(path: &Path) -> Result<Self, PolicyError> {
        let source = std::fs::read(path)?;
        Self::from_yaml(&source)
    }
}
