//! Decision records: immutable policy verdicts.
//!
//! A decision binds one context to one policy version and records the
//! verdict, risk tier, and reason codes the evaluator produced. Like
//! contexts and receipts, decisions are content addressed and their
//! canonical body bytes are stored verbatim.

use serde_json::json;

use crate::canonical::{self, CanonicalError};
use crate::state::Verdict;
use crate::types::ReceiptPolicy;

/// Schema tag of every decision record.
pub const DECISION_SCHEMA: &str = "relia.decision.v0.1";

/// A built, content-addressed decision record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    /// Content address of the canonical body.
    pub decision_id: String,
    /// Context the decision was made for.
    pub context_id: String,
    /// Policy version the decision was made under.
    pub policy: ReceiptPolicy,
    /// The verdict.
    pub verdict: Verdict,
    /// Reason codes from the evaluator.
    pub reason_codes: Vec<String>,
    /// Whether a human approval is required.
    pub require_approval: bool,
    /// Risk tier string.
    pub risk: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Canonical body bytes, stored verbatim.
    pub body_json: Vec<u8>,
}

/// Builds a content-addressed decision record.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the body cannot be canonicalized; with
/// string-only inputs this does not happen in practice.
#[allow(clippy::too_many_arguments)]
pub fn build_decision(
    context_id: &str,
    policy: ReceiptPolicy,
    verdict: Verdict,
    reason_codes: Vec<String>,
    require_approval: bool,
    risk: &str,
    created_at: &str,
) -> Result<DecisionRecord, CanonicalError> {
    let body = json!({
        "schema": DECISION_SCHEMA,
        "created_at": created_at,
        "context_id": context_id,
        "policy": {
            "policy_id": &policy.policy_id,
            "policy_version": &policy.policy_version,
            "policy_hash": &policy.policy_hash,
        },
        "verdict": verdict.as_str(),
        "reason_codes": &reason_codes,
        "require_approval": require_approval,
        "risk": risk,
    });

    let body_json = canonical::canonicalize(&body)?;
    let decision_id = canonical::digest_prefix(&body_json);

    Ok(DecisionRecord {
        decision_id,
        context_id: context_id.to_string(),
        policy,
        verdict,
        reason_codes,
        require_approval,
        risk: risk.to_string(),
        created_at: created_at.to_string(),
        body_json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReceiptPolicy {
        ReceiptPolicy {
            policy_id: "relia-default".to_string(),
            policy_version: "1".to_string(),
            policy_hash: "sha256:p0".to_string(),
        }
    }

    #[test]
    fn decision_id_is_body_digest() {
        let record = build_decision(
            "sha256:c0",
            policy(),
            Verdict::Allow,
            vec!["allow-terraform-dev".to_string()],
            false,
            "low",
            "2025-12-21T00:00:00Z",
        )
        .unwrap();
        assert_eq!(
            record.decision_id,
            canonical::digest_prefix(&record.body_json)
        );
    }

    #[test]
    fn verdict_changes_id() {
        let allow = build_decision(
            "sha256:c0",
            policy(),
            Verdict::Allow,
            vec![],
            false,
            "low",
            "2025-12-21T00:00:00Z",
        )
        .unwrap();
        let deny = build_decision(
            "sha256:c0",
            policy(),
            Verdict::Deny,
            vec![],
            false,
            "low",
            "2025-12-21T00:00:00Z",
        )
        .unwrap();
        assert_ne!(allow.decision_id, deny.decision_id);
    }
}
