//! Context records: immutable snapshots of the caller's environment.
//!
//! A context captures where a request came from (source), what it asked for
//! (inputs), and the evidence attached to it, at request time. The record is
//! content addressed: its id is the digest of its canonical body, and the
//! body bytes are stored verbatim in the ledger.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::canonical::{self, CanonicalError};

/// Schema tag of every context record.
pub const CONTEXT_SCHEMA: &str = "relia.context.v0.1";

/// Where the request originated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSource {
    /// Source kind, e.g. `github_actions`.
    pub kind: String,
    /// Repository, `org/repo`.
    pub repo: String,
    /// Workflow name.
    #[serde(default)]
    pub workflow: String,
    /// Run identifier.
    pub run_id: String,
    /// Acting subject.
    pub actor: String,
    /// Git ref, when known.
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    /// Commit SHA.
    #[serde(default)]
    pub sha: String,
}

/// What the request asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInputs {
    /// Requested action.
    pub action: String,
    /// Target resource.
    pub resource: String,
    /// Target environment.
    pub env: String,
    /// Caller-defined intent map.
    #[serde(default)]
    pub intent: Map<String, Value>,
}

/// Evidence attached to the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEvidence {
    /// Digest of the plan the workload intends to apply.
    #[serde(default)]
    pub plan_digest: String,
    /// URL of the reviewed diff.
    #[serde(default)]
    pub diff_url: String,
}

/// A built, content-addressed context record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRecord {
    /// Content address of the canonical body.
    pub context_id: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Source snapshot.
    pub source: ContextSource,
    /// Input snapshot.
    pub inputs: ContextInputs,
    /// Evidence snapshot.
    pub evidence: ContextEvidence,
    /// Canonical body bytes, stored verbatim.
    pub body_json: Vec<u8>,
}

/// Builds a content-addressed context record.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the intent map cannot be canonicalized.
pub fn build_context(
    source: ContextSource,
    inputs: ContextInputs,
    evidence: ContextEvidence,
    created_at: &str,
) -> Result<ContextRecord, CanonicalError> {
    let body = json!({
        "schema": CONTEXT_SCHEMA,
        "created_at": created_at,
        "source": {
            "kind": &source.kind,
            "repo": &source.repo,
            "workflow": &source.workflow,
            "run_id": &source.run_id,
            "actor": &source.actor,
            "ref": &source.git_ref,
            "sha": &source.sha,
        },
        "inputs": {
            "action": &inputs.action,
            "resource": &inputs.resource,
            "env": &inputs.env,
            "intent": Value::Object(inputs.intent.clone()),
        },
        "evidence": {
            "plan_digest": &evidence.plan_digest,
            "diff_url": &evidence.diff_url,
        },
    });

    let body_json = canonical::canonicalize(&body)?;
    let context_id = canonical::digest_prefix(&body_json);

    Ok(ContextRecord {
        context_id,
        created_at: created_at.to_string(),
        source,
        inputs,
        evidence,
        body_json,
    })
}
