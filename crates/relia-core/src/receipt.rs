//! Receipt construction and verification.
//!
//! A receipt is the signed, content-addressed record of one decision step.
//! The builder assembles the body in a fixed schema shape, canonicalizes it,
//! digests the canonical bytes, and signs the raw digest with the supplied
//! [`Signer`] capability. The prefixed digest doubles as the receipt id, so
//! the id commits to every byte of the body.
//!
//! # Body shape
//!
//! `schema`, `created_at`, `context_id`, `decision_id`, `actor`, `request`,
//! `policy`, `approval`, `credential_grant`, and `outcome` are always present;
//! absent optional substructures appear as `null`. `interaction_ref` and
//! `refs` are emitted only when present and non-empty. Empty-string leaves
//! inside optional substructures become `null`, so the canonical form of a
//! minimal receipt is stable regardless of which optional fields the caller
//! materialized as empty strings.
//!
//! Verification recomputes the body digest and checks the Ed25519 signature
//! over the digest bytes. The stored canonical body is verified verbatim; it
//! is never re-serialized.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::canonical::{self, CanonicalError};
use crate::crypto::{PUBLIC_KEY_SIZE, SignatureError, Signer, verify_signature};
use crate::types::{
    InteractionRef, OutcomeStatus, ReceiptActor, ReceiptApproval, ReceiptCredentialGrant,
    ReceiptOutcome, ReceiptPolicy, ReceiptRefs, ReceiptRequest,
};

/// Schema tag of every receipt body this crate produces.
pub const RECEIPT_SCHEMA: &str = "relia.receipt.v0.1";

/// Errors from receipt construction and verification.
#[derive(Debug, Error)]
pub enum ReceiptError {
    /// The input carried a schema tag other than [`RECEIPT_SCHEMA`].
    #[error("invalid receipt schema: {schema}")]
    InvalidSchema {
        /// The rejected schema tag.
        schema: String,
    },

    /// A required field was empty.
    #[error("missing required receipt field: {field}")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// The body could not be canonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// The stored body digest does not match the recomputed digest.
    #[error("receipt body digest mismatch")]
    DigestMismatch,

    /// The signature does not verify over the body digest.
    #[error("receipt signature verification failed")]
    Signature(#[source] SignatureError),
}

/// All fields of a receipt, prior to canonicalization and signing.
#[derive(Debug, Clone, Default)]
pub struct MakeReceiptInput {
    /// Schema tag; empty defaults to [`RECEIPT_SCHEMA`].
    pub schema: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Idempotency key this receipt belongs to.
    pub idem_key: String,
    /// Previous tip of the chain, when superseding.
    pub supersedes_receipt_id: Option<String>,
    /// Context record id.
    pub context_id: String,
    /// Decision record id.
    pub decision_id: String,
    /// Actor record.
    pub actor: ReceiptActor,
    /// Request record.
    pub request: ReceiptRequest,
    /// Policy reference.
    pub policy: ReceiptPolicy,
    /// Conversational timeline handle, when provided.
    pub interaction_ref: Option<InteractionRef>,
    /// External references, when provided.
    pub refs: Option<ReceiptRefs>,
    /// Approval record, when the decision involves one.
    pub approval: Option<ReceiptApproval>,
    /// Credential grant, on issuance receipts.
    pub credential_grant: Option<ReceiptCredentialGrant>,
    /// Outcome record.
    pub outcome: ReceiptOutcome,
}

impl MakeReceiptInput {
    /// Input with the given outcome status and everything else defaulted.
    #[must_use]
    pub fn with_status(status: OutcomeStatus) -> Self {
        Self {
            outcome: ReceiptOutcome::status_only(status),
            ..Self::default()
        }
    }
}

/// A built receipt: the signed canonical body plus flattened index fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReceipt {
    /// Receipt id, equal to `body_digest`.
    pub receipt_id: String,
    /// Prefixed digest of `body_json`.
    pub body_digest: String,
    /// Canonical body bytes, stored verbatim.
    pub body_json: Vec<u8>,
    /// Id of the key that signed the digest.
    pub key_id: String,
    /// Ed25519 signature over the raw digest bytes.
    pub sig: Vec<u8>,
    /// Idempotency key.
    pub idem_key: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Previous tip of the chain, when superseding.
    pub supersedes_receipt_id: Option<String>,
    /// Context record id.
    pub context_id: String,
    /// Decision record id.
    pub decision_id: String,
    /// Outcome status.
    pub outcome_status: OutcomeStatus,
    /// Approval id, when an approval participates.
    pub approval_id: Option<String>,
    /// Policy content hash.
    pub policy_hash: String,
    /// Whether the outcome is terminal.
    pub is_final: bool,
    /// Credential expiry, on issued receipts.
    pub expires_at: Option<String>,
}

/// Canonicalizes, hashes, and signs a receipt body.
///
/// # Errors
///
/// Returns [`ReceiptError`] if validation fails or the body cannot be
/// canonicalized. Signing itself is infallible for a healthy signer.
pub fn make_receipt(
    mut input: MakeReceiptInput,
    signer: &dyn Signer,
) -> Result<StoredReceipt, ReceiptError> {
    if input.schema.is_empty() {
        input.schema = RECEIPT_SCHEMA.to_string();
    }
    if input.schema != RECEIPT_SCHEMA {
        return Err(ReceiptError::InvalidSchema {
            schema: input.schema,
        });
    }
    if input.idem_key.is_empty() {
        return Err(ReceiptError::MissingField { field: "idem_key" });
    }
    if input.context_id.is_empty() {
        return Err(ReceiptError::MissingField {
            field: "context_id",
        });
    }
    if input.decision_id.is_empty() {
        return Err(ReceiptError::MissingField {
            field: "decision_id",
        });
    }
    if input.policy.policy_hash.is_empty() {
        return Err(ReceiptError::MissingField {
            field: "policy.policy_hash",
        });
    }

    let mut body = json!({
        "schema": &input.schema,
        "created_at": &input.created_at,
        "context_id": &input.context_id,
        "decision_id": &input.decision_id,
        "actor": {
            "kind": &input.actor.kind,
            "subject": &input.actor.subject,
            "issuer": &input.actor.issuer,
            "repo": &input.actor.repo,
            "workflow": &input.actor.workflow,
            "run_id": &input.actor.run_id,
            "sha": &input.actor.sha,
        },
        "request": {
            "request_id": &input.request.request_id,
            "action": &input.request.action,
            "resource": &input.request.resource,
            "env": &input.request.env,
            "intent": Value::Object(input.request.intent.clone()),
        },
        "policy": {
            "policy_id": &input.policy.policy_id,
            "policy_version": &input.policy.policy_version,
            "policy_hash": &input.policy.policy_hash,
        },
        "approval": approval_value(input.approval.as_ref()),
        "credential_grant": credential_value(input.credential_grant.as_ref()),
        "outcome": {
            "status": input.outcome.status.as_str(),
            "issued_at": &input.outcome.issued_at,
            "expires_at": &input.outcome.expires_at,
            "error": outcome_error_value(input.outcome.error.as_ref()),
        },
    });

    let obj = body.as_object_mut().expect("body is an object");
    if let Some(ir) = interaction_ref_value(input.interaction_ref.as_ref()) {
        obj.insert("interaction_ref".to_string(), ir);
    }
    if let Some(refs) = refs_value(input.refs.as_ref()) {
        obj.insert("refs".to_string(), refs);
    }

    let canonical_body = canonical::canonicalize(&body)?;
    let digest = canonical::digest_bytes(&canonical_body);
    let body_digest = canonical::digest_prefix(&canonical_body);
    let sig = signer.sign_ed25519(&digest);

    let approval_id = input
        .approval
        .as_ref()
        .filter(|a| !a.approval_id.is_empty())
        .map(|a| a.approval_id.clone());
    let expires_at = if input.outcome.expires_at.is_empty() {
        None
    } else {
        Some(input.outcome.expires_at.clone())
    };

    Ok(StoredReceipt {
        receipt_id: body_digest.clone(),
        body_digest,
        body_json: canonical_body,
        key_id: signer.key_id().to_string(),
        sig: sig.to_vec(),
        idem_key: input.idem_key,
        created_at: input.created_at,
        supersedes_receipt_id: input.supersedes_receipt_id,
        context_id: input.context_id,
        decision_id: input.decision_id,
        outcome_status: input.outcome.status,
        approval_id,
        policy_hash: input.policy.policy_hash,
        is_final: input.outcome.status.is_final(),
        expires_at,
    })
}

/// Verifies a stored receipt against a public key.
///
/// Recomputes the digest of the verbatim body bytes, compares it to the
/// stored digest, and verifies the Ed25519 signature over the digest bytes.
///
/// # Errors
///
/// Returns [`ReceiptError::DigestMismatch`] when the body bytes do not hash
/// to the stored digest, and [`ReceiptError::Signature`] when the signature
/// does not verify.
pub fn verify_receipt(
    body_json: &[u8],
    body_digest: &str,
    sig: &[u8],
    public_key: &[u8; PUBLIC_KEY_SIZE],
) -> Result<(), ReceiptError> {
    if canonical::digest_prefix(body_json) != body_digest {
        return Err(ReceiptError::DigestMismatch);
    }
    let digest = canonical::digest_bytes(body_json);
    verify_signature(public_key, &digest, sig).map_err(ReceiptError::Signature)
}

/// Maps an empty string to `null`, otherwise to a JSON string.
fn empty_to_null(s: &str) -> Value {
    if s.is_empty() {
        Value::Null
    } else {
        Value::String(s.to_string())
    }
}

fn approval_value(approval: Option<&ReceiptApproval>) -> Value {
    let Some(approval) = approval else {
        return Value::Null;
    };

    let approver = approval.approver.as_ref().map_or(Value::Null, |a| {
        json!({
            "kind": a.kind,
            "id": a.id,
            "display": a.display,
        })
    });

    json!({
        "required": approval.required,
        "approval_id": empty_to_null(&approval.approval_id),
        "status": empty_to_null(&approval.status),
        "approved_at": empty_to_null(&approval.approved_at),
        "approver": approver,
    })
}

fn credential_value(credential: Option<&ReceiptCredentialGrant>) -> Value {
    let Some(credential) = credential else {
        return Value::Null;
    };

    json!({
        "provider": empty_to_null(&credential.provider),
        "method": empty_to_null(&credential.method),
        "role_arn": empty_to_null(&credential.role_arn),
        "region": empty_to_null(&credential.region),
        "ttl_seconds": credential.ttl_seconds,
        "scope_digest": empty_to_null(&credential.scope_digest),
    })
}

fn outcome_error_value(error: Option<&crate::types::OutcomeError>) -> Value {
    let Some(error) = error else {
        return Value::Null;
    };

    json!({
        "code": empty_to_null(&error.code),
        "msg": empty_to_null(&error.msg),
    })
}

/// Builds the `interaction_ref` sub-object, or `None` when every field is
/// null so the key is omitted entirely.
fn interaction_ref_value(ref_: Option<&InteractionRef>) -> Option<Value> {
    let ref_ = ref_?;
    if ref_.is_empty() {
        return None;
    }

    let mut m = Map::new();
    m.insert("mode".to_string(), empty_to_null(&ref_.mode));
    m.insert("session_id".to_string(), empty_to_null(&ref_.session_id));
    m.insert("call_id".to_string(), empty_to_null(&ref_.call_id));
    m.insert("turn_id".to_string(), empty_to_null(&ref_.turn_id));
    m.insert(
        "turn_started_at".to_string(),
        empty_to_null(&ref_.turn_started_at),
    );
    m.insert(
        "turn_ended_at".to_string(),
        empty_to_null(&ref_.turn_ended_at),
    );
    m.insert(
        "jurisdiction".to_string(),
        empty_to_null(&ref_.jurisdiction),
    );
    m.insert(
        "consent_state".to_string(),
        empty_to_null(&ref_.consent_state),
    );
    m.insert(
        "redaction_mode".to_string(),
        empty_to_null(&ref_.redaction_mode),
    );
    if ref_.turn_index != 0 {
        m.insert("turn_index".to_string(), json!(ref_.turn_index));
    }
    Some(Value::Object(m))
}

/// Builds the `refs` sub-object, or `None` when both references are absent.
fn refs_value(refs: Option<&ReceiptRefs>) -> Option<Value> {
    let refs = refs?;
    if refs.context.is_none() && refs.decision.is_none() {
        return None;
    }

    let context = refs.context.as_ref().map_or(Value::Null, |c| {
        json!({
            "context_id": empty_to_null(&c.context_id),
            "record_hash": empty_to_null(&c.record_hash),
            "content_hash": empty_to_null(&c.content_hash),
        })
    });
    let decision = refs.decision.as_ref().map_or(Value::Null, |d| {
        json!({
            "decision_id": empty_to_null(&d.decision_id),
            "inputs_digest": empty_to_null(&d.inputs_digest),
            "record_hash": empty_to_null(&d.record_hash),
            "content_digest": empty_to_null(&d.content_digest),
        })
    });

    Some(json!({
        "context": context,
        "decision": decision,
    }))
}
