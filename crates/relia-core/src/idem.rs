//! Deterministic idempotency keying.
//!
//! The idempotency key is a pure function of the authenticated actor and the
//! validated request: replays of the same logical call map to the same ledger
//! row, which is what makes `authorize` safe to retry. The key is the
//! prefixed digest of a canonical payload, so determinism falls out of the
//! canonicalizer.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::canonical::{self, CanonicalError};
use crate::types::{ActorContext, AuthorizeRequest};

/// Schema tag of the idempotency-key payload.
pub const IDEM_SCHEMA: &str = "relia.idem.v1";

/// Prefix of every idempotency key.
pub const IDEM_PREFIX: &str = "idem:v1:sha256:";

/// Errors from idempotency-key computation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdemKeyError {
    /// A required request field was empty.
    #[error("missing required request field: {field}")]
    MissingRequestField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A required actor-identity field was empty.
    #[error("missing required actor field: {field}")]
    MissingActorField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// The payload could not be canonicalized (e.g. a float in the intent
    /// map).
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Derives the deterministic idempotency key from actor + request.
///
/// The payload is the extended shape: actor identity, request triplet,
/// intent, plan digest, and the pass-through `context_ref`, `decision_ref`,
/// and `interaction_ref` sub-objects when present. `request_id` participates
/// only when non-empty, so callers that omit it get pure content-addressed
/// deduplication.
///
/// # Errors
///
/// Returns [`IdemKeyError`] when a required field is empty or the intent map
/// cannot be canonicalized.
pub fn compute_idem_key(
    actor: &ActorContext,
    request: &AuthorizeRequest,
) -> Result<String, IdemKeyError> {
    if request.action.is_empty() {
        return Err(IdemKeyError::MissingRequestField { field: "action" });
    }
    if request.resource.is_empty() {
        return Err(IdemKeyError::MissingRequestField { field: "resource" });
    }
    if request.env.is_empty() {
        return Err(IdemKeyError::MissingRequestField { field: "env" });
    }
    if actor.subject.is_empty() {
        return Err(IdemKeyError::MissingActorField { field: "subject" });
    }
    if actor.issuer.is_empty() {
        return Err(IdemKeyError::MissingActorField { field: "issuer" });
    }
    if actor.repo.is_empty() {
        return Err(IdemKeyError::MissingActorField { field: "repo" });
    }
    if actor.run_id.is_empty() {
        return Err(IdemKeyError::MissingActorField { field: "run_id" });
    }

    let mut payload = Map::new();
    payload.insert("schema".to_string(), json!(IDEM_SCHEMA));
    payload.insert("iss".to_string(), json!(actor.issuer));
    payload.insert("sub".to_string(), json!(actor.subject));
    payload.insert("repo".to_string(), json!(actor.repo));
    payload.insert("workflow".to_string(), json!(actor.workflow));
    payload.insert("run_id".to_string(), json!(actor.run_id));
    payload.insert("sha".to_string(), json!(actor.sha));
    payload.insert("action".to_string(), json!(request.action));
    payload.insert("resource".to_string(), json!(request.resource));
    payload.insert("env".to_string(), json!(request.env));
    payload.insert(
        "intent".to_string(),
        Value::Object(request.intent.clone()),
    );
    payload.insert(
        "plan_digest".to_string(),
        json!(request.evidence.plan_digest),
    );

    if let Some(context_ref) = &request.context_ref {
        payload.insert(
            "context_ref".to_string(),
            json!({
                "context_id": context_ref.context_id,
                "record_hash": context_ref.record_hash,
                "content_hash": context_ref.content_hash,
            }),
        );
    }
    if let Some(decision_ref) = &request.decision_ref {
        payload.insert(
            "decision_ref".to_string(),
            json!({
                "decision_id": decision_ref.decision_id,
                "inputs_digest": decision_ref.inputs_digest,
                "record_hash": decision_ref.record_hash,
                "content_digest": decision_ref.content_digest,
            }),
        );
    }
    if let Some(interaction_ref) = &request.interaction_ref {
        payload.insert(
            "interaction_ref".to_string(),
            json!({
                "mode": interaction_ref.mode,
                "session_id": interaction_ref.session_id,
                "call_id": interaction_ref.call_id,
                "turn_id": interaction_ref.turn_id,
                "turn_index": interaction_ref.turn_index,
                "turn_started_at": interaction_ref.turn_started_at,
                "turn_ended_at": interaction_ref.turn_ended_at,
                "jurisdiction": interaction_ref.jurisdiction,
                "consent_state": interaction_ref.consent_state,
                "redaction_mode": interaction_ref.redaction_mode,
            }),
        );
    }

    if !request.request_id.is_empty() {
        payload.insert("request_id".to_string(), json!(request.request_id));
    }

    let canonical = canonical::canonicalize(&Value::Object(payload))?;
    let digest = canonical::digest_bytes(&canonical);
    Ok(format!("{IDEM_PREFIX}{}", hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextRef, InteractionRef, RequestEvidence};

    fn actor() -> ActorContext {
        ActorContext {
            subject: "repo:org/repo:ref:refs/heads/main".to_string(),
            issuer: "relia-dev".to_string(),
            repo: "org/repo".to_string(),
            workflow: "deploy".to_string(),
            run_id: "123".to_string(),
            sha: "abc".to_string(),
        }
    }

    fn request() -> AuthorizeRequest {
        AuthorizeRequest {
            action: "terraform.apply".to_string(),
            resource: "res".to_string(),
            env: "dev".to_string(),
            evidence: RequestEvidence {
                plan_digest: "sha256:plan".to_string(),
                diff_url: String::new(),
            },
            ..AuthorizeRequest::default()
        }
    }

    #[test]
    fn key_is_deterministic() {
        let a = compute_idem_key(&actor(), &request()).unwrap();
        let b = compute_idem_key(&actor(), &request()).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(IDEM_PREFIX));
        assert_eq!(a.len(), IDEM_PREFIX.len() + 64);
    }

    #[test]
    fn key_is_independent_of_intent_insertion_order() {
        let mut ra = request();
        ra.intent.insert("a".to_string(), json!(1));
        ra.intent.insert("b".to_string(), json!("two"));

        let mut rb = request();
        rb.intent.insert("b".to_string(), json!("two"));
        rb.intent.insert("a".to_string(), json!(1));

        assert_eq!(
            compute_idem_key(&actor(), &ra).unwrap(),
            compute_idem_key(&actor(), &rb).unwrap()
        );
    }

    #[test]
    fn key_changes_with_request_fields() {
        let base = compute_idem_key(&actor(), &request()).unwrap();

        let mut other = request();
        other.env = "prod".to_string();
        assert_ne!(base, compute_idem_key(&actor(), &other).unwrap());

        let mut other = request();
        other.request_id = "req-1".to_string();
        assert_ne!(base, compute_idem_key(&actor(), &other).unwrap());

        let mut other = request();
        other.interaction_ref = Some(InteractionRef {
            mode: "voice".to_string(),
            ..InteractionRef::default()
        });
        assert_ne!(base, compute_idem_key(&actor(), &other).unwrap());

        let mut other = request();
        other.context_ref = Some(ContextRef {
            context_id: "sha256:c1".to_string(),
            ..ContextRef::default()
        });
        assert_ne!(base, compute_idem_key(&actor(), &other).unwrap());
    }

    #[test]
    fn missing_request_fields_rejected() {
        let mut r = request();
        r.action = String::new();
        assert_eq!(
            compute_idem_key(&actor(), &r),
            Err(IdemKeyError::MissingRequestField { field: "action" })
        );

        let mut r = request();
        r.env = String::new();
        assert_eq!(
            compute_idem_key(&actor(), &r),
            Err(IdemKeyError::MissingRequestField { field: "env" })
        );
    }

    #[test]
    fn missing_actor_fields_rejected() {
        let mut a = actor();
        a.run_id = String::new();
        assert_eq!(
            compute_idem_key(&a, &request()),
            Err(IdemKeyError::MissingActorField { field: "run_id" })
        );

        let mut a = actor();
        a.issuer = String::new();
        assert_eq!(
            compute_idem_key(&a, &request()),
            Err(IdemKeyError::MissingActorField { field: "issuer" })
        );
    }

    #[test]
    fn float_in_intent_rejected() {
        let mut r = request();
        r.intent.insert("ratio".to_string(), json!(0.5));
        assert!(matches!(
            compute_idem_key(&actor(), &r),
            Err(IdemKeyError::Canonical(CanonicalError::FloatNotAllowed))
        ));
    }
}
