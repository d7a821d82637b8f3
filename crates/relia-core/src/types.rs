//! Wire-shape value types shared across the authorize pipeline.
//!
//! These structs mirror the canonical receipt body and the authorize request
//! surface. They are plain owned values: reads from the ledger return copies,
//! and the coordinator passes them by reference between steps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of the workload (or approver) a receipt is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptActor {
    /// Actor category, e.g. `workload` or `approval`.
    pub kind: String,
    /// OIDC subject claim.
    pub subject: String,
    /// OIDC issuer.
    pub issuer: String,
    /// Source repository, `org/repo`.
    pub repo: String,
    /// Workflow name, when the source is CI.
    pub workflow: String,
    /// CI run identifier.
    pub run_id: String,
    /// Commit SHA the workload ran at.
    pub sha: String,
}

/// The request half of a receipt body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRequest {
    /// Caller-supplied request id; empty when not provided.
    pub request_id: String,
    /// Requested action, e.g. `terraform.apply`.
    pub action: String,
    /// Target resource identifier.
    pub resource: String,
    /// Target environment, e.g. `dev` or `prod`.
    pub env: String,
    /// Caller-defined intent map, passed through untouched.
    pub intent: Map<String, Value>,
}

/// Reference to the policy version a decision was made under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPolicy {
    /// Policy document id.
    pub policy_id: String,
    /// Policy document version string.
    pub policy_version: String,
    /// Content hash of the policy source bytes, `sha256:<hex>`.
    pub policy_hash: String,
}

/// Identity of the human who resolved an approval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approver {
    /// Approver category, e.g. `slack_user`.
    pub kind: String,
    /// Stable approver id within its kind.
    pub id: String,
    /// Human-readable display name.
    pub display: String,
}

/// Approval sub-record of a receipt body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptApproval {
    /// Whether the decision required approval.
    pub required: bool,
    /// Allocated approval id; empty when not yet allocated.
    #[serde(default)]
    pub approval_id: String,
    /// Approval status string (`pending`, `approved`, `denied`).
    #[serde(default)]
    pub status: String,
    /// RFC 3339 timestamp of the approval decision.
    #[serde(default)]
    pub approved_at: String,
    /// Identity of the approver, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<Approver>,
}

/// Credential grant sub-record of a final receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptCredentialGrant {
    /// Credential provider, e.g. `aws_sts`.
    pub provider: String,
    /// Issuance method, e.g. `AssumeRoleWithWebIdentity`.
    pub method: String,
    /// Role reference the credentials were minted for.
    pub role_arn: String,
    /// Provider region, when relevant.
    #[serde(default)]
    pub region: String,
    /// Requested credential lifetime in seconds.
    pub ttl_seconds: i64,
    /// Digest of the granted scope, when the provider reports one.
    #[serde(default)]
    pub scope_digest: String,
}

/// Pass-through handle for a conversational timeline (voice/chat).
///
/// Relia does not interpret these fields; they are carried unchanged into the
/// idempotency key and the receipt so downstream systems can correlate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRef {
    /// Interaction mode, caller-defined (`voice`, `chat`, ...).
    #[serde(default)]
    pub mode: String,
    /// Conversation session id.
    #[serde(default)]
    pub session_id: String,
    /// Call id within the session.
    #[serde(default)]
    pub call_id: String,
    /// Turn id within the call.
    #[serde(default)]
    pub turn_id: String,
    /// 1-based turn ordinal; zero means unset.
    #[serde(default)]
    pub turn_index: i64,
    /// RFC 3339 turn start.
    #[serde(default)]
    pub turn_started_at: String,
    /// RFC 3339 turn end.
    #[serde(default)]
    pub turn_ended_at: String,
    /// Caller-declared jurisdiction.
    #[serde(default)]
    pub jurisdiction: String,
    /// Caller-declared consent state.
    #[serde(default)]
    pub consent_state: String,
    /// Caller-declared redaction mode.
    #[serde(default)]
    pub redaction_mode: String,
}

impl InteractionRef {
    /// True when every field is empty, in which case the sub-object is
    /// omitted from canonical bodies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mode.is_empty()
            && self.session_id.is_empty()
            && self.call_id.is_empty()
            && self.turn_id.is_empty()
            && self.turn_index == 0
            && self.turn_started_at.is_empty()
            && self.turn_ended_at.is_empty()
            && self.jurisdiction.is_empty()
            && self.consent_state.is_empty()
            && self.redaction_mode.is_empty()
    }
}

/// External reference to a context record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    /// Context record id.
    #[serde(default)]
    pub context_id: String,
    /// Hash of the stored record.
    #[serde(default)]
    pub record_hash: String,
    /// Hash of the record content, when distinct.
    #[serde(default)]
    pub content_hash: String,
}

/// External reference to a decision record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRef {
    /// Decision record id.
    #[serde(default)]
    pub decision_id: String,
    /// Digest of the decision inputs.
    #[serde(default)]
    pub inputs_digest: String,
    /// Hash of the stored record.
    #[serde(default)]
    pub record_hash: String,
    /// Digest of the record content, when distinct.
    #[serde(default)]
    pub content_digest: String,
}

/// Optional `refs` sub-record of a receipt body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRefs {
    /// Context reference, when supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextRef>,
    /// Decision reference, when supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionRef>,
}

/// Error detail carried inside a receipt outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub msg: String,
}

/// Terminal and intermediate receipt outcome statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// Waiting on a human approval.
    ApprovalPending,
    /// Approval granted; issuance not yet started.
    ApprovalApproved,
    /// Approval denied.
    ApprovalDenied,
    /// Credential issuance in flight.
    IssuingCredentials,
    /// Credentials issued; terminal.
    IssuedCredentials,
    /// Request denied by policy or approver; terminal.
    Denied,
    /// Credential issuance failed permanently; terminal.
    IssueFailed,
}

impl OutcomeStatus {
    /// Canonical string form used in receipt bodies and ledger rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApprovalPending => "ApprovalPending",
            Self::ApprovalApproved => "ApprovalApproved",
            Self::ApprovalDenied => "ApprovalDenied",
            Self::IssuingCredentials => "IssuingCredentials",
            Self::IssuedCredentials => "IssuedCredentials",
            Self::Denied => "Denied",
            Self::IssueFailed => "IssueFailed",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ApprovalPending" => Some(Self::ApprovalPending),
            "ApprovalApproved" => Some(Self::ApprovalApproved),
            "ApprovalDenied" => Some(Self::ApprovalDenied),
            "IssuingCredentials" => Some(Self::IssuingCredentials),
            "IssuedCredentials" => Some(Self::IssuedCredentials),
            "Denied" => Some(Self::Denied),
            "IssueFailed" => Some(Self::IssueFailed),
            _ => None,
        }
    }

    /// A receipt is final iff its outcome is one of these.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::IssuedCredentials | Self::Denied | Self::IssueFailed)
    }
}

/// Outcome sub-record of a receipt body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptOutcome {
    /// Outcome status.
    pub status: OutcomeStatus,
    /// RFC 3339 issuance time; empty when not issued.
    #[serde(default)]
    pub issued_at: String,
    /// RFC 3339 credential expiry; empty when not issued.
    #[serde(default)]
    pub expires_at: String,
    /// Error detail; present only on failure outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl ReceiptOutcome {
    /// Outcome with only a status set.
    #[must_use]
    pub const fn status_only(status: OutcomeStatus) -> Self {
        Self {
            status,
            issued_at: String::new(),
            expires_at: String::new(),
            error: None,
        }
    }
}

impl Default for ReceiptOutcome {
    /// A bare `Denied` outcome, the conservative starting value.
    fn default() -> Self {
        Self::status_only(OutcomeStatus::Denied)
    }
}

/// Authenticated identity of the caller, as produced by the (external)
/// authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    /// OIDC subject claim.
    pub subject: String,
    /// OIDC issuer.
    pub issuer: String,
    /// Source repository, `org/repo`.
    pub repo: String,
    /// Workflow name.
    #[serde(default)]
    pub workflow: String,
    /// CI run identifier.
    pub run_id: String,
    /// Commit SHA.
    #[serde(default)]
    pub sha: String,
}

/// Evidence the caller attaches to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvidence {
    /// Digest of the plan the workload intends to apply.
    #[serde(default)]
    pub plan_digest: String,
    /// URL of the reviewed diff.
    #[serde(default)]
    pub diff_url: String,
}

/// Provider-specific request options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsOptions {
    /// Region to mint credentials in.
    #[serde(default)]
    pub region: String,
}

/// A validated authorize request, as handed to the coordinator by the
/// (external) HTTP adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    /// Caller-supplied request id; participates in the idempotency key when
    /// non-empty.
    #[serde(default)]
    pub request_id: String,
    /// Requested action.
    pub action: String,
    /// Target resource.
    pub resource: String,
    /// Target environment.
    pub env: String,
    /// Caller-defined intent map.
    #[serde(default)]
    pub intent: Map<String, Value>,
    /// Attached evidence.
    #[serde(default)]
    pub evidence: RequestEvidence,
    /// AWS options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsOptions>,
    /// Conversational timeline handle, passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_ref: Option<InteractionRef>,
    /// External context reference, passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<ContextRef>,
    /// External decision reference, passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_ref: Option<DecisionRef>,
}
