//! The authorize coordinator.
//!
//! One logical `authorize` or `approve` call orchestrates keying, policy
//! evaluation, receipt construction, and the ledger commit. The flow:
//!
//! ```text
//! authorize(actor, request, now)
//!   ├── compute idempotency key
//!   ├── existing row? ── dispatch by state (terminal / pending / issue / retry)
//!   └── fresh:
//!         evaluate policy → context + decision records → base receipt
//!         → ONE transaction (key, policy version, context, decision,
//!           idempotency row, approval?, outbox?, receipt)
//!         → losing racer re-reads and dispatches the winner's state
//!         → allow: finalize_issuance (broker OUTSIDE any transaction)
//! ```
//!
//! # Invariants
//!
//! - A broker failure leaves the idempotency row in `Issuing`; the next
//!   authorize call retries finalization.
//! - Retries re-evaluate the policy version pinned by the latest receipt's
//!   `policy_hash`, loaded from the ledger, never the on-disk file.
//! - `latest_receipt_id` always points at the tip of the committed chain;
//!   `final_receipt_id` is set exactly when the state is terminal.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use relia_core::canonical::CanonicalError;
use relia_core::context::{ContextEvidence, ContextInputs, ContextSource, build_context};
use relia_core::crypto::Signer;
use relia_core::decision::build_decision;
use relia_core::idem::{IdemKeyError, compute_idem_key};
use relia_core::policy::{EvalInput, LoadedPolicy, PolicyDecision, PolicyError, evaluate};
use relia_core::receipt::{MakeReceiptInput, ReceiptError, make_receipt};
use relia_core::state::{
    ApprovalStatus, IdemStatus, NextAction, Verdict, apply_approval, transition_from_decision,
};
use relia_core::types::{
    ActorContext, Approver, AuthorizeRequest, OutcomeStatus, ReceiptActor, ReceiptApproval,
    ReceiptCredentialGrant, ReceiptOutcome, ReceiptPolicy, ReceiptRefs, ReceiptRequest,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::broker::{AssumeRoleInput, BrokerError, CredentialBroker};
use crate::ledger::{
    ApprovalRow, ContextRow, DecisionRow, IdempotencyRow, LedgerError, OutboxRow, OutboxStatus,
    PolicyVersionRow, ReceiptRow, SigningKeyRow, Store,
};
use crate::notify::{ApprovalMessageInput, NotificationTransport, build_approval_message};
use crate::outbox::{OutboxConfig, attempt_delivery};

/// Fallback credential lifetime when a rule names none.
pub const DEFAULT_TTL_SECONDS: i64 = 900;

/// Actor kind recorded on workload receipts.
const ACTOR_KIND_WORKLOAD: &str = "workload";

/// Actor kind recorded on approval receipts.
const ACTOR_KIND_APPROVAL: &str = "approval";

/// Errors surfaced by the coordinator.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request or actor is missing required fields.
    #[error(transparent)]
    Validation(#[from] IdemKeyError),

    /// The policy is missing or unparseable.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A record body could not be canonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// Receipt construction failed.
    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    /// The ledger failed outside of recoverable races.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Credential issuance failed; the idempotency row stays `Issuing` and
    /// the next authorize call retries.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The approval message could not be encoded.
    #[error("failed to encode approval message: {0}")]
    MessageEncoding(#[from] serde_json::Error),

    /// The named approval does not exist.
    #[error("approval not found: {approval_id}")]
    ApprovalNotFound {
        /// The id that was looked up.
        approval_id: String,
    },

    /// The approval decision was neither `approved` nor `denied`.
    #[error("invalid approval status: {status}")]
    InvalidApprovalStatus {
        /// The rejected status.
        status: String,
    },

    /// The ledger holds rows that violate a coordinator invariant.
    #[error("corrupt ledger state: {detail}")]
    CorruptState {
        /// What was violated.
        detail: String,
    },
}

/// Approval half of an authorize response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalInfo {
    /// Approval id to poll or resolve.
    pub approval_id: String,
    /// Current status.
    pub status: ApprovalStatus,
}

/// Ephemeral credentials in the response shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwsCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// RFC 3339 expiry.
    pub expires_at: String,
}

/// The shaped result of one authorize call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizeResponse {
    /// The verdict.
    pub verdict: Verdict,
    /// Context record id.
    pub context_id: String,
    /// Decision record id.
    pub decision_id: String,
    /// Receipt the caller should retain as evidence.
    pub receipt_id: String,
    /// Approval handle, on `require_approval` responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalInfo>,
    /// Ephemeral credentials, on `allow` responses that issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_credentials: Option<AwsCredentials>,
    /// Error marker, e.g. on replays of errored keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The coordinator. One instance serves every request; all state lives in
/// the ledger.
pub struct AuthorizeService {
    store: Arc<dyn Store>,
    signer: Arc<dyn Signer>,
    broker: Arc<dyn CredentialBroker>,
    policy_path: PathBuf,
    notifier: Option<Arc<dyn NotificationTransport>>,
    approval_channel: String,
    outbox_config: OutboxConfig,
}

impl AuthorizeService {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        signer: Arc<dyn Signer>,
        broker: Arc<dyn CredentialBroker>,
        policy_path: PathBuf,
    ) -> Self {
        Self {
            store,
            signer,
            broker,
            policy_path,
            notifier: None,
            approval_channel: String::new(),
            outbox_config: OutboxConfig::default(),
        }
    }

    /// Configures the notification transport and destination channel used
    /// for approval requests.
    #[must_use]
    pub fn with_notifier(
        mut self,
        notifier: Arc<dyn NotificationTransport>,
        channel: impl Into<String>,
    ) -> Self {
        self.notifier = Some(notifier);
        self.approval_channel = channel.into();
        self
    }

    /// Handles one authorize call.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`]; broker failures leave the idempotency row
    /// retryable, everything else leaves no partial state.
    pub fn authorize(
        &self,
        actor: &ActorContext,
        request: &AuthorizeRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeResponse, ServiceError> {
        let idem_key = compute_idem_key(actor, request)?;

        if let Some(row) = self.store.get_idempotency_key(&idem_key)? {
            return self.dispatch_existing(row, actor, request, now);
        }

        match self.authorize_fresh(&idem_key, actor, request, now) {
            Err(ServiceError::Ledger(LedgerError::Conflict { .. })) => {
                // Lost the first-writer race; the winner's state is
                // committed, so serve it.
                let row = self.store.get_idempotency_key(&idem_key)?.ok_or_else(|| {
                    ServiceError::CorruptState {
                        detail: format!("conflict on {idem_key} but no committed row"),
                    }
                })?;
                self.dispatch_existing(row, actor, request, now)
            },
            other => other,
        }
    }

    /// Serves an authorize call whose idempotency key already has a row.
    fn dispatch_existing(
        &self,
        row: IdempotencyRow,
        actor: &ActorContext,
        request: &AuthorizeRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeResponse, ServiceError> {
        match row.status {
            IdemStatus::Allowed | IdemStatus::Denied => {
                let verdict = if row.status == IdemStatus::Allowed {
                    Verdict::Allow
                } else {
                    Verdict::Deny
                };
                let final_id =
                    row.final_receipt_id
                        .as_deref()
                        .ok_or_else(|| ServiceError::CorruptState {
                            detail: format!("terminal {} without final receipt", row.idem_key),
                        })?;
                let receipt = self.require_receipt(final_id)?;
                Ok(AuthorizeResponse {
                    verdict,
                    context_id: receipt.context_id,
                    decision_id: receipt.decision_id,
                    receipt_id: receipt.receipt_id,
                    approval: None,
                    aws_credentials: None,
                    error: None,
                })
            },
            IdemStatus::PendingApproval => {
                let latest_id = row.latest_receipt_id.as_deref().ok_or_else(|| {
                    ServiceError::CorruptState {
                        detail: format!("pending {} without latest receipt", row.idem_key),
                    }
                })?;
                let receipt = self.require_receipt(latest_id)?;
                let approval_id =
                    row.approval_id
                        .clone()
                        .ok_or_else(|| ServiceError::CorruptState {
                            detail: format!("pending {} without approval id", row.idem_key),
                        })?;
                Ok(AuthorizeResponse {
                    verdict: Verdict::RequireApproval,
                    context_id: receipt.context_id,
                    decision_id: receipt.decision_id,
                    receipt_id: receipt.receipt_id,
                    approval: Some(ApprovalInfo {
                        approval_id,
                        status: ApprovalStatus::Pending,
                    }),
                    aws_credentials: None,
                    error: None,
                })
            },
            IdemStatus::ApprovedReady => self.issue_approved_ready(row, actor, request, now),
            IdemStatus::Issuing => self.retry_issuing(&row, actor, request, now),
            IdemStatus::Errored => Ok(AuthorizeResponse {
                verdict: Verdict::Deny,
                context_id: String::new(),
                decision_id: String::new(),
                receipt_id: row.latest_receipt_id.unwrap_or_default(),
                approval: None,
                aws_credentials: None,
                error: Some("previous attempt failed".to_string()),
            }),
        }
    }

    /// First sight of an idempotency key: evaluate, record, commit, act.
    fn authorize_fresh(
        &self,
        idem_key: &str,
        actor: &ActorContext,
        request: &AuthorizeRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeResponse, ServiceError> {
        let created_at = rfc3339(now);

        let loaded = LoadedPolicy::from_path(&self.policy_path)?;
        let decision = evaluate(
            &loaded.doc,
            &EvalInput {
                action: &request.action,
                resource: &request.resource,
                env: &request.env,
            },
        );

        let context = build_context(
            ContextSource {
                kind: "github_actions".to_string(),
                repo: actor.repo.clone(),
                workflow: actor.workflow.clone(),
                run_id: actor.run_id.clone(),
                actor: actor.subject.clone(),
                git_ref: String::new(),
                sha: actor.sha.clone(),
            },
            ContextInputs {
                action: request.action.clone(),
                resource: request.resource.clone(),
                env: request.env.clone(),
                intent: request.intent.clone(),
            },
            ContextEvidence {
                plan_digest: request.evidence.plan_digest.clone(),
                diff_url: request.evidence.diff_url.clone(),
            },
            &created_at,
        )?;

        let policy_meta = ReceiptPolicy {
            policy_id: loaded.doc.policy_id.clone(),
            policy_version: loaded.doc.policy_version.clone(),
            policy_hash: loaded.hash.clone(),
        };
        let decision_record = build_decision(
            &context.context_id,
            policy_meta.clone(),
            decision.verdict,
            decision.reason_codes.clone(),
            decision.require_approval,
            &decision.risk,
            &created_at,
        )?;

        let (status, action) = transition_from_decision(decision.verdict);
        let outcome_status = match decision.verdict {
            Verdict::Allow => OutcomeStatus::IssuingCredentials,
            Verdict::RequireApproval => OutcomeStatus::ApprovalPending,
            Verdict::Deny => OutcomeStatus::Denied,
        };

        let approval_id = (action == NextAction::ReturnPending).then(new_approval_id);
        let approval = approval_id.as_ref().map(|id| ReceiptApproval {
            required: true,
            approval_id: id.clone(),
            status: ApprovalStatus::Pending.as_str().to_string(),
            ..ReceiptApproval::default()
        });

        let receipt = make_receipt(
            MakeReceiptInput {
                created_at: created_at.clone(),
                idem_key: idem_key.to_string(),
                context_id: context.context_id.clone(),
                decision_id: decision_record.decision_id.clone(),
                actor: workload_actor(actor),
                request: receipt_request(request),
                policy: policy_meta,
                interaction_ref: request.interaction_ref.clone(),
                refs: request_refs(request),
                approval,
                outcome: ReceiptOutcome::status_only(outcome_status),
                ..MakeReceiptInput::default()
            },
            self.signer.as_ref(),
        )?;
        let receipt_row = ReceiptRow::from(receipt);

        let outbox_row = match &approval_id {
            Some(id) => Some(OutboxRow {
                notification_id: format!("ntf-{}", uuid::Uuid::new_v4()),
                approval_id: id.clone(),
                channel: self.approval_channel.clone(),
                message: build_approval_message(&ApprovalMessageInput {
                    approval_id: id.clone(),
                    receipt_id: receipt_row.receipt_id.clone(),
                    policy_hash: loaded.hash.clone(),
                    context_id: context.context_id.clone(),
                    decision_id: decision_record.decision_id.clone(),
                    action: request.action.clone(),
                    resource: request.resource.clone(),
                    env: request.env.clone(),
                    risk: decision.risk.clone(),
                    diff_url: request.evidence.diff_url.clone(),
                    run_url: String::new(),
                })?,
                attempt_count: 0,
                next_attempt_at: created_at.clone(),
                status: OutboxStatus::Pending,
                last_error: None,
                created_at: created_at.clone(),
                updated_at: created_at.clone(),
            }),
            None => None,
        };

        let idem_row = IdempotencyRow {
            idem_key: idem_key.to_string(),
            status,
            approval_id: approval_id.clone(),
            latest_receipt_id: Some(receipt_row.receipt_id.clone()),
            final_receipt_id: receipt_row
                .is_final
                .then(|| receipt_row.receipt_id.clone()),
            created_at: created_at.clone(),
            updated_at: created_at.clone(),
        };
        let signing_row = SigningKeyRow {
            key_id: self.signer.key_id().to_string(),
            public_key: self.signer.public_key_bytes().to_vec(),
            created_at: created_at.clone(),
        };
        let policy_row = PolicyVersionRow {
            policy_hash: loaded.hash.clone(),
            policy_id: loaded.doc.policy_id.clone(),
            policy_version: loaded.doc.policy_version.clone(),
            source: loaded.raw.clone(),
            created_at: created_at.clone(),
        };
        let context_row = ContextRow {
            context_id: context.context_id.clone(),
            body_json: context.body_json.clone(),
            created_at: created_at.clone(),
        };
        let decision_row = DecisionRow {
            decision_id: decision_record.decision_id.clone(),
            context_id: context.context_id.clone(),
            policy_hash: loaded.hash.clone(),
            verdict: decision.verdict.as_str().to_string(),
            body_json: decision_record.body_json.clone(),
            created_at: created_at.clone(),
        };
        let approval_row = approval_id.as_ref().map(|id| ApprovalRow {
            approval_id: id.clone(),
            idem_key: idem_key.to_string(),
            status: ApprovalStatus::Pending,
            channel: (!self.approval_channel.is_empty()).then(|| self.approval_channel.clone()),
            message_ts: None,
            approved_by: None,
            approved_at: None,
            created_at: created_at.clone(),
            updated_at: created_at.clone(),
        });

        self.store.with_tx(&mut |tx| {
            tx.put_signing_key(&signing_row)?;
            tx.put_policy_version(&policy_row)?;
            tx.put_context(&context_row)?;
            tx.put_decision(&decision_row)?;
            tx.create_idempotency_key(&idem_row)?;
            if let Some(approval_row) = &approval_row {
                tx.put_approval(approval_row)?;
            }
            if let Some(outbox_row) = &outbox_row {
                tx.put_outbox(outbox_row)?;
            }
            tx.put_receipt(&receipt_row)
        })?;

        info!(
            idem_key,
            receipt_id = %receipt_row.receipt_id,
            status = status.as_str(),
            verdict = decision.verdict.as_str(),
            "Committed authorize decision"
        );

        match action {
            NextAction::IssueCredentials => self.finalize_issuance(
                &idem_row,
                &receipt_row,
                actor,
                request,
                now,
                &decision,
            ),
            NextAction::ReturnPending => {
                // Opportunistic inline delivery; the worker retries if this
                // fails or no transport is configured.
                if let (Some(notifier), Some(entry)) = (&self.notifier, outbox_row) {
                    attempt_delivery(
                        self.store.as_ref(),
                        notifier.as_ref(),
                        entry,
                        &self.outbox_config,
                        now,
                    );
                }
                Ok(AuthorizeResponse {
                    verdict: Verdict::RequireApproval,
                    context_id: context.context_id,
                    decision_id: decision_record.decision_id,
                    receipt_id: receipt_row.receipt_id,
                    approval: approval_id.map(|approval_id| ApprovalInfo {
                        approval_id,
                        status: ApprovalStatus::Pending,
                    }),
                    aws_credentials: None,
                    error: None,
                })
            },
            _ => Ok(AuthorizeResponse {
                verdict: Verdict::Deny,
                context_id: context.context_id,
                decision_id: decision_record.decision_id,
                receipt_id: receipt_row.receipt_id,
                approval: None,
                aws_credentials: None,
                error: None,
            }),
        }
    }

    /// Credential issuance for a key a human just approved: pin the policy
    /// version, append the issuing receipt, then finalize.
    fn issue_approved_ready(
        &self,
        row: IdempotencyRow,
        actor: &ActorContext,
        request: &AuthorizeRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeResponse, ServiceError> {
        let created_at = rfc3339(now);
        let latest_id =
            row.latest_receipt_id
                .as_deref()
                .ok_or_else(|| ServiceError::CorruptState {
                    detail: format!("approved {} without latest receipt", row.idem_key),
                })?;
        let latest = self.require_receipt(latest_id)?;
        let decision = self.pinned_decision(&latest, request)?;

        let issuing = make_receipt(
            MakeReceiptInput {
                created_at,
                idem_key: row.idem_key.clone(),
                supersedes_receipt_id: Some(latest.receipt_id.clone()),
                context_id: latest.context_id.clone(),
                decision_id: latest.decision_id.clone(),
                actor: workload_actor(actor),
                request: receipt_request(request),
                policy: ReceiptPolicy {
                    policy_hash: latest.policy_hash.clone(),
                    ..ReceiptPolicy::default()
                },
                outcome: ReceiptOutcome::status_only(OutcomeStatus::IssuingCredentials),
                ..MakeReceiptInput::default()
            },
            self.signer.as_ref(),
        )?;
        let issuing_row = ReceiptRow::from(issuing);

        let mut moved = row;
        moved.status = IdemStatus::Issuing;
        moved.latest_receipt_id = Some(issuing_row.receipt_id.clone());
        moved.updated_at = rfc3339(now);

        self.store.with_tx(&mut |tx| {
            tx.put_receipt(&issuing_row)?;
            tx.put_idempotency_key(&moved)
        })?;

        info!(
            idem_key = %moved.idem_key,
            receipt_id = %issuing_row.receipt_id,
            "Approved key moved to issuing"
        );

        self.finalize_issuance(&moved, &issuing_row, actor, request, now, &decision)
    }

    /// Retry of a previously interrupted issuance, reusing the existing
    /// issuing receipt.
    fn retry_issuing(
        &self,
        row: &IdempotencyRow,
        actor: &ActorContext,
        request: &AuthorizeRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeResponse, ServiceError> {
        let latest_id =
            row.latest_receipt_id
                .as_deref()
                .ok_or_else(|| ServiceError::CorruptState {
                    detail: format!("issuing {} without latest receipt", row.idem_key),
                })?;
        let issuing = self.require_receipt(latest_id)?;
        if issuing.outcome_status != OutcomeStatus::IssuingCredentials {
            return Err(ServiceError::CorruptState {
                detail: format!(
                    "issuing {} tip has outcome {}",
                    row.idem_key,
                    issuing.outcome_status.as_str()
                ),
            });
        }
        let decision = self.pinned_decision(&issuing, request)?;

        self.finalize_issuance(row, &issuing, actor, request, now, &decision)
    }

    /// Calls the broker and commits the final receipt.
    ///
    /// The broker call happens outside any transaction. On failure the row
    /// stays `Issuing` and the error surfaces to this caller only.
    fn finalize_issuance(
        &self,
        row: &IdempotencyRow,
        issuing: &ReceiptRow,
        actor: &ActorContext,
        request: &AuthorizeRequest,
        now: DateTime<Utc>,
        decision: &PolicyDecision,
    ) -> Result<AuthorizeResponse, ServiceError> {
        let role_arn = decision.aws_role_arn.clone().unwrap_or_default();
        let ttl_seconds = decision.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS);
        let region = request
            .aws
            .as_ref()
            .map(|aws| aws.region.clone())
            .unwrap_or_default();

        let credentials = self
            .broker
            .assume_role(&AssumeRoleInput {
                role_arn: role_arn.clone(),
                region: region.clone(),
                ttl_seconds,
                subject: actor.subject.clone(),
            })
            .map_err(|err| {
                warn!(
                    idem_key = %row.idem_key,
                    error = %err,
                    "Broker call failed; key stays retryable"
                );
                err
            })?;
        let expires_at = rfc3339(credentials.expires_at);

        let final_receipt = make_receipt(
            MakeReceiptInput {
                created_at: rfc3339(now),
                idem_key: row.idem_key.clone(),
                supersedes_receipt_id: Some(issuing.receipt_id.clone()),
                context_id: issuing.context_id.clone(),
                decision_id: issuing.decision_id.clone(),
                actor: workload_actor(actor),
                request: receipt_request(request),
                policy: ReceiptPolicy {
                    policy_hash: issuing.policy_hash.clone(),
                    ..ReceiptPolicy::default()
                },
                credential_grant: Some(ReceiptCredentialGrant {
                    provider: "aws_sts".to_string(),
                    method: "AssumeRoleWithWebIdentity".to_string(),
                    role_arn,
                    region,
                    ttl_seconds,
                    scope_digest: String::new(),
                }),
                outcome: ReceiptOutcome {
                    status: OutcomeStatus::IssuedCredentials,
                    issued_at: String::new(),
                    expires_at: expires_at.clone(),
                    error: None,
                },
                ..MakeReceiptInput::default()
            },
            self.signer.as_ref(),
        )?;
        let final_row = ReceiptRow::from(final_receipt);

        let mut finalized = row.clone();
        finalized.status = IdemStatus::Allowed;
        finalized.latest_receipt_id = Some(final_row.receipt_id.clone());
        finalized.final_receipt_id = Some(final_row.receipt_id.clone());
        finalized.updated_at = rfc3339(now);

        let commit = self.store.with_tx(&mut |tx| {
            tx.put_receipt(&final_row)?;
            tx.put_idempotency_key(&finalized)
        });
        if let Err(LedgerError::Conflict { .. }) = commit {
            // A concurrent retry finalized the same issuance first. Its
            // receipt is the one of record; the credentials minted here are
            // equally valid.
            let committed = self
                .store
                .get_idempotency_key(&row.idem_key)?
                .and_then(|r| r.final_receipt_id)
                .ok_or_else(|| ServiceError::CorruptState {
                    detail: format!("finalize conflict on {} without final receipt", row.idem_key),
                })?;
            let receipt = self.require_receipt(&committed)?;
            return Ok(AuthorizeResponse {
                verdict: Verdict::Allow,
                context_id: receipt.context_id,
                decision_id: receipt.decision_id,
                receipt_id: receipt.receipt_id,
                approval: None,
                aws_credentials: Some(AwsCredentials {
                    access_key_id: credentials.access_key_id,
                    secret_access_key: credentials.secret_access_key,
                    session_token: credentials.session_token,
                    expires_at,
                }),
                error: None,
            });
        }
        commit?;

        info!(
            idem_key = %finalized.idem_key,
            receipt_id = %final_row.receipt_id,
            "Issued credentials"
        );

        Ok(AuthorizeResponse {
            verdict: Verdict::Allow,
            context_id: final_row.context_id,
            decision_id: final_row.decision_id,
            receipt_id: final_row.receipt_id,
            approval: None,
            aws_credentials: Some(AwsCredentials {
                access_key_id: credentials.access_key_id,
                secret_access_key: credentials.secret_access_key,
                session_token: credentials.session_token,
                expires_at,
            }),
            error: None,
        })
    }

    /// Consumes an external approval decision.
    ///
    /// Terminal approvals are idempotent: the latest receipt id is returned
    /// unchanged. Otherwise a superseding receipt is appended and the
    /// idempotency row advances, all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ApprovalNotFound`] for unknown ids and
    /// [`ServiceError::InvalidApprovalStatus`] for a `pending` decision.
    pub fn approve(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        approver: Option<Approver>,
        now: DateTime<Utc>,
    ) -> Result<String, ServiceError> {
        let Some(new_state) = apply_approval(status) else {
            return Err(ServiceError::InvalidApprovalStatus {
                status: status.as_str().to_string(),
            });
        };
        let created_at = rfc3339(now);

        let mut receipt_id: Option<String> = None;
        let mut failure: Option<ServiceError> = None;

        let result = self.store.with_tx(&mut |tx| {
            let Some(mut approval) = tx.get_approval(approval_id)? else {
                failure = Some(ServiceError::ApprovalNotFound {
                    approval_id: approval_id.to_string(),
                });
                return Err(LedgerError::Aborted {
                    reason: "approval not found".to_string(),
                });
            };

            let Some(mut idem) = tx.get_idempotency_key(&approval.idem_key)? else {
                failure = Some(ServiceError::CorruptState {
                    detail: format!("approval {approval_id} without idempotency row"),
                });
                return Err(LedgerError::Aborted {
                    reason: "idempotency row missing".to_string(),
                });
            };

            if approval.status.is_terminal() {
                receipt_id = idem.latest_receipt_id.clone();
                return Ok(());
            }

            let Some(latest_id) = idem.latest_receipt_id.clone() else {
                failure = Some(ServiceError::CorruptState {
                    detail: format!("approval {approval_id} without latest receipt"),
                });
                return Err(LedgerError::Aborted {
                    reason: "latest receipt missing".to_string(),
                });
            };
            let Some(latest) = tx.get_receipt(&latest_id)? else {
                failure = Some(ServiceError::CorruptState {
                    detail: format!("latest receipt {latest_id} missing"),
                });
                return Err(LedgerError::Aborted {
                    reason: "latest receipt missing".to_string(),
                });
            };

            let outcome_status = match status {
                ApprovalStatus::Approved => OutcomeStatus::ApprovalApproved,
                _ => OutcomeStatus::ApprovalDenied,
            };

            let receipt = match make_receipt(
                MakeReceiptInput {
                    created_at: created_at.clone(),
                    idem_key: idem.idem_key.clone(),
                    supersedes_receipt_id: Some(latest_id),
                    context_id: latest.context_id.clone(),
                    decision_id: latest.decision_id.clone(),
                    actor: ReceiptActor {
                        kind: ACTOR_KIND_APPROVAL.to_string(),
                        subject: "slack".to_string(),
                        ..ReceiptActor::default()
                    },
                    request: ReceiptRequest {
                        request_id: "approval".to_string(),
                        action: "approve".to_string(),
                        resource: idem.idem_key.clone(),
                        ..ReceiptRequest::default()
                    },
                    policy: ReceiptPolicy {
                        policy_hash: latest.policy_hash.clone(),
                        ..ReceiptPolicy::default()
                    },
                    approval: Some(ReceiptApproval {
                        required: true,
                        approval_id: approval_id.to_string(),
                        status: status.as_str().to_string(),
                        approved_at: created_at.clone(),
                        approver: approver.clone(),
                    }),
                    outcome: ReceiptOutcome::status_only(outcome_status),
                    ..MakeReceiptInput::default()
                },
                self.signer.as_ref(),
            ) {
                Ok(receipt) => receipt,
                Err(err) => {
                    failure = Some(err.into());
                    return Err(LedgerError::Aborted {
                        reason: "receipt build failed".to_string(),
                    });
                },
            };
            let receipt_row = ReceiptRow::from(receipt);

            approval.status = status;
            approval.approved_at = Some(created_at.clone());
            approval.approved_by = approver.as_ref().map(|a| a.id.clone());
            approval.updated_at = created_at.clone();

            idem.status = new_state;
            idem.latest_receipt_id = Some(receipt_row.receipt_id.clone());
            idem.final_receipt_id = (new_state == IdemStatus::Denied)
                .then(|| receipt_row.receipt_id.clone());
            idem.updated_at = created_at.clone();

            tx.put_receipt(&receipt_row)?;
            tx.put_approval(&approval)?;
            tx.put_idempotency_key(&idem)?;
            receipt_id = Some(receipt_row.receipt_id.clone());
            Ok(())
        });

        match result {
            Ok(()) => {
                let receipt_id = receipt_id.ok_or_else(|| ServiceError::CorruptState {
                    detail: format!("approval {approval_id} resolved without a receipt"),
                })?;
                info!(
                    approval_id,
                    status = status.as_str(),
                    receipt_id = %receipt_id,
                    "Approval recorded"
                );
                Ok(receipt_id)
            },
            Err(err) => Err(failure.unwrap_or_else(|| err.into())),
        }
    }

    /// Loads a receipt that an invariant says must exist.
    fn require_receipt(&self, receipt_id: &str) -> Result<ReceiptRow, ServiceError> {
        self.store
            .get_receipt(receipt_id)?
            .ok_or_else(|| ServiceError::CorruptState {
                detail: format!("receipt {receipt_id} missing"),
            })
    }

    /// Re-evaluates the policy version pinned by `receipt.policy_hash`,
    /// loaded from the ledger so a policy edit cannot change an in-flight
    /// issuance.
    fn pinned_decision(
        &self,
        receipt: &ReceiptRow,
        request: &AuthorizeRequest,
    ) -> Result<PolicyDecision, ServiceError> {
        let version = self
            .store
            .get_policy_version(&receipt.policy_hash)?
            .ok_or_else(|| ServiceError::CorruptState {
                detail: format!("policy version {} missing", receipt.policy_hash),
            })?;
        let loaded = LoadedPolicy::from_yaml(&version.source)?;
        Ok(evaluate(
            &loaded.doc,
            &EvalInput {
                action: &request.action,
                resource: &request.resource,
                env: &request.env,
            },
        ))
    }
}

/// RFC 3339 with seconds precision, UTC `Z` suffix.
fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Allocates `approval-<16 random bytes hex>`.
fn new_approval_id() -> String {
    let mut buf = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    format!("approval-{}", hex::encode(buf))
}

fn workload_actor(actor: &ActorContext) -> ReceiptActor {
    ReceiptActor {
        kind: ACTOR_KIND_WORKLOAD.to_string(),
        subject: actor.subject.clone(),
        issuer: actor.issuer.clone(),
        repo: actor.repo.clone(),
        workflow: actor.workflow.clone(),
        run_id: actor.run_id.clone(),
        sha: actor.sha.clone(),
    }
}

fn receipt_request(request: &AuthorizeRequest) -> ReceiptRequest {
    ReceiptRequest {
        request_id: request.request_id.clone(),
        action: request.action.clone(),
        resource: request.resource.clone(),
        env: request.env.clone(),
        intent: request.intent.clone(),
    }
}

/// Builds the `refs` record from the request's pass-through references.
fn request_refs(request: &AuthorizeRequest) -> Option<ReceiptRefs> {
    if request.context_ref.is_none() && request.decision_ref.is_none() {
        return None;
    }
    Some(ReceiptRefs {
        context: request.context_ref.clone(),
        decision: request.decision_ref.clone(),
    })
}
