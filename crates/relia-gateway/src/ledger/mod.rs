//! The transactional receipt ledger.
//!
//! The ledger owns every persistent record of the authorize pipeline:
//! contexts, decisions, policy versions, receipts, idempotency keys,
//! approvals, the notification outbox, and signing keys. All mutation goes
//! through [`Store::with_tx`]; a transaction either commits every row it
//! touched or none of them.
//!
//! # Concurrency
//!
//! Two concurrent first-time writers of the same idempotency key race on the
//! `UNIQUE(idem_key)` constraint: exactly one commits, the other observes
//! [`LedgerError::Conflict`], re-reads, and dispatches against the winner's
//! committed state. No in-process lock is part of the safety argument.
//!
//! # Bit-exactness
//!
//! Receipts store their canonical body bytes verbatim and verification reads
//! those bytes back unchanged, so signatures verify identically across
//! backend engines.

mod sqlite;

pub use sqlite::SqliteStore;

use relia_core::state::{ApprovalStatus, IdemStatus};
use relia_core::types::OutcomeStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A unique constraint rejected the write; the caller lost a race and
    /// should re-read.
    #[error("write conflict on {table}")]
    Conflict {
        /// Table whose constraint fired.
        table: &'static str,
    },

    /// A row the caller required does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// A stored value failed to decode (corrupt or out-of-band edit).
    #[error("corrupt {entity} row {id}: {detail}")]
    Corrupt {
        /// Entity kind.
        entity: &'static str,
        /// The offending row id.
        id: String,
        /// What failed to decode.
        detail: String,
    },

    /// The caller rolled the transaction back deliberately.
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Why the caller aborted.
        reason: String,
    },

    /// Underlying engine failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection lock was poisoned by a panicking thread.
    #[error("ledger connection lock poisoned")]
    Poisoned,
}

/// A stored context record row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRow {
    /// Content address.
    pub context_id: String,
    /// Canonical body bytes, verbatim.
    pub body_json: Vec<u8>,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// A stored decision record row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRow {
    /// Content address.
    pub decision_id: String,
    /// Context the decision was made for.
    pub context_id: String,
    /// Policy content hash the decision pins.
    pub policy_hash: String,
    /// Verdict string.
    pub verdict: String,
    /// Canonical body bytes, verbatim.
    pub body_json: Vec<u8>,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// A stored policy version, keyed by content hash. Written on first use,
/// never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVersionRow {
    /// Content hash of the source bytes.
    pub policy_hash: String,
    /// Document id.
    pub policy_id: String,
    /// Document version string.
    pub policy_version: String,
    /// Raw source bytes.
    pub source: Vec<u8>,
    /// RFC 3339 first-use time.
    pub created_at: String,
}

/// A stored receipt row: the signed canonical body plus index columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptRow {
    /// Receipt id (= body digest).
    pub receipt_id: String,
    /// Idempotency key the receipt belongs to.
    pub idem_key: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Previous tip of the chain, when superseding.
    pub supersedes_receipt_id: Option<String>,
    /// Context record id.
    pub context_id: String,
    /// Decision record id.
    pub decision_id: String,
    /// Policy content hash.
    pub policy_hash: String,
    /// Approval id, when an approval participates.
    pub approval_id: Option<String>,
    /// Outcome status.
    pub outcome_status: OutcomeStatus,
    /// Whether the outcome is terminal.
    pub is_final: bool,
    /// Credential expiry, on issued receipts.
    pub expires_at: Option<String>,
    /// Canonical body bytes, verbatim.
    pub body_json: Vec<u8>,
    /// Prefixed body digest.
    pub body_digest: String,
    /// Signing key id.
    pub key_id: String,
    /// Ed25519 signature over the raw digest bytes.
    pub sig: Vec<u8>,
}

impl From<relia_core::StoredReceipt> for ReceiptRow {
    fn from(receipt: relia_core::StoredReceipt) -> Self {
        Self {
            receipt_id: receipt.receipt_id,
            idem_key: receipt.idem_key,
            created_at: receipt.created_at,
            supersedes_receipt_id: receipt.supersedes_receipt_id,
            context_id: receipt.context_id,
            decision_id: receipt.decision_id,
            policy_hash: receipt.policy_hash,
            approval_id: receipt.approval_id,
            outcome_status: receipt.outcome_status,
            is_final: receipt.is_final,
            expires_at: receipt.expires_at,
            body_json: receipt.body_json,
            body_digest: receipt.body_digest,
            key_id: receipt.key_id,
            sig: receipt.sig,
        }
    }
}

/// A stored approval row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRow {
    /// Approval id.
    pub approval_id: String,
    /// Back-reference to the idempotency key.
    pub idem_key: String,
    /// Current status.
    pub status: ApprovalStatus,
    /// Channel the approval request was posted to, once delivered.
    pub channel: Option<String>,
    /// Opaque transport handle of the posted message, once delivered.
    pub message_ts: Option<String>,
    /// Identity of the approver, once decided.
    pub approved_by: Option<String>,
    /// RFC 3339 decision time, once decided.
    pub approved_at: Option<String>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 last-update time.
    pub updated_at: String,
}

/// A stored idempotency-key row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRow {
    /// The key.
    pub idem_key: String,
    /// Current lifecycle status.
    pub status: IdemStatus,
    /// Approval id, when the decision required one.
    pub approval_id: Option<String>,
    /// Tip of the committed receipt chain.
    pub latest_receipt_id: Option<String>,
    /// Final receipt id, set exactly when the status is terminal.
    pub final_receipt_id: Option<String>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 last-update time.
    pub updated_at: String,
}

/// Delivery status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Awaiting delivery.
    Pending,
    /// Delivered.
    Sent,
    /// Given up after the attempt bound.
    Failed,
}

impl OutboxStatus {
    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A stored outbox entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRow {
    /// Notification id.
    pub notification_id: String,
    /// Approval this notification is about.
    pub approval_id: String,
    /// Destination channel.
    pub channel: String,
    /// Serialized message bytes.
    pub message: Vec<u8>,
    /// Delivery attempts so far.
    pub attempt_count: i64,
    /// RFC 3339 time of the next permitted attempt.
    pub next_attempt_at: String,
    /// Delivery status.
    pub status: OutboxStatus,
    /// Last transport error, for operators.
    pub last_error: Option<String>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 last-update time.
    pub updated_at: String,
}

/// A stored signing key, written on first use so verifiers can resolve
/// public keys from the ledger alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeyRow {
    /// Key id, as recorded in receipts.
    pub key_id: String,
    /// Raw Ed25519 public key bytes.
    pub public_key: Vec<u8>,
    /// RFC 3339 first-use time.
    pub created_at: String,
}

/// Operations available inside a transaction.
///
/// The same read operations are available outside a transaction on
/// [`Store`]; writes are transactional only, except for the convenience
/// single-row `put_*` on `Store` which wrap themselves in a transaction.
pub trait Tx {
    /// Inserts a context record; a second write of the same id is a no-op.
    fn put_context(&mut self, row: &ContextRow) -> Result<(), LedgerError>;

    /// Inserts a decision record; a second write of the same id is a no-op.
    fn put_decision(&mut self, row: &DecisionRow) -> Result<(), LedgerError>;

    /// Inserts a policy version; idempotent on the content hash.
    fn put_policy_version(&mut self, row: &PolicyVersionRow) -> Result<(), LedgerError>;

    /// Inserts a receipt; a duplicate receipt id is a [`LedgerError::Conflict`].
    fn put_receipt(&mut self, row: &ReceiptRow) -> Result<(), LedgerError>;

    /// Upserts an approval row.
    fn put_approval(&mut self, row: &ApprovalRow) -> Result<(), LedgerError>;

    /// Strictly inserts a fresh idempotency row; a duplicate key is a
    /// [`LedgerError::Conflict`] (the race signal).
    fn create_idempotency_key(&mut self, row: &IdempotencyRow) -> Result<(), LedgerError>;

    /// Upserts an idempotency row (state transitions on existing keys).
    fn put_idempotency_key(&mut self, row: &IdempotencyRow) -> Result<(), LedgerError>;

    /// Upserts an outbox entry.
    fn put_outbox(&mut self, row: &OutboxRow) -> Result<(), LedgerError>;

    /// Inserts a signing key; idempotent on the key id.
    fn put_signing_key(&mut self, row: &SigningKeyRow) -> Result<(), LedgerError>;

    /// Reads an approval row.
    fn get_approval(&mut self, approval_id: &str) -> Result<Option<ApprovalRow>, LedgerError>;

    /// Reads an idempotency row.
    fn get_idempotency_key(
        &mut self,
        idem_key: &str,
    ) -> Result<Option<IdempotencyRow>, LedgerError>;

    /// Reads a receipt row.
    fn get_receipt(&mut self, receipt_id: &str) -> Result<Option<ReceiptRow>, LedgerError>;

    /// Reads an outbox entry.
    fn get_outbox(&mut self, notification_id: &str) -> Result<Option<OutboxRow>, LedgerError>;
}

/// The ledger capability held by the coordinator and the outbox worker.
pub trait Store: Send + Sync {
    /// Runs `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// Callers that need values out of the transaction capture them in
    /// locals. [`LedgerError::Aborted`] is the caller-driven rollback signal.
    ///
    /// # Errors
    ///
    /// Returns the closure's error after rolling back, or a ledger error
    /// from begin/commit.
    fn with_tx(
        &self,
        f: &mut dyn FnMut(&mut dyn Tx) -> Result<(), LedgerError>,
    ) -> Result<(), LedgerError>;

    /// Reads a context record.
    fn get_context(&self, context_id: &str) -> Result<Option<ContextRow>, LedgerError>;

    /// Reads a decision record.
    fn get_decision(&self, decision_id: &str) -> Result<Option<DecisionRow>, LedgerError>;

    /// Reads a policy version by content hash.
    fn get_policy_version(
        &self,
        policy_hash: &str,
    ) -> Result<Option<PolicyVersionRow>, LedgerError>;

    /// Reads a receipt row.
    fn get_receipt(&self, receipt_id: &str) -> Result<Option<ReceiptRow>, LedgerError>;

    /// Reads the receipt chain for an idempotency key, oldest first.
    fn get_receipts_by_idem(&self, idem_key: &str) -> Result<Vec<ReceiptRow>, LedgerError>;

    /// Reads an idempotency row.
    fn get_idempotency_key(&self, idem_key: &str) -> Result<Option<IdempotencyRow>, LedgerError>;

    /// Reads an approval row.
    fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRow>, LedgerError>;

    /// Reads an outbox entry.
    fn get_outbox(&self, notification_id: &str) -> Result<Option<OutboxRow>, LedgerError>;

    /// Reads pending outbox entries due at or before `now`, oldest first.
    fn due_outbox(&self, now: &str, limit: usize) -> Result<Vec<OutboxRow>, LedgerError>;

    /// Reads a signing key by id.
    fn get_signing_key(&self, key_id: &str) -> Result<Option<SigningKeyRow>, LedgerError>;

    /// Convenience single-row upsert of an outbox entry.
    fn put_outbox(&self, row: &OutboxRow) -> Result<(), LedgerError> {
        self.with_tx(&mut |tx| tx.put_outbox(row))
    }

    /// Convenience single-row upsert of an approval.
    fn put_approval(&self, row: &ApprovalRow) -> Result<(), LedgerError> {
        self.with_tx(&mut |tx| tx.put_approval(row))
    }
}

/// Verifies a stored receipt using only the ledger: resolves the public key
/// by the receipt's `key_id` from the signing-keys table, then checks the
/// body digest and signature.
///
/// # Errors
///
/// Returns [`LedgerError`] when the receipt or key is missing, and the
/// receipt error of the failed check otherwise.
pub fn verify_receipt_from_ledger(
    store: &dyn Store,
    receipt_id: &str,
) -> Result<Result<(), relia_core::receipt::ReceiptError>, LedgerError> {
    let receipt = store
        .get_receipt(receipt_id)?
        .ok_or_else(|| LedgerError::NotFound {
            entity: "receipt",
            id: receipt_id.to_string(),
        })?;
    let key = store
        .get_signing_key(&receipt.key_id)?
        .ok_or_else(|| LedgerError::NotFound {
            entity: "signing key",
            id: receipt.key_id.clone(),
        })?;

    let public_key: [u8; 32] =
        key.public_key
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::Corrupt {
                entity: "signing key",
                id: receipt.key_id.clone(),
                detail: format!("public key is {} bytes, expected 32", key.public_key.len()),
            })?;

    Ok(relia_core::verify_receipt(
        &receipt.body_json,
        &receipt.body_digest,
        &receipt.sig,
        &public_key,
    ))
}
