//! The per-idempotency-key lifecycle state machine.
//!
//! Every logical authorize call owns one idempotency row whose status moves
//! monotonically forward through these states. The coordinator consults
//! [`transition_from_decision`] on first sight of a key and [`next_action`]
//! on replays; approvals move the state through [`apply_approval`].
//!
//! # Invariants
//!
//! - State only advances; `Allowed` and `Denied` are terminal.
//! - `Issuing` is retryable: a failed broker call leaves the row in
//!   `Issuing` and the next authorize call retries finalization.
//! - All matches are exhaustive so a new state or verdict cannot be added
//!   without revisiting every transition.

use serde::{Deserialize, Serialize};

/// Status of an idempotency key. A fresh key has no row at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdemStatus {
    /// Waiting on a human approval.
    PendingApproval,
    /// Approved; credential issuance not yet started.
    ApprovedReady,
    /// Credential issuance in flight (retryable).
    Issuing,
    /// Credentials issued; terminal.
    Allowed,
    /// Denied by policy or approver; terminal.
    Denied,
    /// A previous attempt failed unrecoverably.
    Errored,
}

impl IdemStatus {
    /// Canonical string form used in ledger rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::ApprovedReady => "approved_ready",
            Self::Issuing => "issuing",
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Errored => "errored",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_approval" => Some(Self::PendingApproval),
            "approved_ready" => Some(Self::ApprovedReady),
            "issuing" => Some(Self::Issuing),
            "allowed" => Some(Self::Allowed),
            "denied" => Some(Self::Denied),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }

    /// True for states from which no transition occurs.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Allowed | Self::Denied)
    }

    /// Position in the forward order, used to assert monotonicity.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::PendingApproval => 0,
            Self::ApprovedReady => 1,
            Self::Issuing => 2,
            Self::Allowed | Self::Denied | Self::Errored => 3,
        }
    }
}

/// Policy verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Issue credentials.
    Allow,
    /// Refuse.
    Deny,
    /// Issue only after human approval.
    RequireApproval,
}

impl Verdict {
    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        }
    }
}

/// What the coordinator should do next for a given state and verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Start credential issuance.
    IssueCredentials,
    /// Return the pending-approval response.
    ReturnPending,
    /// Return the denial response.
    ReturnDenied,
    /// Return the stored terminal response.
    ReturnStored,
    /// Retry a previously started issuance.
    RetryFinalize,
    /// Return a denial carrying the stored error marker.
    ReturnError,
}

/// Status of an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved by a human.
    Approved,
    /// Denied by a human.
    Denied,
}

impl ApprovalStatus {
    /// Canonical string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }

    /// True once a decision has been made.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Denied)
    }
}

/// Initial state and action for a fresh idempotency key, given the verdict.
#[must_use]
pub const fn transition_from_decision(verdict: Verdict) -> (IdemStatus, NextAction) {
    match verdict {
        Verdict::Allow => (IdemStatus::Issuing, NextAction::IssueCredentials),
        Verdict::RequireApproval => (IdemStatus::PendingApproval, NextAction::ReturnPending),
        Verdict::Deny => (IdemStatus::Denied, NextAction::ReturnDenied),
    }
}

/// Next action for an existing idempotency key.
///
/// The verdict is the re-evaluated policy verdict; for most states it cannot
/// change the outcome, because the state already encodes a committed
/// decision.
#[must_use]
pub const fn next_action(status: IdemStatus, verdict: Verdict) -> NextAction {
    match status {
        IdemStatus::PendingApproval => NextAction::ReturnPending,
        IdemStatus::ApprovedReady => match verdict {
            Verdict::Allow | Verdict::RequireApproval => NextAction::IssueCredentials,
            Verdict::Deny => NextAction::ReturnDenied,
        },
        IdemStatus::Issuing => NextAction::RetryFinalize,
        IdemStatus::Allowed | IdemStatus::Denied => NextAction::ReturnStored,
        IdemStatus::Errored => NextAction::ReturnError,
    }
}

/// State after an approval decision arrives.
///
/// Returns `None` for [`ApprovalStatus::Pending`], which is not a decision.
#[must_use]
pub const fn apply_approval(decision: ApprovalStatus) -> Option<IdemStatus> {
    match decision {
        ApprovalStatus::Approved => Some(IdemStatus::ApprovedReady),
        ApprovalStatus::Denied => Some(IdemStatus::Denied),
        ApprovalStatus::Pending => None,
    }
}
