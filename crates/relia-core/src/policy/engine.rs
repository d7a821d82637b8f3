//! Default-deny policy evaluation.

use serde::{Deserialize, Serialize};

use super::schema::PolicyDoc;
use crate::state::Verdict;

/// Rule id reported on default-deny decisions.
pub const DEFAULT_DENY_RULE_ID: &str = "DEFAULT_DENY";

/// Reason code reported on default-deny decisions.
pub const DEFAULT_DENY_REASON: &str = "NO_MATCHING_RULE";

/// Risk tier reported when a matched rule does not declare one.
const DEFAULT_MATCHED_RISK: &str = "low";

/// Risk tier reported on default-deny decisions.
const DEFAULT_DENY_RISK: &str = "high";

/// Inputs to one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalInput<'a> {
    /// Requested action.
    pub action: &'a str,
    /// Target resource.
    pub resource: &'a str,
    /// Target environment.
    pub env: &'a str,
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// The verdict.
    pub verdict: Verdict,
    /// Role to mint credentials for, when the matched rule names one.
    pub aws_role_arn: Option<String>,
    /// Credential lifetime, when the matched rule names one.
    pub ttl_seconds: Option<i64>,
    /// Risk tier string.
    pub risk: String,
    /// Reason codes; the matched rule id, or [`DEFAULT_DENY_REASON`].
    pub reason_codes: Vec<String>,
    /// Whether a human approval is required.
    pub require_approval: bool,
    /// Id of the rule that decided, or [`DEFAULT_DENY_RULE_ID`].
    pub rule_id: String,
}

/// Evaluates a request against a policy document.
///
/// Pure and deterministic: the same document and input always produce the
/// same decision. Rules are checked in document order; the first match
/// decides. An unmatched request gets the document's default verdict with
/// [`DEFAULT_DENY_RULE_ID`] as the rule id.
#[must_use]
pub fn evaluate(policy: &PolicyDoc, input: &EvalInput<'_>) -> PolicyDecision {
    for rule in &policy.rules {
        if !rule
            .match_spec
            .matches(input.action, input.resource, input.env)
        {
            continue;
        }

        let verdict = rule.effect.verdict;
        return PolicyDecision {
            verdict,
            aws_role_arn: rule.effect.aws_role_arn.clone(),
            ttl_seconds: rule.effect.ttl_seconds,
            risk: rule
                .effect
                .risk
                .clone()
                .unwrap_or_else(|| DEFAULT_MATCHED_RISK.to_string()),
            reason_codes: vec![rule.id.clone()],
            require_approval: verdict == Verdict::RequireApproval,
            rule_id: rule.id.clone(),
        };
    }

    PolicyDecision {
        verdict: policy.default_verdict,
        aws_role_arn: None,
        ttl_seconds: None,
        risk: DEFAULT_DENY_RISK.to_string(),
        reason_codes: vec![DEFAULT_DENY_REASON.to_string()],
        require_approval: policy.default_verdict == Verdict::RequireApproval,
        rule_id: DEFAULT_DENY_RULE_ID.to_string(),
    }
}
