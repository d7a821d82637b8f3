//! Approval notification messages and the transport capability.
//!
//! The message is Slack Block Kit JSON: a header, a field grid for the
//! decision surface, optional diff/run links, and Approve/Deny buttons whose
//! values carry the approval id back through the interaction callback. The
//! transport itself is external; the outbox worker only needs
//! [`NotificationTransport`].

use serde_json::{Value, json};
use thiserror::Error;

/// Errors from the notification transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is misconfigured (missing token, channel, ...).
    #[error("transport misconfigured: {reason}")]
    Config {
        /// What is missing.
        reason: String,
    },

    /// The post failed.
    #[error("transport post failed: {message}")]
    Post {
        /// Transport-reported failure.
        message: String,
    },
}

/// Capability that posts an approval message and returns an opaque handle
/// (e.g. the chat message timestamp).
pub trait NotificationTransport: Send + Sync {
    /// Posts `message` to `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on configuration or delivery failure. The
    /// outbox worker records the error and retries; it never propagates.
    fn post_approval(&self, channel: &str, message: &[u8]) -> Result<String, TransportError>;
}

/// Everything the approval message displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalMessageInput {
    /// Approval id carried in the button values.
    pub approval_id: String,
    /// Receipt awaiting the decision.
    pub receipt_id: String,
    /// Policy hash the decision was made under.
    pub policy_hash: String,
    /// Context record id.
    pub context_id: String,
    /// Decision record id.
    pub decision_id: String,
    /// Requested action.
    pub action: String,
    /// Target resource.
    pub resource: String,
    /// Target environment.
    pub env: String,
    /// Risk tier from the decision.
    pub risk: String,
    /// Diff link, when evidence carries one.
    pub diff_url: String,
    /// CI run link, when known.
    pub run_url: String,
}

/// Builds the Block Kit JSON for an approval request.
///
/// # Errors
///
/// Returns a serialization error, which does not occur for the fixed block
/// structure produced here.
pub fn build_approval_message(input: &ApprovalMessageInput) -> Result<Vec<u8>, serde_json::Error> {
    let mut blocks = vec![
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": "*Relia approval required*",
            },
        }),
        json!({
            "type": "section",
            "fields": [
                {"type": "mrkdwn", "text": format!("*Action*\n{}", input.action)},
                {"type": "mrkdwn", "text": format!("*Env*\n{}", input.env)},
                {"type": "mrkdwn", "text": format!("*Resource*\n{}", input.resource)},
                {"type": "mrkdwn", "text": format!("*Risk*\n{}", input.risk)},
            ],
        }),
    ];

    if !input.diff_url.is_empty() || !input.run_url.is_empty() {
        let mut links = String::new();
        if !input.diff_url.is_empty() {
            links.push_str(&format!("<{}|Diff> ", input.diff_url));
        }
        if !input.run_url.is_empty() {
            links.push_str(&format!("<{}|Run>", input.run_url));
        }
        blocks.push(json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": links,
            },
        }));
    }

    blocks.push(json!({
        "type": "actions",
        "elements": [
            {
                "type": "button",
                "text": {"type": "plain_text", "text": "Approve"},
                "style": "primary",
                "action_id": "approve",
                "value": input.approval_id,
            },
            {
                "type": "button",
                "text": {"type": "plain_text", "text": "Deny"},
                "style": "danger",
                "action_id": "deny",
                "value": input.approval_id,
            },
        ],
    }));

    serde_json::to_vec(&json!({ "blocks": blocks }))
}
