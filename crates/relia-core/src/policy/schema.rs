//! Policy document schema.

use serde::{Deserialize, Serialize};

use super::PolicyError;
use crate::state::Verdict;

/// A parsed policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDoc {
    /// Document id, carried into decisions and receipts.
    pub policy_id: String,
    /// Document version string.
    pub policy_version: String,
    /// Ordered rules; first match wins.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Verdict when no rule matches.
    #[serde(default = "default_verdict")]
    pub default_verdict: Verdict,
}

const fn default_verdict() -> Verdict {
    Verdict::Deny
}

impl PolicyDoc {
    /// Rejects rules that would grant credentials without naming a role.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidRule`] for an `allow` rule with no
    /// `aws_role_arn` or a non-positive `ttl_seconds`.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for rule in &self.rules {
            if rule.effect.verdict == Verdict::Allow && rule.effect.aws_role_arn.is_none() {
                return Err(PolicyError::InvalidRule {
                    rule_id: rule.id.clone(),
                    reason: "allow rule must name aws_role_arn".to_string(),
                });
            }
            if let Some(ttl) = rule.effect.ttl_seconds {
                if ttl <= 0 {
                    return Err(PolicyError::InvalidRule {
                        rule_id: rule.id.clone(),
                        reason: format!("ttl_seconds must be positive, got {ttl}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A single policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id, recorded as the decision's reason code.
    pub id: String,
    /// Match conditions; all present conditions must hold.
    #[serde(rename = "match")]
    pub match_spec: MatchSpec,
    /// What to do when the rule matches.
    pub effect: RuleEffect,
}

/// Match conditions of a rule. Absent fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchSpec {
    /// Exact action to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Exact resource to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Exact environment to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

impl MatchSpec {
    /// True when every present condition equals the corresponding input.
    #[must_use]
    pub fn matches(&self, action: &str, resource: &str, env: &str) -> bool {
        self.action.as_deref().map_or(true, |a| a == action)
            && self.resource.as_deref().map_or(true, |r| r == resource)
            && self.env.as_deref().map_or(true, |e| e == env)
    }
}

/// Effect of a matched rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEffect {
    /// Verdict this rule produces.
    pub verdict: Verdict,
    /// Role to mint credentials for, on allow / require_approval rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_role_arn: Option<String>,
    /// Credential lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    /// Risk tier reported in the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_spec_requires_all_present_conditions() {
        let spec = MatchSpec {
            action: Some("terraform.apply".to_string()),
            resource: None,
            env: Some("dev".to_string()),
        };
        assert!(spec.matches("terraform.apply", "anything", "dev"));
        assert!(!spec.matches("terraform.apply", "anything", "prod"));
        assert!(!spec.matches("terraform.plan", "anything", "dev"));
    }

    #[test]
    fn empty_match_spec_matches_everything() {
        assert!(MatchSpec::default().matches("a", "r", "e"));
    }

    #[test]
    fn allow_rule_without_role_rejected() {
        let doc = PolicyDoc {
            policy_id: "p".to_string(),
            policy_version: "1".to_string(),
            rules: vec![Rule {
                id: "bad-allow".to_string(),
                match_spec: MatchSpec::default(),
                effect: RuleEffect {
                    verdict: Verdict::Allow,
                    aws_role_arn: None,
                    ttl_seconds: None,
                    risk: None,
                },
            }],
            default_verdict: Verdict::Deny,
        };
        assert!(matches!(
            doc.validate(),
            Err(PolicyError::InvalidRule { .. })
        ));
    }

    #[test]
    fn default_verdict_defaults_to_deny() {
        let doc: PolicyDoc =
            serde_yaml::from_str("policy_id: p\npolicy_version: \"1\"\nrules: []\n").unwrap();
        assert_eq!(doc.default_verdict, Verdict::Deny);
    }
}
