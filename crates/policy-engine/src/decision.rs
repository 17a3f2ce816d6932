use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::schema::RuleAction;

/// Reason reported when no rule matched.
pub const NO_MATCH_REASON: &str = "no matching policy";

/// Reason reported when evaluation itself failed.
pub const INTERNAL_ERROR_REASON: &str = "internal error";

/// The outcome of evaluating one context against the active rule index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// Owning policy of the rule that matched, if any.
    pub matched_policy_id: Option<String>,
    /// Position of the matching rule within its policy.
    pub matched_rule_index: Option<usize>,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
    /// Hex SHA-256 binding the decision to its context hash and index
    /// generation.
    pub signature: String,
}

impl Decision {
    /// The decision for a context no rule matched.
    pub fn default_deny(context_hash: &str, generation: u64) -> Self {
        Self::unmatched(NO_MATCH_REASON, context_hash, generation)
    }

    /// Fail-closed decision for an evaluation that could not complete.
    pub fn internal_error(context_hash: &str, generation: u64) -> Self {
        Self::unmatched(INTERNAL_ERROR_REASON, context_hash, generation)
    }

    fn unmatched(reason: &str, context_hash: &str, generation: u64) -> Self {
        let mut decision = Self {
            allowed: false,
            matched_policy_id: None,
            matched_rule_index: None,
            reason: reason.to_string(),
            evaluated_at: Utc::now(),
            signature: String::new(),
        };
        decision.sign(context_hash, generation);
        decision
    }

    /// The decision for a matching rule.
    pub fn matched(
        action: RuleAction,
        policy_id: &str,
        rule_index: usize,
        description: &str,
        context_hash: &str,
        generation: u64,
    ) -> Self {
        let reason = match action {
            RuleAction::Modify => format!("modify: {description}"),
            _ if !description.is_empty() => description.to_string(),
            _ => format!("matched rule {rule_index} of policy '{policy_id}'"),
        };
        let mut decision = Self {
            allowed: !matches!(action, RuleAction::Deny),
            matched_policy_id: Some(policy_id.to_string()),
            matched_rule_index: Some(rule_index),
            reason,
            evaluated_at: Utc::now(),
            signature: String::new(),
        };
        decision.sign(context_hash, generation);
        decision
    }

    /// Recompute `signature` over the decision's outcome fields.
    pub fn sign(&mut self, context_hash: &str, generation: u64) {
        self.signature = self.compute_signature(context_hash, generation);
    }

    /// Whether `signature` matches this decision for the given inputs.
    pub fn verify(&self, context_hash: &str, generation: u64) -> bool {
        self.signature == self.compute_signature(context_hash, generation)
    }

    fn compute_signature(&self, context_hash: &str, generation: u64) -> String {
        let rule_index = self
            .matched_rule_index
            .map(|i| i.to_string())
            .unwrap_or_default();
        let material = format!(
            "{context_hash}|{generation}|{}|{}|{rule_index}|{}",
            self.allowed,
            self.matched_policy_id.as_deref().unwrap_or(""),
            self.reason,
        );
        hex::encode(Sha256::digest(material.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deny_has_correct_fields() {
        let d = Decision::default_deny("abc", 3);
        assert!(!d.allowed);
        assert!(d.matched_policy_id.is_none());
        assert!(d.matched_rule_index.is_none());
        assert_eq!(d.reason, "no matching policy");
        assert_eq!(d.signature.len(), 64);
        assert!(d.verify("abc", 3));
    }

    #[test]
    fn reasons_follow_action_and_description() {
        let allow = Decision::matched(RuleAction::Allow, "net-sec-1", 0, "fl traffic", "h", 1);
        assert!(allow.allowed);
        assert_eq!(allow.reason, "fl traffic");

        let deny = Decision::matched(RuleAction::Deny, "net-sec-2", 2, "", "h", 1);
        assert!(!deny.allowed);
        assert_eq!(deny.reason, "matched rule 2 of policy 'net-sec-2'");

        let modify = Decision::matched(RuleAction::Modify, "qos", 0, "throttle", "h", 1);
        assert!(modify.allowed);
        assert_eq!(modify.reason, "modify: throttle");
    }

    #[test]
    fn signature_binds_generation_and_context() {
        let d = Decision::matched(RuleAction::Allow, "p", 0, "ok", "ctx-a", 7);
        assert!(d.verify("ctx-a", 7));
        assert!(!d.verify("ctx-a", 8));
        assert!(!d.verify("ctx-b", 7));
    }

    #[test]
    fn signature_ignores_timestamp() {
        let a = Decision::default_deny("h", 1);
        let mut b = a.clone();
        b.evaluated_at = a.evaluated_at + chrono::Duration::seconds(30);
        b.sign("h", 1);
        assert_eq!(a.signature, b.signature);
    }
}
