use std::sync::Arc;

use crate::schema::{Policy, Rule};

/// One rule in evaluation order, with the provenance a decision reports.
#[derive(Debug, Clone)]
pub struct IndexedRule {
    pub policy_id: Arc<str>,
    pub policy_type: Arc<str>,
    pub priority: i64,
    pub version: u64,
    /// Position of the rule within its policy.
    pub rule_index: usize,
    pub rule: Arc<Rule>,
}

/// The flattened, priority-ordered view of every enabled rule.
///
/// Immutable once built; the store publishes a fresh index per generation
/// and readers hold an `Arc` snapshot for the duration of one evaluation.
#[derive(Debug, Default)]
pub struct RuleIndex {
    generation: u64,
    rules: Vec<IndexedRule>,
}

impl RuleIndex {
    /// Build an index from `policies`, skipping disabled ones.
    ///
    /// Order: priority descending, then version ascending (the least
    /// recently mutated policy wins ties), then policy id, then rule
    /// position.
    pub fn build<'a>(generation: u64, policies: impl IntoIterator<Item = &'a Policy>) -> Self {
        let mut rules: Vec<IndexedRule> = Vec::new();
        for policy in policies.into_iter().filter(|p| p.enabled) {
            let policy_id: Arc<str> = Arc::from(policy.id.as_str());
            let policy_type: Arc<str> = Arc::from(policy.kind.as_str());
            for (rule_index, rule) in policy.rules.iter().enumerate() {
                rules.push(IndexedRule {
                    policy_id: Arc::clone(&policy_id),
                    policy_type: Arc::clone(&policy_type),
                    priority: policy.priority,
                    version: policy.version,
                    rule_index,
                    rule: Arc::new(rule.clone()),
                });
            }
        }

        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.version.cmp(&b.version))
                .then_with(|| a.policy_id.cmp(&b.policy_id))
                .then(a.rule_index.cmp(&b.rule_index))
        });

        Self { generation, rules }
    }

    /// An index with no rules: every request is default-denied.
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            rules: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rules(&self) -> &[IndexedRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
