use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use audit_log::{AuditKind, AuditLog};
use tracing::{debug, error, trace, warn};

use crate::cache::{CacheStats, DecisionCache};
use crate::context::Context;
use crate::decision::Decision;
use crate::index::{IndexedRule, RuleIndex};
use crate::matcher::matches_all;
use crate::runner::FunctionRunner;
use crate::store::PolicyStore;

// ---------------------------------------------------------------------------
// DecisionEngine
// ---------------------------------------------------------------------------

/// Answers "is this operation allowed?" against the store's current index.
///
/// Evaluation is first-match over the priority-ordered [`RuleIndex`] with
/// default-deny. Any number of callers may evaluate concurrently; each
/// holds one index snapshot for the whole evaluation.
pub struct DecisionEngine {
    store: Arc<PolicyStore>,
    runner: FunctionRunner,
    cache: Option<DecisionCache>,
    audit: Option<Arc<AuditLog>>,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("generation", &self.store.generation())
            .field("function_timeout", &self.runner.deadline())
            .field("function_workers", &self.runner.max_in_flight())
            .field("cache", &self.cache.is_some())
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl DecisionEngine {
    pub fn new(store: Arc<PolicyStore>, runner: FunctionRunner) -> Self {
        Self {
            store,
            runner,
            cache: None,
            audit: None,
        }
    }

    pub fn with_cache(mut self, cache: DecisionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record every decision served (and every custom-function failure).
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn runner(&self) -> &FunctionRunner {
        &self.runner
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(DecisionCache::stats)
    }

    /// Decide `ctx`, optionally considering only policies of `policy_type`.
    ///
    /// Always returns a decision: a fault inside evaluation is logged and
    /// answered with a default deny.
    pub fn check(&self, policy_type: Option<&str>, ctx: &Context) -> Decision {
        let index = self.store.index();
        let generation = index.generation();
        let context_hash = ctx.canonical_hash(policy_type);

        if let Some(cache) = &self.cache {
            if let Some(decision) = cache.get(&context_hash, generation) {
                trace!(%context_hash, generation, "decision served from cache");
                self.audit_decision(&decision, &context_hash, policy_type, generation, true);
                return decision;
            }
        }

        let evaluated = catch_unwind(AssertUnwindSafe(|| {
            self.evaluate(&index, policy_type, ctx, &context_hash)
        }));
        let decision = match evaluated {
            Ok(decision) => {
                if let Some(cache) = &self.cache {
                    cache.insert(&context_hash, generation, decision.clone());
                }
                decision
            }
            Err(_) => {
                error!(%context_hash, generation, "policy evaluation panicked; denying");
                Decision::internal_error(&context_hash, generation)
            }
        };

        self.audit_decision(&decision, &context_hash, policy_type, generation, false);
        decision
    }

    /// First-match evaluation of `ctx` against a fixed index snapshot.
    fn evaluate(
        &self,
        index: &RuleIndex,
        policy_type: Option<&str>,
        ctx: &Context,
        context_hash: &str,
    ) -> Decision {
        let generation = index.generation();
        let candidates = index
            .rules()
            .iter()
            .filter(|r| policy_type.map_or(true, |t| &*r.policy_type == t));

        for entry in candidates {
            if self.rule_matches(entry, ctx, context_hash) {
                debug!(
                    policy_id = %entry.policy_id,
                    rule_index = entry.rule_index,
                    action = ?entry.rule.action,
                    "rule matched"
                );
                return Decision::matched(
                    entry.rule.action,
                    &entry.policy_id,
                    entry.rule_index,
                    &entry.rule.description,
                    context_hash,
                    generation,
                );
            }
        }

        debug!(generation, "no rule matched; default deny");
        Decision::default_deny(context_hash, generation)
    }

    /// Whether one rule's conditions hold. A failing custom function makes
    /// the rule a non-match.
    fn rule_matches(&self, entry: &IndexedRule, ctx: &Context, context_hash: &str) -> bool {
        match matches_all(&entry.rule.conditions, ctx, &self.runner) {
            Ok(matched) => matched,
            Err(err) => {
                warn!(
                    policy_id = %entry.policy_id,
                    rule_index = entry.rule_index,
                    function = err.function(),
                    error = %err,
                    "custom function failed; rule treated as non-matching"
                );
                if let Some(audit) = &self.audit {
                    audit.append(
                        AuditKind::Custom,
                        serde_json::json!({
                            "event": "function_error",
                            "function": err.function(),
                            "error": err.to_string(),
                            "policy_id": &*entry.policy_id,
                            "rule_index": entry.rule_index,
                            "context_hash": context_hash,
                        }),
                    );
                }
                false
            }
        }
    }

    fn audit_decision(
        &self,
        decision: &Decision,
        context_hash: &str,
        policy_type: Option<&str>,
        generation: u64,
        cached: bool,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let kind = if decision.allowed {
            AuditKind::PolicyApplied
        } else {
            AuditKind::PolicyViolation
        };
        audit.append(
            kind,
            serde_json::json!({
                "context_hash": context_hash,
                "policy_type": policy_type,
                "generation": generation,
                "allowed": decision.allowed,
                "matched_policy_id": decision.matched_policy_id,
                "matched_rule_index": decision.matched_rule_index,
                "reason": decision.reason,
                "signature": decision.signature,
                "cached": cached,
            }),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FunctionError;
    use crate::functions::FunctionRegistry;
    use crate::loader::{MemorySource, RawDocument};
    use serde_json::{json, Value};
    use std::time::Duration;

    const NET_SEC_1: &str = r#"
net-sec-1:
  name: "FL training traffic"
  type: network
  priority: 100
  rules:
    - action: allow
      description: "allow tcp from fl-client to fl-server:8080"
      match:
        - { type: equals, field: protocol, value: tcp }
        - { type: equals, field: src_type, value: fl-client }
        - { type: equals, field: dst_type, value: fl-server }
        - { type: equals, field: dst_port, value: 8080 }
"#;

    fn registry() -> Arc<FunctionRegistry> {
        Arc::new(
            FunctionRegistry::with_builtins()
                .with("hangs", |_: &Context, _: &Value| -> Result<bool, FunctionError> {
                    std::thread::sleep(Duration::from_secs(5));
                    Ok(true)
                })
                .with("explodes", |_: &Context, _: &Value| -> Result<bool, FunctionError> {
                    panic!("predicate bug")
                }),
        )
    }

    fn engine_from_yaml(yaml: &str) -> (DecisionEngine, Arc<MemorySource>) {
        let raw: RawDocument = serde_yml::from_str(yaml).unwrap();
        let source = Arc::new(MemorySource::new(raw));
        let functions = registry();
        let store = Arc::new(PolicyStore::new(source.clone(), functions.clone()));
        store.reload_from_source().unwrap();
        let runner = FunctionRunner::new(functions, Duration::from_millis(30));
        (DecisionEngine::new(store, runner), source)
    }

    fn fl_context(port: i64) -> Context {
        Context::new()
            .with("protocol", "tcp")
            .with("src_type", "fl-client")
            .with("dst_type", "fl-server")
            .with("dst_port", port)
    }

    /// Decision minus its timestamp.
    fn outcome(d: &Decision) -> (bool, Option<String>, Option<usize>, String, String) {
        (
            d.allowed,
            d.matched_policy_id.clone(),
            d.matched_rule_index,
            d.reason.clone(),
            d.signature.clone(),
        )
    }

    #[test]
    fn fl_traffic_is_allowed() {
        let (engine, _) = engine_from_yaml(NET_SEC_1);
        let d = engine.check(None, &fl_context(8080));
        assert!(d.allowed);
        assert_eq!(d.matched_policy_id.as_deref(), Some("net-sec-1"));
        assert_eq!(d.matched_rule_index, Some(0));
        assert_eq!(d.reason, "allow tcp from fl-client to fl-server:8080");
    }

    #[test]
    fn unmatched_port_is_default_denied() {
        let (engine, _) = engine_from_yaml(NET_SEC_1);
        let d = engine.check(None, &fl_context(9999));
        assert!(!d.allowed);
        assert_eq!(d.reason, "no matching policy");
        assert!(d.matched_policy_id.is_none());
    }

    #[test]
    fn empty_store_denies_everything() {
        let (engine, _) = engine_from_yaml("{}");
        assert!(!engine.check(None, &fl_context(8080)).allowed);
        assert!(!engine.check(None, &Context::new()).allowed);
    }

    #[test]
    fn higher_priority_wins_overlap() {
        let (engine, _) = engine_from_yaml(
            r#"
broad-deny:
  name: "deny all tcp"
  priority: 200
  rules:
    - action: deny
      match: [{ type: equals, field: protocol, value: tcp }]
narrow-allow:
  name: "allow fl"
  priority: 100
  rules:
    - action: allow
      match: [{ type: equals, field: dst_port, value: 8080 }]
"#,
        );
        let d = engine.check(None, &fl_context(8080));
        assert!(!d.allowed);
        assert_eq!(d.matched_policy_id.as_deref(), Some("broad-deny"));
        assert_eq!(d.reason, "matched rule 0 of policy 'broad-deny'");
    }

    #[test]
    fn repeated_checks_are_identical_sans_timestamp() {
        let (engine, _) = engine_from_yaml(NET_SEC_1);
        let first = engine.check(None, &fl_context(8080));
        for _ in 0..5 {
            assert_eq!(outcome(&engine.check(None, &fl_context(8080))), outcome(&first));
        }
    }

    #[test]
    fn cache_does_not_change_outcome() {
        let (plain, _) = engine_from_yaml(NET_SEC_1);
        let (cached, _) = engine_from_yaml(NET_SEC_1);
        let cached = cached.with_cache(DecisionCache::default());

        for port in [8080, 9999, 8080, 9999] {
            let ctx = fl_context(port);
            assert_eq!(
                outcome(&plain.check(None, &ctx)),
                outcome(&cached.check(None, &ctx))
            );
        }
        let stats = cached.cache_stats().unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn cache_is_invalidated_by_mutation() {
        let (engine, _) = engine_from_yaml(NET_SEC_1);
        let engine = engine.with_cache(DecisionCache::default());
        assert!(engine.check(None, &fl_context(8080)).allowed);

        engine.store().delete("net-sec-1").unwrap();
        assert!(!engine.check(None, &fl_context(8080)).allowed);
    }

    #[test]
    fn policy_type_filter_limits_candidates() {
        let (engine, _) = engine_from_yaml(
            r#"
admit:
  name: "admission"
  type: admission
  priority: 500
  rules:
    - action: deny
      match: []
net-sec-1:
  name: "network"
  type: network
  priority: 1
  rules:
    - action: allow
      match: [{ type: equals, field: protocol, value: tcp }]
"#,
        );
        let ctx = fl_context(8080);
        assert!(!engine.check(None, &ctx).allowed);
        assert!(engine.check(Some("network"), &ctx).allowed);
        assert!(!engine.check(Some("aggregation"), &ctx).allowed);
    }

    #[test]
    fn hung_function_degrades_only_its_rule() {
        let (engine, _) = engine_from_yaml(
            r#"
slow:
  name: "slow check"
  priority: 100
  rules:
    - action: allow
      match: [{ type: function, name: hangs }]
fallback:
  name: "fallback"
  priority: 10
  rules:
    - action: deny
      description: "tcp denied"
      match: [{ type: equals, field: protocol, value: tcp }]
"#,
        );
        let d = engine.check(None, &fl_context(8080));
        assert!(!d.allowed);
        assert_eq!(d.matched_policy_id.as_deref(), Some("fallback"));
    }

    #[test]
    fn panicking_function_never_allows() {
        let audit = Arc::new(AuditLog::default());
        let (engine, _) = engine_from_yaml(
            r#"
buggy:
  name: "buggy"
  rules:
    - action: allow
      match: [{ type: function, name: explodes }]
"#,
        );
        let engine = engine.with_audit(Arc::clone(&audit));
        let d = engine.check(None, &Context::new());
        assert!(!d.allowed);
        assert_eq!(d.reason, "no matching policy");

        let events = audit.flush();
        let kinds: Vec<AuditKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::Custom, AuditKind::PolicyViolation]);
        assert_eq!(events[0].payload["function"], "explodes");
    }

    #[test]
    fn builtin_functions_participate() {
        let (engine, _) = engine_from_yaml(
            r#"
hosts:
  name: "trusted hosts"
  rules:
    - action: allow
      match:
        - { type: function, name: glob_match, params: { field: host, pattern: "*.fl.internal" } }
        - { type: function, name: port_range, params: { field: dst_port, min: 8000, max: 8999 } }
"#,
        );
        let ok = Context::new().with("host", "agg-1.fl.internal").with("dst_port", 8443);
        let bad = Context::new().with("host", "evil.example.com").with("dst_port", 8443);
        assert!(engine.check(None, &ok).allowed);
        assert!(!engine.check(None, &bad).allowed);
    }

    #[test]
    fn decisions_are_audited_with_hash_not_context() {
        let audit = Arc::new(AuditLog::default());
        let (engine, _) = engine_from_yaml(NET_SEC_1);
        let engine = engine
            .with_audit(Arc::clone(&audit))
            .with_cache(DecisionCache::default());

        let ctx = fl_context(8080);
        engine.check(None, &ctx);
        engine.check(None, &ctx);
        engine.check(None, &fl_context(1));

        let events = audit.flush();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, AuditKind::PolicyApplied);
        assert_eq!(events[0].payload["cached"], false);
        assert_eq!(events[1].payload["cached"], true);
        assert_eq!(events[2].kind, AuditKind::PolicyViolation);
        assert_eq!(events[0].payload["context_hash"], ctx.canonical_hash(None));
        assert!(events[0].payload.get("context").is_none());
    }

    #[test]
    fn rejected_reload_keeps_decisions_stable() {
        let (engine, source) = engine_from_yaml(NET_SEC_1);
        let before = engine.check(None, &fl_context(8080));

        let mut next = source.snapshot();
        next.insert(
            "broken".into(),
            json!({"name": "x", "rules": [{"action": "allow", "match": [
                {"type": "function", "name": "unknown_fn"}
            ]}]}),
        );
        source.replace(next);
        assert!(engine.store().reload_from_source().is_err());

        let after = engine.check(None, &fl_context(8080));
        assert_eq!(outcome(&before), outcome(&after));
    }

    #[test]
    fn signature_binds_generation() {
        let (engine, _) = engine_from_yaml(NET_SEC_1);
        let ctx = fl_context(8080);
        let d = engine.check(None, &ctx);
        let generation = engine.store().generation();
        assert!(d.verify(&ctx.canonical_hash(None), generation));
        assert!(!d.verify(&ctx.canonical_hash(None), generation + 1));
    }
}
