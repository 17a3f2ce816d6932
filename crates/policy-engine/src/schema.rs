use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named, prioritized bundle of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Globally unique identifier.
    pub id: String,
    pub name: String,
    /// Category tag (e.g. `network`, `admission`, `model_transfer`).
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// Higher numeric priority is evaluated first. Default 0.
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Assigned by the store on every mutation; client values are ignored.
    #[serde(default)]
    pub version: u64,
    /// Ordered list of rules; the first one whose conditions hold wins.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_enabled() -> bool {
    true
}

/// A single condition-to-action mapping within a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub action: RuleAction,
    #[serde(default)]
    pub description: String,
    /// Conditions that must all hold (AND logic). Empty matches every request.
    #[serde(rename = "match", default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
    /// Allow, with a note for the caller carried in the decision reason.
    Modify,
}

/// A typed predicate over a request [`Context`](crate::Context).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Field equals `value` with the same JSON type.
    Equals { field: String, value: Value },
    /// Numeric comparison; the field is coerced to `f64`.
    Compare {
        field: String,
        op: CompareOp,
        value: f64,
    },
    /// Field value is one of `values`.
    In { field: String, values: Vec<Value> },
    /// UTC hour window, optionally restricted to some weekdays.
    TimeWindow {
        /// Context field holding the request time. Falls back to the
        /// current clock when the field is absent.
        #[serde(default = "default_time_field")]
        field: String,
        start_hour: u32,
        end_hour: u32,
        #[serde(default)]
        days: Vec<Weekday>,
    },
    /// Named predicate from the [`FunctionRegistry`](crate::FunctionRegistry).
    Function {
        name: String,
        #[serde(default)]
        params: Value,
    },
}

fn default_time_field() -> String {
    "timestamp".to_string()
}

impl Condition {
    /// Short tag used in logs and violation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::Equals { .. } => "equals",
            Condition::Compare { .. } => "compare",
            Condition::In { .. } => "in",
            Condition::TimeWindow { .. } => "time_window",
            Condition::Function { .. } => "function",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Lte => lhs <= rhs,
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Mon,
            chrono::Weekday::Tue => Weekday::Tue,
            chrono::Weekday::Wed => Weekday::Wed,
            chrono::Weekday::Thu => Weekday::Thu,
            chrono::Weekday::Fri => Weekday::Fri,
            chrono::Weekday::Sat => Weekday::Sat,
            chrono::Weekday::Sun => Weekday::Sun,
        }
    }
}

/// Interchange form of the whole policy set: an object keyed by policy id.
pub type PolicyDocument = BTreeMap<String, Policy>;

/// Filter for [`PolicyStore::list`](crate::PolicyStore::list).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyFilter {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl PolicyFilter {
    pub fn matches(&self, policy: &Policy) -> bool {
        self.kind.as_deref().map_or(true, |k| policy.kind == k)
            && self.enabled.map_or(true, |e| policy.enabled == e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_minimal_policy() {
        let policy: Policy = serde_json::from_value(json!({
            "id": "p1",
            "name": "minimal"
        }))
        .unwrap();
        assert_eq!(policy.priority, 0);
        assert!(policy.enabled);
        assert!(policy.rules.is_empty());
        assert_eq!(policy.kind, "");
    }

    #[test]
    fn deserialize_full_policy_yaml() {
        let yaml = r#"
id: net-sec-1
name: "FL traffic"
type: network
priority: 100
rules:
  - action: allow
    description: "allow tcp from fl-client to fl-server:8080"
    match:
      - type: equals
        field: protocol
        value: tcp
      - type: compare
        field: dst_port
        op: eq
        value: 8080
      - type: in
        field: src_type
        values: [fl-client, fl-aggregator]
      - type: time_window
        start_hour: 22
        end_hour: 6
        days: [sat, sun]
      - type: function
        name: glob_match
        params: { field: dst_host, pattern: "*.fl.internal" }
"#;
        let policy: Policy = serde_yml::from_str(yaml).unwrap();
        assert_eq!(policy.kind, "network");
        assert_eq!(policy.priority, 100);
        let rule = &policy.rules[0];
        assert_eq!(rule.action, RuleAction::Allow);
        assert_eq!(rule.conditions.len(), 5);

        match &rule.conditions[1] {
            Condition::Compare { field, op, value } => {
                assert_eq!(field, "dst_port");
                assert_eq!(*op, CompareOp::Eq);
                assert_eq!(*value, 8080.0);
            }
            other => panic!("expected Compare condition, got {:?}", other),
        }
        match &rule.conditions[3] {
            Condition::TimeWindow {
                field,
                start_hour,
                end_hour,
                days,
            } => {
                assert_eq!(field, "timestamp");
                assert_eq!((*start_hour, *end_hour), (22, 6));
                assert_eq!(days, &[Weekday::Sat, Weekday::Sun]);
            }
            other => panic!("expected TimeWindow condition, got {:?}", other),
        }
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = serde_json::from_value::<Rule>(json!({"action": "maybe"})).unwrap_err();
        assert!(err.to_string().contains("unknown variant"), "{err}");
    }

    #[test]
    fn rule_serializes_conditions_under_match() {
        let rule = Rule {
            action: RuleAction::Deny,
            description: String::new(),
            conditions: vec![Condition::Equals {
                field: "a".into(),
                value: json!(1),
            }],
        };
        let v = serde_json::to_value(&rule).unwrap();
        assert_eq!(v["match"][0]["type"], "equals");
        assert_eq!(v["action"], "deny");
    }

    #[test]
    fn filter_by_type_and_enabled() {
        let policy: Policy = serde_json::from_value(json!({
            "id": "p", "name": "p", "type": "admission", "enabled": false
        }))
        .unwrap();
        assert!(PolicyFilter::default().matches(&policy));
        let by_type = PolicyFilter {
            kind: Some("admission".into()),
            enabled: None,
        };
        assert!(by_type.matches(&policy));
        let enabled_only = PolicyFilter {
            kind: None,
            enabled: Some(true),
        };
        assert!(!enabled_only.matches(&policy));
    }
}
