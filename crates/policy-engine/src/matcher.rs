use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::Value;

use crate::context::Context;
use crate::error::EvaluationError;
use crate::schema::{CompareOp, Condition, Weekday};

/// Executes `function` conditions on behalf of the evaluator.
///
/// Kept as a seam so the evaluator stays a pure function of its inputs;
/// the engine supplies a time-boxed [`FunctionRunner`](crate::FunctionRunner).
pub trait FunctionInvoker {
    fn invoke(&self, name: &str, ctx: &Context, params: &Value) -> Result<bool, EvaluationError>;
}

/// Evaluate a rule's conditions as a left-to-right short-circuit AND.
///
/// An empty list matches. Missing or malformed context data makes the
/// condition false. A failing custom function aborts the conjunction with
/// the error, which callers treat as "rule does not match".
pub fn matches_all(
    conditions: &[Condition],
    ctx: &Context,
    functions: &dyn FunctionInvoker,
) -> Result<bool, EvaluationError> {
    for condition in conditions {
        if !matches_condition(condition, ctx, functions)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluate a single condition.
pub fn matches_condition(
    condition: &Condition,
    ctx: &Context,
    functions: &dyn FunctionInvoker,
) -> Result<bool, EvaluationError> {
    let matched = match condition {
        Condition::Equals { field, value } => matches_equals(ctx.lookup(field), value),
        Condition::Compare { field, op, value } => {
            matches_compare(ctx.lookup(field), *op, *value)
        }
        Condition::In { field, values } => matches_in(ctx.lookup(field), values),
        Condition::TimeWindow {
            field,
            start_hour,
            end_hour,
            days,
        } => match request_time(ctx.lookup(field)) {
            Some(at) => matches_time_window(at, *start_hour, *end_hour, days),
            None => {
                tracing::trace!(field, "time field malformed; condition is false");
                false
            }
        },
        Condition::Function { name, params } => functions.invoke(name, ctx, params)?,
    };
    Ok(matched)
}

/// Exact-type equality: `8080` does not equal `"8080"`.
pub fn matches_equals(actual: Option<&Value>, expected: &Value) -> bool {
    actual.is_some_and(|v| v == expected)
}

/// Numeric comparison with floating-point coercion of the field.
pub fn matches_compare(actual: Option<&Value>, op: CompareOp, expected: f64) -> bool {
    actual
        .and_then(coerce_f64)
        .is_some_and(|lhs| op.apply(lhs, expected))
}

/// Set membership. An array-valued field matches if any element is a member.
pub fn matches_in(actual: Option<&Value>, set: &[Value]) -> bool {
    match actual {
        Some(Value::Array(items)) => items.iter().any(|item| set.contains(item)),
        Some(v) => set.contains(v),
        None => false,
    }
}

/// UTC hour window `[start_hour, end_hour)`, wrapping past midnight when
/// `start_hour > end_hour`. Equal bounds cover the whole day. An empty
/// `days` list allows every weekday.
pub fn matches_time_window(at: DateTime<Utc>, start_hour: u32, end_hour: u32, days: &[Weekday]) -> bool {
    let hour = at.hour();
    let in_hours = match start_hour.cmp(&end_hour) {
        std::cmp::Ordering::Equal => true,
        std::cmp::Ordering::Less => hour >= start_hour && hour < end_hour,
        std::cmp::Ordering::Greater => hour >= start_hour || hour < end_hour,
    };
    in_hours && (days.is_empty() || days.contains(&Weekday::from(at.weekday())))
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Resolve the request time: absent field means "now", a present field
/// must be an RFC 3339 string or Unix seconds.
fn request_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value {
        None | Some(Value::Null) => Some(Utc::now()),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(Value::Number(n)) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            DateTime::from_timestamp(secs.trunc() as i64, 0)
        }
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoFunctions;

    impl FunctionInvoker for NoFunctions {
        fn invoke(&self, name: &str, _: &Context, _: &Value) -> Result<bool, EvaluationError> {
            Err(EvaluationError::Unregistered {
                function: name.to_string(),
            })
        }
    }

    struct Fixed(bool);

    impl FunctionInvoker for Fixed {
        fn invoke(&self, _: &str, _: &Context, _: &Value) -> Result<bool, EvaluationError> {
            Ok(self.0)
        }
    }

    fn eq(field: &str, value: Value) -> Condition {
        Condition::Equals {
            field: field.into(),
            value,
        }
    }

    // ---- equality ----

    #[test]
    fn equality_is_exact_type() {
        let ctx = Context::new().with("dst_port", 8080).with("protocol", "tcp");
        assert!(matches_equals(ctx.lookup("protocol"), &json!("tcp")));
        assert!(matches_equals(ctx.lookup("dst_port"), &json!(8080)));
        assert!(!matches_equals(ctx.lookup("dst_port"), &json!("8080")));
        assert!(!matches_equals(ctx.lookup("missing"), &json!(null)));
    }

    // ---- numeric ----

    #[test]
    fn compare_coerces_numbers_and_numeric_strings() {
        let ctx = Context::new()
            .with("round", 12)
            .with("accuracy", "0.91")
            .with("name", "abc");
        assert!(matches_compare(ctx.lookup("round"), CompareOp::Gte, 12.0));
        assert!(matches_compare(ctx.lookup("round"), CompareOp::Lt, 12.5));
        assert!(matches_compare(ctx.lookup("accuracy"), CompareOp::Gt, 0.9));
        assert!(!matches_compare(ctx.lookup("name"), CompareOp::Ne, 0.0));
        assert!(!matches_compare(ctx.lookup("missing"), CompareOp::Ne, 0.0));
    }

    #[test]
    fn compare_rejects_non_finite_strings() {
        let ctx = Context::new().with("x", "NaN").with("y", "inf");
        assert!(!matches_compare(ctx.lookup("x"), CompareOp::Ne, 1.0));
        assert!(!matches_compare(ctx.lookup("y"), CompareOp::Gt, 1.0));
    }

    // ---- membership ----

    #[test]
    fn membership_scalar_and_array() {
        let set = vec![json!("fl-client"), json!("fl-aggregator")];
        let ctx = Context::new()
            .with("src_type", "fl-client")
            .with("roles", json!(["observer", "fl-aggregator"]))
            .with("other", "attacker");
        assert!(matches_in(ctx.lookup("src_type"), &set));
        assert!(matches_in(ctx.lookup("roles"), &set));
        assert!(!matches_in(ctx.lookup("other"), &set));
        assert!(!matches_in(ctx.lookup("missing"), &set));
    }

    // ---- time window ----

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn time_window_simple_range() {
        assert!(matches_time_window(at("2024-03-05T09:30:00Z"), 9, 17, &[]));
        assert!(!matches_time_window(at("2024-03-05T17:00:00Z"), 9, 17, &[]));
        assert!(!matches_time_window(at("2024-03-05T08:59:59Z"), 9, 17, &[]));
    }

    #[test]
    fn time_window_wraps_midnight() {
        assert!(matches_time_window(at("2024-03-05T23:00:00Z"), 22, 6, &[]));
        assert!(matches_time_window(at("2024-03-06T05:59:00Z"), 22, 6, &[]));
        assert!(!matches_time_window(at("2024-03-06T06:00:00Z"), 22, 6, &[]));
    }

    #[test]
    fn time_window_equal_bounds_is_all_day_and_days_filter() {
        // 2024-03-09 is a Saturday.
        let saturday = at("2024-03-09T12:00:00Z");
        assert!(matches_time_window(saturday, 0, 0, &[]));
        assert!(matches_time_window(saturday, 0, 0, &[Weekday::Sat, Weekday::Sun]));
        assert!(!matches_time_window(saturday, 0, 0, &[Weekday::Mon]));
    }

    #[test]
    fn time_window_reads_context_field() {
        let cond = Condition::TimeWindow {
            field: "timestamp".into(),
            start_hour: 9,
            end_hour: 17,
            days: vec![],
        };
        let rfc = Context::new().with("timestamp", "2024-03-05T10:00:00Z");
        assert!(matches_condition(&cond, &rfc, &NoFunctions).unwrap());

        // 1709632800 = 2024-03-05T10:00:00Z
        let unix = Context::new().with("timestamp", 1_709_632_800i64);
        assert!(matches_condition(&cond, &unix, &NoFunctions).unwrap());

        let late = Context::new().with("timestamp", "2024-03-05T20:00:00Z");
        assert!(!matches_condition(&cond, &late, &NoFunctions).unwrap());
    }

    #[test]
    fn malformed_time_is_false_not_now() {
        let cond = Condition::TimeWindow {
            field: "timestamp".into(),
            start_hour: 0,
            end_hour: 0,
            days: vec![],
        };
        let ctx = Context::new().with("timestamp", "yesterday-ish");
        assert!(!matches_condition(&cond, &ctx, &NoFunctions).unwrap());
        let ctx = Context::new().with("timestamp", json!({"h": 1}));
        assert!(!matches_condition(&cond, &ctx, &NoFunctions).unwrap());
    }

    #[test]
    fn absent_time_uses_clock() {
        // All-day window: holds for whatever "now" is.
        let cond = Condition::TimeWindow {
            field: "timestamp".into(),
            start_hour: 5,
            end_hour: 5,
            days: vec![],
        };
        assert!(matches_condition(&cond, &Context::new(), &NoFunctions).unwrap());
    }

    // ---- conjunction ----

    #[test]
    fn empty_conjunction_matches() {
        assert!(matches_all(&[], &Context::new(), &NoFunctions).unwrap());
    }

    #[test]
    fn conjunction_short_circuits_before_function() {
        let conditions = vec![
            eq("protocol", json!("udp")),
            Condition::Function {
                name: "boom".into(),
                params: Value::Null,
            },
        ];
        let ctx = Context::new().with("protocol", "tcp");
        // The first condition fails, so the failing function is never reached.
        assert_eq!(matches_all(&conditions, &ctx, &NoFunctions), Ok(false));
    }

    #[test]
    fn function_error_propagates() {
        let conditions = vec![Condition::Function {
            name: "boom".into(),
            params: Value::Null,
        }];
        let err = matches_all(&conditions, &Context::new(), &NoFunctions).unwrap_err();
        assert_eq!(err.function(), "boom");
    }

    #[test]
    fn function_result_feeds_conjunction() {
        let conditions = vec![
            eq("protocol", json!("tcp")),
            Condition::Function {
                name: "any".into(),
                params: Value::Null,
            },
        ];
        let ctx = Context::new().with("protocol", "tcp");
        assert_eq!(matches_all(&conditions, &ctx, &Fixed(true)), Ok(true));
        assert_eq!(matches_all(&conditions, &ctx, &Fixed(false)), Ok(false));
    }
}
