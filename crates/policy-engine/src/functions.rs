//! Named custom predicates invocable from `function` conditions.
//!
//! Functions are registered once at startup and looked up by name at
//! evaluation time. Store validation rejects unknown names, so the
//! evaluator never encounters one for a stored policy.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde_json::Value;

use crate::context::Context;
use crate::error::FunctionError;

/// A pure boolean predicate over a request context.
pub trait PolicyFunction: Send + Sync {
    fn call(&self, ctx: &Context, params: &Value) -> Result<bool, FunctionError>;

    /// Reject malformed parameters at policy-store time.
    fn check_params(&self, _params: &Value) -> Result<(), String> {
        Ok(())
    }
}

impl<F> PolicyFunction for F
where
    F: Fn(&Context, &Value) -> Result<bool, FunctionError> + Send + Sync,
{
    fn call(&self, ctx: &Context, params: &Value) -> Result<bool, FunctionError> {
        self(ctx, params)
    }
}

/// Mapping from function name to a registered [`PolicyFunction`].
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn PolicyFunction>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in predicates:
    /// `glob_match`, `regex_match`, `port_range` and `field_present`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("glob_match", GlobMatch::default());
        registry.register("regex_match", RegexMatch::default());
        registry.register("port_range", PortRange);
        registry.register("field_present", FieldPresent);
        registry
    }

    /// Register (or replace) a function under `name`.
    pub fn register(&mut self, name: impl Into<String>, function: impl PolicyFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, function: impl PolicyFunction + 'static) -> Self {
        self.register(name, function);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PolicyFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Built-in functions
// ---------------------------------------------------------------------------

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing string parameter '{key}'"))
}

fn param_f64(params: &Value, key: &str) -> Result<f64, String> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing numeric parameter '{key}'"))
}

/// Compiled patterns keyed by their source text.
///
/// Filled when a policy's params are checked at store time, so evaluation
/// only compiles on a miss (for example a registry shared with a store that
/// was populated elsewhere).
struct PatternMemo<T> {
    compiled: DashMap<String, T>,
}

impl<T> Default for PatternMemo<T> {
    fn default() -> Self {
        Self {
            compiled: DashMap::new(),
        }
    }
}

impl<T: Clone> PatternMemo<T> {
    fn get_or_compile(
        &self,
        pattern: &str,
        compile: impl FnOnce(&str) -> Result<T, String>,
    ) -> Result<T, String> {
        if let Some(hit) = self.compiled.get(pattern) {
            return Ok(hit.value().clone());
        }
        let compiled = compile(pattern)?;
        self.compiled.insert(pattern.to_string(), compiled.clone());
        Ok(compiled)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.compiled.len()
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher, String> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| format!("invalid glob '{pattern}': {e}"))
}

fn compile_regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))
}

/// `{field, pattern}`: the string field matches a glob such as `*.fl.internal`.
#[derive(Default)]
struct GlobMatch {
    memo: PatternMemo<GlobMatcher>,
}

impl PolicyFunction for GlobMatch {
    fn call(&self, ctx: &Context, params: &Value) -> Result<bool, FunctionError> {
        let field = param_str(params, "field").map_err(FunctionError)?;
        let pattern = param_str(params, "pattern").map_err(FunctionError)?;
        let Some(value) = ctx.lookup(field).and_then(Value::as_str) else {
            return Ok(false);
        };
        let matcher = self
            .memo
            .get_or_compile(pattern, compile_glob)
            .map_err(FunctionError)?;
        Ok(matcher.is_match(value))
    }

    fn check_params(&self, params: &Value) -> Result<(), String> {
        param_str(params, "field")?;
        let pattern = param_str(params, "pattern")?;
        self.memo.get_or_compile(pattern, compile_glob).map(|_| ())
    }
}

/// `{field, pattern}`: the string field matches a (non-anchored) regex.
#[derive(Default)]
struct RegexMatch {
    memo: PatternMemo<Regex>,
}

impl PolicyFunction for RegexMatch {
    fn call(&self, ctx: &Context, params: &Value) -> Result<bool, FunctionError> {
        let field = param_str(params, "field").map_err(FunctionError)?;
        let pattern = param_str(params, "pattern").map_err(FunctionError)?;
        let Some(value) = ctx.lookup(field).and_then(Value::as_str) else {
            return Ok(false);
        };
        let re = self
            .memo
            .get_or_compile(pattern, compile_regex)
            .map_err(FunctionError)?;
        Ok(re.is_match(value))
    }

    fn check_params(&self, params: &Value) -> Result<(), String> {
        param_str(params, "field")?;
        let pattern = param_str(params, "pattern")?;
        self.memo.get_or_compile(pattern, compile_regex).map(|_| ())
    }
}

/// `{field, min, max}`: the numeric field lies in `[min, max]`.
struct PortRange;

impl PolicyFunction for PortRange {
    fn call(&self, ctx: &Context, params: &Value) -> Result<bool, FunctionError> {
        let field = param_str(params, "field").map_err(FunctionError)?;
        let min = param_f64(params, "min").map_err(FunctionError)?;
        let max = param_f64(params, "max").map_err(FunctionError)?;
        Ok(ctx
            .lookup(field)
            .and_then(Value::as_f64)
            .is_some_and(|port| port >= min && port <= max))
    }

    fn check_params(&self, params: &Value) -> Result<(), String> {
        param_str(params, "field")?;
        let min = param_f64(params, "min")?;
        let max = param_f64(params, "max")?;
        if min > max {
            return Err(format!("min ({min}) is greater than max ({max})"));
        }
        Ok(())
    }
}

/// `{field}`: the field exists and is not null.
struct FieldPresent;

impl PolicyFunction for FieldPresent {
    fn call(&self, ctx: &Context, params: &Value) -> Result<bool, FunctionError> {
        let field = param_str(params, "field").map_err(FunctionError)?;
        Ok(ctx.lookup(field).is_some_and(|v| !v.is_null()))
    }

    fn check_params(&self, params: &Value) -> Result<(), String> {
        param_str(params, "field").map(|_| ())
    }
}
