//! # policy-engine
//!
//! Core decision logic for fedguard. This crate stores versioned policy
//! definitions, flattens them into a priority-ordered rule index, and
//! answers allow/deny questions about federated-learning operations with
//! first-match, default-deny semantics.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use policy_engine::{
//!     Context, DecisionEngine, FileSource, FunctionRegistry, FunctionRunner, PolicyStore,
//! };
//!
//! let functions = Arc::new(FunctionRegistry::with_builtins());
//! let store = Arc::new(PolicyStore::new(
//!     Arc::new(FileSource::new("policies.yaml")),
//!     functions.clone(),
//! ));
//! store.reload_from_source().unwrap();
//!
//! let engine = DecisionEngine::new(store, FunctionRunner::new(functions, Duration::from_millis(50)));
//! let ctx = Context::new().with("protocol", "tcp").with("dst_port", 8080);
//! println!("{:?}", engine.check(None, &ctx));
//! ```

mod cache;
mod context;
mod decision;
mod error;
mod evaluator;
mod functions;
mod index;
pub mod loader;
pub mod matcher;
mod runner;
mod schema;
mod store;

// Re-export primary public API at crate root.
pub use cache::{CacheStats, DecisionCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
pub use context::Context;
pub use decision::{Decision, INTERNAL_ERROR_REASON, NO_MATCH_REASON};
pub use error::{
    EvaluationError, FunctionError, SourceError, StoreError, ValidationError, Violation,
};
pub use evaluator::DecisionEngine;
pub use functions::{FunctionRegistry, PolicyFunction};
pub use index::{IndexedRule, RuleIndex};
pub use loader::{FileSource, MemorySource, PolicySource, RawDocument};
pub use runner::{FunctionRunner, DEFAULT_FUNCTION_TIMEOUT, DEFAULT_MAX_IN_FLIGHT};
pub use schema::{
    CompareOp, Condition, Policy, PolicyDocument, PolicyFilter, Rule, RuleAction, Weekday,
};
pub use store::{PolicyStore, ReloadSummary};
