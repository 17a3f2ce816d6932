use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use audit_log::{AuditKind, AuditLog};
use policy_engine::{
    DecisionCache, DecisionEngine, FileSource, FunctionRegistry, FunctionRunner, PolicySource,
    PolicyStore,
};

use crate::config::Config;
use crate::http::AppState;

/// The long-lived components of a running fedguard instance.
pub struct Services {
    pub audit: Arc<AuditLog>,
    pub engine: Arc<DecisionEngine>,
}

impl Services {
    /// Build services over the policy file named in `cfg`.
    pub fn from_config(cfg: &Config) -> Self {
        let source: Arc<dyn PolicySource> = Arc::new(FileSource::new(&cfg.policy.file));
        Self::with_source(cfg, source, FunctionRegistry::with_builtins())
    }

    /// Build services over an arbitrary source and function registry.
    ///
    /// A failed initial reload is logged and the engine starts with an
    /// empty policy set, which denies everything. Policy mutations are
    /// refused until a later `/reload` succeeds, so the source is never
    /// overwritten with the empty set.
    pub fn with_source(cfg: &Config, source: Arc<dyn PolicySource>, functions: FunctionRegistry) -> Self {
        let audit = Arc::new(AuditLog::new(cfg.audit.buffer_capacity, cfg.audit.retention));
        let functions = Arc::new(functions);

        let store = Arc::new(
            PolicyStore::new(Arc::clone(&source), Arc::clone(&functions))
                .with_audit(Arc::clone(&audit)),
        );
        match store.reload_from_source() {
            Ok(summary) => info!(
                source = %source.describe(),
                policies = summary.policies,
                rules = summary.rules,
                generation = summary.generation,
                "policy set loaded"
            ),
            Err(e) => warn!(
                source = %source.describe(),
                error = %e,
                "initial policy load failed; denying everything and refusing policy changes until a reload succeeds"
            ),
        }

        let runner = FunctionRunner::new(functions, cfg.policy.function_timeout())
            .with_max_in_flight(cfg.policy.function_workers);
        let mut engine = DecisionEngine::new(store, runner).with_audit(Arc::clone(&audit));
        if cfg.cache.enabled {
            engine = engine.with_cache(DecisionCache::new(
                Duration::from_secs(cfg.cache.ttl_secs),
                cfg.cache.capacity,
            ));
        }
        let engine = Arc::new(engine);

        audit.append(
            AuditKind::EngineStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "source": source.describe(),
                "generation": engine.store().generation(),
                "policies": engine.store().len(),
                "cache": cfg.cache.enabled,
            }),
        );

        Self { audit, engine }
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(Arc::clone(&self.engine), Arc::clone(&self.audit)))
    }
}
