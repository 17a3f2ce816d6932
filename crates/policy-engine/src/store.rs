use std::sync::Arc;

use arc_swap::ArcSwap;
use audit_log::{AuditKind, AuditLog};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{SourceError, StoreError, ValidationError, Violation};
use crate::functions::FunctionRegistry;
use crate::index::RuleIndex;
use crate::loader::{parse_document, validate_document, validate_policy, PolicySource};
use crate::schema::{Policy, PolicyDocument, PolicyFilter};

/// Everything a reader needs, published atomically per generation.
#[derive(Debug)]
struct Snapshot {
    generation: u64,
    policies: PolicyDocument,
    index: Arc<RuleIndex>,
}

/// State touched only by writers.
struct WriterState {
    next_version: u64,
    /// Set once a reload has succeeded. Until then the active set does not
    /// reflect the source, and saving it would overwrite the source.
    loaded: bool,
}

impl WriterState {
    fn ensure_loaded(&self) -> Result<(), StoreError> {
        if self.loaded {
            Ok(())
        } else {
            Err(SourceError::Unavailable(
                "policy set not loaded from source; reload before mutating".into(),
            )
            .into())
        }
    }
}

/// Outcome of a successful bulk reload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReloadSummary {
    pub generation: u64,
    pub policies: usize,
    pub rules: usize,
}

/// Durable, versioned holder of policy definitions.
///
/// Readers ([`get`](Self::get), [`list`](Self::list), [`index`](Self::index))
/// load the current snapshot lock-free. Mutations are serialized by a
/// writer mutex, validated in full, persisted to the [`PolicySource`], and
/// only then published together with a freshly built [`RuleIndex`].
pub struct PolicyStore {
    source: Arc<dyn PolicySource>,
    functions: Arc<FunctionRegistry>,
    audit: Option<Arc<AuditLog>>,
    writer: Mutex<WriterState>,
    snapshot: ArcSwap<Snapshot>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot.load();
        f.debug_struct("PolicyStore")
            .field("source", &self.source.describe())
            .field("generation", &snap.generation)
            .field("policies", &snap.policies.len())
            .field("rules", &snap.index.len())
            .finish()
    }
}

impl PolicyStore {
    /// Create an empty store over `source`. Call
    /// [`reload_from_source`](Self::reload_from_source) to populate it;
    /// mutations fail with [`StoreError::Unavailable`] until a reload has
    /// succeeded.
    pub fn new(source: Arc<dyn PolicySource>, functions: Arc<FunctionRegistry>) -> Self {
        Self {
            source,
            functions,
            audit: None,
            writer: Mutex::new(WriterState {
                next_version: 1,
                loaded: false,
            }),
            snapshot: ArcSwap::from_pointee(Snapshot {
                generation: 0,
                policies: PolicyDocument::new(),
                index: Arc::new(RuleIndex::empty(0)),
            }),
        }
    }

    /// Record policy mutations as `POLICY_LOADED` audit events.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    // -- Readers --------------------------------------------------------------

    /// Current index generation; bumped by every successful mutation.
    pub fn generation(&self) -> u64 {
        self.snapshot.load().generation
    }

    /// Snapshot of the current rule index.
    pub fn index(&self) -> Arc<RuleIndex> {
        Arc::clone(&self.snapshot.load().index)
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.snapshot.load().policies.get(id).cloned()
    }

    /// Policies matching `filter`, ordered by id.
    pub fn list(&self, filter: &PolicyFilter) -> Vec<Policy> {
        self.snapshot
            .load()
            .policies
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Writers --------------------------------------------------------------

    /// Insert a new policy. An existing id is a `duplicate id` violation.
    pub fn create(&self, policy: Policy) -> Result<Policy, StoreError> {
        let mut writer = self.writer.lock();
        writer.ensure_loaded()?;
        let current = self.snapshot.load_full();

        let mut violations = Vec::new();
        if current.policies.contains_key(&policy.id) {
            violations.push(Violation::new(
                format!("policies.{}.id", policy.id),
                "duplicate id",
            ));
        }
        violations.extend(validate_policy(&policy, &self.functions));
        ValidationError::check(violations)?;

        self.upsert(&mut writer, &current, policy, "create")
    }

    /// Create or replace the policy stored under `policy.id`.
    pub fn put(&self, policy: Policy) -> Result<Policy, StoreError> {
        let mut writer = self.writer.lock();
        writer.ensure_loaded()?;
        let current = self.snapshot.load_full();

        ValidationError::check(validate_policy(&policy, &self.functions))?;

        self.upsert(&mut writer, &current, policy, "put")
    }

    /// Remove a policy, returning it.
    pub fn delete(&self, id: &str) -> Result<Policy, StoreError> {
        let writer = self.writer.lock();
        writer.ensure_loaded()?;
        let current = self.snapshot.load_full();

        let mut policies = current.policies.clone();
        let removed = policies
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        self.source.save(&policies)?;
        self.publish(&current, policies, "delete", Some(id));
        Ok(removed)
    }

    /// Replace the whole policy set from the durable source.
    ///
    /// All-or-nothing: an unreachable source or any invalid policy leaves
    /// the active set and index untouched. Every violation across every
    /// policy is reported.
    ///
    /// Versions survive a reload: a policy identical to the active one keeps
    /// its version, and a policy seen for the first time keeps the version
    /// it was saved with. Only edited or unversioned policies get fresh
    /// versions, so equal-priority ties resolve the same way afterwards.
    pub fn reload_from_source(&self) -> Result<ReloadSummary, StoreError> {
        let mut writer = self.writer.lock();
        let current = self.snapshot.load_full();

        let raw = match self.source.load() {
            Ok(raw) => raw,
            Err(SourceError::Parse(message)) => {
                warn!(source = %self.source.describe(), %message, "policy document unparseable");
                return Err(ValidationError {
                    violations: vec![Violation::new("document", message)],
                }
                .into());
            }
            Err(err) => {
                warn!(source = %self.source.describe(), error = %err, "policy source unavailable; keeping current set");
                return Err(err.into());
            }
        };

        let (mut policies, mut violations) = parse_document(raw);
        violations.extend(validate_document(&policies, &self.functions));
        if let Err(err) = ValidationError::check(violations) {
            warn!(
                source = %self.source.describe(),
                violations = err.violations.len(),
                "policy reload rejected; keeping current set"
            );
            return Err(err.into());
        }

        assign_reload_versions(&mut writer, &current.policies, &mut policies);
        writer.loaded = true;

        let count = policies.len();
        let snapshot = self.publish(&current, policies, "reload", None);
        Ok(ReloadSummary {
            generation: snapshot.generation,
            policies: count,
            rules: snapshot.index.len(),
        })
    }

    fn upsert(
        &self,
        writer: &mut WriterState,
        current: &Snapshot,
        mut policy: Policy,
        op: &str,
    ) -> Result<Policy, StoreError> {
        policy.version = writer.next_version;

        let mut policies = current.policies.clone();
        policies.insert(policy.id.clone(), policy.clone());

        self.source.save(&policies)?;
        // Only consume the version once the mutation is durable.
        writer.next_version += 1;

        let id = policy.id.clone();
        self.publish(current, policies, op, Some(&id));
        Ok(policy)
    }

    /// Build the next generation's index and swap it in.
    fn publish(
        &self,
        current: &Snapshot,
        policies: PolicyDocument,
        op: &str,
        policy_id: Option<&str>,
    ) -> Arc<Snapshot> {
        let generation = current.generation + 1;
        let index = Arc::new(RuleIndex::build(generation, policies.values()));
        let snapshot = Arc::new(Snapshot {
            generation,
            policies,
            index,
        });
        self.snapshot.store(Arc::clone(&snapshot));

        info!(
            op,
            policy_id,
            generation,
            policies = snapshot.policies.len(),
            rules = snapshot.index.len(),
            "policy set updated"
        );

        if let Some(audit) = &self.audit {
            audit.append(
                AuditKind::PolicyLoaded,
                serde_json::json!({
                    "op": op,
                    "policy_id": policy_id,
                    "generation": generation,
                    "policies": snapshot.policies.len(),
                    "rules": snapshot.index.len(),
                }),
            );
        }
        snapshot
    }
}

/// Carry versions over from `current` or the source, then number whatever
/// is left in id order above every version already in use.
fn assign_reload_versions(
    writer: &mut WriterState,
    current: &PolicyDocument,
    policies: &mut PolicyDocument,
) {
    let mut fresh = Vec::new();
    for (id, policy) in policies.iter_mut() {
        let kept = match current.get(id) {
            Some(active) if same_definition(active, policy) => Some(active.version),
            Some(_) => None,
            None => (policy.version > 0).then_some(policy.version),
        };
        match kept {
            Some(version) => {
                policy.version = version;
                writer.next_version = writer.next_version.max(version + 1);
            }
            None => fresh.push(id.clone()),
        }
    }
    for id in fresh {
        if let Some(policy) = policies.get_mut(&id) {
            policy.version = writer.next_version;
            writer.next_version += 1;
        }
    }
}

fn same_definition(a: &Policy, b: &Policy) -> bool {
    Policy {
        version: 0,
        ..a.clone()
    } == Policy {
        version: 0,
        ..b.clone()
    }
}
