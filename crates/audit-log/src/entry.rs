use serde::{Deserialize, Serialize};

/// A single audit event recorded by the decision service.
///
/// Events are immutable once appended. `seq` is assigned by the
/// [`AuditLog`](crate::AuditLog) at append time and is strictly increasing,
/// which makes it usable as a pagination cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: AuditKind,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    /// Create a new `AuditEvent` with an auto-generated UUID v4 and the
    /// current UTC timestamp.
    pub fn new(seq: u64, kind: AuditKind, payload: serde_json::Value) -> Self {
        Self {
            seq,
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            kind,
            payload,
        }
    }
}

/// The category of audit event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    /// The decision engine finished starting up.
    EngineStart,
    /// The policy set changed (create, replace, delete, bulk reload).
    PolicyLoaded,
    /// A decision allowed the request.
    PolicyApplied,
    /// A decision denied the request.
    PolicyViolation,
    /// Free-form events, including custom-function failures.
    Custom,
    /// The audit buffer overflowed and entries were dropped.
    PerformanceWarning,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::EngineStart => "ENGINE_START",
            AuditKind::PolicyLoaded => "POLICY_LOADED",
            AuditKind::PolicyApplied => "POLICY_APPLIED",
            AuditKind::PolicyViolation => "POLICY_VIOLATION",
            AuditKind::Custom => "CUSTOM",
            AuditKind::PerformanceWarning => "PERFORMANCE_WARNING",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
