use std::time::Duration;

use serde::Serialize;

/// One schema problem found while validating a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Path to the offending field, e.g. `policies.net-sec-1.rules[0].match[1].field`.
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A rejected mutation, listing every violation rather than only the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// `Ok(())` when `violations` is empty, otherwise the error.
    pub fn check(violations: Vec<Violation>) -> Result<(), ValidationError> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations })
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} validation error(s)", self.violations.len())?;
        for (i, v) in self.violations.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{v}")?;
        }
        Ok(())
    }
}

/// Failure to reach or decode the durable policy source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("policy source unavailable: {0}")]
    Unavailable(String),

    #[error("policy source I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("policy document could not be parsed: {0}")]
    Parse(String),
}

/// Errors returned by [`PolicyStore`](crate::PolicyStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("policy '{0}' not found")]
    NotFound(String),

    #[error("policy store unavailable: {0}")]
    Unavailable(#[from] SourceError),
}

/// A custom predicate returned an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct FunctionError(pub String);

impl FunctionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A custom-function call that could not produce a verdict. The rule that
/// invoked it is treated as not matching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("function '{function}' failed: {source}")]
    Failed {
        function: String,
        #[source]
        source: FunctionError,
    },

    #[error("function '{function}' panicked")]
    Panicked { function: String },

    #[error("function '{function}' exceeded its {deadline:?} deadline")]
    TimedOut { function: String, deadline: Duration },

    #[error("function '{function}' is not registered")]
    Unregistered { function: String },

    #[error("function '{function}' not started: {limit} workers still running")]
    Saturated { function: String, limit: usize },
}

impl EvaluationError {
    pub fn function(&self) -> &str {
        match self {
            EvaluationError::Failed { function, .. }
            | EvaluationError::Panicked { function }
            | EvaluationError::TimedOut { function, .. }
            | EvaluationError::Unregistered { function }
            | EvaluationError::Saturated { function, .. } => function,
        }
    }
}
