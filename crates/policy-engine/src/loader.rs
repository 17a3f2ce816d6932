//! Durable policy sources and schema validation.
//!
//! A policy document is an object keyed by policy id. Sources hand the
//! store a [`RawDocument`] (one untyped JSON value per policy) so that a
//! single malformed policy becomes a field-level violation instead of
//! failing the whole parse with one opaque error.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{SourceError, Violation};
use crate::functions::FunctionRegistry;
use crate::schema::{Condition, Policy, PolicyDocument};

/// A policy document before per-policy parsing.
pub type RawDocument = BTreeMap<String, Value>;

/// Where the canonical policy document lives.
pub trait PolicySource: Send + Sync {
    /// Fetch the current document.
    fn load(&self) -> Result<RawDocument, SourceError>;

    /// Persist `document` as the new canonical form.
    fn save(&self, document: &PolicyDocument) -> Result<(), SourceError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// File source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

/// A policy document stored as a JSON (`.json`) or YAML (anything else)
/// file. Saves go through a temporary file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    format: Format,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        };
        Self { path, format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SourceError {
        SourceError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl PolicySource for FileSource {
    fn load(&self) -> Result<RawDocument, SourceError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        parse_raw(&contents, self.format)
    }

    fn save(&self, document: &PolicyDocument) -> Result<(), SourceError> {
        let body = match self.format {
            Format::Json => serde_json::to_string_pretty(document)
                .map_err(|e| SourceError::Parse(e.to_string()))?,
            Format::Yaml => {
                serde_yml::to_string(document).map_err(|e| SourceError::Parse(e.to_string()))?
            }
        };

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "policies".to_string());
        let tmp = self.path.with_file_name(format!(".{file_name}.tmp"));

        std::fs::write(&tmp, body).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Parse document text into one raw value per policy id.
fn parse_raw(contents: &str, format: Format) -> Result<RawDocument, SourceError> {
    if contents.trim().is_empty() {
        return Ok(RawDocument::new());
    }
    let parsed: Option<RawDocument> = match format {
        Format::Json => serde_json::from_str(contents).map_err(|e| SourceError::Parse(e.to_string()))?,
        Format::Yaml => serde_yml::from_str(contents).map_err(|e| SourceError::Parse(e.to_string()))?,
    };
    Ok(parsed.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// A source held in process memory. Can be switched offline to exercise
/// the unavailable-source path.
#[derive(Debug)]
pub struct MemorySource {
    document: Mutex<RawDocument>,
    available: AtomicBool,
}

impl MemorySource {
    pub fn new(document: RawDocument) -> Self {
        Self {
            document: Mutex::new(document),
            available: AtomicBool::new(true),
        }
    }

    /// Build a source from typed policies.
    pub fn from_policies(policies: impl IntoIterator<Item = Policy>) -> Self {
        let document = policies
            .into_iter()
            .map(|p| {
                let id = p.id.clone();
                (id, serde_json::to_value(p).unwrap_or(Value::Null))
            })
            .collect();
        Self::new(document)
    }

    /// Overwrite the stored document, as an operator editing the source would.
    pub fn replace(&self, document: RawDocument) {
        *self.document.lock() = document;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RawDocument {
        self.document.lock().clone()
    }
}

impl PolicySource for MemorySource {
    fn load(&self) -> Result<RawDocument, SourceError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("memory source is offline".into()));
        }
        Ok(self.document.lock().clone())
    }

    fn save(&self, document: &PolicyDocument) -> Result<(), SourceError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("memory source is offline".into()));
        }
        let raw = document
            .iter()
            .map(|(id, p)| {
                serde_json::to_value(p)
                    .map(|v| (id.clone(), v))
                    .map_err(|e| SourceError::Parse(e.to_string()))
            })
            .collect::<Result<RawDocument, _>>()?;
        *self.document.lock() = raw;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ---------------------------------------------------------------------------
// Parsing & validation
// ---------------------------------------------------------------------------

/// Parse every entry of `raw` into a [`Policy`], collecting one violation
/// per entry that fails. A missing `id` is filled from the document key; a
/// conflicting one is a violation.
pub fn parse_document(raw: RawDocument) -> (PolicyDocument, Vec<Violation>) {
    let mut document = PolicyDocument::new();
    let mut violations = Vec::new();

    for (key, mut value) in raw {
        let path = format!("policies.{key}");
        let Value::Object(map) = &mut value else {
            violations.push(Violation::new(path, "policy must be an object"));
            continue;
        };
        match map.get("id") {
            None => {
                map.insert("id".into(), Value::String(key.clone()));
            }
            Some(Value::String(id)) if *id == key => {}
            Some(other) => {
                violations.push(Violation::new(
                    format!("{path}.id"),
                    format!("id {other} does not match document key '{key}'"),
                ));
                continue;
            }
        }
        match serde_json::from_value::<Policy>(value) {
            Ok(policy) => {
                document.insert(key, policy);
            }
            Err(e) => violations.push(Violation::new(path, e.to_string())),
        }
    }

    (document, violations)
}

/// Check one policy's schema, returning every violation found.
pub fn validate_policy(policy: &Policy, functions: &FunctionRegistry) -> Vec<Violation> {
    let base = format!("policies.{}", policy.id);
    let mut violations = Vec::new();

    if policy.id.trim().is_empty() {
        violations.push(Violation::new(format!("{base}.id"), "must not be empty"));
    } else if policy.id.chars().any(char::is_whitespace) {
        violations.push(Violation::new(
            format!("{base}.id"),
            "must not contain whitespace",
        ));
    }
    if policy.name.trim().is_empty() {
        violations.push(Violation::new(format!("{base}.name"), "must not be empty"));
    }

    for (ri, rule) in policy.rules.iter().enumerate() {
        for (ci, condition) in rule.conditions.iter().enumerate() {
            let path = format!("{base}.rules[{ri}].match[{ci}]");
            validate_condition(condition, &path, functions, &mut violations);
        }
    }

    violations
}

fn validate_condition(
    condition: &Condition,
    path: &str,
    functions: &FunctionRegistry,
    violations: &mut Vec<Violation>,
) {
    match condition {
        Condition::Equals { field, .. } => require_field(field, path, violations),
        Condition::Compare { field, value, .. } => {
            require_field(field, path, violations);
            if !value.is_finite() {
                violations.push(Violation::new(format!("{path}.value"), "must be a finite number"));
            }
        }
        Condition::In { field, values } => {
            require_field(field, path, violations);
            if values.is_empty() {
                violations.push(Violation::new(format!("{path}.values"), "must not be empty"));
            }
        }
        Condition::TimeWindow {
            field,
            start_hour,
            end_hour,
            ..
        } => {
            require_field(field, path, violations);
            for (name, hour) in [("start_hour", start_hour), ("end_hour", end_hour)] {
                if *hour > 23 {
                    violations.push(Violation::new(
                        format!("{path}.{name}"),
                        format!("hour {hour} is outside 0..=23"),
                    ));
                }
            }
        }
        Condition::Function { name, params } => match functions.get(name) {
            None => violations.push(Violation::new(
                format!("{path}.name"),
                format!("unknown function '{name}'"),
            )),
            Some(function) => {
                if let Err(message) = function.check_params(params) {
                    violations.push(Violation::new(format!("{path}.params"), message));
                }
            }
        },
    }
}

fn require_field(field: &str, path: &str, violations: &mut Vec<Violation>) {
    if field.trim().is_empty() {
        violations.push(Violation::new(format!("{path}.field"), "must not be empty"));
    }
}

/// Validate a whole document, including id uniqueness across entries.
pub fn validate_document(document: &PolicyDocument, functions: &FunctionRegistry) -> Vec<Violation> {
    let mut seen = HashSet::new();
    let mut violations = Vec::new();
    for policy in document.values() {
        if !seen.insert(policy.id.as_str()) {
            violations.push(Violation::new(
                format!("policies.{}.id", policy.id),
                "duplicate id",
            ));
        }
        violations.extend(validate_policy(policy, functions));
    }
    violations
}
