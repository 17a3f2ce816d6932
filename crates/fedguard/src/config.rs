use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_policy_file")]
    pub file: PathBuf,
    #[serde(default = "default_function_timeout")]
    pub function_timeout_ms: u64,
    /// Cap on custom-function worker threads alive at once.
    #[serde(default = "default_function_workers")]
    pub function_workers: usize,
}

impl PolicyConfig {
    pub fn function_timeout(&self) -> Duration {
        Duration::from_millis(self.function_timeout_ms)
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            file: default_policy_file(),
            function_timeout_ms: default_function_timeout(),
            function_workers: default_function_workers(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl_secs: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_retention")]
    pub retention: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    /// Optional JSONL file mirroring every flushed event.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            retention: default_retention(),
            flush_interval_ms: default_flush_interval(),
            log_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "127.0.0.1:8181".to_string()
}

fn default_policy_file() -> PathBuf {
    PathBuf::from("policies.yaml")
}

fn default_function_timeout() -> u64 {
    policy_engine::DEFAULT_FUNCTION_TIMEOUT.as_millis() as u64
}

fn default_function_workers() -> usize {
    policy_engine::DEFAULT_MAX_IN_FLIGHT
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    policy_engine::DEFAULT_CACHE_TTL.as_secs()
}

fn default_cache_capacity() -> usize {
    policy_engine::DEFAULT_CACHE_CAPACITY
}

fn default_buffer_capacity() -> usize {
    audit_log::DEFAULT_BUFFER_CAPACITY
}

fn default_retention() -> usize {
    audit_log::DEFAULT_RETENTION
}

fn default_flush_interval() -> u64 {
    audit_log::DEFAULT_FLUSH_INTERVAL.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// Returns `Ok(None)` if the file does not exist, so fedguard can start on
/// defaults before any config has been written. The caller reports that
/// once logging is up.
pub fn load(path: &Path) -> anyhow::Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_reported_and_defaults_apply() {
        assert!(load(Path::new("/definitely/not/here.yaml")).unwrap().is_none());

        let cfg = Config::default();
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:8181");
        assert_eq!(cfg.policy.file, PathBuf::from("policies.yaml"));
        assert_eq!(cfg.policy.function_timeout(), Duration::from_millis(50));
        assert_eq!(cfg.policy.function_workers, 64);
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.cache.ttl_secs, 30);
        assert_eq!(cfg.cache.capacity, 10_000);
        assert_eq!(cfg.audit.buffer_capacity, 4096);
        assert_eq!(cfg.audit.retention, 100_000);
        assert_eq!(cfg.audit.flush_interval_ms, 1000);
        assert!(cfg.audit.log_path.is_none());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "policy:\n  function_timeout_ms: 10\ncache:\n  enabled: false\naudit:\n  log_path: /var/log/fedguard/audit.jsonl\n",
        )
        .unwrap();

        let cfg = load(&path).unwrap().unwrap();
        assert_eq!(cfg.policy.function_timeout_ms, 10);
        assert_eq!(cfg.policy.function_workers, 64);
        assert_eq!(cfg.policy.file, PathBuf::from("policies.yaml"));
        assert!(!cfg.cache.enabled);
        assert_eq!(cfg.cache.ttl_secs, 30);
        assert_eq!(
            cfg.audit.log_path,
            Some(PathBuf::from("/var/log/fedguard/audit.jsonl"))
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server: [not, a, map]\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
