use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fedguard", version, about = "Policy decision service for federated learning")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Path to the policy document (overrides config file setting)
    #[arg(short, long)]
    pub policy: Option<PathBuf>,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Disable the decision cache
    #[arg(long)]
    pub no_cache: bool,
}

impl Cli {
    /// Fold command-line overrides into `cfg`.
    pub fn apply(&self, cfg: &mut crate::config::Config) {
        if let Some(ref policy) = self.policy {
            cfg.policy.file = policy.clone();
        }
        if let Some(ref listen) = self.listen {
            cfg.server.listen_addr = listen.clone();
        }
        if self.no_cache {
            cfg.cache.enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_to_config() {
        let cli = Cli::parse_from([
            "fedguard",
            "--policy",
            "/etc/fedguard/policies.json",
            "--listen",
            "0.0.0.0:9000",
            "--no-cache",
        ]);
        let mut cfg = crate::config::Config::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.policy.file, PathBuf::from("/etc/fedguard/policies.json"));
        assert_eq!(cfg.server.listen_addr, "0.0.0.0:9000");
        assert!(!cfg.cache.enabled);
    }

    #[test]
    fn defaults_leave_config_alone() {
        let cli = Cli::parse_from(["fedguard"]);
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        let mut cfg = crate::config::Config::default();
        cli.apply(&mut cfg);
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:8181");
    }
}
