//! Configuration for Continuebee
//!
//! CLI arguments and environment variable handling using clap. A `.env`
//! file is loaded by the binary before parsing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::auth::{FreshnessGuard, NodeKeys};
use crate::services::bootstrap::BootstrapConfig;
use crate::services::identity::{IdentityConfig, KeyReusePolicy};
use crate::storage::{StorageUri, StoreOptions};
use crate::types::Result;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Continuebee - signature-authenticated hash custody
#[derive(Parser, Debug, Clone)]
#[command(name = "continuebee")]
#[command(about = "Keeps one hash per public key, authenticated by signatures only")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:2999")]
    pub listen: SocketAddr,

    /// Record store: memory:, sled:<dir>, sqlite:<file>, sqlite::memory:,
    /// file:<dir>, or a bare directory path
    #[arg(long, env = "STORAGE_URI", default_value = "memory:")]
    pub storage_uri: String,

    /// Directory levels used by the file store
    #[arg(long, env = "FILE_KEY_DEPTH", default_value = "2")]
    pub file_key_depth: usize,

    /// Allowed clock skew for request timestamps, in milliseconds
    #[arg(long, env = "ALLOWED_TIME_DIFFERENCE_MS", default_value = "300000")]
    pub allowed_time_difference_ms: u64,

    /// What create does when a public key already owns a different hash
    #[arg(long, env = "KEY_REUSE", value_enum, default_value_t = KeyReusePolicy::Reject)]
    pub key_reuse: KeyReusePolicy,

    /// Bound on a single store call, in milliseconds
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value = "5000")]
    pub store_timeout_ms: u64,

    /// Name of this service in spellbooks and identity lists
    #[arg(long, env = "SERVICE_NAME", default_value = "continuebee")]
    pub service_name: String,

    /// Hex ed25519 seed for this service's own key (generated when absent)
    #[arg(long, env = "SIGNING_KEY", hide_env_values = true)]
    pub signing_key: Option<String>,

    /// Spellbook JSON file
    #[arg(long, env = "SPELLBOOK_PATH")]
    pub spellbook_path: Option<PathBuf>,

    /// Cost this service adds to a spell chain
    #[arg(long, env = "MINIMUM_COST", default_value = "20")]
    pub minimum_cost: u64,

    /// Timeout for forwarding a spell to the next stop, in milliseconds
    #[arg(long, env = "FORWARD_TIMEOUT_MS", default_value = "30000")]
    pub forward_timeout_ms: u64,

    /// Discovery service base URL. Without it the service starts unfederated.
    #[arg(long, env = "DISCOVERY_URL")]
    pub discovery_url: Option<String>,

    /// Registration attempts before bootstrap gives up
    #[arg(long, env = "BOOTSTRAP_MAX_ATTEMPTS", default_value = "10")]
    pub bootstrap_max_attempts: u32,

    /// Delay before the first registration retry, in milliseconds
    #[arg(long, env = "BOOTSTRAP_INITIAL_DELAY_MS", default_value = "2000")]
    pub bootstrap_initial_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    pub fn storage(&self) -> Result<StorageUri> {
        StorageUri::parse(&self.storage_uri)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            file_key_depth: self.file_key_depth,
        }
    }

    pub fn identity_config(&self) -> IdentityConfig {
        IdentityConfig {
            freshness: FreshnessGuard::new(Duration::from_millis(self.allowed_time_difference_ms)),
            key_reuse: self.key_reuse,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }

    /// Retry schedule; the initial delay never exceeds the backoff cap
    pub fn bootstrap_config(&self) -> BootstrapConfig {
        let defaults = BootstrapConfig::default();
        BootstrapConfig {
            max_attempts: self.bootstrap_max_attempts,
            initial_delay: Duration::from_millis(self.bootstrap_initial_delay_ms)
                .min(defaults.max_delay),
            ..defaults
        }
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    /// This service's keypair: from SIGNING_KEY, or freshly generated
    pub fn node_keys(&self) -> Result<NodeKeys> {
        match &self.signing_key {
            Some(seed) => NodeKeys::from_seed_hex(seed),
            None => Ok(NodeKeys::generate()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.storage().map_err(|e| e.to_string())?;

        if self.allowed_time_difference_ms == 0 {
            return Err("ALLOWED_TIME_DIFFERENCE_MS must be greater than 0".to_string());
        }
        if self.store_timeout_ms == 0 {
            return Err("STORE_TIMEOUT_MS must be greater than 0".to_string());
        }
        if self.bootstrap_max_attempts == 0 {
            return Err("BOOTSTRAP_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.service_name.trim().is_empty() {
            return Err("SERVICE_NAME must not be empty".to_string());
        }
        if let Some(ref url) = self.discovery_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err("DISCOVERY_URL must be an http(s) URL".to_string());
            }
        }
        if let Some(ref seed) = self.signing_key {
            NodeKeys::from_seed_hex(seed).map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["continuebee"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&[
            "--listen",
            "127.0.0.1:3999",
            "--storage-uri",
            "sqlite::memory:",
            "--key-reuse",
            "reissue",
            "--log-format",
            "json",
            "--allowed-time-difference-ms",
            "1000",
        ]);

        assert_eq!(args.listen, "127.0.0.1:3999".parse().unwrap());
        assert_eq!(args.storage().unwrap(), StorageUri::Sqlite(None));
        assert_eq!(args.key_reuse, KeyReusePolicy::Reissue);
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(
            args.identity_config().freshness.allowed_skew(),
            Duration::from_secs(1)
        );
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let args = parse(&["--storage-uri", "redis://localhost"]);
        assert!(args.validate().is_err());

        let args = parse(&["--signing-key", "abc"]);
        assert!(args.validate().is_err());

        let args = parse(&["--discovery-url", "localhost:3006"]);
        assert!(args.validate().is_err());

        let args = parse(&["--store-timeout-ms", "0"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_bootstrap_initial_delay_is_capped() {
        let args = parse(&["--bootstrap-initial-delay-ms", "600000"]);
        let config = args.bootstrap_config();
        assert_eq!(config.initial_delay, config.max_delay);

        let args = parse(&["--bootstrap-initial-delay-ms", "250"]);
        assert_eq!(args.bootstrap_config().initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_signing_key_is_deterministic() {
        let seed = "11".repeat(32);
        let args = parse(&["--signing-key", seed.as_str()]);
        let a = args.node_keys().unwrap();
        let b = args.node_keys().unwrap();
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }
}
