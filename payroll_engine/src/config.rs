//! Process configuration.
//!
//! Read once at startup from `PAYROLL_*` environment variables.  A
//! missing or unparsable value keeps its default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::RetryPolicy;

/// Process configuration.  Business rules live in versioned snapshot
/// files under `rules_dir`, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// HTTP listen address
    pub bind_addr: String,

    /// Directory of rules snapshot JSON files
    pub rules_dir: PathBuf,

    /// Snapshot version used when a request names none
    pub rules_version: Option<String>,

    /// Offline replay: attempts per item before giving up
    pub sync_max_attempts: u32,

    /// Offline replay: first retry delay in milliseconds
    pub sync_base_delay_ms: u64,

    /// Offline replay: retry delay cap in milliseconds
    pub sync_max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            rules_dir: PathBuf::from("rules"),
            rules_version: None,
            sync_max_attempts: 5,
            sync_base_delay_ms: 500,
            sync_max_delay_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("PAYROLL_BIND_ADDR") {
            config.bind_addr = addr;
        }

        if let Some(dir) = lookup("PAYROLL_RULES_DIR") {
            config.rules_dir = PathBuf::from(dir);
        }

        if let Some(version) = lookup("PAYROLL_RULES_VERSION").filter(|v| !v.is_empty()) {
            config.rules_version = Some(version);
        }

        if let Some(n) = lookup("PAYROLL_SYNC_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.sync_max_attempts = n;
        }

        if let Some(ms) = lookup("PAYROLL_SYNC_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.sync_base_delay_ms = ms;
        }

        if let Some(ms) = lookup("PAYROLL_SYNC_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.sync_max_delay_ms = ms;
        }

        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync_max_attempts.max(1),
            base_delay: Duration::from_millis(self.sync_base_delay_ms),
            max_delay: Duration::from_millis(self.sync_max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.rules_dir, PathBuf::from("rules"));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("PAYROLL_BIND_ADDR", "0.0.0.0:8080"),
            ("PAYROLL_RULES_VERSION", "2024-07"),
            ("PAYROLL_SYNC_MAX_ATTEMPTS", "many"),
            ("PAYROLL_SYNC_BASE_DELAY_MS", "250"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.rules_version.as_deref(), Some("2024-07"));
        assert_eq!(config.sync_max_attempts, 5);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(250));
    }
}
