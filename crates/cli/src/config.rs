//! `stackward.toml` loading.
//!
//! # Example
//!
//! ```toml
//! region = "us-east-1"
//! log_level = "info"
//!
//! [enhanced_diagnostics]
//! regions = ["us-east-1", "eu-west-1"]
//!
//! [cleanup_retry]
//! max_attempts = 3
//! initial_delay_ms = 1000
//!
//! [workflows]
//! retention_secs = 3600
//! stack_event_limit = 50
//! ```
//!
//! Every key is optional. `STACKWARD_REGION` overrides `region`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stackward_engine::{EngineSettings, RegionFeatureFlags, RetryOptions};

pub const REGION_ENV: &str = "STACKWARD_REGION";

// ── Types ─────────────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub region: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub enhanced_diagnostics: EnhancedDiagnostics,
    pub cleanup_retry: CleanupRetry,
    pub workflows: Workflows,
}

/// `[enhanced_diagnostics]`: regions where failure events are mined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnhancedDiagnostics {
    pub regions: Vec<String>,
}

/// `[cleanup_retry]`: backoff policy for dry-run cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupRetry {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_fraction: f64,
    pub total_timeout_ms: u64,
}

/// `[workflows]`: status-table retention and deployment event cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Workflows {
    pub retention_secs: u64,
    pub stack_event_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: EngineSettings::default().region,
            log_level: "info".to_string(),
            enhanced_diagnostics: EnhancedDiagnostics::default(),
            cleanup_retry: CleanupRetry::default(),
            workflows: Workflows::default(),
        }
    }
}

impl Default for CleanupRetry {
    fn default() -> Self {
        let defaults = RetryOptions::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
            jitter_fraction: defaults.jitter_fraction,
            total_timeout_ms: defaults.total_timeout.as_millis() as u64,
        }
    }
}

impl Default for Workflows {
    fn default() -> Self {
        let defaults = EngineSettings::default();
        Self {
            retention_secs: defaults.retention.as_secs(),
            stack_event_limit: defaults.stack_event_limit,
        }
    }
}

// ── Functions ─────────────────────────────────────────────────────────────────

/// Load the configuration from `path` (defaults when `None`) and apply the
/// environment override.
pub fn load(path: Option<&Path>) -> Result<Config, String> {
    let mut config = match path {
        Some(path) => read_config(path)?,
        None => Config::default(),
    };
    config.override_region(std::env::var(REGION_ENV).ok());
    config.check()?;
    Ok(config)
}

/// Read and parse a config TOML file from `path`.
pub fn read_config(path: &Path) -> Result<Config, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;

    toml::from_str(&content).map_err(|e| format!("could not parse '{}': {}", path.display(), e))
}

impl Config {
    pub fn override_region(&mut self, region: Option<String>) {
        if let Some(region) = region.filter(|r| !r.trim().is_empty()) {
            self.region = region;
        }
    }

    /// Reject values the retry runner cannot work with.
    pub fn check(&self) -> Result<(), String> {
        let retry = &self.cleanup_retry;
        let mut errors = Vec::new();
        if self.region.trim().is_empty() {
            errors.push("region must not be empty".to_string());
        }
        if retry.backoff_multiplier < 1.0 {
            errors.push(format!(
                "cleanup_retry.backoff_multiplier must be at least 1.0, got {}",
                retry.backoff_multiplier
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_fraction) {
            errors.push(format!(
                "cleanup_retry.jitter_fraction must be between 0.0 and 1.0, got {}",
                retry.jitter_fraction
            ));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            errors.push(format!(
                "cleanup_retry.initial_delay_ms ({}) exceeds max_delay_ms ({})",
                retry.initial_delay_ms, retry.max_delay_ms
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let retry = &self.cleanup_retry;
        EngineSettings {
            region: self.region.clone(),
            cleanup_retry: RetryOptions {
                max_attempts: retry.max_attempts,
                initial_delay: Duration::from_millis(retry.initial_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
                backoff_multiplier: retry.backoff_multiplier,
                jitter_fraction: retry.jitter_fraction,
                total_timeout: Duration::from_millis(retry.total_timeout_ms),
                ..RetryOptions::default()
            },
            retention: Duration::from_secs(self.workflows.retention_secs),
            stack_event_limit: self.workflows.stack_event_limit,
        }
    }

    pub fn feature_flags(&self) -> RegionFeatureFlags {
        RegionFeatureFlags::new(self.enhanced_diagnostics.regions.iter().cloned())
    }
}
