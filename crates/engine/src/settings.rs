use std::time::Duration;

use crate::retry::RetryOptions;

/// Engine-wide tunables, built from the CLI configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Region the engine runs against; consulted by the feature flags.
    pub region: String,
    /// Policy for change-set and stack deletion after a dry run.
    pub cleanup_retry: RetryOptions,
    /// How long a finished workflow stays queryable.
    pub retention: Duration,
    /// Stack events kept on a deployment record.
    pub stack_event_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            cleanup_retry: RetryOptions::default(),
            retention: Duration::from_secs(3600),
            stack_event_limit: 50,
        }
    }
}
