//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;
use crate::spec::RetryPolicy;

/// Batch execution configuration.
///
/// Per-job settings on a [`crate::spec::JobSpec`] override the defaults here;
/// the concurrency and channel bounds apply to the batch as a whole.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of concurrently running jobs (the worker pool width).
    pub max_workers: usize,
    /// Per-attempt timeout applied when a spec does not set its own.
    pub default_timeout: Duration,
    /// Retry policy applied when a spec does not set its own.
    pub default_retry: RetryPolicy,
    /// Per-stream capture cap; stdout/stderr beyond this are dropped and the
    /// result is flagged truncated.
    pub max_capture_bytes: usize,
    /// Bound on the internal result and event channels.
    pub channel_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            default_timeout: Duration::from_secs(600), // 10 minutes
            default_retry: RetryPolicy::default(),
            max_capture_bytes: 64 * 1024, // 64 KiB
            channel_capacity: 256,
        }
    }
}

impl BatchConfig {
    /// Validate the configuration. Called once at batch construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "channel_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "default_timeout".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
