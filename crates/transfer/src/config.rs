//! Transfer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default part size: 10 MiB.
///
/// The Bot API refuses to serve files above 20 MB, so parts stay well
/// below that ceiling.
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transfer configuration: {0}")]
pub struct ConfigError(pub String);

/// Tunables shared by the upload and download pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub part_size_bytes: u64,
    /// Attempts per remote call, the first one included.
    pub max_retry_attempts: u32,
    pub backoff_base_millis: u64,
    /// Ceiling of the exponential backoff.
    pub backoff_max_millis: u64,
    /// Pause between two uploaded parts. Zero disables it.
    pub inter_part_delay_millis: u64,
    /// Limit for one remote call. Zero disables it.
    pub call_timeout_millis: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size_bytes: DEFAULT_PART_SIZE,
            max_retry_attempts: 5,
            backoff_base_millis: 1000,
            backoff_max_millis: 30_000,
            inter_part_delay_millis: 2000,
            call_timeout_millis: 120_000,
        }
    }
}

impl TransferConfig {
    /// Checks the values a pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.part_size_bytes == 0 {
            return Err(ConfigError("part_size_bytes must be greater than 0".into()));
        }
        if usize::try_from(self.part_size_bytes).is_err() {
            return Err(ConfigError(format!(
                "part_size_bytes {} does not fit in memory",
                self.part_size_bytes
            )));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError("max_retry_attempts must be at least 1".into()));
        }
        if self.backoff_max_millis < self.backoff_base_millis {
            return Err(ConfigError(
                "backoff_max_millis must not be below backoff_base_millis".into(),
            ));
        }
        Ok(())
    }

    pub fn inter_part_delay(&self) -> Option<Duration> {
        (self.inter_part_delay_millis > 0).then(|| Duration::from_millis(self.inter_part_delay_millis))
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_millis > 0).then(|| Duration::from_millis(self.call_timeout_millis))
    }
}
