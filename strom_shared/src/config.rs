use std::{fs, io, path::Path, time::Duration};

use byte_unit::{Byte, UnitType};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read the configuration: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse the configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of the streaming subsystem
///
/// Every field has a default so that a YAML file only has to contain the values that differ.
///
/// ```
/// use strom_shared::StreamingConfig;
/// let config = StreamingConfig::from_yaml_str("staging_capacity: 1024").unwrap();
/// assert_eq!(config.staging_capacity, 1024);
/// assert_eq!(config.staging_alignment, StreamingConfig::default().staging_alignment);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of threads in the I/O pool
    pub io_worker_count: usize,
    /// Size of the staging region in bytes. One batch never exceeds this size.
    pub staging_capacity: u64,
    /// Alignment of every copy source inside the staging region
    pub staging_alignment: u64,
    /// Capacity of the channel on which the I/O pool reports decoded resources
    pub notification_capacity: usize,
    /// Time the transfer thread sleeps when there is no work
    pub transfer_idle_wait_ms: u64,
    /// Upper bound for draining outstanding work at shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            io_worker_count: num_cpus::get().clamp(1, 4),
            staging_capacity: 16 * 1024 * 1024,
            staging_alignment: 16,
            notification_capacity: 1024,
            transfer_idle_wait_ms: 2,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl StreamingConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Checks the values that would make the streaming threads misbehave.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.io_worker_count == 0 {
            return Err(ConfigError::Invalid("io_worker_count must be at least 1".to_owned()));
        }
        if self.staging_capacity == 0 {
            return Err(ConfigError::Invalid("staging_capacity must not be 0".to_owned()));
        }
        if !self.staging_alignment.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "staging_alignment must be a power of two but is {}",
                self.staging_alignment
            )));
        }
        if self.notification_capacity == 0 {
            return Err(ConfigError::Invalid("notification_capacity must not be 0".to_owned()));
        }
        Ok(())
    }

    pub fn transfer_idle_wait(&self) -> Duration {
        Duration::from_millis(self.transfer_idle_wait_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Formats a byte count with a binary unit for log output.
pub fn format_bytes(bytes: u64) -> String {
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{adjusted:.2}")
}
