//! Repository configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One rendering frame at 60 Hz.
pub const DEFAULT_INSERT_DEBOUNCE_MS: u64 = 16;

/// Capacity of the repository and branch update channels.
pub const DEFAULT_UPDATE_CHANNEL_CAPACITY: usize = 1024;

// Validation constants
const MAX_INSERT_DEBOUNCE_MS: u64 = 10_000;
const MIN_UPDATE_CHANNEL_CAPACITY: usize = 1;
const MAX_UPDATE_CHANNEL_CAPACITY: usize = 1 << 20;

/// Tunables for a [`Repository`](crate::Repository).
///
/// # Examples
///
/// ```
/// use rime::RepositoryConfig;
///
/// let config = RepositoryConfig::default().with_insert_debounce_ms(0);
/// assert!(config.validate().is_ok());
///
/// let parsed = RepositoryConfig::from_json(r#"{"insert_debounce_ms": 32}"#).unwrap();
/// assert_eq!(parsed.insert_debounce_ms, 32);
/// assert_eq!(parsed.update_channel_capacity, 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// How long item fetch results wait to be coalesced into one write.
    pub insert_debounce_ms: u64,

    /// Buffered update notifications per subscriber before it lags.
    pub update_channel_capacity: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            insert_debounce_ms: DEFAULT_INSERT_DEBOUNCE_MS,
            update_channel_capacity: DEFAULT_UPDATE_CHANNEL_CAPACITY,
        }
    }
}

impl RepositoryConfig {
    pub fn with_insert_debounce_ms(mut self, ms: u64) -> Self {
        self.insert_debounce_ms = ms;
        self
    }

    pub fn with_update_channel_capacity(mut self, capacity: usize) -> Self {
        self.update_channel_capacity = capacity;
        self
    }

    pub fn insert_debounce(&self) -> Duration {
        Duration::from_millis(self.insert_debounce_ms)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError(format!("malformed JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.insert_debounce_ms > MAX_INSERT_DEBOUNCE_MS {
            return Err(ConfigError(format!(
                "insert_debounce_ms must be at most {MAX_INSERT_DEBOUNCE_MS}, got {}",
                self.insert_debounce_ms
            )));
        }
        if !(MIN_UPDATE_CHANNEL_CAPACITY..=MAX_UPDATE_CHANNEL_CAPACITY)
            .contains(&self.update_channel_capacity)
        {
            return Err(ConfigError(format!(
                "update_channel_capacity must be between {MIN_UPDATE_CHANNEL_CAPACITY} and {MAX_UPDATE_CHANNEL_CAPACITY}, got {}",
                self.update_channel_capacity
            )));
        }
        Ok(())
    }
}
