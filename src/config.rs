//! Runtime settings for persistence retries and channels.
//!
//! Both settings structs follow the same pattern: `Default` carries the
//! production values and `validate` rejects settings that would make the
//! retry loop or the consumer loop misbehave.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of retries after the first attempt of a store call.
pub const MAX_RETRIES: u32 = 5;

/// Default wait between retries.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Default channel log name prefix.
pub const CHANNEL_PREFIX: &str = "tbone_channel_";

/// Bounded retry applied to every store call made by a collection.
///
/// A call is attempted once and then retried up to `max_retries` times while
/// it keeps failing with a transient error, waiting `backoff` between
/// attempts. The wait never blocks the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Sets the number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the wait between attempts.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total number of attempts, first call included.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if retries are configured with
    /// no wait between them.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_retries > 0 && self.backoff.is_zero() {
            return Err(invalid("retry.backoff", "must be non-zero when retries are enabled"));
        }
        Ok(self)
    }
}

/// Settings for a named channel and its capped backing log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Maximum number of entries kept in the log.
    pub capacity: usize,
    /// Byte budget per entry; the log holds `capacity * message_size` bytes.
    pub message_size: usize,
    /// Wait before re-tailing when the log had nothing new.
    pub poll_interval: Duration,
    /// How long a single tail call waits for a new entry.
    pub await_timeout: Duration,
    /// Restart the consumer after it fails instead of leaving it dead.
    pub restart_on_failure: bool,
    /// Prefix joined to the channel name to form the log name.
    pub name_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 15,
            message_size: 1024,
            poll_interval: Duration::from_millis(100),
            await_timeout: Duration::from_secs(1),
            restart_on_failure: true,
            name_prefix: CHANNEL_PREFIX.to_string(),
        }
    }
}

impl ChannelConfig {
    /// Sets the capped log's document budget.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the expected size of one message, which sizes the log's byte budget.
    #[must_use]
    pub const fn with_message_size(mut self, message_size: usize) -> Self {
        self.message_size = message_size;
        self
    }

    /// Sets the wait before polling again when the log cannot be tailed.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets how long one tail read waits for a new entry.
    #[must_use]
    pub const fn with_await_timeout(mut self, await_timeout: Duration) -> Self {
        self.await_timeout = await_timeout;
        self
    }

    /// Sets whether a failed consumer is restarted.
    #[must_use]
    pub const fn with_restart_on_failure(mut self, restart: bool) -> Self {
        self.restart_on_failure = restart;
        self
    }

    /// Sets the prefix of log collection names.
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Total byte budget of the backing log.
    #[must_use]
    pub const fn max_bytes(&self) -> usize {
        self.capacity.saturating_mul(self.message_size)
    }

    /// Log name for a channel.
    #[must_use]
    pub fn log_name(&self, channel: &str) -> String {
        format!("{}{}", self.name_prefix, channel)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` for zero sizes or intervals.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.capacity == 0 {
            return Err(invalid("channel.capacity", "must be greater than zero"));
        }
        if self.message_size == 0 {
            return Err(invalid("channel.message_size", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("channel.poll_interval", "must be non-zero"));
        }
        if self.await_timeout.is_zero() {
            return Err(invalid("channel.await_timeout", "must be non-zero"));
        }
        Ok(self)
    }
}

fn invalid(setting: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        setting: setting.to_string(),
        reason: reason.to_string(),
    }
}
