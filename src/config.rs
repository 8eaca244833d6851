//! Plain-data channel settings.
//!
//! Settings can be built in code, deserialized (durations are expressed in
//! milliseconds), or read from `CHANNEL_TREE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default interval between quiescence checks while waiting for children.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const ENV_BUFFER_CAPACITY: &str = "CHANNEL_TREE_BUFFER_CAPACITY";
const ENV_POLL_INTERVAL_MS: &str = "CHANNEL_TREE_POLL_INTERVAL_MS";
const ENV_LOCK_TIMEOUT_MS: &str = "CHANNEL_TREE_LOCK_TIMEOUT_MS";
const ENV_SHUTDOWN_TIMEOUT_MS: &str = "CHANNEL_TREE_SHUTDOWN_TIMEOUT_MS";

/// Settings shared by a channel and, through inheritance, its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Queue capacity. `0` requests the smallest queue available: one slot,
    /// so a send may complete before the consumer has taken the message.
    pub buffer_capacity: usize,
    /// Upper bound between checks while waiting for children to finish.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Deadline for acquiring the child registry lock.
    #[serde(with = "option_duration_ms")]
    pub lock_timeout: Option<Duration>,
    /// Deadline for the whole wait-for-children step of shutdown.
    #[serde(with = "option_duration_ms")]
    pub shutdown_timeout: Option<Duration>,
    /// Human-readable name used in logs and topology snapshots.
    pub name: Option<String>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_timeout: None,
            shutdown_timeout: None,
            name: None,
        }
    }
}

impl ChannelSettings {
    /// Build settings from `CHANNEL_TREE_*` environment variables.
    ///
    /// Missing variables fall back to the defaults. Values that are present
    /// but unparsable are reported rather than ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_BUFFER_CAPACITY)? {
            settings.buffer_capacity = capacity;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_POLL_INTERVAL_MS)? {
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    key: ENV_POLL_INTERVAL_MS.to_string(),
                    message: "poll interval must be greater than zero".to_string(),
                });
            }
            settings.poll_interval = Duration::from_millis(ms);
        }
        settings.lock_timeout =
            parse_var::<u64>(&lookup, ENV_LOCK_TIMEOUT_MS)?.map(Duration::from_millis);
        settings.shutdown_timeout =
            parse_var::<u64>(&lookup, ENV_SHUTDOWN_TIMEOUT_MS)?.map(Duration::from_millis);

        Ok(settings)
    }

    /// Queue capacity actually allocated for these settings.
    pub fn effective_capacity(&self) -> usize {
        self.buffer_capacity.max(1)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{:?}: {}", raw, e),
        })
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
