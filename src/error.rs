//! Error types for channel-tree.

use std::time::Duration;

use crate::channels::ChannelId;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The caller's cancellation fired before the queue had room.
    /// The message was not enqueued.
    #[error("Send on channel {id} cancelled before the message was accepted")]
    Cancelled { id: ChannelId },

    /// The queue was already closed by the shutdown sequence.
    #[error("Channel {id} is closed")]
    Closed { id: ChannelId },

    #[error("Channel {id} registry failure: {source}")]
    Registry {
        id: ChannelId,
        #[source]
        source: RegistryError,
    },
}

impl ChannelError {
    /// Whether this error came from a deadline elapsing inside the registry.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ChannelError::Registry {
                source: RegistryError::Timeout { .. },
                ..
            }
        )
    }
}

/// Child registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The operation did not complete before its deadline.
    #[error("Registry {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A caller-supplied callback reported a failure.
    #[error("Registry callback failed: {0}")]
    Callback(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
