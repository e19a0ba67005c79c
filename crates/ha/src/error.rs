//! Error types for HA replication
//!
//! Every failure inside the replication subsystem is expressed as an
//! [`Error`]. None of these ever cross into the negotiation engine: the bus
//! hooks swallow them and report through logs and metrics instead.

use thiserror::Error;

/// Result type for HA operations
pub type Result<T> = std::result::Result<T, Error>;

/// HA replication errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid or missing configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store client is not in the `Connected` state
    #[error("Store is not connected")]
    NotConnected,

    /// A bounded store operation did not finish in time
    #[error("Store {operation} timed out after {after_ms} ms")]
    Timeout {
        /// Operation that timed out ("connect", "publish")
        operation: &'static str,
        /// Configured bound in milliseconds
        after_ms: u64,
    },

    /// Transport-level failure (refused, reset, protocol error)
    #[error("Store transport error: {0}")]
    Transport(String),

    /// A record could not be serialized for the wire
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key material could not be sealed or opened
    #[error("Key sealing error: {0}")]
    Seal(String),

    /// A bus hook was invoked with inconsistent arguments
    #[error("Contract violation in {hook}: {reason}")]
    ContractViolation {
        /// Hook that received the bad arguments
        hook: &'static str,
        /// What was wrong
        reason: String,
    },

    /// `start()` called on a running service
    #[error("HA service is already running")]
    AlreadyRunning,

    /// `stop()` called on a service that is not running
    #[error("HA service is not running")]
    NotRunning,
}

impl Error {
    /// Whether the failure is expected to clear on its own once the store
    /// becomes reachable again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NotConnected | Error::Timeout { .. } | Error::Transport(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Transport(err.to_string())
    }
}
