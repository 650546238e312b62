use std::io::Error as IoError;

use thiserror::Error;

/// Errors surfaced by the bridge to the broadcast framework
#[derive(Debug, Error)]
pub enum Error {
    /// The broker could not be reached, or refused the operation. Not retried
    /// by the bridge; retry policy belongs to the transport
    #[error("broker unavailable: {reason}")]
    BrokerUnavailable {
        reason: String,
    },

    /// The adapter has been shut down and accepts no new subscriptions
    #[error("adapter has been shut down")]
    Shutdown,

    /// The listener thread did not terminate within the configured timeout
    #[error("listener did not terminate within {waited_ms}ms")]
    ShutdownTimeout {
        waited_ms: u64,
    },

    /// A background thread or its runtime could not be started
    #[error("failed to start background thread: {0}")]
    ThreadSpawn(#[from] IoError),
}

impl Error {
    pub(crate) fn unavailable<S>(reason: S) -> Self
    where
        S: Into<String>,
    {
        Error::BrokerUnavailable {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
