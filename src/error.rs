//! Error taxonomy for the virtual capture device

use thiserror::Error;

/// Errors reported by device commands.
///
/// Every error is local and synchronous: it goes back to the caller that
/// issued the command and leaves the device in its previous valid state.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Another session already holds the device
    #[error("device busy: another session holds it")]
    Busy,

    /// Bad index, tag, buffer category or dimension
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Command is not legal in the current session/buffer state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Pool cannot be resized while buffers are queued or completed
    #[error("buffers in use: {0}")]
    ResourceBusy(String),

    /// Buffer memory could not be allocated
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Non-blocking dequeue found no completed buffer
    #[error("no completed buffer available")]
    WouldBlock,

    /// Blocking dequeue was woken because streaming stopped
    #[error("stream stopped")]
    StreamStopped,

    /// Unsupported format or enumeration past the last entry
    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl DeviceError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;
