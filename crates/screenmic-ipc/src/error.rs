//! IPC error types.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// IPC error type.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Framing error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;
