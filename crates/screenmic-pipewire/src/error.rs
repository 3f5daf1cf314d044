//! PipeWire error types.

use screenmic_core::BackendError;
use thiserror::Error;

/// PipeWire error type.
#[derive(Debug, Error)]
pub enum PwError {
    #[error("PipeWire connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Capture node creation failed: {0}")]
    CaptureNodeFailed(String),

    #[error("Link creation failed: {0}")]
    LinkCreationFailed(String),

    #[error("Link not found: {0}")]
    LinkNotFound(u64),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("MainLoop error: {0}")]
    MainLoopError(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("PipeWire connection lost")]
    Disconnected,
}

impl PwError {
    /// Whether the error means the connection can no longer be trusted.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::RegistryError(_)
                | Self::MainLoopError(_)
                | Self::Timeout(_)
                | Self::Disconnected
        )
    }
}

impl From<PwError> for BackendError {
    fn from(e: PwError) -> Self {
        if e.is_connection_lost() {
            BackendError::unavailable(e.to_string())
        } else {
            BackendError::rejected(e.to_string())
        }
    }
}

/// Result type for PipeWire operations.
pub type PwResult<T> = Result<T, PwError>;
