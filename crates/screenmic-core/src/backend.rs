//! The seam between the engine and a live graph.

use thiserror::Error;

use crate::error::Error;
use crate::graph::Snapshot;
use crate::plan::PlannedLink;

/// Opaque handle to a link created by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

/// Classification of backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The connection to the server is gone or did not answer in time
    Unavailable,
    /// The server refused the operation; the connection is still usable
    Rejected,
}

/// Error reported by a [`GraphBackend`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    /// Failure class
    pub kind: BackendErrorKind,
    /// Human-readable description
    pub message: String,
}

impl BackendError {
    /// The connection was lost or timed out.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self { kind: BackendErrorKind::Unavailable, message: message.into() }
    }

    /// The server rejected the request.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self { kind: BackendErrorKind::Rejected, message: message.into() }
    }

    /// Whether the connection must be considered lost.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.kind == BackendErrorKind::Unavailable
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        match e.kind {
            BackendErrorKind::Unavailable => Error::GraphUnavailable(e.message),
            BackendErrorKind::Rejected => Error::CommitFailed(e.message),
        }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Access to a live audio graph.
///
/// Implementations block for a bounded time; none of the methods may wait
/// indefinitely for the server.
#[cfg_attr(test, mockall::automock)]
pub trait GraphBackend: Send + Sync {
    /// Return a consistent snapshot that reflects every object known at call time.
    fn snapshot(&self) -> BackendResult<Snapshot>;

    /// Create the capture endpoint if needed and return its node ID once its
    /// input ports are visible.
    fn ensure_capture_node(&mut self) -> BackendResult<u32>;

    /// Destroy the capture endpoint. A no-op when it does not exist.
    fn release_capture_node(&mut self) -> BackendResult<()>;

    /// Create one link and wait for the server to acknowledge it.
    fn create_link(&mut self, link: &PlannedLink) -> BackendResult<LinkHandle>;

    /// Destroy a link previously returned by [`GraphBackend::create_link`].
    fn destroy_link(&mut self, handle: LinkHandle) -> BackendResult<()>;
}
