//! Error types for screenmic core.

use thiserror::Error;

/// Core error type for patch bay operations.
///
/// The variants form the caller-facing taxonomy: argument and filter errors
/// are raised before the graph is touched, `CommitFailed` guarantees that the
/// attempted links were rolled back, and `GraphUnavailable` means the session
/// state is unknown and has been dropped.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Multimedia server unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Graph unavailable: {0}")]
    GraphUnavailable(String),

    #[error("Link commit failed: {0}")]
    CommitFailed(String),

    #[error("A link session is already active")]
    SessionActive,
}

impl Error {
    /// Stable numeric code used on the IPC surface.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Unavailable(_) => 503,
            Self::InvalidArgument(_) => 400,
            Self::InvalidFilter(_) => 422,
            Self::GraphUnavailable(_) => 502,
            Self::CommitFailed(_) => 409,
            Self::SessionActive => 423,
        }
    }

    /// Whether the caller must re-probe and reconstruct the engine.
    #[must_use]
    pub fn is_graph_lost(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::GraphUnavailable(_))
    }
}

/// Result type alias for screenmic core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            Error::Unavailable(String::new()),
            Error::InvalidArgument(String::new()),
            Error::InvalidFilter(String::new()),
            Error::GraphUnavailable(String::new()),
            Error::CommitFailed(String::new()),
            Error::SessionActive,
        ];

        let mut codes: Vec<_> = errors.iter().map(Error::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_graph_lost_kinds() {
        assert!(Error::GraphUnavailable("gone".into()).is_graph_lost());
        assert!(Error::Unavailable("absent".into()).is_graph_lost());
        assert!(!Error::CommitFailed("busy".into()).is_graph_lost());
        assert!(!Error::InvalidFilter("empty".into()).is_graph_lost());
    }
}
