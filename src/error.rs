//! Error types for crosspool.

use thiserror::Error;

/// Result type alias using crosspool's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for crosspool operations.
///
/// Request-path failures (budget exhausted, graphics inactive, handle
/// duplication failed) are not errors: they surface as empty buffer handles
/// so callers can fall back to local allocation. `Error` covers segment
/// attach, collaborator construction, and syscall failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid or corrupt shared segment.
    #[error("invalid shared segment: {0}")]
    InvalidSegment(String),

    /// The segment's named-object directory is full.
    #[error("named-object directory full (max {0} objects)")]
    DirectoryFull(usize),

    /// The graphics backend could not be brought up.
    #[error("graphics backend unavailable: {0}")]
    GraphicsUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
