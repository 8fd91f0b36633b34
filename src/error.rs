//! Crate-wide error types.

/// Low-level I/O failure reported by the file system's worker tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    #[error("no error")]
    None,
    #[error("failed to open file")]
    FailedOpening,
    #[error("failed while reading file")]
    FailedReading,
    #[error("failed while writing file")]
    FailedWriting,
    #[error("failed to create containing directory")]
    FailedCreatingDir,
}

/// Errors surfaced at the public API boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller misused the API in a way that is detectable but not a
    /// programmer-only invariant breach (e.g. double-copy, destination too
    /// small, handle table at capacity).
    #[error("{0}")]
    Contract(&'static str),
}
