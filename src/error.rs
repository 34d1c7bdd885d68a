//! Error types for the reference-processing core.

use thiserror::Error;

/// Errors that can cross component boundaries in this crate.
///
/// Only two kinds of failure ever propagate: a cooperative termination
/// signal, and a refusal from the thread-lifecycle collaborator. Everything a
/// cleanup action itself raises is absorbed at the point of invocation (see
/// [`crate::service::run_catching_errors`]).
///
/// # Examples
///
/// ```
/// use refproc::error::{RefProcError, RefProcResult};
///
/// let terminated: RefProcResult<()> = Err(RefProcError::Terminated);
/// assert!(terminated.is_err());
/// assert_eq!(
///     RefProcError::Terminated.to_string(),
///     "reference processing terminated by runtime shutdown",
/// );
/// ```
#[derive(Debug, Error)]
pub enum RefProcError {
    /// Cooperative shutdown requested while processing references.
    #[error("reference processing terminated by runtime shutdown")]
    Terminated,
    /// The thread-lifecycle collaborator could not start the consumer thread.
    #[error("failed to start reference-processor thread: {0}")]
    ThreadSpawn(String),
}

/// Result type for reference-processing operations.
pub type RefProcResult<T> = Result<T, RefProcError>;

/// Failure classes a category-supplied cleanup action may produce.
///
/// The error-isolation wrapper applies a fixed policy per class:
/// `Termination` always propagates, the other two are reported only when the
/// runtime debug flag is set and are otherwise discarded.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// The runtime is shutting down; stop processing on this path.
    #[error("runtime termination requested")]
    Termination,
    /// A guest-level error raised by the cleanup code itself.
    #[error("guest error raised by cleanup action: {0}")]
    GuestRaise(String),
    /// Any other failure of the cleanup action.
    #[error("cleanup action failed: {0}")]
    Failed(String),
}
