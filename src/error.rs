//! Error taxonomy for the runtime core.
//!
//! All fallible construction and loading APIs return [`Result`]. The one
//! deliberate exception is [`ConflictAbort`]: it is a control-flow signal for
//! the scheduler driving speculative iterations, not a failure, so it is a
//! separate type and is never wrapped into [`SkeinError`].

use std::io;

use thiserror::Error;

/// Result type for runtime-core operations.
///
/// The error parameter defaults to [`SkeinError`] but can be overridden,
/// which the conflict-aware accessors use to return [`ConflictAbort`].
pub type Result<T, E = SkeinError> = std::result::Result<T, E>;

/// Errors surfaced by loading, construction, and allocation APIs.
#[derive(Debug, Error)]
pub enum SkeinError {
    /// I/O error from the underlying filesystem (open, map, write, sync).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unsupported on-disk graph image.
    ///
    /// Fatal to the load or build call; the caller may recover by choosing
    /// another input. No partial graph is left observable.
    #[error("malformed graph image: {0}")]
    Format(String),

    /// The bulk allocator could not satisfy a region request.
    ///
    /// The runtime has no fallback allocation strategy, so callers should
    /// treat this as fatal for the current phase.
    #[error("bulk allocation of {len} bytes failed: {source}")]
    Alloc {
        /// Requested length in bytes, before page rounding.
        len: usize,
        /// Underlying OS error.
        source: io::Error,
    },

    /// Invalid argument or API contract violation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Signal that a speculative iteration lost a guarded record to a concurrent
/// owner and must be rolled back and retried.
///
/// Raised by acquire paths only. The components raising it never catch it;
/// the scheduler driving iterations does. An aborted iteration releases every
/// mark it held when it is dropped, after the caller has discarded its
/// tentative effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("conflicting access to a guarded record; iteration must retry")]
pub struct ConflictAbort;
