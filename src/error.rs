//! Error types for the reconciliation engine.
//!
//! Errors are strongly typed using thiserror and split by how the caller is
//! expected to react: source failures are transient and only cost the current
//! notification, invariant violations mean the mirrored state can no longer be
//! trusted.

use thiserror::Error;

use crate::ids::ThreadId;

/// Failures reported by the monitoring source.
///
/// These are transient: the notification being processed is dropped and
/// already-emitted history is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Thread {thread} is not suspended")]
    NotSuspended {
        thread: ThreadId,
    },

    #[error("Stale handle: {what}")]
    StaleHandle {
        what: String,
    },

    #[error("Thread {thread} no longer exists in the target")]
    ThreadGone {
        thread: ThreadId,
    },

    #[error("Monitoring source disconnected")]
    Disconnected,
}

/// Internal invariant violations.
///
/// The reconciler and the contour store have desynchronized; there is no safe
/// way to continue producing a trace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantError {
    #[error("In-model frame {frame} on {thread} has no method contour")]
    MissingContour {
        thread: ThreadId,
        frame: String,
    },

    #[error("Mirrored stack of {thread} is empty where a frame was required")]
    EmptyMirror {
        thread: ThreadId,
    },

    #[error("Mirrored stack of {thread} is deeper ({mirrored}) than the real stack ({real}) after reconciliation")]
    DepthMismatch {
        thread: ThreadId,
        mirrored: usize,
        real: usize,
    },

    #[error("Poisoned lock: {context}")]
    Poisoned {
        context: &'static str,
    },
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("'{field}' must be at least {min} (got {actual})")]
    TooSmall {
        field: &'static str,
        min: usize,
        actual: usize,
    },

    #[error("Invalid configuration document: {reason}")]
    Malformed {
        reason: String,
    },

    #[error("Invalid filter pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },
}

/// Errors from the event dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Dispatcher channel '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Dispatcher operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Top-level error type for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl EngineError {
    /// Returns true if only the current notification is affected.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    /// Returns true if the engine state can no longer be trusted.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Dispatch(DispatchError::Disconnected { .. }))
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

pub(crate) fn lock_err(context: &'static str) -> EngineError {
    EngineError::Invariant(InvariantError::Poisoned { context })
}
