//! Error taxonomy shared by every FrankenFFI layer.
//!
//! Each variant carries the identifiers needed to reproduce the failure
//! (arena, segment, symbol, argument index, key, task) so callers never have
//! to inspect internal state to explain an error.

use thiserror::Error;

use crate::arena::{ArenaId, SegmentId};
use crate::owner::OwnerId;

/// Boxed error raised inside a task body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used across the workspace.
pub type FfiResult<T> = Result<T, FfiError>;

/// Every failure the interop layer can report.
#[derive(Debug, Error)]
pub enum FfiError {
    // Memory regions
    #[error("arena {arena} is closed")]
    ArenaClosed { arena: ArenaId },

    #[error(
        "access [{offset}, {offset}+{len}) outside segment {segment} of arena {arena} (length {segment_len})"
    )]
    BoundsViolation {
        arena: ArenaId,
        segment: SegmentId,
        offset: usize,
        len: usize,
        segment_len: usize,
    },

    #[error("arena {arena} is confined to owner {owner}, accessed by {caller}")]
    WrongOwner {
        arena: ArenaId,
        owner: OwnerId,
        caller: OwnerId,
    },

    #[error("arena {arena} cannot satisfy a request of {requested} bytes")]
    OutOfMemory { arena: ArenaId, requested: usize },

    #[error("layout has no field `{path}`")]
    UnknownField { path: String },

    // Bindings
    #[error("symbol `{symbol}` not found in the native search path")]
    SymbolNotFound { symbol: String },

    #[error("invalid descriptor for `{symbol}`: {reason}")]
    InvalidDescriptor { symbol: String, reason: String },

    #[error("`{symbol}` expects {expected} arguments, got {actual}")]
    ArityMismatch {
        symbol: String,
        expected: usize,
        actual: usize,
    },

    #[error("{context}: argument {index} expects {expected}, got {actual}")]
    TypeMismatch {
        context: String,
        index: usize,
        expected: String,
        actual: String,
    },

    // Context
    #[error("context key `{key}` is not bound in the current frame")]
    ContextKeyMissing { key: String },

    // Tasks
    #[error("task {task} failed: {source}")]
    TaskFailed {
        task: u64,
        #[source]
        source: BoxError,
    },

    #[error("task {task} was cancelled")]
    Cancelled { task: u64 },
}

/// Field-free classification of [`FfiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ArenaClosed,
    BoundsViolation,
    WrongOwner,
    OutOfMemory,
    UnknownField,
    SymbolNotFound,
    InvalidDescriptor,
    ArityMismatch,
    TypeMismatch,
    ContextKeyMissing,
    TaskFailed,
    Cancelled,
}

impl ErrorKind {
    /// Stable lowercase name used in structured logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ArenaClosed => "arena_closed",
            Self::BoundsViolation => "bounds_violation",
            Self::WrongOwner => "wrong_owner",
            Self::OutOfMemory => "out_of_memory",
            Self::UnknownField => "unknown_field",
            Self::SymbolNotFound => "symbol_not_found",
            Self::InvalidDescriptor => "invalid_descriptor",
            Self::ArityMismatch => "arity_mismatch",
            Self::TypeMismatch => "type_mismatch",
            Self::ContextKeyMissing => "context_key_missing",
            Self::TaskFailed => "task_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FfiError {
    /// Classification without payload.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ArenaClosed { .. } => ErrorKind::ArenaClosed,
            Self::BoundsViolation { .. } => ErrorKind::BoundsViolation,
            Self::WrongOwner { .. } => ErrorKind::WrongOwner,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::UnknownField { .. } => ErrorKind::UnknownField,
            Self::SymbolNotFound { .. } => ErrorKind::SymbolNotFound,
            Self::InvalidDescriptor { .. } => ErrorKind::InvalidDescriptor,
            Self::ArityMismatch { .. } => ErrorKind::ArityMismatch,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::ContextKeyMissing { .. } => ErrorKind::ContextKeyMissing,
            Self::TaskFailed { .. } => ErrorKind::TaskFailed,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Build a [`FfiError::TypeMismatch`] from displayable parts.
    pub fn type_mismatch(
        context: impl Into<String>,
        index: usize,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::TypeMismatch {
            context: context.into(),
            index,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Build a [`FfiError::InvalidDescriptor`].
    pub fn invalid_descriptor(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }
}
