//! Unified error handling for MicroForge
//!
//! This module provides a centralized error type covering every failure the
//! allocator core can produce, from arena exhaustion to malformed model
//! containers. Errors are categorized so hosts can decide whether a failure
//! is actionable (bad model), a resource limit (arena too small), or a bug.

use std::fmt;

use thiserror::Error;

/// Unified error type for MicroForge
///
/// Every fallible operation in the crate returns this type. None of the
/// errors are retried internally; after a failure the allocator state is
/// only good enough for teardown, not for retrying allocation in place.
#[derive(Debug, Error)]
pub enum MicroForgeError {
    /// A head, tail, or temp request would make head + tail exceed capacity
    #[error("arena exhausted: requested {requested} bytes but only {available} available")]
    ArenaExhausted { requested: usize, available: usize },

    /// An activation tensor has an inconsistent first_use/last_use pair
    #[error(
        "logic error in memory planner: tensor {tensor} has an invalid lifetime: \
         first_use {first_use}, last_use {last_use}"
    )]
    LifetimeLogicError {
        tensor: usize,
        first_use: i32,
        last_use: i32,
    },

    /// The model is well-formed but uses features the runtime does not support
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    /// The model container is corrupt or truncated
    #[error("invalid model file: {0}")]
    InvalidModelFile(String),

    /// An operator's opcode has no kernel in the resolver
    #[error("missing kernel registration for operator {0}")]
    MissingRegistration(String),

    /// Allocator lifecycle misuse (reentrant start, finish without start, ...)
    #[error("allocation lifecycle violation: {0}")]
    InvariantViolation(&'static str),
}

impl MicroForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            MicroForgeError::ArenaExhausted { .. } => ErrorCategory::Resource,

            MicroForgeError::UnsupportedModel(_)
            | MicroForgeError::InvalidModelFile(_)
            | MicroForgeError::MissingRegistration(_) => ErrorCategory::Model,

            MicroForgeError::LifetimeLogicError { .. }
            | MicroForgeError::InvariantViolation(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is a resource limit (grow the arena and retry from scratch)
    pub fn is_resource_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Resource)
    }

    /// Check if this is a model error (the serialized graph needs fixing)
    pub fn is_model_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Model)
    }

    /// Check if this is an internal error (indicates a bug in caller or core)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Resource limit - a larger arena is required
    Resource,
    /// Model error - the serialized model or resolver needs fixing
    Model,
    /// Internal error - lifecycle misuse or a malformed graph invariant
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Model => write!(f, "Model"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Helper type alias for Results using MicroForgeError
pub type ForgeResult<T> = std::result::Result<T, MicroForgeError>;
