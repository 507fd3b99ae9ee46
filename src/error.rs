//! Error types
//!
//! Only misuse that is detectable before any shared state changes is
//! reported through [`RuntimeError`]. Contract violations discovered in the
//! middle of graph construction (malformed argument lists, insertion into an
//! unattached taskpool) are fatal panics: continuing past them would build an
//! incorrect dependency graph. Invariant checks on hot paths are
//! `debug_assert!`s and compile out of release builds.

use thiserror::Error;

/// Errors surfaced by the runtime API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The configuration value is internally inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with it.
        reason: String,
    },

    /// The taskpool already has an execution context.
    #[error("taskpool is already attached to an execution context")]
    AlreadyAttached,
}

impl RuntimeError {
    /// Shorthand for [`RuntimeError::InvalidConfig`].
    #[inline]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
