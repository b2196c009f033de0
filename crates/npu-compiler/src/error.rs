//! Error types for layer compilation

use thiserror::Error;

/// Result type alias for compiler operations
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors that can occur while lowering a layer to instructions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Layer descriptor is inconsistent or out of range
    #[error("Invalid layer: {reason}")]
    InvalidLayer {
        /// Reason for failure
        reason: String,
    },

    /// Layer kind has no lowering
    #[error("Unsupported layer: {kind}")]
    UnsupportedLayer {
        /// Layer kind name
        kind: String,
    },

    /// Instruction sequence would exceed its bound
    #[error("Instruction sequence exceeds bound of {bound} instructions")]
    SequenceOverflow {
        /// Configured bound
        bound: usize,
    },
}

impl CompileError {
    /// Create an invalid layer error
    pub fn invalid_layer(reason: impl Into<String>) -> Self {
        Self::InvalidLayer {
            reason: reason.into(),
        }
    }

    /// Create an unsupported layer error
    pub fn unsupported(kind: impl Into<String>) -> Self {
        Self::UnsupportedLayer { kind: kind.into() }
    }
}
