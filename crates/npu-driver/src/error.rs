//! Error types for EdgeNPU driver operations

use npu_compiler::CompileError;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, NpuError>;

/// Errors that can occur while driving the NPU
#[derive(Debug, Error)]
pub enum NpuError {
    /// Null, zero-length or out-of-range argument
    #[error("Invalid parameter: {reason}")]
    InvalidParam {
        /// Reason for failure
        reason: String,
    },

    /// Operation issued before `init`
    #[error("Runtime not initialized")]
    NotInitialized,

    /// Conflicting operation while running or while a DMA is in flight
    #[error("Device busy, cannot {operation}")]
    Busy {
        /// Operation that was refused
        operation: String,
    },

    /// Polling deadline exceeded
    #[error("Operation timeout after {duration_us}us")]
    Timeout {
        /// Timeout in microseconds
        duration_us: u64,
    },

    /// Error status bit observed
    #[error("Hardware fault (error code {code:#010x})")]
    HwFault {
        /// Raw ERROR_CODE register value
        code: u32,
    },

    /// Content exceeds a configured buffer
    #[error("{what} overflow: {requested} bytes requested, capacity {capacity}")]
    Overflow {
        /// Buffer that would overflow
        what: &'static str,
        /// Requested size
        requested: u64,
        /// Configured capacity
        capacity: u64,
    },

    /// Malformed model binary
    #[error("Invalid model: {reason}")]
    InvalidModel {
        /// Reason for failure
        reason: String,
    },

    /// Unsupported operation or opcode
    #[error("Invalid operation: {reason}")]
    InvalidOp {
        /// Reason for failure
        reason: String,
    },

    /// DMA engine or runtime not ready
    #[error("Not ready: {reason}")]
    NotReady {
        /// Reason for failure
        reason: String,
    },

    /// DMA transfer failed
    #[error("DMA error: {reason}")]
    Dma {
        /// Reason for failure
        reason: String,
    },

    /// Execution context is in a state that forbids the operation
    #[error("Device in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// I/O error while mapping or reading files
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Layer lowering failed
    #[error("Compile error: {source}")]
    Compile {
        /// Underlying compiler error
        #[from]
        source: CompileError,
    },
}

impl NpuError {
    /// Create an invalid parameter error
    pub fn invalid_param(reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            reason: reason.into(),
        }
    }

    /// Create a busy error
    pub fn busy(operation: impl Into<String>) -> Self {
        Self::Busy {
            operation: operation.into(),
        }
    }

    /// Create an invalid model error
    pub fn invalid_model(reason: impl Into<String>) -> Self {
        Self::InvalidModel {
            reason: reason.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_op(reason: impl Into<String>) -> Self {
        Self::InvalidOp {
            reason: reason.into(),
        }
    }

    /// Create a not ready error
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady {
            reason: reason.into(),
        }
    }

    /// Create a DMA error
    pub fn dma(reason: impl Into<String>) -> Self {
        Self::Dma {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Firmware status code for this error.
    ///
    /// Negative codes shared with the on-device firmware, for shims that
    /// report errors as integers.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::InvalidParam { .. } | Self::InvalidModel { .. } => -2,
            Self::Timeout { .. } => -3,
            Self::Busy { .. } => -4,
            Self::HwFault { .. } => -5,
            Self::Dma { .. } => -6,
            Self::Overflow { .. } => -7,
            Self::InvalidOp { .. } => -8,
            Self::NotInitialized | Self::NotReady { .. } => -9,
            Self::Compile { source } => match source {
                CompileError::SequenceOverflow { .. } => -7,
                CompileError::UnsupportedLayer { .. } => -8,
                CompileError::InvalidLayer { .. } => -2,
            },
            Self::InvalidState { .. } | Self::Io { .. } => -1,
        }
    }
}
