//! Engine Error Types
//!
//! Every fallible engine entry point returns [`EngineResult`]. The binding
//! layer never inspects the variant of an `EngineError`; it re-raises the
//! message text as a single host-level error. The variants exist so that
//! engine implementations and their tests can be precise.

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by an engine implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Invalid argument value (bad axis, bad size, bad combination)
    #[error("[{op}] {message}")]
    InvalidArgument {
        /// Operation that rejected the argument
        op: String,
        /// Description of the problem
        message: String,
    },

    /// Shapes cannot be combined
    #[error("[{op}] shapes {lhs:?} and {rhs:?} cannot be broadcast")]
    Broadcast {
        /// Operation name
        op: String,
        /// Left shape
        lhs: Vec<usize>,
        /// Right shape
        rhs: Vec<usize>,
    },

    /// Operation not defined for the dtype
    #[error("[{op}] unsupported dtype {dtype}")]
    Dtype {
        /// Operation name
        op: String,
        /// Offending dtype name
        dtype: String,
    },

    /// Operation is not provided by this engine
    #[error("[{op}] not supported by the {backend} backend")]
    Unsupported {
        /// Operation name
        op: String,
        /// Backend name
        backend: String,
    },

    /// File or serialization failure
    #[error("[{op}] {message}")]
    Io {
        /// Operation name
        op: String,
        /// Underlying message
        message: String,
    },

    /// A callback supplied by the caller failed
    #[error("{0}")]
    Callback(String),

    /// Any other runtime failure
    #[error("{0}")]
    Runtime(String),
}

impl EngineError {
    /// Create an invalid argument error
    pub fn invalid(op: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidArgument {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Create a broadcast error
    pub fn broadcast(op: impl Into<String>, lhs: &[usize], rhs: &[usize]) -> Self {
        EngineError::Broadcast {
            op: op.into(),
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }
    }

    /// Create a dtype error
    pub fn dtype(op: impl Into<String>, dtype: impl std::fmt::Display) -> Self {
        EngineError::Dtype {
            op: op.into(),
            dtype: dtype.to_string(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(op: impl Into<String>, backend: impl Into<String>) -> Self {
        EngineError::Unsupported {
            op: op.into(),
            backend: backend.into(),
        }
    }

    /// Create an IO error
    pub fn io(op: impl Into<String>, message: impl std::fmt::Display) -> Self {
        EngineError::Io {
            op: op.into(),
            message: message.to_string(),
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        EngineError::Runtime(message.into())
    }

    /// Check if this error came from a caller-supplied callback
    pub fn is_callback(&self) -> bool {
        matches!(self, EngineError::Callback(_))
    }

    /// Check if the engine lacks the operation entirely
    pub fn is_unsupported(&self) -> bool {
        matches!(self, EngineError::Unsupported { .. })
    }
}
