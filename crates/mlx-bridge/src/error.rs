//! Error Types for the MLX Bridge
//!
//! Every failure visible to the host runtime is one of seven classes.
//! Argument problems are detected before the engine is called; anything
//! the engine raises is re-typed into [`BridgeError::Engine`] at a single
//! point, keeping only the message text.
//!
//! ## Error Classes
//!
//! - `ArgumentError`: wrong count, shape or combination of arguments
//! - `TypeMismatchError`: wrong kind of value for a parameter
//! - `RaggedShapeError`: nested sequence with inconsistent lengths
//! - `IndexRangeError`: index outside its axis after wrap-around
//! - `UnsupportedDtypeError`: conversion not defined for a dtype
//! - `NotImplementedError`: recognized but unported operation
//! - `EngineError`: anything raised by the engine

use mlx_engine::EngineError;
use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Wrong argument count, shape or combination
    #[error("{message}")]
    Argument {
        /// Description of the problem
        message: String,
    },

    /// Wrong value category for a parameter
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected host type
        expected: String,
        /// Host type received
        actual: String,
    },

    /// Nested sequence with inconsistent lengths at some depth
    #[error("ragged nested sequence: expected length {expected} at depth {depth}, got {actual}")]
    RaggedShape {
        /// Nesting depth of the offending sequence
        depth: usize,
        /// Length established by the first sequence at that depth
        expected: usize,
        /// Length found
        actual: usize,
    },

    /// Index outside the valid range of an axis
    #[error("index {index} is out of bounds for axis {axis} with size {size}")]
    IndexRange {
        /// Index as written by the caller
        index: i64,
        /// Axis being indexed
        axis: usize,
        /// Length of that axis
        size: usize,
    },

    /// Conversion or operation not defined for a dtype
    #[error("unsupported dtype {dtype}: {context}")]
    UnsupportedDtype {
        /// Dtype name
        dtype: String,
        /// What was attempted
        context: String,
    },

    /// Operation recognized but not ported
    #[error("{operation} is not implemented")]
    NotImplemented {
        /// Name of the operation
        operation: String,
    },

    /// Any failure raised by the engine
    #[error("{0}")]
    Engine(String),
}

impl BridgeError {
    /// Create an argument error
    pub fn argument(message: impl Into<String>) -> Self {
        BridgeError::Argument {
            message: message.into(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        BridgeError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a ragged shape error
    pub fn ragged(depth: usize, expected: usize, actual: usize) -> Self {
        BridgeError::RaggedShape {
            depth,
            expected,
            actual,
        }
    }

    /// Create an index range error
    pub fn index_range(index: i64, axis: usize, size: usize) -> Self {
        BridgeError::IndexRange { index, axis, size }
    }

    /// Create an unsupported dtype error
    pub fn unsupported_dtype(dtype: impl std::fmt::Display, context: impl Into<String>) -> Self {
        BridgeError::UnsupportedDtype {
            dtype: dtype.to_string(),
            context: context.into(),
        }
    }

    /// Create a not implemented error
    pub fn not_implemented(operation: impl Into<String>) -> Self {
        BridgeError::NotImplemented {
            operation: operation.into(),
        }
    }

    /// Create an engine error from message text
    pub fn engine(message: impl Into<String>) -> Self {
        BridgeError::Engine(message.into())
    }

    /// Host-visible class name of this error
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Argument { .. } => "ArgumentError",
            BridgeError::TypeMismatch { .. } => "TypeMismatchError",
            BridgeError::RaggedShape { .. } => "RaggedShapeError",
            BridgeError::IndexRange { .. } => "IndexRangeError",
            BridgeError::UnsupportedDtype { .. } => "UnsupportedDtypeError",
            BridgeError::NotImplemented { .. } => "NotImplementedError",
            BridgeError::Engine(_) => "EngineError",
        }
    }

    pub fn is_argument_error(&self) -> bool {
        matches!(self, BridgeError::Argument { .. })
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, BridgeError::TypeMismatch { .. })
    }

    pub fn is_ragged(&self) -> bool {
        matches!(self, BridgeError::RaggedShape { .. })
    }

    pub fn is_index_error(&self) -> bool {
        matches!(self, BridgeError::IndexRange { .. })
    }

    pub fn is_dtype_error(&self) -> bool {
        matches!(self, BridgeError::UnsupportedDtype { .. })
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, BridgeError::NotImplemented { .. })
    }

    /// Check if this error came from the engine
    pub fn is_engine_error(&self) -> bool {
        matches!(self, BridgeError::Engine(_))
    }
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        BridgeError::Engine(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_names() {
        assert_eq!(BridgeError::argument("x").kind(), "ArgumentError");
        assert_eq!(BridgeError::type_mismatch("Array", "String").kind(), "TypeMismatchError");
        assert_eq!(BridgeError::ragged(1, 2, 1).kind(), "RaggedShapeError");
        assert_eq!(BridgeError::index_range(-6, 0, 5).kind(), "IndexRangeError");
        assert_eq!(BridgeError::unsupported_dtype("bfloat16", "to_a").kind(), "UnsupportedDtypeError");
        assert_eq!(BridgeError::not_implemented("savez").kind(), "NotImplementedError");
        assert_eq!(BridgeError::engine("boom").kind(), "EngineError");
    }

    #[test]
    fn test_engine_message_is_preserved() {
        let err: BridgeError = EngineError::invalid("reshape", "cannot reshape").into();
        assert!(err.is_engine_error());
        assert_eq!(err.to_string(), "[reshape] cannot reshape");
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            BridgeError::index_range(-6, 0, 5).to_string(),
            "index -6 is out of bounds for axis 0 with size 5"
        );
        assert!(BridgeError::type_mismatch("Array", "Hash").to_string().contains("expected Array"));
        assert!(BridgeError::ragged(1, 2, 1).is_ragged());
    }
}
