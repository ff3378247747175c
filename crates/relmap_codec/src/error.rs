//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a row to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes into a row.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A field held a value of an unexpected scalar kind.
    #[error("field `{field}` has kind {actual}, expected {expected}")]
    FieldKind {
        /// Name of the offending field.
        field: String,
        /// The kind that was found.
        actual: &'static str,
        /// The kind that was required.
        expected: &'static str,
    },
}

impl CodecError {
    /// Creates an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Creates a field kind mismatch error.
    pub fn field_kind(field: impl Into<String>, actual: &'static str, expected: &'static str) -> Self {
        Self::FieldKind {
            field: field.into(),
            actual,
            expected,
        }
    }
}
