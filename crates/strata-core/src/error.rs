//! # Error Types
//!
//! Domain-specific error types for strata-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  strata-core errors (this file)                                        │
//! │  ├── CoreError        - Key paths and value encoding                   │
//! │  └── ValidationError  - Resource values that fail their kind's rules   │
//! │                                                                         │
//! │  strata-sync errors (separate crate)                                   │
//! │  └── SyncError        - Config, transport and protocol failures        │
//! │                                                                         │
//! │  Flow: ValidationError → deletion (never surfaced)                     │
//! │        CoreError → SyncError::InvalidMessage (connection-fatal)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while converting keys and values to and from their
/// serialized forms.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The key kind has no default path.
    ///
    /// ## When This Occurs
    /// - A `Node` record reaches the cache without passing through
    ///   validation (nodes are composite and only their derived keys
    ///   are ever published)
    #[error("Key {kind} has no default path")]
    NoDefaultPath { kind: &'static str },

    /// A path could not be parsed back into a key.
    #[error("Cannot parse key path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A value could not be encoded or decoded.
    #[error("Value encoding failed: {0}")]
    ValueEncoding(#[from] serde_json::Error),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Resource validation errors.
///
/// The validation stage never propagates these: an update that fails
/// validation is rewritten into a deletion of its key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} bytes")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., an IP that doesn't parse).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// The value variant doesn't belong to the key's kind.
    #[error("{kind} keys cannot hold a {actual} value")]
    WrongValueKind {
        kind: &'static str,
        actual: &'static str,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::NoDefaultPath { kind: "node" };
        assert_eq!(err.to_string(), "Key node has no default path");

        let err = CoreError::InvalidPath {
            path: "calico".to_string(),
            reason: "must start with '/'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot parse key path 'calico': must start with '/'"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "hostname".to_string(),
        };
        assert_eq!(err.to_string(), "hostname is required");

        let err = ValidationError::WrongValueKind {
            kind: "host_ip",
            actual: "text",
        };
        assert_eq!(err.to_string(), "host_ip keys cannot hold a text value");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "name".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
