//! Error types for parsing and validating nodelink values.

use thiserror::Error;

/// Result type for value parsing.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors raised while constructing identity and addressing values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TypesError {
    /// Node id is empty or contains whitespace.
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    /// Persistent node id does not have the 32 lowercase hex digit form.
    #[error("invalid persistent node id {0:?}: expected 32 lowercase hex digits")]
    InvalidPersistentId(String),

    /// Legacy `host:instance` identifier could not be parsed.
    #[error("invalid legacy node id: {0:?}")]
    InvalidLegacyId(String),

    /// Network contact string could not be parsed.
    #[error("invalid network contact {input:?}: {reason}")]
    InvalidContact { input: String, reason: String },

    /// Contact point string could not be parsed.
    #[error("invalid contact point {input:?}: {reason}")]
    InvalidContactPoint { input: String, reason: String },

    /// Unknown response result code.
    #[error("unknown result code: {0}")]
    UnknownResultCode(u16),

    /// Unknown communication type name.
    #[error("unknown communication type: {0:?}")]
    UnknownCommunicationType(String),
}

impl TypesError {
    /// Create an invalid contact error.
    pub fn contact(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidContact {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid contact point error.
    pub fn contact_point(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidContactPoint {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
