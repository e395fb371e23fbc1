//! Error types for capstan-core

use thiserror::Error;

/// Result type for capstan-core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in the cluster-independent layer
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A manifest document could not be decoded into a usable mapping
    #[error("malformed manifest: {0}")]
    ManifestMalformed(String),

    /// A release or resource name failed validation
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
}
