//! Error types for capstan-kube

use std::time::Duration;

use thiserror::Error;

/// Result type for capstan-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while planning and executing a release
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// A manifest document could not be adapted into a resource
    #[error("malformed manifest: {0}")]
    ManifestMalformed(String),

    /// Discovery has no mapping for the document's apiVersion/kind
    #[error("no REST mapping for {api_version}/{kind}")]
    NoRestMapping { api_version: String, kind: String },

    /// The manifest document carries no metadata.name
    #[error("manifest document for {kind:?} is missing metadata.name")]
    MissingName { kind: String },

    /// A live object blocks the plan and cannot be adopted
    #[error("resource conflict for {id}: {reason}")]
    ResourceConflict { id: String, reason: String },

    /// Adding the edge would make the plan graph cyclic
    #[error("dependency cycle: edge {from:?} -> {to:?}")]
    Cycle { from: String, to: String },

    /// An edge references an operation that was never added
    #[error("unknown operation {id:?} in plan graph")]
    UnknownOperation { id: String },

    /// A Kubernetes API status error, normalised so it can be cached and replayed
    #[error("{context}: api error (code {code}, reason {reason}): {message}")]
    ApiStatus {
        context: String,
        code: u16,
        reason: String,
        message: String,
    },

    /// The request never produced an API status (connection, TLS, serialization)
    #[error("{context}: transport error: {message}")]
    Transport { context: String, message: String },

    /// A tracking operation ran out of time
    #[error("timed out after {after:?} waiting for {what}")]
    TrackTimeout { what: String, after: Duration },

    /// A tracked resource reached a state it cannot recover from
    #[error("resource {what} failed while being tracked: {reason}")]
    TrackFailed { what: String, reason: String },

    /// The invocation was canceled before the plan finished
    #[error("operation canceled")]
    Canceled,

    /// Plan execution stopped on the first failed operation
    #[error("plan execution failed for [{}]: {source}", .failed.join(", "))]
    ExecutionFailed {
        failed: Vec<String>,
        #[source]
        source: Box<KubeError>,
    },

    /// No revision of the release exists
    #[error("release {name:?} not found in namespace {namespace:?}")]
    ReleaseNotFound { name: String, namespace: String },

    /// Release history storage failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Encoding or decoding a release record failed
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] capstan_core::CoreError),

    /// IO error, e.g. writing a plan debug dump
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Raw client error from discovery or transport setup
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

impl KubeError {
    /// Normalise a raw client error into a cacheable form, prefixed with the
    /// action context
    pub(crate) fn from_kube(context: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => KubeError::ApiStatus {
                context: context.into(),
                code: resp.code,
                reason: resp.reason,
                message: resp.message,
            },
            other => KubeError::Transport {
                context: context.into(),
                message: other.to_string(),
            },
        }
    }

    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::ApiStatus { code, .. } => *code == 404,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this is a conflict error (409), e.g. a rejected apply
    pub fn is_conflict(&self) -> bool {
        match self {
            KubeError::ApiStatus { code, .. } => *code == 409,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}
