//! Capstan Core - foundational types and contracts for the deployment engine
//!
//! This crate provides the cluster-independent pieces used throughout capstan:
//! - `Logger`: the levelled logging contract with grouped push/pop buffering
//! - `manifest`: YAML manifest stream splitting and document checks
//! - `ChartMetadata`: chart identity carried into release records
//! - `names`: DNS-1123 validation for release and resource names
//! - `exit_codes`: process exit codes for CLI wrappers

pub mod chart;
pub mod error;
pub mod exit_codes;
pub mod logger;
pub mod manifest;
pub mod names;

pub use chart::{normalize_notes, ChartMetadata};
pub use error::{CoreError, Result};
pub use logger::{Level, Logger, NullLogger, TracingLogger};
pub use manifest::{parse_document, split_manifests};
pub use names::{validate_release_name, validate_resource_name};
