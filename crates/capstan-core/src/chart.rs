//! Chart identity carried into release records

use serde::{Deserialize, Serialize};

/// Metadata of the chart a release was rendered from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name
    pub name: String,

    /// Chart version
    pub version: String,

    /// Version of the application the chart deploys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

impl ChartMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            app_version: None,
        }
    }

    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = Some(app_version.into());
        self
    }
}

/// Trim trailing whitespace from rendered release notes
pub fn normalize_notes(notes: &str) -> String {
    notes.trim_end().to_string()
}
