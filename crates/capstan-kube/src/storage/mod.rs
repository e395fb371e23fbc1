//! Release history storage
//!
//! A release's revisions are persisted through the [`ReleaseStorage`]
//! collaborator, keyed by `(namespace, name, revision)`. The engine writes
//! one record per status transition its release operations perform.
//!
//! Drivers:
//! - [`SecretStorage`]: records in Kubernetes Secrets, gzip + base64 JSON,
//!   compatible in shape with the legacy chart history format
//! - [`MockReleaseStorage`]: in-memory, with operation counters for tests

mod mock;
mod secret;

pub use mock::{MockReleaseStorage, OperationCounts};
pub use secret::SecretStorage;

use async_trait::async_trait;

use crate::error::{KubeError, Result};
use crate::release::ReleaseRecord;

/// Release history persistence contract
#[async_trait]
pub trait ReleaseStorage: Send + Sync {
    /// Fetch one revision; `ReleaseNotFound` when it does not exist
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<ReleaseRecord>;

    /// The highest revision of a release, or `None` when the release has none
    async fn latest(&self, namespace: &str, name: &str) -> Result<Option<ReleaseRecord>>;

    /// All revisions of a release, newest first
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseRecord>>;

    /// Persist a new revision record
    async fn create(&self, record: &ReleaseRecord) -> Result<()>;

    /// Overwrite an existing revision record
    async fn update(&self, record: &ReleaseRecord) -> Result<()>;

    /// Remove one revision record; absent revisions are a no-op
    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()>;
}

/// Serialize a record for storage: JSON, gzip, base64
pub fn encode_record(record: &ReleaseRecord) -> Result<String> {
    use std::io::Write;

    let json =
        serde_json::to_vec(record).map_err(|err| KubeError::Serialization(err.to_string()))?;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map(|compressed| base64::Engine::encode(&base64::engine::general_purpose::STANDARD, compressed))
        .map_err(|err| KubeError::Serialization(err.to_string()))
}

/// Decode a record from its stored form
pub fn decode_record(data: &str) -> Result<ReleaseRecord> {
    use std::io::Read;

    let compressed = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
        .map_err(|err| KubeError::Serialization(format!("base64 decode: {}", err)))?;

    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|err| KubeError::Serialization(format!("gunzip: {}", err)))?;

    serde_json::from_slice(&json).map_err(|err| KubeError::Serialization(err.to_string()))
}

/// Labels applied to every storage object for lookup
pub fn storage_labels(record: &ReleaseRecord) -> std::collections::BTreeMap<String, String> {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "capstan".to_string(),
    );
    labels.insert("capstan.io/release-name".to_string(), record.name.clone());
    labels.insert(
        "capstan.io/release-revision".to_string(),
        record.revision.to_string(),
    );
    labels.insert("capstan.io/release-status".to_string(), record.status.as_str().to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseStatus;
    use capstan_core::ChartMetadata;

    fn record(revision: u32, status: ReleaseStatus) -> ReleaseRecord {
        ReleaseRecord {
            name: "demo".to_string(),
            namespace: "app".to_string(),
            revision,
            status,
            chart: ChartMetadata::new("demo", "1.0.0"),
            values: serde_json::json!({"replicas": 2}),
            info_annotations: Default::default(),
            first_deployed: None,
            last_deployed: None,
            notes: String::new(),
            crd_manifests: Vec::new(),
            hook_manifests: Vec::new(),
            manifests: vec!["apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n".to_string()],
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let original = record(3, ReleaseStatus::Deployed);
        let encoded = encode_record(&original).unwrap();
        let decoded = decode_record(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_record("not base64 at all!!!").is_err());

        let not_gzip =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"plain bytes");
        assert!(decode_record(&not_gzip).is_err());
    }

    #[test]
    fn test_storage_labels() {
        let labels = storage_labels(&record(2, ReleaseStatus::Superseded));
        assert_eq!(labels.get("capstan.io/release-name").unwrap(), "demo");
        assert_eq!(labels.get("capstan.io/release-revision").unwrap(), "2");
        assert_eq!(labels.get("capstan.io/release-status").unwrap(), "superseded");
    }

    #[tokio::test]
    async fn test_mock_storage_lifecycle() {
        let storage = MockReleaseStorage::new();

        assert!(storage.latest("app", "demo").await.unwrap().is_none());

        storage.create(&record(1, ReleaseStatus::PendingInstall)).await.unwrap();
        storage.update(&record(1, ReleaseStatus::Deployed)).await.unwrap();
        storage.create(&record(2, ReleaseStatus::PendingUpgrade)).await.unwrap();

        let latest = storage.latest("app", "demo").await.unwrap().unwrap();
        assert_eq!(latest.revision, 2);

        let history = storage.history("app", "demo").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].revision, 2, "history is newest first");
        assert_eq!(history[1].status, ReleaseStatus::Deployed);

        storage.delete("app", "demo", 2).await.unwrap();
        let latest = storage.latest("app", "demo").await.unwrap().unwrap();
        assert_eq!(latest.revision, 1);

        let err = storage.get("app", "demo", 9).await.unwrap_err();
        assert!(matches!(err, KubeError::ReleaseNotFound { .. }));
    }
}
