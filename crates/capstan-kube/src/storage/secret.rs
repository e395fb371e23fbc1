//! Release records in Kubernetes Secrets
//!
//! One Secret per revision, named `capstan.release.v1.<name>.v<revision>`,
//! in the release's namespace. The record travels gzip + base64 encoded
//! under the `release` key, with labels for list-based lookup.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};

use super::{decode_record, encode_record, storage_labels, ReleaseStorage};
use crate::error::{KubeError, Result};
use crate::release::ReleaseRecord;

const RELEASE_KEY: &str = "release";
const SECRET_TYPE: &str = "capstan.io/release.v1";

/// Secret-backed release storage
pub struct SecretStorage {
    client: kube::Client,
}

impl SecretStorage {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secret_name(name: &str, revision: u32) -> String {
        format!("capstan.release.v1.{}.v{}", name, revision)
    }

    fn to_secret(record: &ReleaseRecord) -> Result<Secret> {
        let mut string_data = BTreeMap::new();
        string_data.insert(RELEASE_KEY.to_string(), encode_record(record)?);

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(record.storage_key()),
                namespace: Some(record.namespace.clone()),
                labels: Some(storage_labels(record)),
                ..Default::default()
            },
            string_data: Some(string_data),
            type_: Some(SECRET_TYPE.to_string()),
            ..Default::default()
        })
    }

    fn from_secret(secret: &Secret) -> Result<ReleaseRecord> {
        let name = secret.metadata.name.as_deref().unwrap_or("<unnamed>");

        if let Some(data) = secret.data.as_ref().and_then(|d| d.get(RELEASE_KEY)) {
            let encoded = String::from_utf8(data.0.clone())
                .map_err(|err| KubeError::Serialization(format!("secret {}: {}", name, err)))?;
            return decode_record(&encoded);
        }

        // string_data is only visible on writes, but tolerate it for tests
        if let Some(encoded) = secret.string_data.as_ref().and_then(|d| d.get(RELEASE_KEY)) {
            return decode_record(encoded);
        }

        Err(KubeError::Storage(format!(
            "secret {} carries no release record",
            name
        )))
    }

    async fn list_release_secrets(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseRecord>> {
        let params = ListParams::default().labels(&format!(
            "app.kubernetes.io/managed-by=capstan,capstan.io/release-name={}",
            name
        ));

        let secrets = self
            .secrets(namespace)
            .list(&params)
            .await
            .map_err(|err| KubeError::from_kube(format!("list release records for {:?}", name), err))?;

        let mut records = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            records.push(Self::from_secret(secret)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl ReleaseStorage for SecretStorage {
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<ReleaseRecord> {
        let secret_name = Self::secret_name(name, revision);
        let secret = self
            .secrets(namespace)
            .get_opt(&secret_name)
            .await
            .map_err(|err| {
                KubeError::from_kube(format!("get release record {:?}", secret_name), err)
            })?;

        match secret {
            Some(secret) => Self::from_secret(&secret),
            None => Err(KubeError::ReleaseNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
        }
    }

    async fn latest(&self, namespace: &str, name: &str) -> Result<Option<ReleaseRecord>> {
        let records = self.list_release_secrets(namespace, name).await?;
        Ok(records.into_iter().max_by_key(|record| record.revision))
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseRecord>> {
        let mut records = self.list_release_secrets(namespace, name).await?;
        records.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(records)
    }

    async fn create(&self, record: &ReleaseRecord) -> Result<()> {
        let secret = Self::to_secret(record)?;
        self.secrets(&record.namespace)
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|err| {
                KubeError::from_kube(format!("create release record {:?}", record.storage_key()), err)
            })?;
        Ok(())
    }

    async fn update(&self, record: &ReleaseRecord) -> Result<()> {
        let api = self.secrets(&record.namespace);
        let name = record.storage_key();

        let mut secret = Self::to_secret(record)?;
        let existing = api.get(&name).await.map_err(|err| {
            KubeError::from_kube(format!("get release record {:?}", name), err)
        })?;
        secret.metadata.resource_version = existing.metadata.resource_version;

        api.replace(&name, &PostParams::default(), &secret)
            .await
            .map_err(|err| {
                KubeError::from_kube(format!("update release record {:?}", name), err)
            })?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        let secret_name = Self::secret_name(name, revision);
        match self
            .secrets(namespace)
            .delete(&secret_name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(KubeError::from_kube(
                format!("delete release record {:?}", secret_name),
                err,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseStatus;
    use capstan_core::ChartMetadata;

    fn record() -> ReleaseRecord {
        ReleaseRecord {
            name: "demo".to_string(),
            namespace: "app".to_string(),
            revision: 4,
            status: ReleaseStatus::Deployed,
            chart: ChartMetadata::new("demo", "2.0.0"),
            values: serde_json::json!({}),
            info_annotations: Default::default(),
            first_deployed: None,
            last_deployed: None,
            notes: String::new(),
            crd_manifests: Vec::new(),
            hook_manifests: Vec::new(),
            manifests: Vec::new(),
        }
    }

    #[test]
    fn test_secret_shape() {
        let secret = SecretStorage::to_secret(&record()).unwrap();

        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("capstan.release.v1.demo.v4")
        );
        assert_eq!(secret.metadata.namespace.as_deref(), Some("app"));
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE));
        assert!(secret
            .metadata
            .labels
            .as_ref()
            .unwrap()
            .contains_key("capstan.io/release-name"));
    }

    #[test]
    fn test_secret_round_trip_via_string_data() {
        let original = record();
        let secret = SecretStorage::to_secret(&original).unwrap();
        let decoded = SecretStorage::from_secret(&secret).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_from_secret_without_record_fails() {
        let empty = Secret::default();
        assert!(SecretStorage::from_secret(&empty).is_err());
    }
}
