//! Resource identity
//!
//! A `ResourceID` names one Kubernetes object under management:
//! `(group, version, kind, namespace, name)`. The version participates in
//! identity, so a new version introduced by a CRD upgrade is a distinct key.
//! The namespace is empty exactly when the kind is cluster-scoped.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;

use crate::error::{KubeError, Result};
use crate::mapper::{ResolvedResource, RestMapper};

/// Identity of a Kubernetes object, with lazy REST mapping resolution
#[derive(Clone)]
pub struct ResourceID {
    group: String,
    version: String,
    kind: String,
    namespace: String,
    name: String,

    mapper: Arc<dyn RestMapper>,
    resolved: Arc<tokio::sync::OnceCell<ResolvedResource>>,
}

impl ResourceID {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        mapper: Arc<dyn RestMapper>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            mapper,
            resolved: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Namespace, empty for cluster-scoped objects
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `apiVersion` as it appears in manifests
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }

    /// Stable identity: `group/version/kind/namespace/name`, empty segments
    /// preserved. Used as plan-vertex key.
    pub fn id(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.group, self.version, self.kind, self.namespace, self.name
        )
    }

    /// Identity including the API version, used as cache and lock key
    pub fn version_id(&self) -> String {
        self.id()
    }

    /// Short form for messages: `kind/name`, namespace-qualified when set
    pub fn human_id(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.kind, self.name)
        } else {
            format!("{}/{}/{}", self.namespace, self.kind, self.name)
        }
    }

    /// Whether this identity names a CustomResourceDefinition
    pub fn is_crd(&self) -> bool {
        self.group == "apiextensions.k8s.io" && self.kind == "CustomResourceDefinition"
    }

    /// API resource coordinates, resolved through the mapper on first use
    pub async fn api_resource(&self) -> Result<ApiResource> {
        Ok(self.resolve().await?.api_resource)
    }

    /// Whether the kind is namespaced, resolved through the mapper on first use
    pub async fn namespaced(&self) -> Result<bool> {
        Ok(self.resolve().await?.namespaced)
    }

    /// Resolve the REST mapping, retrying once after a mapper reset: the
    /// no-match may be stale when a CRD was just installed.
    pub(crate) async fn resolve(&self) -> Result<ResolvedResource> {
        self.resolved
            .get_or_try_init(|| async {
                let gvk = self.group_version_kind();

                if let Some(resolved) = self.mapper.resolve(&gvk).await? {
                    return Ok(resolved);
                }

                self.mapper.reset().await?;
                match self.mapper.resolve(&gvk).await? {
                    Some(resolved) => Ok(resolved),
                    None => Err(KubeError::NoRestMapping {
                        api_version: self.api_version(),
                        kind: self.kind.clone(),
                    }),
                }
            })
            .await
            .cloned()
    }

    /// Seed the resolution memo, for callers that already consulted the mapper
    pub(crate) fn prime(&self, resolved: ResolvedResource) {
        let _ = self.resolved.set(resolved);
    }

    fn key(&self) -> (&str, &str, &str, &str, &str) {
        (
            &self.group,
            &self.version,
            &self.kind,
            &self.namespace,
            &self.name,
        )
    }
}

impl std::fmt::Debug for ResourceID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceID")
            .field("group", &self.group)
            .field("version", &self.version)
            .field("kind", &self.kind)
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish()
    }
}

impl std::fmt::Display for ResourceID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.human_id())
    }
}

impl PartialEq for ResourceID {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ResourceID {}

impl Hash for ResourceID {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ResourceID {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceID {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Split a manifest `apiVersion` into group and version
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}
