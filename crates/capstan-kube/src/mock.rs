//! In-memory test collaborators
//!
//! `MockCluster` implements the raw dynamic API over a hash map and
//! `StaticMapper` implements REST mapping from a fixed table, so plans can be
//! built and executed in unit tests without a cluster. Both are exported as
//! library code so downstream crates can test against the engine too.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
use kube::api::{DeleteParams, DynamicObject, ObjectMeta, PatchParams};
use kube::core::{ErrorResponse, GroupVersionKind, TypeMeta};
use kube::discovery::ApiResource;

use crate::client::{ApiTarget, DynamicApi};
use crate::error::Result;
use crate::mapper::{ResolvedResource, RestMapper};
use crate::resource::parse_api_version;

/// In-memory cluster for tests
///
/// Applied workload objects get a synthesized ready status, imitating the
/// controllers that would reconcile them on a real cluster. Disable with
/// [`MockCluster::set_auto_ready`] to exercise tracking timeouts.
pub struct MockCluster {
    objects: Mutex<HashMap<String, DynamicObject>>,
    rpcs: AtomicUsize,
    auto_ready: Mutex<bool>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            rpcs: AtomicUsize::new(0),
            auto_ready: Mutex::new(true),
        }
    }

    /// Build a minimal dynamic object for seeding and applying
    pub fn object(
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(String::from),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    /// Place an object into the cluster as-is
    pub fn seed(&self, obj: DynamicObject) {
        let key = Self::object_key(&obj);
        self.objects.lock().unwrap().insert(key, obj);
    }

    /// Place an object owned by the given field manager
    pub fn seed_managed(&self, mut obj: DynamicObject, manager: &str) {
        obj.metadata
            .managed_fields
            .get_or_insert_with(Vec::new)
            .push(ManagedFieldsEntry {
                manager: Some(manager.to_string()),
                ..Default::default()
            });
        self.seed(obj);
    }

    /// Whether applied workloads get a synthesized ready status
    pub fn set_auto_ready(&self, auto_ready: bool) {
        *self.auto_ready.lock().unwrap() = auto_ready;
    }

    /// Total API calls served so far
    pub fn rpc_count(&self) -> usize {
        self.rpcs.load(Ordering::SeqCst)
    }

    /// Whether an object exists, by `apiVersion/kind/namespace/name`
    pub fn contains(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> bool {
        let (group, version) = parse_api_version(api_version);
        let key = format!("{}/{}/{}/{}/{}", group, version, kind, namespace, name);
        self.objects.lock().unwrap().contains_key(&key)
    }

    /// Number of objects currently in the cluster
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    fn object_key(obj: &DynamicObject) -> String {
        let (group, version) = obj
            .types
            .as_ref()
            .map(|t| parse_api_version(&t.api_version))
            .unwrap_or_default();
        let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
        format!(
            "{}/{}/{}/{}/{}",
            group,
            version,
            kind,
            obj.metadata.namespace.as_deref().unwrap_or(""),
            obj.metadata.name.as_deref().unwrap_or("")
        )
    }

    fn target_key(target: &ApiTarget, name: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            target.api_resource.group,
            target.api_resource.version,
            target.api_resource.kind,
            target.namespace.as_deref().unwrap_or(""),
            name
        )
    }

    fn not_found(name: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{:?} not found", name),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }

    fn synthesize_ready_status(obj: &mut DynamicObject) {
        let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
        let data = match obj.data.as_object_mut() {
            Some(data) => data,
            None => return,
        };

        let status = match kind {
            "Deployment" | "StatefulSet" | "ReplicaSet" => {
                let replicas = data
                    .get("spec")
                    .and_then(|s| s.get("replicas"))
                    .and_then(|r| r.as_i64())
                    .unwrap_or(1);
                serde_json::json!({"replicas": replicas, "readyReplicas": replicas})
            }
            "DaemonSet" => {
                serde_json::json!({"desiredNumberScheduled": 1, "numberReady": 1})
            }
            "Job" => {
                serde_json::json!({"succeeded": 1, "conditions": [{"type": "Complete", "status": "True"}]})
            }
            "Pod" => {
                serde_json::json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]})
            }
            "PersistentVolumeClaim" => serde_json::json!({"phase": "Bound"}),
            _ => return,
        };

        data.insert("status".to_string(), status);
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DynamicApi for MockCluster {
    async fn get(&self, target: &ApiTarget, name: &str) -> kube::Result<DynamicObject> {
        self.rpcs.fetch_add(1, Ordering::SeqCst);
        let key = Self::target_key(target, name);
        self.objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    async fn apply(
        &self,
        target: &ApiTarget,
        name: &str,
        obj: &DynamicObject,
        params: &PatchParams,
    ) -> kube::Result<DynamicObject> {
        self.rpcs.fetch_add(1, Ordering::SeqCst);
        let key = Self::target_key(target, name);

        let mut applied = obj.clone();
        applied.metadata.name = Some(name.to_string());
        applied.metadata.namespace = target.namespace.clone();

        let mut objects = self.objects.lock().unwrap();

        // Union of prior owners plus the applying manager
        let mut managers: Vec<ManagedFieldsEntry> = objects
            .get(&key)
            .and_then(|existing| existing.metadata.managed_fields.clone())
            .unwrap_or_default();
        if let Some(manager) = &params.field_manager {
            if !managers
                .iter()
                .any(|entry| entry.manager.as_deref() == Some(manager))
            {
                managers.push(ManagedFieldsEntry {
                    manager: Some(manager.clone()),
                    ..Default::default()
                });
            }
        }
        applied.metadata.managed_fields = Some(managers);

        if *self.auto_ready.lock().unwrap() {
            Self::synthesize_ready_status(&mut applied);
        }

        if !params.dry_run {
            objects.insert(key, applied.clone());
        }
        Ok(applied)
    }

    async fn merge_patch(
        &self,
        target: &ApiTarget,
        name: &str,
        patch: &serde_json::Value,
        _params: &PatchParams,
    ) -> kube::Result<DynamicObject> {
        self.rpcs.fetch_add(1, Ordering::SeqCst);
        let key = Self::target_key(target, name);
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(&key).ok_or_else(|| Self::not_found(name))?;

        if let Some(annotations) = patch
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.as_object())
        {
            let target_annotations = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
            for (k, v) in annotations {
                match v.as_str() {
                    Some(value) => {
                        target_annotations.insert(k.clone(), value.to_string());
                    }
                    None => {
                        target_annotations.remove(k);
                    }
                }
            }
        }

        if let Some(rest) = patch.as_object() {
            for (k, v) in rest {
                if k == "metadata" {
                    continue;
                }
                json_merge(&mut obj.data[k.as_str()], v);
            }
        }

        Ok(obj.clone())
    }

    async fn delete(
        &self,
        target: &ApiTarget,
        name: &str,
        _params: &DeleteParams,
    ) -> kube::Result<()> {
        self.rpcs.fetch_add(1, Ordering::SeqCst);
        let key = Self::target_key(target, name);
        self.objects
            .lock()
            .unwrap()
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name))
    }
}

/// Recursive JSON merge-patch: objects merge, null deletes, anything else
/// replaces
fn json_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(entries) => {
            if !target.is_object() {
                *target = serde_json::json!({});
            }
            let target_map = target.as_object_mut().unwrap();
            for (k, v) in entries {
                if v.is_null() {
                    target_map.remove(k);
                } else {
                    json_merge(target_map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[derive(Clone)]
struct StaticMapping {
    plural: String,
    namespaced: bool,
}

/// REST mapper over a fixed table, with scripted CRD installs
///
/// Kinds registered with [`StaticMapper::register_after_reset`] stay
/// unresolvable until the next `reset()`, which is exactly how a freshly
/// applied CRD behaves against a stale discovery cache.
pub struct StaticMapper {
    known: Mutex<HashMap<(String, String, String), StaticMapping>>,
    pending: Mutex<HashMap<(String, String, String), StaticMapping>>,
    resets: AtomicUsize,
}

impl StaticMapper {
    pub fn new() -> Self {
        Self {
            known: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            resets: AtomicUsize::new(0),
        }
    }

    /// Mapper pre-populated with the builtin kinds the engine meets in tests
    pub fn with_builtins() -> Self {
        let mapper = Self::new();
        for (group, version, kind, plural, namespaced) in [
            ("", "v1", "ConfigMap", "configmaps", true),
            ("", "v1", "Secret", "secrets", true),
            ("", "v1", "Service", "services", true),
            ("", "v1", "Pod", "pods", true),
            ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
            ("", "v1", "ServiceAccount", "serviceaccounts", true),
            ("", "v1", "Namespace", "namespaces", false),
            ("apps", "v1", "Deployment", "deployments", true),
            ("apps", "v1", "StatefulSet", "statefulsets", true),
            ("apps", "v1", "DaemonSet", "daemonsets", true),
            ("apps", "v1", "ReplicaSet", "replicasets", true),
            ("batch", "v1", "Job", "jobs", true),
            (
                "apiextensions.k8s.io",
                "v1",
                "CustomResourceDefinition",
                "customresourcedefinitions",
                false,
            ),
        ] {
            mapper.register(group, version, kind, plural, namespaced);
        }
        mapper
    }

    pub fn register(&self, group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) {
        self.known.lock().unwrap().insert(
            (group.to_string(), version.to_string(), kind.to_string()),
            StaticMapping {
                plural: plural.to_string(),
                namespaced,
            },
        );
    }

    /// Register a kind that only resolves after the next mapper reset
    pub fn register_after_reset(
        &self,
        group: &str,
        version: &str,
        kind: &str,
        plural: &str,
        namespaced: bool,
    ) {
        self.pending.lock().unwrap().insert(
            (group.to_string(), version.to_string(), kind.to_string()),
            StaticMapping {
                plural: plural.to_string(),
                namespaced,
            },
        );
    }

    /// How many times the mapper was reset
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Default for StaticMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RestMapper for StaticMapper {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResolvedResource>> {
        let key = (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone());
        Ok(self.known.lock().unwrap().get(&key).map(|mapping| {
            let api_version = if gvk.group.is_empty() {
                gvk.version.clone()
            } else {
                format!("{}/{}", gvk.group, gvk.version)
            };
            ResolvedResource {
                api_resource: ApiResource {
                    group: gvk.group.clone(),
                    version: gvk.version.clone(),
                    api_version,
                    kind: gvk.kind.clone(),
                    plural: mapping.plural.clone(),
                },
                namespaced: mapping.namespaced,
            }
        }))
    }

    async fn reset(&self) -> Result<()> {
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        self.known.lock().unwrap().extend(pending);
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
