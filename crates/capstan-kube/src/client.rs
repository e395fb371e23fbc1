//! Kube client facade
//!
//! All cluster access goes through [`KubeClient`]. It layers two contracts on
//! top of the raw dynamic API:
//!
//! - **Per-resource serialisation.** Every call locks its resource's mutex
//!   (keyed by version id) for the full duration. Concurrent writes to the
//!   same object from one invocation are almost always a plan bug;
//!   serialising them keeps errors deterministic and the read cache coherent.
//! - **Invocation-lifetime read cache.** Results, including errors, are
//!   cached by version id. `Get` with `try_cache` replays the cached result
//!   without an RPC. Mutating calls overwrite the entry; `delete` evicts it.
//!   Dry-run calls never touch the cache.
//!
//! Server-Side Apply backs both `create` and `apply`, with ownership forced
//! under this engine's field manager. A successful non-dry-run apply of a
//! CRD resets the REST mapper so new kinds become resolvable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PropagationPolicy};
use kube::discovery::ApiResource;

use crate::error::{KubeError, Result};
use crate::mapper::{DiscoveryRestMapper, RestMapper};
use crate::resource::ResourceID;

/// Field manager name for Server-Side Apply
pub const DEFAULT_FIELD_MANAGER: &str = "nelm";

/// Fully resolved coordinates for one dynamic API call
#[derive(Debug, Clone)]
pub struct ApiTarget {
    pub api_resource: ApiResource,

    /// `None` for cluster-scoped resources
    pub namespace: Option<String>,
}

/// Raw dynamic calls against the cluster
///
/// The facade owns locking, caching and error normalisation; implementations
/// of this trait only move bytes. The real implementation wraps
/// `kube::Api<DynamicObject>`; tests substitute an in-memory cluster.
#[async_trait]
pub trait DynamicApi: Send + Sync {
    async fn get(&self, target: &ApiTarget, name: &str) -> kube::Result<DynamicObject>;

    async fn apply(
        &self,
        target: &ApiTarget,
        name: &str,
        obj: &DynamicObject,
        params: &PatchParams,
    ) -> kube::Result<DynamicObject>;

    async fn merge_patch(
        &self,
        target: &ApiTarget,
        name: &str,
        patch: &serde_json::Value,
        params: &PatchParams,
    ) -> kube::Result<DynamicObject>;

    async fn delete(
        &self,
        target: &ApiTarget,
        name: &str,
        params: &DeleteParams,
    ) -> kube::Result<()>;
}

/// Dynamic API implementation over a live cluster connection
pub struct ClusterApi {
    client: kube::Client,
}

impl ClusterApi {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api_for(&self, target: &ApiTarget) -> Api<DynamicObject> {
        match &target.namespace {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, &target.api_resource)
            }
            None => Api::all_with(self.client.clone(), &target.api_resource),
        }
    }
}

#[async_trait]
impl DynamicApi for ClusterApi {
    async fn get(&self, target: &ApiTarget, name: &str) -> kube::Result<DynamicObject> {
        self.api_for(target).get(name).await
    }

    async fn apply(
        &self,
        target: &ApiTarget,
        name: &str,
        obj: &DynamicObject,
        params: &PatchParams,
    ) -> kube::Result<DynamicObject> {
        self.api_for(target).patch(name, params, &Patch::Apply(obj)).await
    }

    async fn merge_patch(
        &self,
        target: &ApiTarget,
        name: &str,
        patch: &serde_json::Value,
        params: &PatchParams,
    ) -> kube::Result<DynamicObject> {
        self.api_for(target)
            .patch(name, params, &Patch::Merge(patch))
            .await
    }

    async fn delete(
        &self,
        target: &ApiTarget,
        name: &str,
        params: &DeleteParams,
    ) -> kube::Result<()> {
        self.api_for(target).delete(name, params).await.map(|_| ())
    }
}

/// API error in a clonable form so the cache can replay it
#[derive(Debug, Clone)]
struct ApiFailure {
    /// `None` when the request never produced an API status
    code: Option<u16>,
    reason: String,
    message: String,
}

impl ApiFailure {
    fn from_kube(err: &kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => Self {
                code: Some(resp.code),
                reason: resp.reason.clone(),
                message: resp.message.clone(),
            },
            other => Self {
                code: None,
                reason: String::new(),
                message: other.to_string(),
            },
        }
    }

    fn to_error(&self, context: String) -> KubeError {
        match self.code {
            Some(code) => KubeError::ApiStatus {
                context,
                code,
                reason: self.reason.clone(),
                message: self.message.clone(),
            },
            None => KubeError::Transport {
                context,
                message: self.message.clone(),
            },
        }
    }

    fn is_not_found(&self) -> bool {
        self.code == Some(404)
    }
}

#[derive(Clone)]
enum CacheEntry {
    Hit(DynamicObject),
    Miss(ApiFailure),
}

/// Options for [`KubeClient::get`]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Replay the cached result (object or error) without an RPC
    pub try_cache: bool,
}

/// Options for [`KubeClient::apply`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Validate server-side without persisting; bypasses cache and mapper
    pub dry_run: bool,
}

/// Options for [`KubeClient::delete`]
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Deletion propagation, foreground when unset
    pub propagation: Option<PropagationPolicy>,
}

/// The facade every operation and the planner go through
pub struct KubeClient {
    api: Arc<dyn DynamicApi>,
    mapper: Arc<dyn RestMapper>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KubeClient {
    pub fn new(api: Arc<dyn DynamicApi>, mapper: Arc<dyn RestMapper>) -> Self {
        Self {
            api,
            mapper,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Connect using the ambient kubeconfig and run discovery
    pub async fn try_default() -> Result<Self> {
        let client = kube::Client::try_default().await?;
        let mapper: Arc<dyn RestMapper> = Arc::new(DiscoveryRestMapper::new(client.clone()).await?);
        Ok(Self::new(Arc::new(ClusterApi::new(client)), mapper))
    }

    /// The REST mapping collaborator shared with resource identity
    pub fn mapper(&self) -> Arc<dyn RestMapper> {
        self.mapper.clone()
    }

    /// Fetch a resource; with `try_cache` the cached result is replayed
    pub async fn get(&self, resource: &ResourceID, opts: GetOptions) -> Result<DynamicObject> {
        let _guard = self.lock_resource(resource).await;
        let context = format!("get resource {:?}", resource.human_id());

        if opts.try_cache {
            if let Some(entry) = self.cache_entry(resource) {
                return match entry {
                    CacheEntry::Hit(obj) => {
                        tracing::trace!(resource = %resource.human_id(), "got resource from cache");
                        Ok(obj)
                    }
                    CacheEntry::Miss(failure) => Err(failure.to_error(context)),
                };
            }
        }

        let target = self.target_for(resource).await?;

        tracing::debug!(resource = %resource.human_id(), "getting resource");
        match self.api.get(&target, resource.name()).await {
            Ok(obj) => {
                self.cache_put(resource, CacheEntry::Hit(obj.clone()));
                Ok(obj)
            }
            Err(err) => {
                let failure = ApiFailure::from_kube(&err);
                self.cache_put(resource, CacheEntry::Miss(failure.clone()));
                Err(failure.to_error(context))
            }
        }
    }

    /// Server-side apply for an object expected to be absent
    pub async fn create(
        &self,
        resource: &ResourceID,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let _guard = self.lock_resource(resource).await;
        let context = format!("server-side apply resource {:?}", resource.human_id());
        let target = self.target_for(resource).await?;

        let mut params = PatchParams::apply(DEFAULT_FIELD_MANAGER);
        params.force = true;

        tracing::debug!(resource = %resource.human_id(), "server-side applying resource");
        match self.api.apply(&target, resource.name(), obj, &params).await {
            Ok(result) => {
                self.cache_put(resource, CacheEntry::Hit(result.clone()));
                if resource.is_crd() {
                    self.mapper.reset().await?;
                }
                Ok(result)
            }
            Err(err) => {
                let failure = ApiFailure::from_kube(&err);
                self.cache_put(resource, CacheEntry::Miss(failure.clone()));
                Err(failure.to_error(context))
            }
        }
    }

    /// Server-side apply for an object expected to be present
    pub async fn apply(
        &self,
        resource: &ResourceID,
        obj: &DynamicObject,
        opts: ApplyOptions,
    ) -> Result<DynamicObject> {
        let _guard = self.lock_resource(resource).await;
        let dry_run_label = if opts.dry_run { "dry-run " } else { "" };
        let context = format!(
            "server-side {}apply resource {:?}",
            dry_run_label,
            resource.human_id()
        );
        let target = self.target_for(resource).await?;

        let mut params = PatchParams::apply(DEFAULT_FIELD_MANAGER);
        params.force = true;
        if opts.dry_run {
            params.dry_run = true;
        }

        tracing::debug!(resource = %resource.human_id(), dry_run = opts.dry_run, "server-side applying resource");
        match self.api.apply(&target, resource.name(), obj, &params).await {
            Ok(result) => {
                if !opts.dry_run {
                    self.cache_put(resource, CacheEntry::Hit(result.clone()));
                    if resource.is_crd() {
                        self.mapper.reset().await?;
                    }
                }
                Ok(result)
            }
            Err(err) => {
                let failure = ApiFailure::from_kube(&err);
                if !opts.dry_run {
                    self.cache_put(resource, CacheEntry::Miss(failure.clone()));
                }
                Err(failure.to_error(context))
            }
        }
    }

    /// Merge-patch a live object; an absent object is the caller's no-op
    pub async fn merge_patch(
        &self,
        resource: &ResourceID,
        patch: serde_json::Value,
    ) -> Result<Option<DynamicObject>> {
        let _guard = self.lock_resource(resource).await;
        let context = format!("merge patch resource {:?}", resource.human_id());
        let target = self.target_for(resource).await?;

        let mut params = PatchParams::default();
        params.field_manager = Some(DEFAULT_FIELD_MANAGER.to_string());

        tracing::debug!(resource = %resource.human_id(), "merge patching resource");
        match self
            .api
            .merge_patch(&target, resource.name(), &patch, &params)
            .await
        {
            Ok(result) => {
                self.cache_put(resource, CacheEntry::Hit(result.clone()));
                Ok(Some(result))
            }
            Err(err) => {
                let failure = ApiFailure::from_kube(&err);
                if failure.is_not_found() {
                    tracing::debug!(resource = %resource.human_id(), "skipping merge patch, resource not found");
                    return Ok(None);
                }
                self.cache_put(resource, CacheEntry::Miss(failure.clone()));
                Err(failure.to_error(context))
            }
        }
    }

    /// Delete a resource with foreground propagation by default
    pub async fn delete(&self, resource: &ResourceID, opts: DeleteOptions) -> Result<()> {
        let _guard = self.lock_resource(resource).await;
        let context = format!("delete resource {:?}", resource.human_id());
        let target = self.target_for(resource).await?;

        let params = DeleteParams {
            propagation_policy: Some(opts.propagation.unwrap_or(PropagationPolicy::Foreground)),
            ..Default::default()
        };

        tracing::debug!(resource = %resource.human_id(), "deleting resource");
        match self.api.delete(&target, resource.name(), &params).await {
            Ok(()) => {
                self.cache_remove(resource);
                Ok(())
            }
            Err(err) => {
                let failure = ApiFailure::from_kube(&err);
                if failure.is_not_found() {
                    tracing::debug!(resource = %resource.human_id(), "skipping deletion, resource not found");
                    self.cache_remove(resource);
                    return Ok(());
                }
                Err(failure.to_error(context))
            }
        }
    }

    async fn target_for(&self, resource: &ResourceID) -> Result<ApiTarget> {
        let api_resource = resource.api_resource().await?;
        let namespaced = resource.namespaced().await?;
        Ok(ApiTarget {
            api_resource,
            namespace: namespaced.then(|| resource.namespace().to_string()),
        })
    }

    /// Entries are never removed during an invocation; the whole map drops
    /// with the client.
    async fn lock_resource(&self, resource: &ResourceID) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("resource lock map poisoned");
            locks
                .entry(resource.version_id())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn cache_entry(&self, resource: &ResourceID) -> Option<CacheEntry> {
        self.cache
            .lock()
            .expect("cluster cache poisoned")
            .get(&resource.version_id())
            .cloned()
    }

    fn cache_put(&self, resource: &ResourceID, entry: CacheEntry) {
        self.cache
            .lock()
            .expect("cluster cache poisoned")
            .insert(resource.version_id(), entry);
    }

    fn cache_remove(&self, resource: &ResourceID) {
        self.cache
            .lock()
            .expect("cluster cache poisoned")
            .remove(&resource.version_id());
    }
}
