//! Resettable REST mapping
//!
//! Maps a group-version-kind to the API resource and scope needed to talk to
//! the cluster. The mapper must be resettable: applying a CRD introduces new
//! kinds, and the client facade resets the mapper after every CRD write so
//! subsequent lookups see them. Reads must tolerate concurrent resets.

use async_trait::async_trait;
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};

use crate::error::{KubeError, Result};

/// Resolution result for one group-version-kind
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    /// Resource coordinates used for dynamic API calls
    pub api_resource: kube::discovery::ApiResource,

    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

/// REST mapping contract used by resource identity and the client facade
#[async_trait]
pub trait RestMapper: Send + Sync {
    /// Resolve a group-version-kind, or `None` when the cluster does not
    /// serve it
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResolvedResource>>;

    /// Drop cached mappings and rediscover the cluster's API surface
    async fn reset(&self) -> Result<()>;
}

/// Mapper backed by the cluster's discovery endpoints
pub struct DiscoveryRestMapper {
    client: kube::Client,
    discovery: tokio::sync::RwLock<Discovery>,
}

impl DiscoveryRestMapper {
    /// Run discovery once and build the mapper
    pub async fn new(client: kube::Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self {
            client,
            discovery: tokio::sync::RwLock::new(discovery),
        })
    }
}

#[async_trait]
impl RestMapper for DiscoveryRestMapper {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResolvedResource>> {
        let discovery = self.discovery.read().await;
        Ok(discovery
            .resolve_gvk(gvk)
            .map(|(api_resource, capabilities)| ResolvedResource {
                api_resource,
                namespaced: capabilities.scope == Scope::Namespaced,
            }))
    }

    async fn reset(&self) -> Result<()> {
        tracing::debug!("resetting REST mapper, rerunning discovery");
        let fresh = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(KubeError::Api)?;
        *self.discovery.write().await = fresh;
        Ok(())
    }
}
