//! Resource classes and the manifest adapter
//!
//! Every rendered manifest document becomes one of three resource classes:
//! - [`StandaloneCrd`]: a CRD shipped beside the chart, applied before all
//!   other resources
//! - [`HookResource`]: a lifecycle-annotated resource, ordered by stage and
//!   weight, never persisted in the general release manifest
//! - [`GeneralResource`]: ordinary chart output, persisted across revisions
//!
//! The adapter decodes the YAML document, validates the identity fields,
//! fills the namespace from the deploy default when the REST mapping says
//! the kind is namespaced, and resolves the mapping (retrying once behind a
//! mapper reset in case a CRD was just installed).

pub mod id;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;

use crate::annotations::{self, HookDeletePolicy, HookPhase, ManageableBy};
use crate::error::{KubeError, Result};
use crate::mapper::RestMapper;

pub use id::{parse_api_version, ResourceID};

/// Inputs shared by all `from_manifest` constructors
#[derive(Clone)]
pub struct FromManifestOptions {
    /// Namespace applied to namespaced resources without an explicit one
    pub default_namespace: String,

    /// REST mapping collaborator
    pub mapper: Arc<dyn RestMapper>,
}

/// A CRD manifest shipped alongside the chart, applied before everything else
#[derive(Debug, Clone)]
pub struct StandaloneCrd {
    id: ResourceID,
    body: DynamicObject,
}

impl StandaloneCrd {
    pub async fn from_manifest(manifest: &str, opts: &FromManifestOptions) -> Result<Self> {
        let (id, body) = adapt_document(manifest, opts).await?;
        if !id.is_crd() {
            return Err(KubeError::ManifestMalformed(format!(
                "expected a CustomResourceDefinition, got {}",
                id.human_id()
            )));
        }
        Ok(Self { id, body })
    }

    pub fn id(&self) -> &ResourceID {
        &self.id
    }

    pub fn body(&self) -> &DynamicObject {
        &self.body
    }
}

/// A lifecycle hook resource
#[derive(Debug, Clone)]
pub struct HookResource {
    id: ResourceID,
    body: DynamicObject,
    phases: Vec<HookPhase>,
    weight: i32,
    delete_policy: HookDeletePolicy,
    track_timeout: Option<Duration>,
}

impl HookResource {
    pub async fn from_manifest(manifest: &str, opts: &FromManifestOptions) -> Result<Self> {
        let (id, body) = adapt_document(manifest, opts).await?;
        let annotations = annotations_of(&body);

        let phases = annotations::hook_phases(&annotations);
        if phases.is_empty() {
            return Err(KubeError::ManifestMalformed(format!(
                "resource {} carries no recognised hook phase",
                id.human_id()
            )));
        }

        Ok(Self {
            id,
            weight: annotations::parse_hook_weight(&annotations),
            delete_policy: annotations::parse_delete_policy(&annotations),
            track_timeout: annotations::parse_track_timeout(&annotations),
            body,
            phases,
        })
    }

    pub fn id(&self) -> &ResourceID {
        &self.id
    }

    pub fn body(&self) -> &DynamicObject {
        &self.body
    }

    pub fn phases(&self) -> &[HookPhase] {
        &self.phases
    }

    /// Whether the hook participates in any of the given phases
    pub fn runs_in_any(&self, phases: &[HookPhase]) -> bool {
        self.phases.iter().any(|p| phases.contains(p))
    }

    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn delete_policy(&self) -> HookDeletePolicy {
        self.delete_policy
    }

    pub fn track_timeout(&self) -> Option<Duration> {
        self.track_timeout
    }
}

/// Ordinary chart output, persisted in the release history
#[derive(Debug, Clone)]
pub struct GeneralResource {
    id: ResourceID,
    body: DynamicObject,
    weight: i32,
    manageable_by: ManageableBy,
    keep_on_delete: bool,
    skip_readiness: bool,
    track_timeout: Option<Duration>,
}

impl GeneralResource {
    pub async fn from_manifest(manifest: &str, opts: &FromManifestOptions) -> Result<Self> {
        let (id, body) = adapt_document(manifest, opts).await?;
        let annotations = annotations_of(&body);

        Ok(Self {
            id,
            weight: annotations::parse_weight(&annotations),
            manageable_by: annotations::parse_manageable_by(&annotations),
            keep_on_delete: annotations::has_keep_policy(&annotations),
            skip_readiness: annotations::should_skip_readiness(&annotations),
            track_timeout: annotations::parse_track_timeout(&annotations),
            body,
        })
    }

    pub fn id(&self) -> &ResourceID {
        &self.id
    }

    pub fn body(&self) -> &DynamicObject {
        &self.body
    }

    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn manageable_by(&self) -> &ManageableBy {
        &self.manageable_by
    }

    pub fn keep_on_delete(&self) -> bool {
        self.keep_on_delete
    }

    pub fn skip_readiness(&self) -> bool {
        self.skip_readiness
    }

    pub fn track_timeout(&self) -> Option<Duration> {
        self.track_timeout
    }
}

/// Whether a decoded document carries a hook annotation
pub fn document_is_hook(value: &serde_yaml::Value) -> bool {
    let annotations: BTreeMap<String, String> = value
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| serde_yaml::from_value(a.clone()).ok())
        .unwrap_or_default();
    annotations::is_hook(&annotations)
}

/// Annotations of an adapted object
pub fn annotations_of(body: &DynamicObject) -> BTreeMap<String, String> {
    body.metadata.annotations.clone().unwrap_or_default()
}

/// Field managers currently owning a live object
pub fn field_managers(body: &DynamicObject) -> Vec<String> {
    body.metadata
        .managed_fields
        .as_ref()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.manager.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Decode one manifest document into its identity and body
async fn adapt_document(
    manifest: &str,
    opts: &FromManifestOptions,
) -> Result<(ResourceID, DynamicObject)> {
    let value = capstan_core::parse_document(manifest)?;

    let json = serde_json::to_value(&value)
        .map_err(|err| KubeError::ManifestMalformed(format!("convert document: {}", err)))?;
    let mut body: DynamicObject = serde_json::from_value(json)
        .map_err(|err| KubeError::ManifestMalformed(format!("decode object: {}", err)))?;

    let types = body
        .types
        .clone()
        .ok_or_else(|| KubeError::ManifestMalformed("missing apiVersion or kind".to_string()))?;
    let (group, version) = parse_api_version(&types.api_version);

    let name = body
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| KubeError::MissingName {
            kind: types.kind.clone(),
        })?;
    capstan_core::validate_resource_name(&name)?;

    // Scope decides the namespace, so resolve the mapping first. A no-match
    // is tolerated here: a CRD shipped in the same chart may define the kind,
    // and identity resolution is lazy, so the mapping is retried when the
    // operation actually runs (after the CRD apply reset the mapper).
    let preliminary = ResourceID::new(
        group.clone(),
        version.clone(),
        types.kind.clone(),
        String::new(),
        name.clone(),
        opts.mapper.clone(),
    );
    let resolved = match preliminary.resolve().await {
        Ok(resolved) => Some(resolved),
        Err(KubeError::NoRestMapping { .. }) => None,
        Err(err) => return Err(err),
    };

    // Unresolvable kinds are assumed namespaced; custom resources almost
    // always are
    let namespaced = resolved.as_ref().map(|r| r.namespaced).unwrap_or(true);

    let namespace = if namespaced {
        match body.metadata.namespace.clone().filter(|ns| !ns.is_empty()) {
            Some(ns) => ns,
            None => opts.default_namespace.clone(),
        }
    } else {
        String::new()
    };

    if namespaced {
        body.metadata.namespace = Some(namespace.clone());
    } else {
        body.metadata.namespace = None;
    }

    let id = ResourceID::new(group, version, types.kind, namespace, name, opts.mapper.clone());
    if let Some(resolved) = resolved {
        id.prime(resolved);
    }

    Ok((id, body))
}
