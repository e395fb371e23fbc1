//! Release model
//!
//! A release is the immutable aggregate of one revision of a chart deployed
//! into a namespace: values snapshot, chart metadata, the adapted resource
//! lists, notes, deploy timestamps and a status. The status labels match the
//! legacy chart history format byte-for-byte so records interoperate with
//! existing tooling.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use capstan_core::ChartMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::annotations::HookPhase;
use crate::error::{KubeError, Result};
use crate::mapper::RestMapper;
use crate::resource::{FromManifestOptions, GeneralResource, HookResource, StandaloneCrd};

/// Release handle shared between the planner, release operations and the
/// caller; release operations are the only writers
pub type SharedRelease = Arc<RwLock<Release>>;

/// What kind of deployment this invocation drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployType {
    /// First revision ever for the release name
    Initial,
    Install,
    Upgrade,
    Rollback,
    Uninstall,
}

impl DeployType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployType::Initial => "initial",
            DeployType::Install => "install",
            DeployType::Upgrade => "upgrade",
            DeployType::Rollback => "rollback",
            DeployType::Uninstall => "uninstall",
        }
    }

    /// Hook phases active for this deploy type, pre phase first
    pub fn active_hook_phases(&self) -> &'static [HookPhase] {
        match self {
            DeployType::Initial | DeployType::Install => {
                &[HookPhase::PreInstall, HookPhase::PostInstall]
            }
            DeployType::Upgrade => &[HookPhase::PreUpgrade, HookPhase::PostUpgrade],
            DeployType::Rollback => &[HookPhase::PreRollback, HookPhase::PostRollback],
            DeployType::Uninstall => &[HookPhase::PreDelete, HookPhase::PostDelete],
        }
    }
}

impl std::fmt::Display for DeployType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Release status, spelled exactly as the legacy chart history format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    #[default]
    Unknown,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Deployed,
    Failed,
    Superseded,
    Uninstalled,
    Uninstalling,
    Skipped,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Unknown => "unknown",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Uninstalled => "uninstalled",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::Skipped => "skipped",
        }
    }

    /// Whether this is a transitional state
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
                | ReleaseStatus::Uninstalling
        )
    }

    /// Whether this state is absorbing within a revision
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::Deployed
                | ReleaseStatus::Failed
                | ReleaseStatus::Superseded
                | ReleaseStatus::Uninstalled
                | ReleaseStatus::Skipped
        )
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optional attributes for [`Release::new`]
#[derive(Default)]
pub struct ReleaseOptions {
    pub status: ReleaseStatus,
    pub info_annotations: BTreeMap<String, String>,
    pub first_deployed: Option<DateTime<Utc>>,
    pub last_deployed: Option<DateTime<Utc>>,
}

/// One revision of a named release
#[derive(Clone)]
pub struct Release {
    name: String,
    namespace: String,
    revision: u32,

    values: serde_json::Value,
    chart: ChartMetadata,
    info_annotations: BTreeMap<String, String>,
    first_deployed: Option<DateTime<Utc>>,
    last_deployed: Option<DateTime<Utc>>,
    notes: String,

    standalone_crds: Vec<StandaloneCrd>,
    hook_resources: Vec<HookResource>,
    general_resources: Vec<GeneralResource>,

    status: ReleaseStatus,
}

#[allow(clippy::too_many_arguments)]
impl Release {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        revision: u32,
        values: serde_json::Value,
        chart: ChartMetadata,
        mut standalone_crds: Vec<StandaloneCrd>,
        mut hook_resources: Vec<HookResource>,
        mut general_resources: Vec<GeneralResource>,
        notes: &str,
        opts: ReleaseOptions,
    ) -> Result<Self> {
        let name = name.into();
        capstan_core::validate_release_name(&name)?;

        // Stable resource order keeps planning deterministic
        standalone_crds.sort_by(|a, b| a.id().cmp(b.id()));
        hook_resources.sort_by(|a, b| a.id().cmp(b.id()));
        general_resources.sort_by(|a, b| a.id().cmp(b.id()));

        Ok(Self {
            name,
            namespace: namespace.into(),
            revision,
            values,
            chart,
            info_annotations: opts.info_annotations,
            first_deployed: opts.first_deployed,
            last_deployed: opts.last_deployed,
            notes: capstan_core::normalize_notes(notes),
            standalone_crds,
            hook_resources,
            general_resources,
            status: opts.status,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn values(&self) -> &serde_json::Value {
        &self.values
    }

    pub fn chart(&self) -> &ChartMetadata {
        &self.chart
    }

    pub fn info_annotations(&self) -> &BTreeMap<String, String> {
        &self.info_annotations
    }

    pub fn first_deployed(&self) -> Option<DateTime<Utc>> {
        self.first_deployed
    }

    pub fn last_deployed(&self) -> Option<DateTime<Utc>> {
        self.last_deployed
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn standalone_crds(&self) -> &[StandaloneCrd] {
        &self.standalone_crds
    }

    pub fn hook_resources(&self) -> &[HookResource] {
        &self.hook_resources
    }

    pub fn general_resources(&self) -> &[GeneralResource] {
        &self.general_resources
    }

    pub fn status(&self) -> ReleaseStatus {
        self.status
    }

    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.name, self.revision)
    }

    pub fn human_id(&self) -> String {
        format!("{}:{}/{}", self.namespace, self.name, self.revision)
    }

    /// Commit to a pending state for the deploy type and stamp deploy times
    ///
    /// Only meaningful from `unknown`; later calls are ignored.
    pub fn pend(&mut self, deploy_type: DeployType) {
        if self.status != ReleaseStatus::Unknown {
            return;
        }

        self.status = match deploy_type {
            DeployType::Initial | DeployType::Install => ReleaseStatus::PendingInstall,
            DeployType::Upgrade => ReleaseStatus::PendingUpgrade,
            DeployType::Rollback => ReleaseStatus::PendingRollback,
            DeployType::Uninstall => ReleaseStatus::Uninstalling,
        };

        let now = Utc::now();
        if self.first_deployed.is_none() {
            self.first_deployed = Some(now);
        }
        self.last_deployed = Some(now);
    }

    /// Close the revision as deployed; terminal states absorb
    pub fn succeed(&mut self) {
        if !self.status.is_terminal() {
            self.status = ReleaseStatus::Deployed;
        }
    }

    /// Close the revision as uninstalled
    pub fn uninstalled(&mut self) {
        if !self.status.is_terminal() {
            self.status = ReleaseStatus::Uninstalled;
        }
    }

    /// Close the revision as failed
    pub fn fail(&mut self) {
        if !self.status.is_terminal() {
            self.status = ReleaseStatus::Failed;
        }
    }

    /// Mark a deployed (or still-pending) prior revision as replaced
    pub fn supersede(&mut self) {
        if self.status == ReleaseStatus::Deployed || !self.status.is_terminal() {
            self.status = ReleaseStatus::Superseded;
        }
    }

    /// Mark a revision whose plan turned out to be a no-op
    pub fn skip(&mut self) {
        if self.status == ReleaseStatus::Unknown {
            self.status = ReleaseStatus::Skipped;
        }
    }

    /// Whether the revision ended well
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            ReleaseStatus::Deployed | ReleaseStatus::Superseded | ReleaseStatus::Uninstalled
        )
    }

    /// Whether the revision is failed or was abandoned mid-flight
    pub fn failed(&self) -> bool {
        matches!(
            self.status,
            ReleaseStatus::Failed
                | ReleaseStatus::Unknown
                | ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
                | ReleaseStatus::Uninstalling
        )
    }

    /// Snapshot this release into its persistable record form
    pub fn to_record(&self) -> Result<ReleaseRecord> {
        Ok(ReleaseRecord {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            revision: self.revision,
            status: self.status,
            chart: self.chart.clone(),
            values: self.values.clone(),
            info_annotations: self.info_annotations.clone(),
            first_deployed: self.first_deployed,
            last_deployed: self.last_deployed,
            notes: self.notes.clone(),
            crd_manifests: serialize_bodies(self.standalone_crds.iter().map(|r| r.body()))?,
            hook_manifests: serialize_bodies(self.hook_resources.iter().map(|r| r.body()))?,
            manifests: serialize_bodies(self.general_resources.iter().map(|r| r.body()))?,
        })
    }
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("revision", &self.revision)
            .field("status", &self.status)
            .finish()
    }
}

fn serialize_bodies<'a>(
    bodies: impl Iterator<Item = &'a kube::api::DynamicObject>,
) -> Result<Vec<String>> {
    bodies
        .map(|body| {
            serde_yaml::to_string(body).map_err(|err| KubeError::Serialization(err.to_string()))
        })
        .collect()
}

/// Persisted form of a release revision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: ReleaseStatus,
    pub chart: ChartMetadata,
    pub values: serde_json::Value,

    #[serde(default)]
    pub info_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_deployed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,

    #[serde(default)]
    pub notes: String,

    #[serde(default)]
    pub crd_manifests: Vec<String>,

    #[serde(default)]
    pub hook_manifests: Vec<String>,

    #[serde(default)]
    pub manifests: Vec<String>,
}

impl ReleaseRecord {
    /// Storage key for this revision
    pub fn storage_key(&self) -> String {
        format!("capstan.release.v1.{}.v{}", self.name, self.revision)
    }

    /// Re-adapt the stored manifests back into a live release model
    pub async fn into_release(self, mapper: Arc<dyn RestMapper>) -> Result<Release> {
        let opts = FromManifestOptions {
            default_namespace: self.namespace.clone(),
            mapper,
        };

        let mut standalone_crds = Vec::with_capacity(self.crd_manifests.len());
        for manifest in &self.crd_manifests {
            standalone_crds.push(StandaloneCrd::from_manifest(manifest, &opts).await?);
        }

        let mut hook_resources = Vec::with_capacity(self.hook_manifests.len());
        for manifest in &self.hook_manifests {
            hook_resources.push(HookResource::from_manifest(manifest, &opts).await?);
        }

        let mut general_resources = Vec::with_capacity(self.manifests.len());
        for manifest in &self.manifests {
            general_resources.push(GeneralResource::from_manifest(manifest, &opts).await?);
        }

        Release::new(
            self.name,
            self.namespace,
            self.revision,
            self.values,
            self.chart,
            standalone_crds,
            hook_resources,
            general_resources,
            &self.notes,
            ReleaseOptions {
                status: self.status,
                info_annotations: self.info_annotations,
                first_deployed: self.first_deployed,
                last_deployed: self.last_deployed,
            },
        )
    }
}
