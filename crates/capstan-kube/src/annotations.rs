//! Annotation parsing with Helm chart compatibility
//!
//! Capstan honours its own `capstan.io/*` annotations first and falls back
//! to the `helm.sh/*` spellings so existing charts keep their hook and
//! ordering behaviour.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capstan-native annotations
pub mod capstan {
    /// Hook phase annotation
    pub const HOOK: &str = "capstan.io/hook";
    /// Hook weight for ordering within a stage
    pub const HOOK_WEIGHT: &str = "capstan.io/hook-weight";
    /// Hook delete policy
    pub const HOOK_DELETE_POLICY: &str = "capstan.io/hook-delete-policy";
    /// Weight for ordering general resources within a stage
    pub const WEIGHT: &str = "capstan.io/weight";
    /// Timeout for readiness/absence tracking of this resource
    pub const TRACK_TIMEOUT: &str = "capstan.io/track-timeout";
    /// Skip readiness tracking for this resource
    pub const SKIP_READINESS: &str = "capstan.io/skip-readiness";
    /// Field managers allowed to own this resource without a conflict
    pub const MANAGEABLE_BY: &str = "capstan.io/manageable-by";
    /// Resource policy (keep on delete)
    pub const RESOURCE_POLICY: &str = "capstan.io/resource-policy";
    /// Release ownership stamped onto deployed resources
    pub const RELEASE_NAME: &str = "capstan.io/release-name";
    pub const RELEASE_NAMESPACE: &str = "capstan.io/release-namespace";
}

/// Helm-compatible annotations
pub mod helm {
    /// Hook phase annotation
    pub const HOOK: &str = "helm.sh/hook";
    /// Hook weight for ordering
    pub const HOOK_WEIGHT: &str = "helm.sh/hook-weight";
    /// Hook delete policy
    pub const HOOK_DELETE_POLICY: &str = "helm.sh/hook-delete-policy";
    /// Resource policy (keep on delete)
    pub const RESOURCE_POLICY: &str = "helm.sh/resource-policy";
}

const RESOURCE_POLICY_KEEP: &str = "keep";

/// Get annotation value, preferring the capstan spelling
pub fn get_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    capstan_key: &str,
    helm_key: &str,
) -> Option<&'a str> {
    annotations
        .get(capstan_key)
        .or_else(|| annotations.get(helm_key))
        .map(String::as_str)
}

/// Lifecycle phase a hook participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum HookPhase {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
    PreDelete,
    PostDelete,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::PreInstall => "pre-install",
            HookPhase::PostInstall => "post-install",
            HookPhase::PreUpgrade => "pre-upgrade",
            HookPhase::PostUpgrade => "post-upgrade",
            HookPhase::PreRollback => "pre-rollback",
            HookPhase::PostRollback => "post-rollback",
            HookPhase::PreDelete => "pre-delete",
            HookPhase::PostDelete => "post-delete",
        }
    }

    /// Whether this phase runs before the deploy type's main resources
    pub fn is_pre(&self) -> bool {
        matches!(
            self,
            HookPhase::PreInstall
                | HookPhase::PreUpgrade
                | HookPhase::PreRollback
                | HookPhase::PreDelete
        )
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parse comma-separated hook phases; unknown phases are ignored
pub fn parse_hook_phases(value: &str) -> Vec<HookPhase> {
    value
        .split(',')
        .filter_map(|phase| match phase.trim() {
            "pre-install" => Some(HookPhase::PreInstall),
            "post-install" => Some(HookPhase::PostInstall),
            "pre-upgrade" => Some(HookPhase::PreUpgrade),
            "post-upgrade" => Some(HookPhase::PostUpgrade),
            "pre-rollback" => Some(HookPhase::PreRollback),
            "post-rollback" => Some(HookPhase::PostRollback),
            "pre-delete" => Some(HookPhase::PreDelete),
            "post-delete" => Some(HookPhase::PostDelete),
            _ => None,
        })
        .collect()
}

/// Hook phases from annotations, empty when the resource is not a hook
pub fn hook_phases(annotations: &BTreeMap<String, String>) -> Vec<HookPhase> {
    get_annotation(annotations, capstan::HOOK, helm::HOOK)
        .map(parse_hook_phases)
        .unwrap_or_default()
}

/// Whether the resource carries a hook annotation at all
pub fn is_hook(annotations: &BTreeMap<String, String>) -> bool {
    get_annotation(annotations, capstan::HOOK, helm::HOOK).is_some()
}

/// Parse hook weight (default: 0)
pub fn parse_hook_weight(annotations: &BTreeMap<String, String>) -> i32 {
    get_annotation(annotations, capstan::HOOK_WEIGHT, helm::HOOK_WEIGHT)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Parse general-resource weight (default: 0); `helm.sh/hook-weight` is
/// honoured as a fallback sort key for non-hook resources too
pub fn parse_weight(annotations: &BTreeMap<String, String>) -> i32 {
    get_annotation(annotations, capstan::WEIGHT, helm::HOOK_WEIGHT)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// When a hook resource left behind by a previous run is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDeletePolicy {
    /// Delete the leftover before creating the hook again (default)
    #[default]
    BeforeHookCreation,
    /// Delete after the hook succeeds
    OnSuccess,
    /// Delete after the hook fails
    OnFailure,
    /// Never delete
    Never,
}

/// Parse hook delete policy
pub fn parse_delete_policy(annotations: &BTreeMap<String, String>) -> HookDeletePolicy {
    let value = get_annotation(
        annotations,
        capstan::HOOK_DELETE_POLICY,
        helm::HOOK_DELETE_POLICY,
    );

    match value {
        Some(s) => {
            let policies: Vec<&str> = s.split(',').map(|p| p.trim()).collect();

            if policies.contains(&"before-hook-creation") {
                HookDeletePolicy::BeforeHookCreation
            } else if policies.contains(&"hook-succeeded") {
                HookDeletePolicy::OnSuccess
            } else if policies.contains(&"hook-failed") {
                HookDeletePolicy::OnFailure
            } else {
                HookDeletePolicy::default()
            }
        }
        None => HookDeletePolicy::default(),
    }
}

/// Which field managers may own a live resource without the engine reporting
/// a conflict when it adopts the object
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ManageableBy {
    /// Only this engine's own field manager (default)
    #[default]
    OwnManager,
    /// Any owner is acceptable
    Anyone,
    /// An explicit allow-list of field managers
    FieldManagers(Vec<String>),
}

impl ManageableBy {
    /// Whether a live object owned by `managers` may be taken over
    pub fn permits(&self, managers: &[String], own_manager: &str) -> bool {
        match self {
            ManageableBy::OwnManager => managers.iter().all(|m| m == own_manager),
            ManageableBy::Anyone => true,
            ManageableBy::FieldManagers(allowed) => managers
                .iter()
                .all(|m| m == own_manager || allowed.iter().any(|a| a == m)),
        }
    }
}

/// Parse the manageable-by grant
pub fn parse_manageable_by(annotations: &BTreeMap<String, String>) -> ManageableBy {
    match annotations.get(capstan::MANAGEABLE_BY).map(String::as_str) {
        None | Some("") => ManageableBy::OwnManager,
        Some("anyone") => ManageableBy::Anyone,
        Some(list) => ManageableBy::FieldManagers(
            list.split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
        ),
    }
}

/// Parse a duration like "5m", "300s", "1h", "100ms"; bare numbers are seconds
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (num_str, unit) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped, "h")
    } else {
        (value, "s")
    };

    let num: u64 = num_str.parse().ok()?;

    Some(match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => return None,
    })
}

/// Per-resource tracking timeout, if annotated
pub fn parse_track_timeout(annotations: &BTreeMap<String, String>) -> Option<Duration> {
    annotations
        .get(capstan::TRACK_TIMEOUT)
        .and_then(|s| parse_duration(s))
}

/// Check if readiness tracking should be skipped for this resource
pub fn should_skip_readiness(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(capstan::SKIP_READINESS)
        .map(|s| s.to_lowercase() == "true" || s == "1")
        .unwrap_or(false)
}

/// Check if the resource must be kept when its release stops owning it
pub fn has_keep_policy(annotations: &BTreeMap<String, String>) -> bool {
    get_annotation(
        annotations,
        capstan::RESOURCE_POLICY,
        helm::RESOURCE_POLICY,
    ) == Some(RESOURCE_POLICY_KEEP)
}
