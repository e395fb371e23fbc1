//! Planner: (prior state, desired state, cluster view) -> plan graph
//!
//! The planner classifies every desired resource against the observed
//! cluster state, emits the matching operations into weight-bucketed stages,
//! wires release finalisation around them and transitively reduces the
//! result. It never contacts the cluster directly: all reads go through the
//! facade with `try_cache`, so the same observation serves the planner and
//! the executor.
//!
//! Stage order for a deploy: pend -> standalone CRDs -> pre hooks ->
//! general resources -> post hooks -> cleanup of orphaned prior resources ->
//! supersede/succeed. The fail-release vertex stays unconnected; only the
//! executor's failure branch drives it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;

use super::Plan;
use crate::annotations::{self, HookDeletePolicy, HookPhase};
use crate::client::{GetOptions, KubeClient, DEFAULT_FIELD_MANAGER};
use crate::error::{KubeError, Result};
use crate::operation::{
    ApplyResourceOperation, CreateResourceOperation, DeleteResourceOperation,
    FailReleaseOperation, Operation, PendReleaseOperation, RecreateResourceOperation,
    ResourceOperationOptions, SucceedReleaseOperation, SupersedePreviousReleaseOperation,
    TrackAbsenceOperation, TrackReadinessOperation, UpdateResourceOperation,
};
use crate::release::{DeployType, ReleaseStatus, SharedRelease};
use crate::resource::{field_managers, GeneralResource, HookResource, ResourceID, StandaloneCrd};
use crate::storage::ReleaseStorage;
use crate::track::TrackOptions;

/// Knobs for plan construction
#[derive(Debug, Clone, Copy)]
pub struct PlanBuilderOptions {
    /// Tracking timeout for resources without their own annotation
    pub default_track_timeout: Duration,

    /// Poll interval handed to every tracking operation
    pub poll_interval: Duration,
}

impl Default for PlanBuilderOptions {
    fn default() -> Self {
        Self {
            default_track_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// The product of plan construction
pub struct BuiltPlan {
    pub plan: Plan,
    pub release: SharedRelease,
    pub previous: Option<SharedRelease>,
}

/// Builds the operation graph for one release revision
pub struct PlanBuilder {
    deploy_type: DeployType,
    release: SharedRelease,
    previous: Option<SharedRelease>,
    client: Arc<KubeClient>,
    storage: Arc<dyn ReleaseStorage>,
    options: PlanBuilderOptions,
}

impl PlanBuilder {
    pub fn new(
        deploy_type: DeployType,
        release: SharedRelease,
        previous: Option<SharedRelease>,
        client: Arc<KubeClient>,
        storage: Arc<dyn ReleaseStorage>,
    ) -> Self {
        Self {
            deploy_type,
            release,
            previous,
            client,
            storage,
            options: PlanBuilderOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PlanBuilderOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn build(self) -> Result<BuiltPlan> {
        match self.deploy_type {
            DeployType::Uninstall => self.build_uninstall().await,
            _ => self.build_deploy().await,
        }
    }

    async fn build_deploy(self) -> Result<BuiltPlan> {
        let mut plan = Plan::new();

        let (standalone_crds, hooks, generals, release_ownership) = {
            let release = self.release.read().expect("release lock poisoned");
            (
                release.standalone_crds().to_vec(),
                release.hook_resources().to_vec(),
                release.general_resources().to_vec(),
                ownership_annotations(release.name(), release.namespace()),
            )
        };

        let pend = plan.add_operation(Operation::PendRelease(PendReleaseOperation::new(
            self.release.clone(),
            self.storage.clone(),
            self.deploy_type,
        )));
        let mut chain_from = pend.id();

        // Standalone CRDs come first; applying them resets the mapper so the
        // kinds they define resolve in later stages
        if !standalone_crds.is_empty() {
            let (stage_in, stage_out) = stage_ids("initialization");
            for crd in &standalone_crds {
                let op = self.crd_operation(crd).await?;
                plan.add_staged_operation(op, &stage_in, &stage_out)?;
            }
            plan.add_dependency(&chain_from, &stage_in)?;
            chain_from = stage_out;
        }

        let phases = self.deploy_type.active_hook_phases();
        let (pre_phase, post_phase) = (phases[0], phases[1]);

        chain_from = self
            .add_hook_stages(&mut plan, &hooks, pre_phase, chain_from)
            .await?;

        // General resources, bucketed by weight
        for (weight, bucket) in bucket_by_weight(&generals, |r| r.weight()) {
            let (stage_in, stage_out) =
                stage_ids(&format!("{}/weight:{}", self.deploy_type.as_str(), weight));

            for resource in bucket {
                self.add_general_resource(&mut plan, &resource, &release_ownership, &stage_in, &stage_out)
                    .await?;
            }

            plan.add_dependency(&chain_from, &stage_in)?;
            chain_from = stage_out;
        }

        chain_from = self
            .add_hook_stages(&mut plan, &hooks, post_phase, chain_from)
            .await?;

        // Prior-release resources no longer in the desired set get removed
        let orphans = self.orphaned_resources(&generals);
        if !orphans.is_empty() {
            let (stage_in, stage_out) = stage_ids("cleanup");
            for orphan in &orphans {
                self.add_removal(&mut plan, orphan.id(), &stage_in, &stage_out).await?;
            }
            plan.add_dependency(&chain_from, &stage_in)?;
            chain_from = stage_out;
        }

        // Finalisation: supersede the deployed prior revision, then succeed
        let succeed = plan.add_operation(Operation::SucceedRelease(SucceedReleaseOperation::new(
            self.release.clone(),
            self.storage.clone(),
            self.deploy_type,
        )));
        let supersede_wanted = matches!(self.deploy_type, DeployType::Upgrade | DeployType::Rollback)
            && self
                .previous
                .as_ref()
                .map(|prev| prev.read().expect("release lock poisoned").status() == ReleaseStatus::Deployed)
                .unwrap_or(false);
        if supersede_wanted {
            let supersede = plan.add_operation(Operation::SupersedePreviousRelease(
                SupersedePreviousReleaseOperation::new(
                    self.previous.clone().expect("previous release present"),
                    self.storage.clone(),
                ),
            ));
            plan.add_dependency(&chain_from, &supersede.id())?;
            plan.add_dependency(&supersede.id(), &succeed.id())?;
        } else {
            plan.add_dependency(&chain_from, &succeed.id())?;
        }

        plan.add_operation(Operation::FailRelease(FailReleaseOperation::new(
            self.release.clone(),
            self.storage.clone(),
        )));

        plan.optimize();

        Ok(BuiltPlan {
            plan,
            release: self.release,
            previous: self.previous,
        })
    }

    async fn build_uninstall(self) -> Result<BuiltPlan> {
        let mut plan = Plan::new();

        let (hooks, generals) = {
            let release = self.release.read().expect("release lock poisoned");
            (
                release.hook_resources().to_vec(),
                release.general_resources().to_vec(),
            )
        };

        let pend = plan.add_operation(Operation::PendRelease(PendReleaseOperation::new(
            self.release.clone(),
            self.storage.clone(),
            self.deploy_type,
        )));
        let mut chain_from = pend.id();

        let phases = self.deploy_type.active_hook_phases();
        let (pre_phase, post_phase) = (phases[0], phases[1]);

        chain_from = self
            .add_hook_stages(&mut plan, &hooks, pre_phase, chain_from)
            .await?;

        // Owned resources go away in reverse weight order; keep-policy
        // resources stay behind
        let mut buckets = bucket_by_weight(&generals, |r| r.weight());
        buckets.reverse();
        for (weight, bucket) in buckets {
            let (stage_in, stage_out) =
                stage_ids(&format!("{}/weight:{}", self.deploy_type.as_str(), weight));

            let mut emitted = false;
            for resource in bucket {
                if resource.keep_on_delete() {
                    tracing::debug!(resource = %resource.id().human_id(), "keeping resource on uninstall");
                    continue;
                }
                self.add_removal(&mut plan, resource.id(), &stage_in, &stage_out).await?;
                emitted = true;
            }

            if emitted {
                plan.add_dependency(&chain_from, &stage_in)?;
                chain_from = stage_out;
            }
        }

        chain_from = self
            .add_hook_stages(&mut plan, &hooks, post_phase, chain_from)
            .await?;

        let succeed = plan.add_operation(Operation::SucceedRelease(SucceedReleaseOperation::new(
            self.release.clone(),
            self.storage.clone(),
            self.deploy_type,
        )));
        plan.add_dependency(&chain_from, &succeed.id())?;

        plan.add_operation(Operation::FailRelease(FailReleaseOperation::new(
            self.release.clone(),
            self.storage.clone(),
        )));

        plan.optimize();

        Ok(BuiltPlan {
            plan,
            release: self.release,
            previous: self.previous,
        })
    }

    /// Hook stages for one phase, weight-bucketed, chained after `chain_from`
    async fn add_hook_stages(
        &self,
        plan: &mut Plan,
        hooks: &[HookResource],
        phase: HookPhase,
        mut chain_from: String,
    ) -> Result<String> {
        let active: Vec<&HookResource> = hooks
            .iter()
            .filter(|hook| hook.runs_in_any(&[phase]))
            .collect();

        for (weight, bucket) in bucket_by_weight(&active, |h| h.weight()) {
            let (stage_in, stage_out) = stage_ids(&format!("{}/weight:{}", phase, weight));

            for hook in bucket {
                self.add_hook(plan, hook, &stage_in, &stage_out).await?;
            }

            plan.add_dependency(&chain_from, &stage_in)?;
            chain_from = stage_out;
        }

        Ok(chain_from)
    }

    async fn add_hook(
        &self,
        plan: &mut Plan,
        hook: &HookResource,
        stage_in: &str,
        stage_out: &str,
    ) -> Result<()> {
        // A hook annotated for both active phases already ran in the earlier
        // one; wiring the same vertex into a later stage would close a cycle
        let resource_id = hook.id().id();
        for kind in ["create", "recreate", "apply"] {
            if plan.operation(&format!("{}/{}", kind, resource_id)).is_some() {
                tracing::debug!(hook = %hook.id().human_id(), "hook already scheduled in an earlier phase");
                return Ok(());
            }
        }

        let observed = self.observe(hook.id()).await?;

        let (mutation, mutation_empty) = match &observed {
            None => (
                Operation::Create(CreateResourceOperation::new(
                    hook.id().clone(),
                    hook.body().clone(),
                    self.client.clone(),
                    ResourceOperationOptions::default(),
                )),
                false,
            ),
            // A leftover from the previous run is recreated under the
            // before-hook-creation policy
            Some(_) if hook.delete_policy() == HookDeletePolicy::BeforeHookCreation => (
                Operation::Recreate(RecreateResourceOperation::new(
                    hook.id().clone(),
                    hook.body().clone(),
                    self.client.clone(),
                    ResourceOperationOptions::default(),
                )),
                false,
            ),
            Some(live) => {
                let empty = managed_by_us(live) && desired_matches_live(hook.body(), live);
                (
                    Operation::Apply(ApplyResourceOperation::new(
                        hook.id().clone(),
                        hook.body().clone(),
                        self.client.clone(),
                        ResourceOperationOptions {
                            empty,
                            ..Default::default()
                        },
                    )),
                    empty,
                )
            }
        };

        let mutation_id = plan.add_staged_operation(mutation, stage_in, stage_out)?.id();

        let mut tracker = TrackReadinessOperation::new(
            hook.id().clone(),
            self.client.clone(),
            self.track_options(hook.track_timeout()),
        );
        if mutation_empty {
            tracker = tracker.into_empty();
        }
        let tracker_id = plan
            .add_staged_operation(Operation::TrackReadiness(tracker), stage_in, stage_out)?
            .id();
        plan.add_dependency(&mutation_id, &tracker_id)?;

        Ok(())
    }

    /// Classify and emit one general resource: mutation, readiness tracker,
    /// extra-post ownership stamp
    async fn add_general_resource(
        &self,
        plan: &mut Plan,
        resource: &GeneralResource,
        release_ownership: &serde_json::Value,
        stage_in: &str,
        stage_out: &str,
    ) -> Result<()> {
        let observed = self.observe(resource.id()).await?;

        let (mutation, mutation_empty) = match &observed {
            None => (
                Operation::Create(CreateResourceOperation::new(
                    resource.id().clone(),
                    resource.body().clone(),
                    self.client.clone(),
                    ResourceOperationOptions::default(),
                )),
                false,
            ),
            Some(live) => {
                let managers = field_managers(live);
                let ours = managed_by_us(live);

                if !ours && !resource.manageable_by().permits(&managers, DEFAULT_FIELD_MANAGER) {
                    return Err(KubeError::ResourceConflict {
                        id: resource.id().human_id(),
                        reason: format!(
                            "owned by field managers [{}], not granted by {}",
                            managers.join(", "),
                            annotations::capstan::MANAGEABLE_BY,
                        ),
                    });
                }

                let empty = ours && desired_matches_live(resource.body(), live);
                (
                    Operation::Apply(ApplyResourceOperation::new(
                        resource.id().clone(),
                        resource.body().clone(),
                        self.client.clone(),
                        ResourceOperationOptions {
                            empty,
                            ..Default::default()
                        },
                    )),
                    empty,
                )
            }
        };

        let mutation_id = plan.add_staged_operation(mutation, stage_in, stage_out)?.id();
        let mut after = mutation_id.clone();

        if !resource.skip_readiness() {
            let mut tracker = TrackReadinessOperation::new(
                resource.id().clone(),
                self.client.clone(),
                self.track_options(resource.track_timeout()),
            );
            if mutation_empty {
                tracker = tracker.into_empty();
            }
            let tracker_id = plan
                .add_staged_operation(Operation::TrackReadiness(tracker), stage_in, stage_out)?
                .id();
            plan.add_dependency(&after, &tracker_id)?;
            after = tracker_id;
        }

        // Ownership annotations land after the resource settled
        let stamp_needed = match &observed {
            Some(live) => !carries_ownership(live, release_ownership),
            None => true,
        };
        let patch = if stamp_needed {
            serde_json::json!({"metadata": {"annotations": release_ownership.clone()}})
        } else {
            serde_json::json!({})
        };
        let stamp = plan.add_staged_operation(
            Operation::Update(UpdateResourceOperation::new(
                resource.id().clone(),
                patch,
                self.client.clone(),
                ResourceOperationOptions {
                    extra_post: true,
                    ..Default::default()
                },
            )),
            stage_in,
            stage_out,
        )?;
        plan.add_dependency(&after, &stamp.id())?;

        Ok(())
    }

    /// Delete plus absence tracking for one resource
    async fn add_removal(
        &self,
        plan: &mut Plan,
        id: &ResourceID,
        stage_in: &str,
        stage_out: &str,
    ) -> Result<()> {
        let absent = self.observe(id).await?.is_none();

        let delete_id = plan
            .add_staged_operation(
                Operation::Delete(DeleteResourceOperation::new(
                    id.clone(),
                    self.client.clone(),
                    ResourceOperationOptions {
                        empty: absent,
                        ..Default::default()
                    },
                )),
                stage_in,
                stage_out,
            )?
            .id();

        let mut tracker = TrackAbsenceOperation::new(
            id.clone(),
            self.client.clone(),
            self.track_options(None),
        );
        if absent {
            tracker = tracker.into_empty();
        }
        let tracker_id = plan
            .add_staged_operation(Operation::TrackAbsence(tracker), stage_in, stage_out)?
            .id();
        plan.add_dependency(&delete_id, &tracker_id)?;

        Ok(())
    }

    async fn crd_operation(&self, crd: &StandaloneCrd) -> Result<Operation> {
        let observed = self.observe(crd.id()).await?;

        Ok(match &observed {
            None => Operation::Create(CreateResourceOperation::new(
                crd.id().clone(),
                crd.body().clone(),
                self.client.clone(),
                ResourceOperationOptions::default(),
            )),
            Some(live) => {
                let empty = managed_by_us(live) && desired_matches_live(crd.body(), live);
                Operation::Apply(ApplyResourceOperation::new(
                    crd.id().clone(),
                    crd.body().clone(),
                    self.client.clone(),
                    ResourceOperationOptions {
                        empty,
                        ..Default::default()
                    },
                ))
            }
        })
    }

    /// Prior-release general resources absent from the desired set
    fn orphaned_resources(&self, desired: &[GeneralResource]) -> Vec<GeneralResource> {
        let Some(previous) = &self.previous else {
            return Vec::new();
        };

        let desired_ids: BTreeSet<String> = desired.iter().map(|r| r.id().id()).collect();

        previous
            .read()
            .expect("release lock poisoned")
            .general_resources()
            .iter()
            .filter(|r| !desired_ids.contains(&r.id().id()))
            .filter(|r| {
                if r.keep_on_delete() {
                    tracing::debug!(resource = %r.id().human_id(), "keeping orphaned resource");
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect()
    }

    /// Observed cluster state through the cached facade read. Absence and an
    /// unresolvable kind (CRD still to be installed) both read as `None`.
    async fn observe(&self, id: &ResourceID) -> Result<Option<DynamicObject>> {
        match self.client.get(id, GetOptions { try_cache: true }).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(KubeError::NoRestMapping { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn track_options(&self, timeout: Option<Duration>) -> TrackOptions {
        TrackOptions {
            timeout: timeout.unwrap_or(self.options.default_track_timeout),
            poll_interval: self.options.poll_interval,
        }
    }
}

fn stage_ids(name: &str) -> (String, String) {
    (format!("stage/{}:in", name), format!("stage/{}:out", name))
}

fn ownership_annotations(name: &str, namespace: &str) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        annotations::capstan::RELEASE_NAME.to_string(),
        serde_json::Value::String(name.to_string()),
    );
    map.insert(
        annotations::capstan::RELEASE_NAMESPACE.to_string(),
        serde_json::Value::String(namespace.to_string()),
    );
    serde_json::Value::Object(map)
}

fn carries_ownership(live: &DynamicObject, ownership: &serde_json::Value) -> bool {
    let live_annotations = match &live.metadata.annotations {
        Some(annotations) => annotations,
        None => return false,
    };
    ownership
        .as_object()
        .map(|wanted| {
            wanted.iter().all(|(key, value)| {
                live_annotations.get(key).map(String::as_str) == value.as_str()
            })
        })
        .unwrap_or(true)
}

fn managed_by_us(live: &DynamicObject) -> bool {
    let managers = field_managers(live);
    // An unowned live object is adoptable without a grant
    managers.is_empty() || managers.iter().any(|m| m == DEFAULT_FIELD_MANAGER)
}

/// Whether applying `desired` would change nothing on `live`
fn desired_matches_live(desired: &DynamicObject, live: &DynamicObject) -> bool {
    map_subset(&desired.metadata.labels, &live.metadata.labels)
        && map_subset(&desired.metadata.annotations, &live.metadata.annotations)
        && json_subset(&desired.data, &live.data)
}

fn map_subset(
    wanted: &Option<BTreeMap<String, String>>,
    present: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(wanted) = wanted else { return true };
    wanted.iter().all(|(key, value)| {
        present
            .as_ref()
            .and_then(|p| p.get(key))
            .map(|v| v == value)
            .unwrap_or(false)
    })
}

fn json_subset(wanted: &serde_json::Value, present: &serde_json::Value) -> bool {
    match wanted {
        serde_json::Value::Null => true,
        serde_json::Value::Object(entries) => entries.iter().all(|(key, value)| {
            present
                .get(key)
                .map(|p| json_subset(value, p))
                .unwrap_or(false)
        }),
        other => other == present,
    }
}

/// Group by weight, ascending, preserving the input order inside a bucket
fn bucket_by_weight<T: Clone>(items: &[T], weight: impl Fn(&T) -> i32) -> Vec<(i32, Vec<T>)> {
    let mut buckets: BTreeMap<i32, Vec<T>> = BTreeMap::new();
    for item in items {
        buckets.entry(weight(item)).or_default().push(item.clone());
    }
    buckets.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    #[test]
    fn test_json_subset() {
        let live = serde_json::json!({"spec": {"replicas": 2, "extra": true}, "status": {}});
        assert!(json_subset(&serde_json::json!({"spec": {"replicas": 2}}), &live));
        assert!(!json_subset(&serde_json::json!({"spec": {"replicas": 3}}), &live));
        assert!(!json_subset(&serde_json::json!({"missing": 1}), &live));
        assert!(json_subset(&serde_json::json!({}), &live));
    }

    #[test]
    fn test_bucket_by_weight_sorted_ascending() {
        let items = vec![(5, "e"), (-5, "a"), (0, "c"), (-5, "b"), (0, "d")];
        let buckets = bucket_by_weight(&items, |(w, _)| *w);

        let weights: Vec<i32> = buckets.iter().map(|(w, _)| *w).collect();
        assert_eq!(weights, vec![-5, 0, 5]);
        // Input order preserved inside a bucket
        assert_eq!(buckets[0].1, vec![(-5, "a"), (-5, "b")]);
    }

    #[test]
    fn test_desired_matches_live_checks_metadata() {
        let mut desired = MockCluster::object("v1", "ConfigMap", Some("app"), "cfg");
        desired.metadata.labels = Some(
            [("app".to_string(), "demo".to_string())].into_iter().collect(),
        );
        desired.data = serde_json::json!({"data": {"k": "v"}});

        let mut live = desired.clone();
        live.data = serde_json::json!({"data": {"k": "v", "other": "x"}});
        assert!(desired_matches_live(&desired, &live));

        live.metadata.labels = None;
        assert!(!desired_matches_live(&desired, &live));
    }

    #[test]
    fn test_stage_ids() {
        let (stage_in, stage_out) = stage_ids("pre-install/weight:-5");
        assert_eq!(stage_in, "stage/pre-install/weight:-5:in");
        assert_eq!(stage_out, "stage/pre-install/weight:-5:out");
    }

    #[test]
    fn test_carries_ownership() {
        let ownership = ownership_annotations("demo", "app");

        let mut live = MockCluster::object("v1", "ConfigMap", Some("app"), "cfg");
        assert!(!carries_ownership(&live, &ownership));

        live.metadata.annotations = Some(
            [
                ("capstan.io/release-name".to_string(), "demo".to_string()),
                ("capstan.io/release-namespace".to_string(), "app".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        assert!(carries_ownership(&live, &ownership));
    }
}
