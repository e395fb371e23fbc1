//! End-to-end deploy scenarios against the in-memory cluster

use std::sync::{Arc, RwLock};
use std::time::Duration;

use capstan_core::ChartMetadata;
use capstan_kube::{
    DeployOptions, Deployer, GeneralResource, HookResource, KubeError, KubeClient,
    MockCluster, MockReleaseStorage, PlanBuilder, PlanBuilderOptions, Release, ReleaseOptions,
    ReleaseStatus, RestMapper, StandaloneCrd, StaticMapper, UninstallOptions,
    DeployType, FromManifestOptions, ReleaseStorage,
};

struct Harness {
    cluster: Arc<MockCluster>,
    mapper: Arc<StaticMapper>,
    client: Arc<KubeClient>,
    storage: Arc<MockReleaseStorage>,
    deployer: Deployer,
}

fn harness() -> Harness {
    let cluster = Arc::new(MockCluster::new());
    let mapper = Arc::new(StaticMapper::with_builtins());
    let client = Arc::new(KubeClient::new(
        cluster.clone(),
        mapper.clone() as Arc<dyn RestMapper>,
    ));
    let storage = Arc::new(MockReleaseStorage::new());
    let deployer = Deployer::new(client.clone(), storage.clone());

    Harness {
        cluster,
        mapper,
        client,
        storage,
        deployer,
    }
}

fn fast_plan_options() -> PlanBuilderOptions {
    PlanBuilderOptions {
        default_track_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(5),
    }
}

fn deploy_options(manifests: &str) -> DeployOptions {
    let mut opts = DeployOptions::new("demo", "app");
    opts.manifests = manifests.to_string();
    opts.chart = ChartMetadata::new("demo", "1.0.0");
    opts.plan_options = fast_plan_options();
    opts
}

const CONFIGMAP_AND_DEPLOYMENT: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
data:
  key: value
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
";

#[tokio::test]
async fn scenario_install() {
    let h = harness();

    let outcome = h
        .deployer
        .deploy(deploy_options(CONFIGMAP_AND_DEPLOYMENT))
        .await
        .unwrap();

    assert_eq!(outcome.revision, 1);
    assert_eq!(outcome.status, ReleaseStatus::Deployed);
    assert!(!outcome.skipped);

    assert!(h.cluster.contains("v1", "ConfigMap", "app", "cfg"));
    assert!(h.cluster.contains("apps/v1", "Deployment", "app", "web"));

    assert!(outcome
        .completed
        .iter()
        .any(|op| op == "create resource: app/ConfigMap/cfg"));
    assert!(outcome
        .completed
        .iter()
        .any(|op| op == "create resource: app/Deployment/web"));

    let stored = h.storage.latest("app", "demo").await.unwrap().unwrap();
    assert_eq!(stored.revision, 1);
    assert_eq!(stored.status, ReleaseStatus::Deployed);
    assert!(stored.first_deployed.is_some());
}

#[tokio::test]
async fn scenario_upgrade_with_removal() {
    let h = harness();

    let revision_one = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: a
data:
  generation: \"1\"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: b
data:
  removed: \"soon\"
";
    h.deployer.deploy(deploy_options(revision_one)).await.unwrap();
    assert!(h.cluster.contains("v1", "ConfigMap", "app", "b"));

    let revision_two = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: a
data:
  generation: \"2\"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: c
data:
  fresh: \"yes\"
";
    let outcome = h.deployer.deploy(deploy_options(revision_two)).await.unwrap();

    assert_eq!(outcome.revision, 2);
    assert_eq!(outcome.status, ReleaseStatus::Deployed);

    assert!(h.cluster.contains("v1", "ConfigMap", "app", "a"));
    assert!(h.cluster.contains("v1", "ConfigMap", "app", "c"));
    assert!(
        !h.cluster.contains("v1", "ConfigMap", "app", "b"),
        "orphaned resource must be deleted"
    );
    assert!(outcome
        .completed
        .iter()
        .any(|op| op == "delete resource: app/ConfigMap/b"));

    let history = h.storage.history("app", "demo").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, ReleaseStatus::Deployed);
    assert_eq!(history[1].status, ReleaseStatus::Superseded);
}

/// Build a desired release and its plan without executing, for graph-shape
/// assertions
async fn plan_for(
    h: &Harness,
    manifests: &str,
    crd_manifests: &[&str],
    deploy_type: DeployType,
) -> capstan_kube::BuiltPlan {
    let from_opts = FromManifestOptions {
        default_namespace: "app".to_string(),
        mapper: h.mapper.clone() as Arc<dyn RestMapper>,
    };

    let mut hooks = Vec::new();
    let mut generals = Vec::new();
    for document in capstan_core::split_manifests(manifests) {
        let value = capstan_core::parse_document(&document).unwrap();
        if capstan_kube::resource::document_is_hook(&value) {
            hooks.push(HookResource::from_manifest(&document, &from_opts).await.unwrap());
        } else {
            generals.push(GeneralResource::from_manifest(&document, &from_opts).await.unwrap());
        }
    }

    let mut crds = Vec::new();
    for stream in crd_manifests {
        crds.push(StandaloneCrd::from_manifest(stream, &from_opts).await.unwrap());
    }

    let release = Release::new(
        "demo",
        "app",
        1,
        serde_json::json!({}),
        ChartMetadata::new("demo", "1.0.0"),
        crds,
        hooks,
        generals,
        "",
        ReleaseOptions::default(),
    )
    .unwrap();

    PlanBuilder::new(
        deploy_type,
        Arc::new(RwLock::new(release)),
        None,
        h.client.clone(),
        h.storage.clone(),
    )
    .with_options(fast_plan_options())
    .build()
    .await
    .unwrap()
}

const HOOKS_AND_RESOURCE: &str = "\
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  annotations:
    helm.sh/hook: pre-install
    helm.sh/hook-weight: \"-5\"
spec:
  template:
    spec:
      containers:
        - name: migrate
          image: migrate:latest
---
apiVersion: batch/v1
kind: Job
metadata:
  name: seed
  annotations:
    helm.sh/hook: pre-install
    helm.sh/hook-weight: \"0\"
spec:
  template:
    spec:
      containers:
        - name: seed
          image: seed:latest
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
data:
  key: value
";

#[tokio::test]
async fn scenario_hook_ordering() {
    let h = harness();

    let built = plan_for(&h, HOOKS_AND_RESOURCE, &[], DeployType::Install).await;
    let plan = &built.plan;

    let migrate = "create/batch/v1/Job/app/migrate";
    let migrate_track = "track-readiness/batch/v1/Job/app/migrate";
    let seed = "create/batch/v1/Job/app/seed";
    let seed_track = "track-readiness/batch/v1/Job/app/seed";
    let cfg = "create//v1/ConfigMap/app/cfg";

    for id in [migrate, migrate_track, seed, seed_track, cfg] {
        assert!(plan.operation(id).is_some(), "plan is missing {}", id);
    }

    // Weight -5 completes (including readiness) before weight 0 starts
    assert!(plan.reaches(migrate, seed));
    assert!(plan.reaches(migrate_track, seed));
    // Both hooks complete before any general resource applies
    assert!(plan.reaches(seed, cfg));
    assert!(plan.reaches(seed_track, cfg));

    // And the whole thing actually runs to completion
    let outcome = h
        .deployer
        .deploy(deploy_options(HOOKS_AND_RESOURCE))
        .await
        .unwrap();
    assert_eq!(outcome.status, ReleaseStatus::Deployed);
    assert!(h.cluster.contains("batch/v1", "Job", "app", "migrate"));
    assert!(h.cluster.contains("batch/v1", "Job", "app", "seed"));
}

#[tokio::test]
async fn scenario_failure_mid_stage() {
    let h = harness();
    // Nothing ever reconciles, so the deployment never becomes ready
    h.cluster.set_auto_ready(false);

    let err = h
        .deployer
        .deploy(deploy_options(CONFIGMAP_AND_DEPLOYMENT))
        .await
        .unwrap_err();

    match &err {
        KubeError::ExecutionFailed { failed, source } => {
            assert!(
                failed
                    .iter()
                    .any(|op| op == "track readiness of resource: app/Deployment/web"),
                "error must name the tracker, got {:?}",
                failed
            );
            assert!(matches!(**source, KubeError::TrackTimeout { .. }));
        }
        other => panic!("unexpected error: {}", other),
    }

    // Completed mutations are not reverted
    assert!(h.cluster.contains("v1", "ConfigMap", "app", "cfg"));
    assert!(h.cluster.contains("apps/v1", "Deployment", "app", "web"));

    // The revision is recorded failed so a rollback can target it
    let stored = h.storage.latest("app", "demo").await.unwrap().unwrap();
    assert_eq!(stored.status, ReleaseStatus::Failed);
}

const WIDGET_CRD: &str = "\
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.io
spec:
  group: example.io
  names:
    kind: Widget
    plural: widgets
  scope: Namespaced
";

const WIDGET_CR: &str = "\
apiVersion: example.io/v1
kind: Widget
metadata:
  name: w1
spec:
  size: 3
";

#[tokio::test]
async fn scenario_crd_install_then_use() {
    let h = harness();
    // The Widget kind only becomes resolvable once discovery reruns
    h.mapper
        .register_after_reset("example.io", "v1", "Widget", "widgets", true);

    let mut opts = deploy_options(WIDGET_CR);
    opts.crd_manifests = vec![WIDGET_CRD.to_string()];

    let outcome = h.deployer.deploy(opts).await.unwrap();
    assert_eq!(outcome.status, ReleaseStatus::Deployed);

    assert!(h.cluster.contains(
        "apiextensions.k8s.io/v1",
        "CustomResourceDefinition",
        "",
        "widgets.example.io"
    ));
    assert!(h.cluster.contains("example.io/v1", "Widget", "app", "w1"));
    assert!(h.mapper.reset_count() >= 1, "CRD apply must reset the mapper");

    // The CRD apply precedes the custom resource in the graph
    let built = plan_for(&h, WIDGET_CR, &[WIDGET_CRD], DeployType::Install).await;
    assert!(built.plan.reaches(
        "apply/apiextensions.k8s.io/v1/CustomResourceDefinition//widgets.example.io",
        "apply/example.io/v1/Widget/app/w1"
    ));
}

#[tokio::test]
async fn scenario_idempotent_rerun() {
    let h = harness();

    h.deployer
        .deploy(deploy_options(CONFIGMAP_AND_DEPLOYMENT))
        .await
        .unwrap();

    let outcome = h
        .deployer
        .deploy(deploy_options(CONFIGMAP_AND_DEPLOYMENT))
        .await
        .unwrap();

    assert!(outcome.skipped, "unchanged desired state must be a no-op");
    assert_eq!(outcome.status, ReleaseStatus::Skipped);

    let history = h.storage.history("app", "demo").await.unwrap();
    assert_eq!(history.len(), 1, "no new revision for a useless plan");
    assert_eq!(history[0].revision, 1);
    assert_eq!(history[0].status, ReleaseStatus::Deployed);
}

#[tokio::test]
async fn scenario_uninstall() {
    let h = harness();

    h.deployer
        .deploy(deploy_options(CONFIGMAP_AND_DEPLOYMENT))
        .await
        .unwrap();
    assert!(h.cluster.contains("v1", "ConfigMap", "app", "cfg"));

    let mut opts = UninstallOptions::new("demo", "app");
    opts.plan_options = fast_plan_options();
    let outcome = h.deployer.uninstall(opts).await.unwrap();

    assert_eq!(outcome.status, ReleaseStatus::Uninstalled);
    assert!(!h.cluster.contains("v1", "ConfigMap", "app", "cfg"));
    assert!(!h.cluster.contains("apps/v1", "Deployment", "app", "web"));
    assert!(
        h.storage.latest("app", "demo").await.unwrap().is_none(),
        "history removed after uninstall"
    );
}

#[tokio::test]
async fn scenario_resource_conflict() {
    let h = harness();

    // cfg already exists and belongs to another field manager
    h.cluster.seed_managed(
        MockCluster::object("v1", "ConfigMap", Some("app"), "cfg"),
        "kubectl",
    );

    let err = h
        .deployer
        .deploy(deploy_options(CONFIGMAP_AND_DEPLOYMENT))
        .await
        .unwrap_err();
    assert!(matches!(err, KubeError::ResourceConflict { .. }));

    // Nothing was recorded for the failed plan construction
    assert!(h.storage.latest("app", "demo").await.unwrap().is_none());
}

#[tokio::test]
async fn scenario_adoption_with_grant() {
    let h = harness();

    h.cluster.seed_managed(
        MockCluster::object("v1", "ConfigMap", Some("app"), "cfg"),
        "kubectl",
    );

    let manifests = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
  annotations:
    capstan.io/manageable-by: kubectl
data:
  key: value
";
    let outcome = h.deployer.deploy(deploy_options(manifests)).await.unwrap();
    assert_eq!(outcome.status, ReleaseStatus::Deployed);
    assert!(outcome
        .completed
        .iter()
        .any(|op| op == "apply resource: app/ConfigMap/cfg"));
}

#[tokio::test]
async fn planning_is_deterministic() {
    let h = harness();

    let built_a = plan_for(&h, HOOKS_AND_RESOURCE, &[WIDGET_CRD], DeployType::Install).await;
    let built_b = plan_for(&h, HOOKS_AND_RESOURCE, &[WIDGET_CRD], DeployType::Install).await;

    let ids = |plan: &capstan_kube::Plan| -> Vec<String> {
        plan.operations().iter().map(|op| op.id()).collect()
    };
    let edges = |plan: &capstan_kube::Plan| -> Vec<(String, String)> {
        plan.operations()
            .iter()
            .flat_map(|op| {
                let from = op.id();
                plan.successors(&from)
                    .into_iter()
                    .map(move |to| (from.clone(), to))
            })
            .collect()
    };

    assert_eq!(ids(&built_a.plan), ids(&built_b.plan));
    assert_eq!(edges(&built_a.plan), edges(&built_b.plan));
}
