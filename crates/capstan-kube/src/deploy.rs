//! Deploy action surface
//!
//! [`Deployer`] is the library entry point: it loads the prior release,
//! adapts the rendered manifests into a desired release, builds the plan,
//! executes it and reports the terminal release. One invocation drives one
//! revision forward and returns; it is not a reconciler loop.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use capstan_core::{ChartMetadata, Logger, TracingLogger};

use crate::client::KubeClient;
use crate::error::{KubeError, Result};
use crate::plan::{BuiltPlan, ExecutorOptions, PlanBuilder, PlanBuilderOptions, PlanExecutor};
use crate::release::{
    DeployType, Release, ReleaseOptions, ReleaseStatus, SharedRelease,
};
use crate::resource::{self, FromManifestOptions, GeneralResource, HookResource, StandaloneCrd};
use crate::storage::ReleaseStorage;

/// Serialises top-level actions that touch ambient process-wide state
/// (e.g. environment passthrough for secret keys). Never held across more
/// than the action itself.
static ACTION_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Inputs for one deploy invocation
pub struct DeployOptions {
    /// Release name
    pub release_name: String,

    /// Target namespace, also the default for namespaced resources
    pub namespace: String,

    /// Rendered chart output: general resources and hooks, one YAML stream
    pub manifests: String,

    /// CRDs shipped beside the chart, applied before everything else
    pub crd_manifests: Vec<String>,

    /// Values snapshot recorded with the release
    pub values: serde_json::Value,

    /// Chart identity recorded with the release
    pub chart: ChartMetadata,

    /// Rendered release notes
    pub notes: String,

    /// Forced deploy type; auto-detected from history when unset
    pub deploy_type: Option<DeployType>,

    /// Executor worker budget (default 1)
    pub workers: usize,

    /// Planner knobs (tracking timeouts, poll interval)
    pub plan_options: PlanBuilderOptions,

    /// Cooperative cancellation signal
    pub cancel: Option<tokio::sync::watch::Receiver<bool>>,

    /// Write a Graphviz dump of the optimized plan before executing
    pub dot_path: Option<PathBuf>,
}

impl DeployOptions {
    pub fn new(release_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            release_name: release_name.into(),
            namespace: namespace.into(),
            manifests: String::new(),
            crd_manifests: Vec::new(),
            values: serde_json::json!({}),
            chart: ChartMetadata::default(),
            notes: String::new(),
            deploy_type: None,
            workers: 1,
            plan_options: PlanBuilderOptions::default(),
            cancel: None,
            dot_path: None,
        }
    }
}

/// Inputs for one uninstall invocation
pub struct UninstallOptions {
    pub release_name: String,
    pub namespace: String,

    /// Keep the release history records after a successful uninstall
    pub keep_history: bool,

    pub workers: usize,
    pub plan_options: PlanBuilderOptions,
    pub cancel: Option<tokio::sync::watch::Receiver<bool>>,
    pub dot_path: Option<PathBuf>,
}

impl UninstallOptions {
    pub fn new(release_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            release_name: release_name.into(),
            namespace: namespace.into(),
            keep_history: false,
            workers: 1,
            plan_options: PlanBuilderOptions::default(),
            cancel: None,
            dot_path: None,
        }
    }
}

/// What one invocation did
#[derive(Debug)]
pub struct DeployOutcome {
    /// Snapshot of the release after the run
    pub release: Release,

    pub status: ReleaseStatus,
    pub revision: u32,

    /// The plan was useless; no revision was recorded
    pub skipped: bool,

    /// Human IDs of completed resource mutations
    pub completed: Vec<String>,

    /// Human IDs of canceled resource mutations
    pub canceled: Vec<String>,
}

/// Drives releases against one cluster session
pub struct Deployer {
    client: Arc<KubeClient>,
    storage: Arc<dyn ReleaseStorage>,
    logger: Arc<dyn Logger>,
}

impl Deployer {
    pub fn new(client: Arc<KubeClient>, storage: Arc<dyn ReleaseStorage>) -> Self {
        Self {
            client,
            storage,
            logger: Arc::new(TracingLogger::new()),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Bring the cluster to the chart's declared state for the named release
    pub async fn deploy(&self, opts: DeployOptions) -> Result<DeployOutcome> {
        let _guard = ACTION_LOCK.lock().await;

        capstan_core::validate_release_name(&opts.release_name)?;

        let prior_record = self
            .storage
            .latest(&opts.namespace, &opts.release_name)
            .await?;
        let deploy_type = opts.deploy_type.unwrap_or(match &prior_record {
            None => DeployType::Initial,
            Some(_) => DeployType::Upgrade,
        });
        let revision = prior_record.as_ref().map(|r| r.revision + 1).unwrap_or(1);

        tracing::info!(
            release = %opts.release_name,
            namespace = %opts.namespace,
            revision,
            deploy_type = %deploy_type,
            "planning release deployment"
        );

        let release = self.desired_release(&opts, revision).await?;
        let shared: SharedRelease = Arc::new(RwLock::new(release));

        let previous = match prior_record {
            Some(record) => {
                let prior = record.into_release(self.client.mapper()).await?;
                Some(Arc::new(RwLock::new(prior)))
            }
            None => None,
        };

        let built = PlanBuilder::new(
            deploy_type,
            shared,
            previous,
            self.client.clone(),
            self.storage.clone(),
        )
        .with_options(opts.plan_options)
        .build()
        .await?;

        if let Some(path) = &opts.dot_path {
            built.plan.save_dot(path)?;
        }

        if built.plan.useless() {
            built
                .release
                .write()
                .expect("release lock poisoned")
                .skip();
            tracing::info!(release = %opts.release_name, "no changes required, skipping release");
            return Ok(outcome_of(&built, true));
        }

        let executor = PlanExecutor::new(ExecutorOptions {
            workers: opts.workers,
            cancel: opts.cancel.clone(),
            logger: Some(self.logger.clone()),
        });

        match executor.execute(&built.plan).await {
            Ok(()) => Ok(outcome_of(&built, false)),
            Err(err) => {
                // When nothing ran, no pending record was written; drop any
                // tentative one so the aborted revision leaves no trace
                if built.plan.completed_operations().is_empty() {
                    let _ = self
                        .storage
                        .delete(&opts.namespace, &opts.release_name, revision)
                        .await;
                }
                Err(err)
            }
        }
    }

    /// Remove every resource the latest revision owns and close the release
    pub async fn uninstall(&self, opts: UninstallOptions) -> Result<DeployOutcome> {
        let _guard = ACTION_LOCK.lock().await;

        let mut record = self
            .storage
            .latest(&opts.namespace, &opts.release_name)
            .await?
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: opts.release_name.clone(),
                namespace: opts.namespace.clone(),
            })?;

        tracing::info!(
            release = %opts.release_name,
            namespace = %opts.namespace,
            revision = record.revision,
            "planning release uninstall"
        );

        // The revision record is re-pended through the release state machine
        record.status = ReleaseStatus::Unknown;
        let release = record.into_release(self.client.mapper()).await?;
        let shared: SharedRelease = Arc::new(RwLock::new(release));

        let built = PlanBuilder::new(
            DeployType::Uninstall,
            shared,
            None,
            self.client.clone(),
            self.storage.clone(),
        )
        .with_options(opts.plan_options)
        .build()
        .await?;

        if let Some(path) = &opts.dot_path {
            built.plan.save_dot(path)?;
        }

        let executor = PlanExecutor::new(ExecutorOptions {
            workers: opts.workers,
            cancel: opts.cancel.clone(),
            logger: Some(self.logger.clone()),
        });
        executor.execute(&built.plan).await?;

        if !opts.keep_history {
            let history = self
                .storage
                .history(&opts.namespace, &opts.release_name)
                .await?;
            for record in history {
                self.storage
                    .delete(&record.namespace, &record.name, record.revision)
                    .await?;
            }
        }

        Ok(outcome_of(&built, false))
    }

    /// Adapt the rendered manifest stream into the desired release model
    async fn desired_release(&self, opts: &DeployOptions, revision: u32) -> Result<Release> {
        let from_opts = FromManifestOptions {
            default_namespace: opts.namespace.clone(),
            mapper: self.client.mapper(),
        };

        let mut hooks = Vec::new();
        let mut generals = Vec::new();
        for document in capstan_core::split_manifests(&opts.manifests) {
            let value = capstan_core::parse_document(&document)?;
            if resource::document_is_hook(&value) {
                hooks.push(HookResource::from_manifest(&document, &from_opts).await?);
            } else {
                generals.push(GeneralResource::from_manifest(&document, &from_opts).await?);
            }
        }

        let mut crds = Vec::new();
        for stream in &opts.crd_manifests {
            for document in capstan_core::split_manifests(stream) {
                crds.push(StandaloneCrd::from_manifest(&document, &from_opts).await?);
            }
        }

        Release::new(
            opts.release_name.clone(),
            opts.namespace.clone(),
            revision,
            opts.values.clone(),
            opts.chart.clone(),
            crds,
            hooks,
            generals,
            &opts.notes,
            ReleaseOptions::default(),
        )
    }
}

fn outcome_of(built: &BuiltPlan, skipped: bool) -> DeployOutcome {
    let release = built
        .release
        .read()
        .expect("release lock poisoned")
        .clone();

    DeployOutcome {
        status: release.status(),
        revision: release.revision(),
        skipped,
        completed: built
            .plan
            .worthy_completed_operations()
            .iter()
            .map(|op| op.human_id())
            .collect(),
        canceled: built
            .plan
            .worthy_canceled_operations()
            .iter()
            .map(|op| op.human_id())
            .collect(),
        release,
    }
}
