//! Capstan Kube - the plan engine of the capstan deployment engine
//!
//! This crate turns a rendered chart plus the observed cluster state into a
//! directed acyclic graph of typed operations, executes that graph with
//! per-resource serialisation and stage barriers, and records the outcome as
//! a versioned release history:
//!
//! - **Resource identity**: manifest adaptation into addressable
//!   `(group, version, kind, namespace, name)` identities with lazy REST
//!   mapping resolution
//! - **Kube client facade**: serialised per-resource get/create/apply/
//!   patch/delete with an invocation-lifetime read cache
//! - **Operation taxonomy**: a closed set of plan vertices sharing one
//!   capability surface
//! - **Plan graph**: stage barriers, cycle prevention, transitive reduction,
//!   DOT rendering
//! - **Planner and executor**: diff to graph, graph to terminal release
//! - **Release model and storage**: legacy-compatible status state machine
//!   and history drivers

pub mod annotations;
pub mod client;
pub mod deploy;
pub mod error;
pub mod mapper;
pub mod mock;
pub mod operation;
pub mod plan;
pub mod release;
pub mod resource;
pub mod storage;
pub mod track;

pub use annotations::{HookDeletePolicy, HookPhase, ManageableBy};
pub use client::{
    ApplyOptions, ClusterApi, DeleteOptions, DynamicApi, GetOptions, KubeClient,
    DEFAULT_FIELD_MANAGER,
};
pub use deploy::{DeployOptions, DeployOutcome, Deployer, UninstallOptions};
pub use error::{KubeError, Result};
pub use mapper::{DiscoveryRestMapper, ResolvedResource, RestMapper};
pub use mock::{MockCluster, StaticMapper};
pub use operation::{OpStatus, Operation, OperationType};
pub use plan::{BuiltPlan, ExecutorOptions, Plan, PlanBuilder, PlanBuilderOptions, PlanExecutor};
pub use release::{
    DeployType, Release, ReleaseOptions, ReleaseRecord, ReleaseStatus, SharedRelease,
};
pub use resource::{
    FromManifestOptions, GeneralResource, HookResource, ResourceID, StandaloneCrd,
};
pub use storage::{MockReleaseStorage, ReleaseStorage, SecretStorage};
pub use track::TrackOptions;
