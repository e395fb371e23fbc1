//! Operation taxonomy
//!
//! Plan vertices are drawn from a closed set of operation kinds sharing one
//! capability surface: `execute`, `id`, `human_id`, `op_type`, `status`,
//! `empty`. The set is fixed, so dispatch is an exhaustive match and a new
//! kind cannot be forgotten anywhere.
//!
//! An operation performs exactly one cluster (or history) interaction and
//! records whether it completed or failed; it never retries internally.
//! Retrying and ordering are the executor's concern.

mod release;
mod resource;
mod stage;
mod track;

pub use release::{
    FailReleaseOperation, PendReleaseOperation, SucceedReleaseOperation,
    SupersedePreviousReleaseOperation,
};
pub use resource::{
    ApplyResourceOperation, CreateResourceOperation, DeleteResourceOperation,
    RecreateResourceOperation, ResourceOperationOptions, UpdateResourceOperation,
};
pub use stage::StageOperation;
pub use track::{TrackAbsenceOperation, TrackPresenceOperation, TrackReadinessOperation};

use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Execution status of one operation
///
/// `Unknown` at the end of a run means the operation was canceled by an
/// earlier failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpStatus {
    #[default]
    Unknown,
    Completed,
    Failed,
}

/// Shared status slot so the graph can be queried while operations run
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<Mutex<OpStatus>>);

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> OpStatus {
        *self.0.lock().expect("status cell poisoned")
    }

    pub(crate) fn set(&self, status: OpStatus) {
        *self.0.lock().expect("status cell poisoned") = status;
    }
}

/// Kind tag for every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Create,
    Recreate,
    Apply,
    Update,
    Delete,
    ExtraPostCreate,
    ExtraPostRecreate,
    ExtraPostApply,
    ExtraPostUpdate,
    ExtraPostDelete,
    TrackReadiness,
    TrackPresence,
    TrackAbsence,
    Stage,
    PendRelease,
    SucceedRelease,
    FailRelease,
    SupersedePreviousRelease,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Recreate => "recreate",
            OperationType::Apply => "apply",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::ExtraPostCreate => "extra-post-create",
            OperationType::ExtraPostRecreate => "extra-post-recreate",
            OperationType::ExtraPostApply => "extra-post-apply",
            OperationType::ExtraPostUpdate => "extra-post-update",
            OperationType::ExtraPostDelete => "extra-post-delete",
            OperationType::TrackReadiness => "track-readiness",
            OperationType::TrackPresence => "track-presence",
            OperationType::TrackAbsence => "track-absence",
            OperationType::Stage => "stage",
            OperationType::PendRelease => "pend-release",
            OperationType::SucceedRelease => "succeed-release",
            OperationType::FailRelease => "fail-release",
            OperationType::SupersedePreviousRelease => "supersede-previous-release",
        }
    }

    /// Whether this kind mutates cluster resources (for human-facing reports)
    pub fn is_resource_mutation(&self) -> bool {
        matches!(
            self,
            OperationType::Create
                | OperationType::Recreate
                | OperationType::Apply
                | OperationType::Update
                | OperationType::Delete
                | OperationType::ExtraPostCreate
                | OperationType::ExtraPostRecreate
                | OperationType::ExtraPostApply
                | OperationType::ExtraPostUpdate
                | OperationType::ExtraPostDelete
        )
    }

    /// Whether this kind counts when deciding if a plan is useless
    pub fn affects_cluster(&self) -> bool {
        self.is_resource_mutation()
            || matches!(
                self,
                OperationType::TrackReadiness
                    | OperationType::TrackPresence
                    | OperationType::TrackAbsence
            )
    }

    pub fn is_extra_post(&self) -> bool {
        matches!(
            self,
            OperationType::ExtraPostCreate
                | OperationType::ExtraPostRecreate
                | OperationType::ExtraPostApply
                | OperationType::ExtraPostUpdate
                | OperationType::ExtraPostDelete
        )
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One plan vertex
pub enum Operation {
    Create(CreateResourceOperation),
    Recreate(RecreateResourceOperation),
    Apply(ApplyResourceOperation),
    Update(UpdateResourceOperation),
    Delete(DeleteResourceOperation),
    TrackReadiness(TrackReadinessOperation),
    TrackPresence(TrackPresenceOperation),
    TrackAbsence(TrackAbsenceOperation),
    Stage(StageOperation),
    PendRelease(PendReleaseOperation),
    SucceedRelease(SucceedReleaseOperation),
    FailRelease(FailReleaseOperation),
    SupersedePreviousRelease(SupersedePreviousReleaseOperation),
}

impl Operation {
    /// Perform the operation's single interaction and record the outcome
    pub async fn execute(&self) -> Result<()> {
        let result = match self {
            Operation::Create(op) => op.run().await,
            Operation::Recreate(op) => op.run().await,
            Operation::Apply(op) => op.run().await,
            Operation::Update(op) => op.run().await,
            Operation::Delete(op) => op.run().await,
            Operation::TrackReadiness(op) => op.run().await,
            Operation::TrackPresence(op) => op.run().await,
            Operation::TrackAbsence(op) => op.run().await,
            Operation::Stage(op) => op.run(),
            Operation::PendRelease(op) => op.run().await,
            Operation::SucceedRelease(op) => op.run().await,
            Operation::FailRelease(op) => op.run().await,
            Operation::SupersedePreviousRelease(op) => op.run().await,
        };

        self.status_cell().set(match result {
            Ok(()) => OpStatus::Completed,
            Err(_) => OpStatus::Failed,
        });

        result
    }

    /// Stable vertex key
    pub fn id(&self) -> String {
        match self {
            Operation::Create(op) => op.id(),
            Operation::Recreate(op) => op.id(),
            Operation::Apply(op) => op.id(),
            Operation::Update(op) => op.id(),
            Operation::Delete(op) => op.id(),
            Operation::TrackReadiness(op) => op.id(),
            Operation::TrackPresence(op) => op.id(),
            Operation::TrackAbsence(op) => op.id(),
            Operation::Stage(op) => op.id(),
            Operation::PendRelease(op) => op.id(),
            Operation::SucceedRelease(op) => op.id(),
            Operation::FailRelease(op) => op.id(),
            Operation::SupersedePreviousRelease(op) => op.id(),
        }
    }

    /// Form used in messages and failure reports
    pub fn human_id(&self) -> String {
        match self {
            Operation::Create(op) => op.human_id(),
            Operation::Recreate(op) => op.human_id(),
            Operation::Apply(op) => op.human_id(),
            Operation::Update(op) => op.human_id(),
            Operation::Delete(op) => op.human_id(),
            Operation::TrackReadiness(op) => op.human_id(),
            Operation::TrackPresence(op) => op.human_id(),
            Operation::TrackAbsence(op) => op.human_id(),
            Operation::Stage(op) => op.human_id(),
            Operation::PendRelease(op) => op.human_id(),
            Operation::SucceedRelease(op) => op.human_id(),
            Operation::FailRelease(op) => op.human_id(),
            Operation::SupersedePreviousRelease(op) => op.human_id(),
        }
    }

    pub fn op_type(&self) -> OperationType {
        match self {
            Operation::Create(op) => op.op_type(),
            Operation::Recreate(op) => op.op_type(),
            Operation::Apply(op) => op.op_type(),
            Operation::Update(op) => op.op_type(),
            Operation::Delete(op) => op.op_type(),
            Operation::TrackReadiness(_) => OperationType::TrackReadiness,
            Operation::TrackPresence(_) => OperationType::TrackPresence,
            Operation::TrackAbsence(_) => OperationType::TrackAbsence,
            Operation::Stage(_) => OperationType::Stage,
            Operation::PendRelease(_) => OperationType::PendRelease,
            Operation::SucceedRelease(_) => OperationType::SucceedRelease,
            Operation::FailRelease(_) => OperationType::FailRelease,
            Operation::SupersedePreviousRelease(_) => OperationType::SupersedePreviousRelease,
        }
    }

    pub fn status(&self) -> OpStatus {
        self.status_cell().get()
    }

    /// Whether executing this operation would produce no cluster change
    pub fn empty(&self) -> bool {
        match self {
            Operation::Create(_) | Operation::Recreate(_) => false,
            Operation::Apply(op) => op.empty(),
            Operation::Update(op) => op.empty(),
            Operation::Delete(op) => op.empty(),
            Operation::TrackReadiness(op) => op.empty(),
            Operation::TrackPresence(_) => false,
            Operation::TrackAbsence(op) => op.empty(),
            // Stage markers and release bookkeeping never touch the cluster
            Operation::Stage(_)
            | Operation::PendRelease(_)
            | Operation::SucceedRelease(_)
            | Operation::FailRelease(_)
            | Operation::SupersedePreviousRelease(_) => true,
        }
    }

    fn status_cell(&self) -> &StatusCell {
        match self {
            Operation::Create(op) => op.status_cell(),
            Operation::Recreate(op) => op.status_cell(),
            Operation::Apply(op) => op.status_cell(),
            Operation::Update(op) => op.status_cell(),
            Operation::Delete(op) => op.status_cell(),
            Operation::TrackReadiness(op) => op.status_cell(),
            Operation::TrackPresence(op) => op.status_cell(),
            Operation::TrackAbsence(op) => op.status_cell(),
            Operation::Stage(op) => op.status_cell(),
            Operation::PendRelease(op) => op.status_cell(),
            Operation::SucceedRelease(op) => op.status_cell(),
            Operation::FailRelease(op) => op.status_cell(),
            Operation::SupersedePreviousRelease(op) => op.status_cell(),
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id())
            .field("type", &self.op_type().as_str())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_labels() {
        assert_eq!(OperationType::Create.as_str(), "create");
        assert_eq!(OperationType::ExtraPostApply.as_str(), "extra-post-apply");
        assert_eq!(OperationType::TrackAbsence.as_str(), "track-absence");
        assert_eq!(
            OperationType::SupersedePreviousRelease.as_str(),
            "supersede-previous-release"
        );
    }

    #[test]
    fn test_mutation_classification() {
        assert!(OperationType::Apply.is_resource_mutation());
        assert!(OperationType::ExtraPostDelete.is_resource_mutation());
        assert!(!OperationType::TrackReadiness.is_resource_mutation());
        assert!(!OperationType::Stage.is_resource_mutation());
        assert!(!OperationType::SucceedRelease.is_resource_mutation());
    }

    #[test]
    fn test_affects_cluster_includes_trackers() {
        assert!(OperationType::TrackReadiness.affects_cluster());
        assert!(OperationType::Delete.affects_cluster());
        assert!(!OperationType::Stage.affects_cluster());
        assert!(!OperationType::PendRelease.affects_cluster());
    }

    #[test]
    fn test_status_cell_shared() {
        let cell = StatusCell::new();
        let other = cell.clone();
        cell.set(OpStatus::Completed);
        assert_eq!(other.get(), OpStatus::Completed);
    }

    #[tokio::test]
    async fn test_stage_operation_completes_and_is_empty() {
        let op = Operation::Stage(StageOperation::new("stage/install:in"));
        assert_eq!(op.status(), OpStatus::Unknown);
        assert!(op.empty());

        op.execute().await.unwrap();
        assert_eq!(op.status(), OpStatus::Completed);
        assert_eq!(op.id(), "stage/install:in");
    }
}
