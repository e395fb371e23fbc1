//! Release bookkeeping operations
//!
//! These mutate the release model's status and persist the record through
//! the history collaborator. They are the only writers of release state.
//! Guards are scoped so no lock is held across the storage await.

use std::sync::Arc;

use super::{OperationType, StatusCell};
use crate::error::Result;
use crate::release::{DeployType, ReleaseRecord, SharedRelease};
use crate::storage::ReleaseStorage;

fn release_id(release: &SharedRelease) -> String {
    release.read().expect("release lock poisoned").id()
}

fn release_human_id(release: &SharedRelease) -> String {
    release.read().expect("release lock poisoned").human_id()
}

/// Commit the release to its pending state at plan entry
pub struct PendReleaseOperation {
    release: SharedRelease,
    storage: Arc<dyn ReleaseStorage>,
    deploy_type: DeployType,
    /// Uninstall re-pends an existing revision record instead of writing a
    /// new one
    update_existing: bool,
    status: StatusCell,
}

impl PendReleaseOperation {
    pub fn new(
        release: SharedRelease,
        storage: Arc<dyn ReleaseStorage>,
        deploy_type: DeployType,
    ) -> Self {
        Self {
            release,
            storage,
            deploy_type,
            update_existing: deploy_type == DeployType::Uninstall,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        let record: ReleaseRecord = {
            let mut release = self.release.write().expect("release lock poisoned");
            release.pend(self.deploy_type);
            release.to_record()?
        };

        if self.update_existing {
            self.storage.update(&record).await
        } else {
            self.storage.create(&record).await
        }
    }

    pub fn id(&self) -> String {
        format!("release/{}/pend", release_id(&self.release))
    }

    pub fn human_id(&self) -> String {
        format!("pend release: {}", release_human_id(&self.release))
    }

    pub fn op_type(&self) -> OperationType {
        OperationType::PendRelease
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Close the release revision in its success state at plan exit
pub struct SucceedReleaseOperation {
    release: SharedRelease,
    storage: Arc<dyn ReleaseStorage>,
    deploy_type: DeployType,
    status: StatusCell,
}

impl SucceedReleaseOperation {
    pub fn new(
        release: SharedRelease,
        storage: Arc<dyn ReleaseStorage>,
        deploy_type: DeployType,
    ) -> Self {
        Self {
            release,
            storage,
            deploy_type,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        let record = {
            let mut release = self.release.write().expect("release lock poisoned");
            if self.deploy_type == DeployType::Uninstall {
                release.uninstalled();
            } else {
                release.succeed();
            }
            release.to_record()?
        };

        self.storage.update(&record).await
    }

    pub fn id(&self) -> String {
        format!("release/{}/succeed", release_id(&self.release))
    }

    pub fn human_id(&self) -> String {
        format!("succeed release: {}", release_human_id(&self.release))
    }

    pub fn op_type(&self) -> OperationType {
        OperationType::SucceedRelease
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Close the release revision as failed; driven only on the failure branch
pub struct FailReleaseOperation {
    release: SharedRelease,
    storage: Arc<dyn ReleaseStorage>,
    status: StatusCell,
}

impl FailReleaseOperation {
    pub fn new(release: SharedRelease, storage: Arc<dyn ReleaseStorage>) -> Self {
        Self {
            release,
            storage,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        let record = {
            let mut release = self.release.write().expect("release lock poisoned");
            release.fail();
            release.to_record()?
        };

        self.storage.update(&record).await
    }

    pub fn id(&self) -> String {
        format!("release/{}/fail", release_id(&self.release))
    }

    pub fn human_id(&self) -> String {
        format!("fail release: {}", release_human_id(&self.release))
    }

    pub fn op_type(&self) -> OperationType {
        OperationType::FailRelease
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Mark the previously deployed revision as replaced
pub struct SupersedePreviousReleaseOperation {
    previous: SharedRelease,
    storage: Arc<dyn ReleaseStorage>,
    status: StatusCell,
}

impl SupersedePreviousReleaseOperation {
    pub fn new(previous: SharedRelease, storage: Arc<dyn ReleaseStorage>) -> Self {
        Self {
            previous,
            storage,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        let record = {
            let mut previous = self.previous.write().expect("release lock poisoned");
            previous.supersede();
            previous.to_record()?
        };

        self.storage.update(&record).await
    }

    pub fn id(&self) -> String {
        format!("release/{}/supersede", release_id(&self.previous))
    }

    pub fn human_id(&self) -> String {
        format!("supersede release: {}", release_human_id(&self.previous))
    }

    pub fn op_type(&self) -> OperationType {
        OperationType::SupersedePreviousRelease
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}
