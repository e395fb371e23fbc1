//! Tracking operations

use std::sync::Arc;

use super::{OperationType, StatusCell};
use crate::client::KubeClient;
use crate::error::Result;
use crate::resource::ResourceID;
use crate::track::{self, TrackOptions};

/// Block until the target reaches readiness or the timeout expires
pub struct TrackReadinessOperation {
    resource: ResourceID,
    client: Arc<KubeClient>,
    opts: TrackOptions,
    empty: bool,
    status: StatusCell,
}

impl TrackReadinessOperation {
    pub fn new(resource: ResourceID, client: Arc<KubeClient>, opts: TrackOptions) -> Self {
        Self {
            resource,
            client,
            opts,
            empty: false,
            status: StatusCell::new(),
        }
    }

    /// Mark the tracker empty: the planner knows the target is already in
    /// its goal state
    pub fn into_empty(mut self) -> Self {
        self.empty = true;
        self
    }

    pub(super) async fn run(&self) -> Result<()> {
        track::wait_ready(&self.client, &self.resource, self.opts).await
    }

    pub fn id(&self) -> String {
        format!("{}/{}", OperationType::TrackReadiness, self.resource.id())
    }

    pub fn human_id(&self) -> String {
        format!("track readiness of resource: {}", self.resource.human_id())
    }

    pub fn empty(&self) -> bool {
        self.empty
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Block until the target exists
pub struct TrackPresenceOperation {
    resource: ResourceID,
    client: Arc<KubeClient>,
    opts: TrackOptions,
    status: StatusCell,
}

impl TrackPresenceOperation {
    pub fn new(resource: ResourceID, client: Arc<KubeClient>, opts: TrackOptions) -> Self {
        Self {
            resource,
            client,
            opts,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        track::wait_present(&self.client, &self.resource, self.opts).await
    }

    pub fn id(&self) -> String {
        format!("{}/{}", OperationType::TrackPresence, self.resource.id())
    }

    pub fn human_id(&self) -> String {
        format!("track presence of resource: {}", self.resource.human_id())
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Block until the target no longer exists
pub struct TrackAbsenceOperation {
    resource: ResourceID,
    client: Arc<KubeClient>,
    opts: TrackOptions,
    empty: bool,
    status: StatusCell,
}

impl TrackAbsenceOperation {
    pub fn new(resource: ResourceID, client: Arc<KubeClient>, opts: TrackOptions) -> Self {
        Self {
            resource,
            client,
            opts,
            empty: false,
            status: StatusCell::new(),
        }
    }

    /// Mark the tracker empty: the planner observed the target to be absent
    pub fn into_empty(mut self) -> Self {
        self.empty = true;
        self
    }

    pub(super) async fn run(&self) -> Result<()> {
        track::wait_absent(&self.client, &self.resource, self.opts).await
    }

    pub fn id(&self) -> String {
        format!("{}/{}", OperationType::TrackAbsence, self.resource.id())
    }

    pub fn human_id(&self) -> String {
        format!("track absence of resource: {}", self.resource.human_id())
    }

    pub fn empty(&self) -> bool {
        self.empty
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}
