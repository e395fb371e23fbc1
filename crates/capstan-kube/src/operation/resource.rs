//! Resource-mutating operations

use std::sync::Arc;

use kube::api::DynamicObject;

use super::{OperationType, StatusCell};
use crate::client::{ApplyOptions, DeleteOptions, KubeClient};
use crate::error::Result;
use crate::resource::ResourceID;

/// Flags shared by the resource operation constructors
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceOperationOptions {
    /// Schedule after readiness tracking instead of before it; carries a
    /// distinct ID prefix so both kinds coexist in one graph
    pub extra_post: bool,

    /// The planner determined this operation would change nothing
    pub empty: bool,
}

/// Server-side apply of an object the planner observed to be absent
pub struct CreateResourceOperation {
    resource: ResourceID,
    body: DynamicObject,
    client: Arc<KubeClient>,
    extra_post: bool,
    status: StatusCell,
}

impl CreateResourceOperation {
    pub fn new(
        resource: ResourceID,
        body: DynamicObject,
        client: Arc<KubeClient>,
        opts: ResourceOperationOptions,
    ) -> Self {
        Self {
            resource,
            body,
            client,
            extra_post: opts.extra_post,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        self.client
            .create(&self.resource, &self.body)
            .await?;
        Ok(())
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.op_type(), self.resource.id())
    }

    pub fn human_id(&self) -> String {
        format!("create resource: {}", self.resource.human_id())
    }

    pub fn op_type(&self) -> OperationType {
        if self.extra_post {
            OperationType::ExtraPostCreate
        } else {
            OperationType::Create
        }
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Foreground delete followed by a server-side apply
pub struct RecreateResourceOperation {
    resource: ResourceID,
    body: DynamicObject,
    client: Arc<KubeClient>,
    extra_post: bool,
    status: StatusCell,
}

impl RecreateResourceOperation {
    pub fn new(
        resource: ResourceID,
        body: DynamicObject,
        client: Arc<KubeClient>,
        opts: ResourceOperationOptions,
    ) -> Self {
        Self {
            resource,
            body,
            client,
            extra_post: opts.extra_post,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        self.client
            .delete(&self.resource, DeleteOptions::default())
            .await?;
        self.client
            .create(&self.resource, &self.body)
            .await?;
        Ok(())
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.op_type(), self.resource.id())
    }

    pub fn human_id(&self) -> String {
        format!("recreate resource: {}", self.resource.human_id())
    }

    pub fn op_type(&self) -> OperationType {
        if self.extra_post {
            OperationType::ExtraPostRecreate
        } else {
            OperationType::Recreate
        }
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Server-side apply of an object the planner observed to be present
pub struct ApplyResourceOperation {
    resource: ResourceID,
    body: DynamicObject,
    client: Arc<KubeClient>,
    extra_post: bool,
    empty: bool,
    status: StatusCell,
}

impl ApplyResourceOperation {
    pub fn new(
        resource: ResourceID,
        body: DynamicObject,
        client: Arc<KubeClient>,
        opts: ResourceOperationOptions,
    ) -> Self {
        Self {
            resource,
            body,
            client,
            extra_post: opts.extra_post,
            empty: opts.empty,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        self.client
            .apply(&self.resource, &self.body, ApplyOptions::default())
            .await?;
        Ok(())
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.op_type(), self.resource.id())
    }

    pub fn human_id(&self) -> String {
        format!("apply resource: {}", self.resource.human_id())
    }

    pub fn op_type(&self) -> OperationType {
        if self.extra_post {
            OperationType::ExtraPostApply
        } else {
            OperationType::Apply
        }
    }

    pub fn empty(&self) -> bool {
        self.empty
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Merge-patch against a stored spec delta
pub struct UpdateResourceOperation {
    resource: ResourceID,
    patch: serde_json::Value,
    client: Arc<KubeClient>,
    extra_post: bool,
    status: StatusCell,
}

impl UpdateResourceOperation {
    pub fn new(
        resource: ResourceID,
        patch: serde_json::Value,
        client: Arc<KubeClient>,
        opts: ResourceOperationOptions,
    ) -> Self {
        Self {
            resource,
            patch,
            client,
            extra_post: opts.extra_post,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        if self.empty() {
            return Ok(());
        }
        // An absent target is the facade's no-op contract
        self.client
            .merge_patch(&self.resource, self.patch.clone())
            .await?;
        Ok(())
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.op_type(), self.resource.id())
    }

    pub fn human_id(&self) -> String {
        format!("update resource: {}", self.resource.human_id())
    }

    pub fn op_type(&self) -> OperationType {
        if self.extra_post {
            OperationType::ExtraPostUpdate
        } else {
            OperationType::Update
        }
    }

    pub fn empty(&self) -> bool {
        match &self.patch {
            serde_json::Value::Null => true,
            serde_json::Value::Object(entries) => entries.is_empty(),
            _ => false,
        }
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}

/// Foreground delete; an absent object is a benign no-op
pub struct DeleteResourceOperation {
    resource: ResourceID,
    client: Arc<KubeClient>,
    extra_post: bool,
    empty: bool,
    status: StatusCell,
}

impl DeleteResourceOperation {
    pub fn new(
        resource: ResourceID,
        client: Arc<KubeClient>,
        opts: ResourceOperationOptions,
    ) -> Self {
        Self {
            resource,
            client,
            extra_post: opts.extra_post,
            empty: opts.empty,
            status: StatusCell::new(),
        }
    }

    pub(super) async fn run(&self) -> Result<()> {
        self.client
            .delete(&self.resource, DeleteOptions::default())
            .await
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.op_type(), self.resource.id())
    }

    pub fn human_id(&self) -> String {
        format!("delete resource: {}", self.resource.human_id())
    }

    pub fn op_type(&self) -> OperationType {
        if self.extra_post {
            OperationType::ExtraPostDelete
        } else {
            OperationType::Delete
        }
    }

    pub fn empty(&self) -> bool {
        self.empty
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}
