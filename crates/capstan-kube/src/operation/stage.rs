//! Stage markers
//!
//! A stage marker does no work; it exists purely so the graph can express
//! happens-before between groups of operations. The spanning edge between a
//! stage's in and out markers guarantees that even an empty stage still
//! enforces order.

use super::StatusCell;

/// Zero-work ordering barrier
pub struct StageOperation {
    id: String,
    status: StatusCell,
}

impl StageOperation {
    /// `id` is the full vertex key, e.g. `stage/install/weight:0:in`
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: StatusCell::new(),
        }
    }

    pub(super) fn run(&self) -> crate::error::Result<()> {
        Ok(())
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn human_id(&self) -> String {
        self.id.clone()
    }

    pub(super) fn status_cell(&self) -> &StatusCell {
        &self.status
    }
}
