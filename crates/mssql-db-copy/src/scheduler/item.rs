//! Per-object migration state.

use crate::catalog::{ObjectId, SqlObject};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Progress of one object through the copy phases.
///
/// Ordered: a status never moves backwards within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    NotStarted,
    /// Schema exists on the target (or indexes were dropped in data-only mode); rows pending.
    SchemaMigrated,
    /// Rows copied; indexes pending.
    DataMigrated,
    Completed,
}

impl ItemStatus {
    /// Whether other objects may reference this one in this status.
    pub fn satisfies_dependents(self) -> bool {
        self >= ItemStatus::SchemaMigrated
    }
}

/// Mutable migration record of one catalog object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationItem {
    /// The object being copied.
    pub object: SqlObject,

    /// Current phase.
    pub status: ItemStatus,

    /// Execution attempts in the current pass.
    pub attempts: u32,

    /// Outcome of the most recent attempt; `None` until one finishes.
    pub succeeded: Option<bool>,

    /// Most recent failure, cleared on success.
    pub last_error: Option<String>,
}

impl MigrationItem {
    pub fn new(object: SqlObject) -> Self {
        Self {
            object,
            status: ItemStatus::NotStarted,
            attempts: 0,
            succeeded: None,
            last_error: None,
        }
    }

    /// Build one item per object, all `NotStarted`.
    pub fn from_objects(objects: impl IntoIterator<Item = SqlObject>) -> Vec<Self> {
        objects.into_iter().map(Self::new).collect()
    }

    pub fn id(&self) -> ObjectId {
        self.object.id
    }

    pub fn is_table(&self) -> bool {
        self.object.is_table()
    }

    /// Move to a later status. Moving backwards is ignored.
    pub fn advance(&mut self, next: ItemStatus) {
        debug_assert!(
            next >= self.status,
            "{} cannot move from {:?} back to {:?}",
            self.object,
            self.status,
            next
        );
        self.status = self.status.max(next);
    }

    /// Record a successful attempt.
    pub fn mark_succeeded(&mut self) {
        self.succeeded = Some(true);
        self.last_error = None;
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.succeeded = Some(false);
        self.last_error = Some(error.into());
    }

    /// Whether the item ended the run fully copied.
    pub fn is_complete(&self) -> bool {
        self.status == ItemStatus::Completed && self.succeeded == Some(true)
    }
}

impl fmt::Display for MigrationItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.object, f)
    }
}

/// Whether every item in the slice succeeded on its last attempt.
pub fn all_succeeded<'a>(items: impl IntoIterator<Item = &'a MigrationItem>) -> bool {
    items.into_iter().all(|item| item.succeeded == Some(true))
}
