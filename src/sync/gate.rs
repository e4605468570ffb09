//! Safety checks applied to a plan before anything is mutated.

use tracing::warn;

use crate::config::SyncOptions;
use crate::sync::error::SyncError;
use crate::sync::plan::Plan;

/// Downgrades or rejects destructive parts of a plan.
///
/// Never touches the create, update or copy partitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyGate {
    delete_removed: bool,
    delete_after: bool,
    /// 0 means unlimited.
    max_delete: usize,
    force: bool,
}

impl SafetyGate {
    pub fn new(delete_removed: bool, max_delete: usize, force: bool) -> Self {
        Self {
            delete_removed,
            delete_after: false,
            max_delete,
            force,
        }
    }

    pub fn from_options(options: &SyncOptions) -> Self {
        Self::new(options.delete_removed, options.max_delete, options.force)
            .with_delete_after(options.delete_after)
    }

    pub fn with_delete_after(mut self, delete_after: bool) -> Self {
        self.delete_after = delete_after;
        self
    }

    /// Approve `plan`, given how many source entries were found before comparison.
    pub fn apply(&self, mut plan: Plan, source_count: usize) -> Result<Plan, SyncError> {
        if !self.delete_removed {
            keep_destination_only(&mut plan);
        } else if source_count == 0 && !plan.to_delete.is_empty() && !self.force {
            warn!(
                "delete: cowardly refusing to delete because no source files were found.  Use --force to override."
            );
            keep_destination_only(&mut plan);
        }

        if self.max_delete > 0 && plan.to_delete.len() > self.max_delete {
            warn!("maximum requested number of deletes would be exceeded, none performed");
            return Err(SyncError::DeleteCeilingExceeded {
                planned: plan.to_delete.len(),
                ceiling: self.max_delete,
            });
        }

        // Pending deletes could remove a copy source before the copy runs.
        plan.delete_after = self.delete_after || !plan.copy_pairs.is_empty();
        Ok(plan)
    }
}

/// Destination-only keys that will not be deleted count as unchanged.
fn keep_destination_only(plan: &mut Plan) {
    if plan.to_delete.is_empty() {
        return;
    }
    plan.unchanged
        .extend(plan.to_delete.drain(..).map(|entry| entry.key));
    plan.unchanged.sort();
}
