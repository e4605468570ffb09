//! The classified action set produced by one reconciliation pass.

use serde::Serialize;

use crate::fs::types::Entry;

/// Reuse of content already present in the destination under another key.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyPair {
    /// Source entry whose content is wanted at `target_key`.
    pub source: Entry,
    /// Destination key that already holds identical content.
    pub existing_key: String,
    pub target_key: String,
}

/// What the executor should do to make a destination match its source.
///
/// Every list is in ascending key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Source entries missing from the destination.
    pub to_create: Vec<Entry>,
    /// Source entries whose destination counterpart differs.
    pub to_update: Vec<Entry>,
    /// Destination entries missing from the source.
    pub to_delete: Vec<Entry>,
    pub copy_pairs: Vec<CopyPair>,
    /// Keys left alone.
    pub unchanged: Vec<String>,
    /// Keys dropped by the pattern filter, echoed in dry-run output.
    pub excluded: Vec<String>,
    /// Run the delete phase after transfers instead of before.
    pub delete_after: bool,
}

/// Per-partition counts, for logging and dry-run summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub copy: usize,
    pub unchanged: usize,
}

impl Plan {
    /// Nothing to transfer, copy or delete.
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty()
            && self.to_update.is_empty()
            && self.to_delete.is_empty()
            && self.copy_pairs.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.to_create.len(),
            update: self.to_update.len(),
            delete: self.to_delete.len(),
            copy: self.copy_pairs.len(),
            unchanged: self.unchanged.len(),
        }
    }

    /// Target keys of every acted-upon partition, in partition order.
    pub fn acted_keys(&self) -> impl Iterator<Item = &str> {
        self.to_create
            .iter()
            .map(|e| e.key.as_str())
            .chain(self.to_update.iter().map(|e| e.key.as_str()))
            .chain(self.to_delete.iter().map(|e| e.key.as_str()))
            .chain(self.copy_pairs.iter().map(|p| p.target_key.as_str()))
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to copy, {} to delete, {} unchanged",
            self.create, self.update, self.copy, self.delete, self.unchanged
        )
    }
}
