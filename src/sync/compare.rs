//! Three-way classification of a source and destination listing.

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::fs::types::{Entry, KeyedListing};
use crate::sync::plan::{CopyPair, Plan};

/// Compares two listings that share the same relative key space.
#[derive(Debug, Clone, Copy)]
pub struct Comparator {
    check_content: bool,
}

impl Comparator {
    /// With `check_content`, digests are compared whenever both sides have one.
    pub fn new(check_content: bool) -> Self {
        Self { check_content }
    }

    /// Classify every key of both listings.
    ///
    /// The returned plan has `delete_after` unset; the safety gate decides it.
    pub fn compare(&self, source: &KeyedListing, dest: &KeyedListing) -> Plan {
        let mut plan = Plan::default();
        let mut missing = Vec::new();

        for entry in source.iter() {
            match dest.get(&entry.key) {
                Some(existing) if self.differs(entry, existing) => {
                    debug!("XFER: {} (content differs)", entry.key);
                    plan.to_update.push(entry.clone());
                }
                Some(_) => plan.unchanged.push(entry.key.clone()),
                None => missing.push(entry),
            }
        }

        // A key rewritten by the update phase can no longer vouch for its old content.
        let updated: HashSet<&str> = plan.to_update.iter().map(|e| e.key.as_str()).collect();
        let index = self.digest_index(dest, &updated);

        for entry in missing {
            match self.copy_source(entry, &index) {
                Some(existing_key) => {
                    debug!("COPY: {} <- {}", entry.key, existing_key);
                    plan.copy_pairs.push(CopyPair {
                        source: entry.clone(),
                        existing_key: existing_key.to_string(),
                        target_key: entry.key.clone(),
                    });
                }
                None => plan.to_create.push(entry.clone()),
            }
        }

        plan.to_delete = dest
            .iter()
            .filter(|e| !source.contains_key(&e.key))
            .cloned()
            .collect();

        plan
    }

    fn differs(&self, src: &Entry, dst: &Entry) -> bool {
        if src.size != dst.size {
            return true;
        }
        if !self.check_content {
            return false;
        }
        match (&src.digest, &dst.digest) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }

    /// digest -> (size, smallest key). Listing iteration is ascending, so the
    /// first key seen for a digest is the smallest.
    fn digest_index<'a>(
        &self,
        dest: &'a KeyedListing,
        excluded: &HashSet<&str>,
    ) -> BTreeMap<&'a str, Vec<(u64, &'a str)>> {
        let mut index: BTreeMap<&str, Vec<(u64, &str)>> = BTreeMap::new();
        if !self.check_content {
            return index;
        }
        for entry in dest.iter() {
            if excluded.contains(entry.key.as_str()) {
                continue;
            }
            if let Some(digest) = entry.digest.as_deref() {
                index.entry(digest).or_default().push((entry.size, entry.key.as_str()));
            }
        }
        index
    }

    fn copy_source<'a>(
        &self,
        entry: &Entry,
        index: &BTreeMap<&'a str, Vec<(u64, &'a str)>>,
    ) -> Option<&'a str> {
        let digest = entry.digest.as_deref()?;
        index
            .get(digest)?
            .iter()
            .find(|(size, _)| *size == entry.size)
            .map(|(_, key)| *key)
    }
}
