use chrono::{DateTime, Utc};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// Name of the user-metadata field carrying preserved attributes.
pub const ATTRS_HEADER: &str = "bucketsync-attrs";

/// File attributes carried along with an object when `--preserve` is on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
    pub md5: Option<String>,
}

impl Attrs {
    pub fn is_empty(&self) -> bool {
        *self == Attrs::default()
    }

    /// Encode as `key:value/key:value`, keys sorted.
    pub fn to_header_value(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(atime) = self.atime {
            parts.push(format!("atime:{}", atime));
        }
        if let Some(gid) = self.gid {
            parts.push(format!("gid:{}", gid));
        }
        if let Some(md5) = &self.md5 {
            parts.push(format!("md5:{}", md5));
        }
        if let Some(mode) = self.mode {
            parts.push(format!("mode:{}", mode));
        }
        if let Some(mtime) = self.mtime {
            parts.push(format!("mtime:{}", mtime));
        }
        if let Some(uid) = self.uid {
            parts.push(format!("uid:{}", uid));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Parse a header value written by [`Attrs::to_header_value`].
    /// Unknown or malformed fields are ignored.
    pub fn parse_header_value(value: &str) -> Self {
        let mut attrs = Attrs::default();
        for part in value.split('/') {
            let Some((key, val)) = part.split_once(':') else {
                continue;
            };
            match key {
                "atime" => attrs.atime = val.parse().ok(),
                "gid" => attrs.gid = val.parse().ok(),
                "md5" => attrs.md5 = Some(val.to_string()),
                "mode" => attrs.mode = val.parse().ok(),
                "mtime" => attrs.mtime = val.parse().ok(),
                "uid" => attrs.uid = val.parse().ok(),
                _ => {}
            }
        }
        attrs
    }
}

/// One file or object, keyed by its path relative to the listing root.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Content digest (lowercase hex MD5). `None` means size-only comparison.
    pub digest: Option<String>,
    /// Where the entry lives: an absolute local path or an object URI.
    pub origin: String,
    pub attrs: Option<Attrs>,
}

impl Entry {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        let key = key.into();
        Self {
            origin: key.clone(),
            key,
            size,
            modified: None,
            digest: None,
            attrs: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = Some(attrs);
        self
    }
}

/// Ordered mapping from relative key to entry.
///
/// Iteration is always in ascending key order; the executor's `[i of n]`
/// labels and dry-run output depend on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedListing {
    entries: BTreeMap<String, Entry>,
}

impl KeyedListing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing (and returning) any entry with the same key.
    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.key.clone(), entry)
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Split off the entries for which `keep` is false.
    pub fn partition<F>(self, mut keep: F) -> (KeyedListing, KeyedListing)
    where
        F: FnMut(&Entry) -> bool,
    {
        let mut kept = KeyedListing::new();
        let mut dropped = KeyedListing::new();
        for (_, entry) in self.entries {
            if keep(&entry) {
                kept.insert(entry);
            } else {
                dropped.insert(entry);
            }
        }
        (kept, dropped)
    }
}

impl FromIterator<Entry> for KeyedListing {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut listing = KeyedListing::new();
        for entry in iter {
            listing.insert(entry);
        }
        listing
    }
}

impl IntoIterator for KeyedListing {
    type Item = Entry;
    type IntoIter = btree_map::IntoValues<String, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}
