//! Include/exclude pattern filtering of keyed listings.
//!
//! Exclude rules are evaluated first; include rules can only re-admit a key
//! that an exclude rule removed. Globs follow shell rules except that `*`
//! also crosses `/`, and must match the whole key. Regexes are searched for
//! anywhere in the key.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::SyncOptions;
use crate::fs::types::KeyedListing;
use crate::sync::error::SyncError;

/// One compiled side (exclude or include) of the filter.
#[derive(Debug, Clone)]
struct PatternSet {
    globs: GlobSet,
    regexes: Vec<Regex>,
    textual: Vec<String>,
}

impl Default for PatternSet {
    fn default() -> Self {
        Self {
            globs: GlobSet::empty(),
            regexes: Vec::new(),
            textual: Vec::new(),
        }
    }
}

impl PatternSet {
    fn compile(globs: &[String], regexes: &[String]) -> Result<Self, SyncError> {
        let mut builder = GlobSetBuilder::new();
        let mut textual = Vec::new();
        for pattern in globs {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .backslash_escape(true)
                .build()
                .map_err(|e| SyncError::Usage(format!("invalid glob '{}': {}", pattern, e)))?;
            builder.add(glob);
            textual.push(pattern.clone());
        }
        let globs = builder
            .build()
            .map_err(|e| SyncError::Usage(format!("invalid glob set: {}", e)))?;

        let mut compiled = Vec::with_capacity(regexes.len());
        for pattern in regexes {
            let regex = Regex::new(pattern)
                .map_err(|e| SyncError::Usage(format!("invalid regex '{}': {}", pattern, e)))?;
            compiled.push(regex);
            textual.push(pattern.clone());
        }

        Ok(Self {
            globs,
            regexes: compiled,
            textual,
        })
    }

    fn is_empty(&self) -> bool {
        self.globs.is_empty() && self.regexes.is_empty()
    }

    fn is_match(&self, key: &str) -> bool {
        if self.regexes.iter().any(|r| r.is_match(key)) {
            return true;
        }
        self.globs.is_match(key)
    }
}

/// Compiled include/exclude rules.
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    exclude: PatternSet,
    include: PatternSet,
}

impl PatternFilter {
    /// A filter that admits everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile literal rule lists.
    pub fn from_patterns(
        exclude: &[String],
        rexclude: &[String],
        include: &[String],
        rinclude: &[String],
    ) -> Result<Self, SyncError> {
        Ok(Self {
            exclude: PatternSet::compile(exclude, rexclude)?,
            include: PatternSet::compile(include, rinclude)?,
        })
    }

    /// Compile the rules of a run, including the ones read from `*-from` files.
    pub fn from_options(options: &SyncOptions) -> Result<Self, SyncError> {
        let exclude = with_files(&options.exclude, &options.exclude_from)?;
        let rexclude = with_files(&options.rexclude, &options.rexclude_from)?;
        let include = with_files(&options.include, &options.include_from)?;
        let rinclude = with_files(&options.rinclude, &options.rinclude_from)?;
        Self::from_patterns(&exclude, &rexclude, &include, &rinclude)
    }

    pub fn is_empty(&self) -> bool {
        self.exclude.is_empty()
    }

    /// Rules in the order they were given, excludes first.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.exclude
            .textual
            .iter()
            .chain(self.include.textual.iter())
            .map(String::as_str)
    }

    /// Whether `key` is dropped by the rules.
    pub fn is_excluded(&self, key: &str) -> bool {
        if !self.exclude.is_match(key) {
            return false;
        }
        if self.include.is_match(key) {
            debug!("INCL: {}", key);
            return false;
        }
        debug!("EXCL: {}", key);
        true
    }

    /// Split a listing into the admitted entries and the excluded keys.
    pub fn apply(&self, listing: KeyedListing) -> (KeyedListing, Vec<String>) {
        if self.is_empty() {
            return (listing, Vec::new());
        }
        let (kept, dropped) = listing.partition(|entry| !self.is_excluded(&entry.key));
        let excluded = dropped.keys().map(str::to_string).collect();
        (kept, excluded)
    }
}

fn with_files(literal: &[String], files: &[PathBuf]) -> Result<Vec<String>, SyncError> {
    let mut patterns = literal.to_vec();
    for file in files {
        patterns.extend(read_pattern_file(file)?);
    }
    Ok(patterns)
}

/// One pattern per line; blank lines and `#` comments are skipped.
pub fn read_pattern_file(path: &Path) -> Result<Vec<String>, SyncError> {
    debug!("Reading patterns from {}", path.display());
    let content = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Usage(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(parse_patterns(&content))
}

fn parse_patterns(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
