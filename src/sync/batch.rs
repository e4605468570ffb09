//! Bulk operations outside of sync: recursive delete, copy and move.

use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::SyncOptions;
use crate::fs::{Entry, KeyedListing, StorageBackend};
use crate::sync::error::SyncError;
use crate::sync::executor::{AuditLine, AuditSender, Executor, DRY_RUN_NOTICE};
use crate::sync::filter::PatternFilter;
use crate::sync::stats::{ExitStatus, RunStats, Scoreboard};

/// Outcome of a bulk command.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub stats: RunStats,
    pub scoreboard: Scoreboard,
    pub status: ExitStatus,
    /// Stopped by an interrupt before all batches were sent.
    pub interrupted: bool,
}

/// Deletes every object under a backend's root, in batches.
pub struct BatchDelete {
    store: Arc<dyn StorageBackend>,
    options: SyncOptions,
    filter: PatternFilter,
    whole_store: bool,
    only_key: Option<String>,
    audit: Option<AuditSender>,
}

impl BatchDelete {
    pub fn new(store: Arc<dyn StorageBackend>, options: SyncOptions) -> Result<Self, SyncError> {
        let filter = PatternFilter::from_options(&options)?;
        Ok(Self {
            store,
            options,
            filter,
            whole_store: false,
            only_key: None,
            audit: None,
        })
    }

    /// The root is a bucket rather than a prefix; deleting it needs `--force`.
    pub fn whole_store(mut self, whole_store: bool) -> Self {
        self.whole_store = whole_store;
        self
    }

    /// Restrict the command to a single object.
    pub fn only_key(mut self, key: Option<String>) -> Self {
        self.only_key = key;
        self
    }

    pub fn with_audit(mut self, audit: AuditSender) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run until done or until Ctrl-C arrives between two batches.
    pub async fn run(&self) -> Result<BatchReport, SyncError> {
        self.run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until done or until `interrupt` resolves.
    pub async fn run_until<F>(&self, interrupt: F) -> Result<BatchReport, SyncError>
    where
        F: Future<Output = ()>,
    {
        if self.whole_store && !self.options.force {
            return Err(SyncError::Usage(format!(
                "Please use --force to delete ALL contents of {}",
                self.store.display_path("")
            )));
        }

        let listing = self
            .store
            .list_objects(self.options.recursive)
            .await
            .map_err(|source| SyncError::Listing {
                endpoint: self.store.display_path(""),
                source,
            })?;
        let (listing, excluded) = self.filter.apply(restrict(listing, self.only_key.as_deref()));
        info!("Summary: {} remote files to delete", listing.len());

        let mut report = BatchReport::default();
        if let (Some(key), true) = (&self.only_key, listing.is_empty()) {
            warn!("Key not found {}", self.store.display_path(key));
            report.scoreboard.not_found();
        }
        report.stats.start();
        report.stats.files = listing.len();
        report.stats.size = listing.total_size();
        report.stats.files_excluded = excluded.len();

        if self.options.max_delete > 0 && listing.len() > self.options.max_delete {
            warn!("delete: maximum requested number of deletes would be exceeded, none performed.");
            return Err(SyncError::DeleteCeilingExceeded {
                planned: listing.len(),
                ceiling: self.options.max_delete,
            });
        }

        if self.options.dry_run {
            for key in &excluded {
                self.audit(format!("exclude: {}", key)).await;
            }
            for entry in listing.iter() {
                self.audit(format!("delete: '{}'", self.store.display_path(&entry.key)))
                    .await;
            }
            warn!("{}", DRY_RUN_NOTICE);
            self.audit(DRY_RUN_NOTICE.to_string()).await;
            report.stats.stop();
            return Ok(report);
        }

        let entries: Vec<Entry> = listing.into_iter().collect();
        let batch_size = self.store.delete_batch_limit().max(1);
        tokio::pin!(interrupt);

        for batch in entries.chunks(batch_size) {
            let keys: Vec<String> = batch.iter().map(|e| e.key.clone()).collect();
            debug!("Batch delete {} keys", keys.len());

            // Checked between batches only; a started batch always completes.
            if interrupt.as_mut().now_or_never().is_some() {
                warn!("Interrupted; {} objects deleted so far", report.stats.files_deleted);
                report.interrupted = true;
                break;
            }

            match self.store.delete_batch(&keys).await {
                Ok(outcomes) => {
                    for entry in batch {
                        let deleted = outcomes
                            .iter()
                            .any(|o| o.key == entry.key && o.is_deleted());
                        if deleted {
                            report.scoreboard.success();
                            report.stats.record_delete(entry.size);
                            self.audit(format!("delete: '{}'", self.store.display_path(&entry.key)))
                                .await;
                        } else {
                            error!("delete of '{}' failed", self.store.display_path(&entry.key));
                            report.scoreboard.failed();
                            report.stats.record_failure();
                        }
                    }
                }
                Err(e) => {
                    error!("Batch delete failed: {}", e);
                    for _ in batch {
                        report.scoreboard.failed();
                        report.stats.record_failure();
                    }
                }
            }
            if self.options.stop_on_error && report.scoreboard.failures() > 0 {
                error!("Exiting now because of --stop-on-error");
                report.stats.stop();
                report.status = ExitStatus::DataErr;
                return Ok(report);
            }
        }

        report.stats.stop();
        report.status = if report.interrupted {
            ExitStatus::Break
        } else {
            report.scoreboard.rc()
        };
        Ok(report)
    }

    async fn audit(&self, text: String) {
        match &self.audit {
            Some(tx) => {
                let line = AuditLine {
                    destination: self.store.display_path(""),
                    text,
                };
                let _ = tx.send(line).await;
            }
            None => info!("{}", text),
        }
    }
}

/// Copies (or moves) objects item by item from one store to another.
pub struct ObjectCopier {
    source: Arc<dyn StorageBackend>,
    executor: Executor,
    options: SyncOptions,
    filter: PatternFilter,
    remove_source: bool,
    only_key: Option<String>,
}

impl ObjectCopier {
    pub fn copy(
        source: Arc<dyn StorageBackend>,
        dest: Arc<dyn StorageBackend>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        options.validate()?;
        let filter = PatternFilter::from_options(&options)?;
        Ok(Self {
            executor: Executor::new(source.clone(), dest, &options),
            source,
            options,
            filter,
            remove_source: false,
            only_key: None,
        })
    }

    /// Like [`ObjectCopier::copy`], deleting each source object once it has been copied.
    pub fn move_objects(
        source: Arc<dyn StorageBackend>,
        dest: Arc<dyn StorageBackend>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let mut copier = Self::copy(source, dest, options)?;
        copier.remove_source = true;
        Ok(copier)
    }

    /// Restrict the command to a single object.
    pub fn only_key(mut self, key: Option<String>) -> Self {
        self.only_key = key;
        self
    }

    pub fn with_audit(mut self, audit: AuditSender) -> Self {
        self.executor = self.executor.with_audit(audit);
        self
    }

    fn verb(&self) -> &'static str {
        if self.remove_source {
            "move"
        } else {
            "copy"
        }
    }

    pub async fn run(&self) -> Result<BatchReport, SyncError> {
        let listing = self
            .source
            .list_objects(self.options.recursive)
            .await
            .map_err(|source| SyncError::Listing {
                endpoint: self.source.display_path(""),
                source,
            })?;
        let (listing, excluded) = self.filter.apply(restrict(listing, self.only_key.as_deref()));

        let mut report = BatchReport::default();
        if let (Some(key), true) = (&self.only_key, listing.is_empty()) {
            warn!("Key not found {}", self.source.display_path(key));
            report.scoreboard.not_found();
        }
        report.stats.start();
        report.stats.files = listing.len();
        report.stats.size = listing.total_size();
        report.stats.files_excluded = excluded.len();

        let total = listing.len();
        for (index, entry) in listing.iter().enumerate() {
            let from = self.source.display_path(&entry.key);
            let to = self.executor.target_path(&entry.key);
            let label = format!("[{} of {}]", index + 1, total);

            if self.options.dry_run {
                self.executor
                    .audit(format!("{}: '{}' -> '{}' {}", self.verb(), from, to, label))
                    .await;
                continue;
            }

            match self.executor.transfer(entry).await {
                Ok(receipt) => {
                    if self.remove_source && !self.remove(&entry.key).await {
                        report.scoreboard.failed();
                        report.stats.record_failure();
                    } else {
                        report.scoreboard.success();
                        report.stats.record_transfer(receipt.bytes);
                        self.executor
                            .audit(format!("{}: '{}' -> '{}' {}", self.verb(), from, to, label))
                            .await;
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!("Key not found {}", from);
                    report.scoreboard.not_found();
                }
                Err(e) => {
                    error!("{} of '{}' failed: {}", self.verb(), from, e.reason());
                    report.scoreboard.failed();
                    report.stats.record_failure();
                }
            }

            if self.options.stop_on_error && report.scoreboard.failures() > 0 {
                error!("Exiting now because of --stop-on-error");
                report.stats.stop();
                report.status = ExitStatus::DataErr;
                return Ok(report);
            }
        }

        if self.options.dry_run {
            warn!("{}", DRY_RUN_NOTICE);
            self.executor.audit(DRY_RUN_NOTICE.to_string()).await;
        }
        report.stats.stop();
        report.status = report.scoreboard.rc();
        Ok(report)
    }

    async fn remove(&self, key: &str) -> bool {
        match self.source.delete_batch(&[key.to_string()]).await {
            Ok(outcomes) if outcomes.iter().all(|o| o.is_deleted()) => true,
            Ok(outcomes) => {
                for outcome in outcomes.iter().filter(|o| !o.is_deleted()) {
                    error!(
                        "Cannot remove '{}' after copying: {}",
                        self.source.display_path(&outcome.key),
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
                false
            }
            Err(e) => {
                error!("Cannot remove '{}' after copying: {}", self.source.display_path(key), e);
                false
            }
        }
    }
}

fn restrict(listing: KeyedListing, key: Option<&str>) -> KeyedListing {
    match key {
        Some(key) => listing.partition(|entry| entry.key == key).0,
        None => listing,
    }
}
