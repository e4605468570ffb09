//! Transfer executor.
//!
//! Walks an approved plan for one destination in a fixed phase order:
//! delete-before (unless `delete_after`), create, update, copy, the
//! fallback transfers for failed copies, then delete-after. Items inside a
//! phase run sequentially in ascending key order so that `[i of n]` labels
//! and audit output are deterministic.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SyncOptions;
use crate::fs::backend::{Headers, StorageBackend, TransferReceipt};
use crate::fs::local::{attrs_from_headers, restore_attrs, staging_file};
use crate::fs::types::{Attrs, Entry, ATTRS_HEADER};
use crate::sync::error::{SyncError, TransferError};
use crate::sync::plan::{CopyPair, Plan};
use crate::sync::stats::{format_size, ExitStatus, RunStats};
use crate::sync::throttle::BandwidthLimiter;

/// Notice emitted at the end of a dry run.
pub const DRY_RUN_NOTICE: &str = "Exiting now because of --dry-run";

/// One line of the human-readable action log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLine {
    /// Destination the line belongs to.
    pub destination: String,
    pub text: String,
}

pub type AuditSender = mpsc::Sender<AuditLine>;

/// Final result of a single item, as seen by the phase loop.
#[derive(Debug)]
pub enum ItemOutcome {
    Done(TransferReceipt),
    /// The collaborator gave up after its own retries.
    Retryable(String),
    /// The item vanished between listing and transfer; only a warning.
    Missing(String),
    Fatal {
        reason: String,
        /// Status the worker exits with if this failure stops it.
        escalation: ExitStatus,
        /// Continuing would only repeat the failure (disk full and similar).
        run_fatal: bool,
    },
}

impl From<Result<TransferReceipt, TransferError>> for ItemOutcome {
    fn from(result: Result<TransferReceipt, TransferError>) -> Self {
        match result {
            Ok(receipt) => ItemOutcome::Done(receipt),
            Err(e) if e.is_not_found() => ItemOutcome::Missing(e.reason()),
            Err(e) if e.is_retryable() => ItemOutcome::Retryable(e.reason()),
            Err(e @ TransferError::Local { .. }) => ItemOutcome::Fatal {
                reason: e.reason(),
                escalation: ExitStatus::OsFile,
                run_fatal: e.is_run_fatal(),
            },
            Err(e @ TransferError::InvalidFile { .. }) => ItemOutcome::Fatal {
                reason: e.reason(),
                escalation: ExitStatus::OsFile,
                run_fatal: false,
            },
            Err(e) => ItemOutcome::Fatal {
                reason: e.reason(),
                escalation: ExitStatus::DataErr,
                run_fatal: false,
            },
        }
    }
}

/// What one worker reports back once its plan is done (or abandoned).
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub destination: String,
    pub stats: RunStats,
    pub status: ExitStatus,
    /// Set when the worker stopped before finishing its plan.
    pub aborted: Option<String>,
}

/// How items move between the two backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Upload,
    Download,
    Copy,
}

impl TransferMode {
    fn between(source: &dyn StorageBackend, dest: &dyn StorageBackend) -> Self {
        match (source.is_local(), dest.is_local()) {
            (true, false) => TransferMode::Upload,
            (false, true) => TransferMode::Download,
            _ => TransferMode::Copy,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            TransferMode::Upload => "upload",
            TransferMode::Download => "download",
            TransferMode::Copy => "copy",
        }
    }
}

/// Executes plans against one destination.
pub struct Executor {
    source: Arc<dyn StorageBackend>,
    dest: Arc<dyn StorageBackend>,
    destination: String,
    mode: TransferMode,
    dry_run: bool,
    stop_on_error: bool,
    preserve: bool,
    limiter: BandwidthLimiter,
    audit: Option<AuditSender>,
}

impl Executor {
    pub fn new(
        source: Arc<dyn StorageBackend>,
        dest: Arc<dyn StorageBackend>,
        options: &SyncOptions,
    ) -> Self {
        let mode = TransferMode::between(source.as_ref(), dest.as_ref());
        let destination = dest.display_path("");
        Self {
            source,
            dest,
            destination,
            mode,
            dry_run: options.dry_run,
            stop_on_error: options.stop_on_error,
            preserve: options.preserve,
            limiter: BandwidthLimiter::new(options.limit_rate),
            audit: None,
        }
    }

    /// Send audit lines to `sender` instead of the log.
    pub fn with_audit(mut self, sender: AuditSender) -> Self {
        self.audit = Some(sender);
        self
    }

    /// Share a bandwidth limiter with other workers.
    pub fn with_limiter(mut self, limiter: BandwidthLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Where `key` lands in the destination.
    pub fn target_path(&self, key: &str) -> String {
        self.dest.display_path(key)
    }

    /// Run `plan` to completion, or until a failure stops the worker.
    pub async fn execute(&self, plan: Plan) -> WorkerReport {
        let mut stats = RunStats::new();
        stats.start();
        stats.files_unchanged = plan.unchanged.len();
        stats.files_excluded = plan.excluded.len();

        if self.dry_run {
            self.print_plan(&plan).await;
            stats.stop();
            return self.report(stats, ExitStatus::Ok, None);
        }

        let result = self.run_phases(&plan, &mut stats).await;
        stats.stop();

        match result {
            Ok(()) if stats.files_failed > 0 => self.report(stats, ExitStatus::Partial, None),
            Ok(()) => self.report(stats, ExitStatus::Ok, None),
            Err(e) => {
                let status = e.exit_status();
                self.report(stats, status, Some(e.to_string()))
            }
        }
    }

    fn report(&self, stats: RunStats, status: ExitStatus, aborted: Option<String>) -> WorkerReport {
        WorkerReport {
            destination: self.destination.clone(),
            stats,
            status,
            aborted,
        }
    }

    async fn run_phases(&self, plan: &Plan, stats: &mut RunStats) -> Result<(), SyncError> {
        if !plan.delete_after && !plan.to_delete.is_empty() {
            self.delete_phase(&plan.to_delete, stats).await?;
        }

        let total = plan.to_create.len() + plan.to_update.len();
        let mut seq = 0;
        self.transfer_phase(&plan.to_create, &mut seq, total, stats).await?;
        self.transfer_phase(&plan.to_update, &mut seq, total, stats).await?;

        let failed_copies = self.copy_phase(&plan.copy_pairs, stats).await;
        if !failed_copies.is_empty() {
            debug!("Transferring {} files that could not be copied", failed_copies.len());
            let total = total + failed_copies.len();
            self.transfer_phase(&failed_copies, &mut seq, total, stats).await?;
        }

        if plan.delete_after && !plan.to_delete.is_empty() {
            self.delete_phase(&plan.to_delete, stats).await?;
        }
        Ok(())
    }

    async fn transfer_phase(
        &self,
        entries: &[Entry],
        seq: &mut usize,
        total: usize,
        stats: &mut RunStats,
    ) -> Result<(), SyncError> {
        for entry in entries {
            *seq += 1;
            let label = format!("[{} of {}]", seq, total);
            let source = self.source.display_path(&entry.key);
            let target = self.dest.display_path(&entry.key);

            match ItemOutcome::from(self.transfer(entry).await) {
                ItemOutcome::Done(receipt) => {
                    stats.record_transfer(receipt.bytes);
                    self.audit(format!(
                        "{}: '{}' -> '{}' ({} bytes in {:.1} seconds, {}/s) {}",
                        self.mode.verb(),
                        source,
                        target,
                        receipt.bytes,
                        receipt.elapsed.as_secs_f64(),
                        format_size(receipt.speed() as u64),
                        label
                    ))
                    .await;
                }
                ItemOutcome::Missing(reason) => {
                    warn!("{} of '{}' skipped: {}", self.mode.verb(), source, reason);
                }
                ItemOutcome::Retryable(reason) => {
                    error!(
                        "{} of '{}' failed too many times (Last reason: {})",
                        self.mode.verb(),
                        source,
                        reason
                    );
                    self.record_failure(stats, reason, ExitStatus::DataErr, false)?;
                }
                ItemOutcome::Fatal {
                    reason,
                    escalation,
                    run_fatal,
                } => {
                    error!(
                        "{} of '{}' is not possible (Reason: {})",
                        self.mode.verb(),
                        source,
                        reason
                    );
                    self.record_failure(stats, reason, escalation, run_fatal)?;
                }
            }
        }
        Ok(())
    }

    /// Returns the entries whose copy failed, retargeted for a full transfer.
    async fn copy_phase(&self, pairs: &[CopyPair], stats: &mut RunStats) -> Vec<Entry> {
        let mut failed = Vec::new();
        for pair in pairs {
            let from = self.dest.display_path(&pair.existing_key);
            let to = self.dest.display_path(&pair.target_key);
            let headers = self.headers_for(&pair.source);

            match self
                .dest
                .copy(&pair.existing_key, &pair.target_key, &headers)
                .await
            {
                Ok(()) => {
                    stats.record_copy(pair.source.size);
                    self.audit(format!("remote copy: '{}' -> '{}'", from, to)).await;
                }
                Err(e) => {
                    warn!("Unable to remote copy files '{}' -> '{}': {}", from, to, e);
                    let mut entry = pair.source.clone();
                    entry.key = pair.target_key.clone();
                    failed.push(entry);
                }
            }
        }
        failed
    }

    async fn delete_phase(&self, entries: &[Entry], stats: &mut RunStats) -> Result<(), SyncError> {
        let batch_size = self.dest.delete_batch_limit().max(1);
        for batch in entries.chunks(batch_size) {
            let keys: Vec<String> = batch.iter().map(|e| e.key.clone()).collect();
            debug!("Batch delete {} keys", keys.len());

            let outcomes = match self.dest.delete_batch(&keys).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    error!("Batch delete failed: {}", e);
                    for _ in batch {
                        stats.record_failure();
                    }
                    if self.stop_on_error {
                        return Err(self.stop(ExitStatus::DataErr, e.to_string()));
                    }
                    continue;
                }
            };

            for entry in batch {
                let outcome = outcomes.iter().find(|o| o.key == entry.key);
                match outcome.and_then(|o| o.error.as_deref()) {
                    None if outcome.is_some() => {
                        stats.record_delete(entry.size);
                        self.audit(format!("delete: '{}'", self.dest.display_path(&entry.key)))
                            .await;
                    }
                    reason => {
                        let reason = reason.unwrap_or("no outcome reported").to_string();
                        error!(
                            "delete of '{}' failed: {}",
                            self.dest.display_path(&entry.key),
                            reason
                        );
                        self.record_failure(stats, reason, ExitStatus::DataErr, false)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn record_failure(
        &self,
        stats: &mut RunStats,
        reason: String,
        escalation: ExitStatus,
        run_fatal: bool,
    ) -> Result<(), SyncError> {
        stats.record_failure();
        if run_fatal {
            error!("Exiting now because of a fatal local error");
            return Err(self.stop(escalation, reason));
        }
        if self.stop_on_error {
            error!("Exiting now because of --stop-on-error");
            return Err(self.stop(escalation, reason));
        }
        Ok(())
    }

    fn stop(&self, status: ExitStatus, reason: String) -> SyncError {
        SyncError::Aborted { status, reason }
    }

    /// Move one entry's content from the source into the destination.
    pub(crate) async fn transfer(&self, entry: &Entry) -> Result<TransferReceipt, TransferError> {
        self.limiter.acquire(entry.size).await;
        let headers = self.headers_for(entry);
        if let Some(local) = self.source.local_path(&entry.key) {
            return self.dest.put(&local, &entry.key, &headers).await;
        }
        if let Some(target) = self.dest.local_path(&entry.key) {
            return self.download(entry, &target).await;
        }
        self.relay(entry, &headers).await
    }

    /// Fetch into a staging file next to `target`, renamed into place on success.
    async fn download(&self, entry: &Entry, target: &Path) -> Result<TransferReceipt, TransferError> {
        let parent = target.parent().unwrap_or(Path::new("."));
        let staged = staging_file(parent).map_err(|e| TransferError::local(parent, "create", e))?;

        let download = self.source.get(&entry.key, staged.path(), 0).await?;

        if self.preserve {
            if let Some(attrs) = attrs_from_headers(&download.metadata) {
                if let Err(e) = restore_attrs(staged.path(), &attrs) {
                    warn!("Cannot restore attributes of {}: {}", target.display(), e);
                }
            }
        }

        staged
            .persist(target)
            .map_err(|e| TransferError::local(target, "rename", e.error))?;
        Ok(download.receipt)
    }

    /// Remote to remote across stores: through a local temporary file.
    async fn relay(&self, entry: &Entry, headers: &Headers) -> Result<TransferReceipt, TransferError> {
        let staged = tempfile::NamedTempFile::new()
            .map_err(|e| TransferError::local(std::env::temp_dir(), "create", e))?;
        let download = self.source.get(&entry.key, staged.path(), 0).await?;

        let mut headers = headers.clone();
        if self.preserve && !headers.contains_key(ATTRS_HEADER) {
            if let Some(value) = download.metadata.get(ATTRS_HEADER) {
                headers.insert(ATTRS_HEADER.to_string(), value.clone());
            }
        }
        let upload = self.dest.put(staged.path(), &entry.key, &headers).await?;
        Ok(TransferReceipt::new(
            upload.bytes,
            download.receipt.elapsed + upload.elapsed,
        ))
    }

    /// The attribute header always carries the digest; `--preserve` adds the rest.
    fn headers_for(&self, entry: &Entry) -> Headers {
        let mut attrs = match (&entry.attrs, self.preserve) {
            (Some(attrs), true) => attrs.clone(),
            _ => Attrs::default(),
        };
        if attrs.md5.is_none() {
            attrs.md5 = entry.digest.clone();
        }

        let mut headers = Headers::new();
        if let Some(value) = attrs.to_header_value() {
            headers.insert(ATTRS_HEADER.to_string(), value);
        }
        headers
    }

    async fn print_plan(&self, plan: &Plan) {
        for key in &plan.excluded {
            self.audit(format!("exclude: {}", key)).await;
        }
        for entry in plan.to_create.iter().chain(plan.to_update.iter()) {
            self.audit(format!(
                "{}: '{}' -> '{}'",
                self.mode.verb(),
                self.source.display_path(&entry.key),
                self.dest.display_path(&entry.key)
            ))
            .await;
        }
        for pair in &plan.copy_pairs {
            self.audit(format!(
                "remote copy: '{}' -> '{}'",
                self.dest.display_path(&pair.existing_key),
                self.dest.display_path(&pair.target_key)
            ))
            .await;
        }
        for entry in &plan.to_delete {
            self.audit(format!("delete: '{}'", self.dest.display_path(&entry.key)))
                .await;
        }
        warn!("{}", DRY_RUN_NOTICE);
        self.audit(DRY_RUN_NOTICE.to_string()).await;
    }

    pub(crate) async fn audit(&self, text: String) {
        match &self.audit {
            Some(tx) => {
                let line = AuditLine {
                    destination: self.destination.clone(),
                    text,
                };
                let _ = tx.send(line).await;
            }
            None => info!("{}", text),
        }
    }
}
