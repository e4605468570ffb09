//! Sync engine.
//!
//! Lists the source once, plans every destination against it, and only
//! then starts one executor task per destination. A plan rejected by the
//! safety gate aborts the whole run before any destination is touched.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::SyncOptions;
use crate::fs::{KeyedListing, StorageBackend};
use crate::sync::compare::Comparator;
use crate::sync::error::SyncError;
use crate::sync::executor::{AuditSender, Executor, WorkerReport};
use crate::sync::filter::PatternFilter;
use crate::sync::gate::SafetyGate;
use crate::sync::plan::Plan;
use crate::sync::stats::{reduce_statuses, ExitStatus, RunStats};
use crate::sync::throttle::BandwidthLimiter;

/// Outcome of a whole sync run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// One report per destination, in the order destinations were added.
    pub workers: Vec<WorkerReport>,
    /// Totals across every destination.
    pub stats: RunStats,
    /// Worst status across every destination.
    pub status: ExitStatus,
}

impl SyncReport {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Orchestrates one source against any number of destinations.
pub struct SyncEngine {
    source: Arc<dyn StorageBackend>,
    destinations: Vec<Arc<dyn StorageBackend>>,
    options: SyncOptions,
    filter: PatternFilter,
    limiter: BandwidthLimiter,
    audit: Option<AuditSender>,
}

impl SyncEngine {
    /// Create an engine; pattern files named in `options` are read here.
    pub fn new(
        source: Arc<dyn StorageBackend>,
        destination: Arc<dyn StorageBackend>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        options.validate()?;
        let filter = PatternFilter::from_options(&options)?;
        let limiter = BandwidthLimiter::new(options.limit_rate);
        Ok(Self {
            source,
            destinations: vec![destination],
            options,
            filter,
            limiter,
            audit: None,
        })
    }

    /// Sync the same source into one more destination.
    pub fn add_destination(mut self, destination: Arc<dyn StorageBackend>) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Create a sync engine that reports audit lines over a channel.
    pub fn with_audit(mut self, audit: AuditSender) -> Self {
        self.audit = Some(audit);
        self
    }

    /// List and filter the source.
    async fn scan_source(&self) -> Result<(KeyedListing, Vec<String>), SyncError> {
        let listing = self
            .source
            .list_objects(self.options.recursive)
            .await
            .map_err(|source| SyncError::Listing {
                endpoint: self.source.display_path(""),
                source,
            })?;
        info!("Summary: {} source files to upload", listing.len());
        Ok(self.filter.apply(listing))
    }

    /// Reconcile one destination against the filtered source.
    async fn plan_for(
        &self,
        dest: &dyn StorageBackend,
        source: &KeyedListing,
        excluded: &[String],
    ) -> Result<Plan, SyncError> {
        let listing = dest
            .list_objects(self.options.recursive)
            .await
            .map_err(|source| SyncError::Listing {
                endpoint: dest.display_path(""),
                source,
            })?;
        let (listing, dest_excluded) = self.filter.apply(listing);
        debug!("{} remote files for {}", listing.len(), dest.display_path(""));

        let plan = Comparator::new(self.options.check_md5).compare(source, &listing);
        let mut plan = SafetyGate::from_options(&self.options).apply(plan, source.len())?;
        plan.excluded = merge_excluded(excluded, dest_excluded);
        info!("{}: {}", dest.display_path(""), plan.summary());
        Ok(plan)
    }

    /// Plan every destination, then execute the plans concurrently.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let (source, excluded) = self.scan_source().await?;

        let mut plans = Vec::with_capacity(self.destinations.len());
        for dest in &self.destinations {
            plans.push(self.plan_for(dest.as_ref(), &source, &excluded).await?);
        }

        let mut tasks = JoinSet::new();
        for (index, (dest, plan)) in self.destinations.iter().zip(plans).enumerate() {
            let mut executor = Executor::new(self.source.clone(), dest.clone(), &self.options)
                .with_limiter(self.limiter.clone());
            if let Some(audit) = &self.audit {
                executor = executor.with_audit(audit.clone());
            }
            tasks.spawn(async move { (index, executor.execute(plan).await) });
        }

        let mut workers: Vec<Option<WorkerReport>> = vec![None; self.destinations.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => workers[index] = Some(report),
                Err(e) => error!("Destination worker failed: {}", e),
            }
        }

        let mut statuses = Vec::with_capacity(workers.len());
        let mut reports = Vec::with_capacity(workers.len());
        let mut stats = RunStats::new();
        for (index, worker) in workers.into_iter().enumerate() {
            match worker {
                Some(mut report) => {
                    report.stats.files = source.len();
                    report.stats.size = source.total_size();
                    if let Some(reason) = &report.aborted {
                        error!("{}: {}", report.destination, reason);
                    }
                    stats.absorb(&report.stats);
                    statuses.push(report.status);
                    reports.push(report);
                }
                None => {
                    let destination = self.destinations[index].display_path("");
                    statuses.push(ExitStatus::General);
                    reports.push(WorkerReport {
                        destination,
                        stats: RunStats::new(),
                        status: ExitStatus::General,
                        aborted: Some("worker task did not finish".to_string()),
                    });
                }
            }
        }

        // Source totals describe the run, not each destination.
        stats.files = source.len();
        stats.size = source.total_size();
        stats.files_excluded = excluded.len();

        Ok(SyncReport {
            workers: reports,
            stats,
            status: reduce_statuses(statuses),
        })
    }
}

/// Keys excluded on either side, sorted and without duplicates.
fn merge_excluded(source: &[String], dest: Vec<String>) -> Vec<String> {
    let mut keys: Vec<String> = source.iter().cloned().chain(dest).collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}
