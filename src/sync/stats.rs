//! Run statistics, the per-item scoreboard, and exit status reduction.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Process exit status, ordered by the codes the binary returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ExitStatus {
    #[default]
    Ok,
    General,
    Partial,
    Precondition,
    Usage,
    DataErr,
    OsFile,
    TempFail,
    Config,
    Break,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::General => 1,
            Self::Partial => 2,
            Self::Precondition => 14,
            Self::Usage => 64,
            Self::DataErr => 65,
            Self::OsFile => 72,
            Self::TempFail => 75,
            Self::Config => 78,
            Self::Break => 130,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Worst-of reduction: the first non-Ok status sticks.
    pub fn merge(self, other: ExitStatus) -> ExitStatus {
        if self.is_ok() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Reduce many worker statuses to one.
pub fn reduce_statuses<I: IntoIterator<Item = ExitStatus>>(statuses: I) -> ExitStatus {
    statuses
        .into_iter()
        .fold(ExitStatus::Ok, |acc, status| acc.merge(status))
}

/// Outcome counters for simple per-item operations (cp, mv).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scoreboard {
    success: usize,
    failed: usize,
    not_found: usize,
}

impl Scoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&mut self) {
        self.success += 1;
    }

    pub fn failed(&mut self) {
        self.failed += 1;
    }

    pub fn not_found(&mut self) {
        self.not_found += 1;
    }

    pub fn successes(&self) -> usize {
        self.success
    }

    pub fn failures(&self) -> usize {
        self.failed
    }

    pub fn missing(&self) -> usize {
        self.not_found
    }

    /// Missing keys are only warnings; any hard failure makes the run partial.
    pub fn rc(&self) -> ExitStatus {
        if self.failed > 0 {
            ExitStatus::Partial
        } else {
            ExitStatus::Ok
        }
    }
}

/// Counters and byte totals for one sync worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    /// Source entries examined after filtering.
    pub files: usize,
    /// Total size of the examined source entries.
    pub size: u64,
    pub files_transferred: usize,
    pub size_transferred: u64,
    /// Entries produced by same-store copies instead of transfers.
    pub files_copied: usize,
    /// Bytes that did not need to be transferred thanks to copies.
    pub size_copied: u64,
    pub files_deleted: usize,
    pub size_deleted: u64,
    pub files_unchanged: usize,
    pub files_failed: usize,
    pub files_excluded: usize,
    #[serde(skip)]
    started: Option<Instant>,
    #[serde(serialize_with = "serialize_duration")]
    elapsed: Duration,
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the wall clock.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stop the wall clock and freeze the elapsed time.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed = started.elapsed();
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => started.elapsed(),
            None => self.elapsed,
        }
    }

    pub fn record_transfer(&mut self, bytes: u64) {
        self.files_transferred += 1;
        self.size_transferred += bytes;
    }

    pub fn record_copy(&mut self, bytes: u64) {
        self.files_copied += 1;
        self.size_copied += bytes;
    }

    pub fn record_delete(&mut self, bytes: u64) {
        self.files_deleted += 1;
        self.size_deleted += bytes;
    }

    pub fn record_failure(&mut self) {
        self.files_failed += 1;
    }

    /// Fold another worker's stats into this one.
    pub fn absorb(&mut self, other: &RunStats) {
        self.files += other.files;
        self.size += other.size;
        self.files_transferred += other.files_transferred;
        self.size_transferred += other.size_transferred;
        self.files_copied += other.files_copied;
        self.size_copied += other.size_copied;
        self.files_deleted += other.files_deleted;
        self.size_deleted += other.size_deleted;
        self.files_unchanged += other.files_unchanged;
        self.files_failed += other.files_failed;
        self.files_excluded += other.files_excluded;
        self.elapsed = self.elapsed.max(other.elapsed());
    }

    /// Average transfer rate in bytes per second, with a one-second floor on elapsed time.
    pub fn rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64().max(1.0);
        self.size_transferred as f64 / elapsed
    }

    /// One-line "Done." summary.
    pub fn summary(&self) -> String {
        format!(
            "Done. Transferred {} files ({}) in {:.1} seconds, {}/s. Copied {}, deleted {}, unchanged {}, failed {}.",
            self.files_transferred,
            format_size(self.size_transferred),
            self.elapsed().as_secs_f64(),
            format_size(self.rate() as u64),
            self.files_copied,
            self.files_deleted,
            self.files_unchanged,
            self.files_failed,
        )
    }

    /// Multi-line stats block printed with `--stats`.
    pub fn format_output(&self) -> String {
        let mut output = String::new();
        output.push_str("\nStats: Number of files: ");
        output.push_str(&format!("{} ({} bytes)\n", self.files, self.size));
        output.push_str(&format!(
            "Stats: Number of files transferred: {} ({} bytes)\n",
            self.files_transferred, self.size_transferred
        ));
        output.push_str(&format!(
            "Stats: Number of files copied: {} ({} bytes saved)\n",
            self.files_copied, self.size_copied
        ));
        output.push_str(&format!(
            "Stats: Number of files deleted: {} ({} bytes)\n",
            self.files_deleted, self.size_deleted
        ));
        output.push_str(&format!("Stats: Number of files unchanged: {}\n", self.files_unchanged));
        output.push_str(&format!("Stats: Number of files failed: {}\n", self.files_failed));
        output
    }

    /// Structured single-line stats record.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut frozen = self.clone();
        frozen.stop();
        serde_json::to_string(&frozen)
    }
}

/// Format a byte count the way summaries print it.
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}
