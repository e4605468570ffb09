use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use bucketsync::config::{Config, SyncOptions};
use bucketsync::fs::{Endpoint, StorageBackend};
use bucketsync::logging;
use bucketsync::sync::{
    AuditLine, BatchDelete, BatchReport, ExitStatus, ObjectCopier, SyncEngine, SyncError,
};

/// Synchronize directory trees with S3-compatible object storage
#[derive(Parser)]
#[command(name = "bucketsync", version, about)]
struct Cli {
    /// Debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Configuration file (default: <config dir>/bucketsync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Make DESTINATION match SOURCE
    Sync {
        source: String,
        destination: String,
        /// Also sync into this destination (repeatable)
        #[arg(long = "add-destination", value_name = "URI")]
        add_destination: Vec<String>,
        /// Delete destination objects with no counterpart in the source
        #[arg(long)]
        delete_removed: bool,
        /// Delete after transfers instead of before
        #[arg(long)]
        delete_after: bool,
        /// Compare sizes only
        #[arg(long)]
        no_check_md5: bool,
        /// Keep file mode, ownership and timestamps
        #[arg(short, long)]
        preserve: bool,
        /// Follow symbolic links in local sources
        #[arg(short = 'F', long)]
        follow_symlinks: bool,
        /// Limit transfer rate, bytes per second (k and m suffixes allowed)
        #[arg(long, value_parser = parse_rate)]
        limit_rate: Option<u64>,
        /// Print transfer statistics at the end
        #[arg(long)]
        stats: bool,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Delete objects
    Del {
        uri: String,
        /// Delete everything under the prefix
        #[arg(short, long)]
        recursive: bool,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Copy objects
    Cp {
        source: String,
        destination: String,
        #[arg(short, long)]
        recursive: bool,
        #[arg(long, value_parser = parse_rate)]
        limit_rate: Option<u64>,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Move objects
    Mv {
        source: String,
        destination: String,
        #[arg(short, long)]
        recursive: bool,
        #[arg(long, value_parser = parse_rate)]
        limit_rate: Option<u64>,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Show what would be done without changing anything
    #[arg(short = 'n', long)]
    dry_run: bool,
    /// Allow deleting everything
    #[arg(short, long)]
    force: bool,
    /// Abort at the first failed item
    #[arg(long)]
    stop_on_error: bool,
    /// Refuse to delete more than N objects (0 = unlimited)
    #[arg(long, value_name = "N")]
    max_delete: Option<usize>,
}

#[derive(Args)]
struct FilterArgs {
    /// Skip keys matching GLOB
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,
    #[arg(long, value_name = "FILE")]
    exclude_from: Vec<PathBuf>,
    /// Skip keys matching REGEXP
    #[arg(long, value_name = "REGEXP")]
    rexclude: Vec<String>,
    #[arg(long, value_name = "FILE")]
    rexclude_from: Vec<PathBuf>,
    /// Keep excluded keys matching GLOB
    #[arg(long, value_name = "GLOB")]
    include: Vec<String>,
    #[arg(long, value_name = "FILE")]
    include_from: Vec<PathBuf>,
    /// Keep excluded keys matching REGEXP
    #[arg(long, value_name = "REGEXP")]
    rinclude: Vec<String>,
    #[arg(long, value_name = "FILE")]
    rinclude_from: Vec<PathBuf>,
}

impl RunArgs {
    fn apply(&self, options: &mut SyncOptions) {
        options.dry_run |= self.dry_run;
        options.force |= self.force;
        options.stop_on_error |= self.stop_on_error;
        if let Some(max_delete) = self.max_delete {
            options.max_delete = max_delete;
        }
    }
}

impl FilterArgs {
    fn apply(&self, options: &mut SyncOptions) {
        options.exclude.extend(self.exclude.iter().cloned());
        options.exclude_from.extend(self.exclude_from.iter().cloned());
        options.rexclude.extend(self.rexclude.iter().cloned());
        options.rexclude_from.extend(self.rexclude_from.iter().cloned());
        options.include.extend(self.include.iter().cloned());
        options.include_from.extend(self.include_from.iter().cloned());
        options.rinclude.extend(self.rinclude.iter().cloned());
        options.rinclude_from.extend(self.rinclude_from.iter().cloned());
    }
}

fn parse_rate(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|e| format!("invalid rate '{}': {}", value, e))
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let status = if err.use_stderr() {
                ExitStatus::Usage
            } else {
                ExitStatus::Ok
            };
            std::process::exit(status.code());
        }
    };

    logging::init(cli.verbose, cli.quiet);

    let status = match run(cli).await {
        Ok(status) => status,
        Err(err) => {
            eprintln!("{} {:#}", "ERROR:".red().bold(), err);
            err.downcast_ref::<SyncError>()
                .map(SyncError::exit_status)
                .unwrap_or(ExitStatus::General)
        }
    };
    std::process::exit(status.code());
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let mut options = config.sync.clone();
    let quiet = cli.quiet;

    match cli.command {
        Command::Sync {
            source,
            destination,
            add_destination,
            delete_removed,
            delete_after,
            no_check_md5,
            preserve,
            follow_symlinks,
            limit_rate,
            stats,
            run,
            filter,
        } => {
            options.delete_removed |= delete_removed;
            options.delete_after |= delete_after;
            options.check_md5 &= !no_check_md5;
            options.preserve |= preserve;
            options.follow_symlinks |= follow_symlinks;
            options.limit_rate = limit_rate.or(options.limit_rate);
            options.stats |= stats;
            options.recursive = true;
            run.apply(&mut options);
            filter.apply(&mut options);

            let source: Endpoint = source.parse()?;
            let mut targets = Vec::new();
            for uri in std::iter::once(&destination).chain(add_destination.iter()) {
                let endpoint: Endpoint = uri.parse()?;
                targets.push(Endpoint::destination_base(&source, &endpoint)?);
            }
            if !source.is_remote() && targets.iter().all(|t| !t.is_remote()) {
                return Err(SyncError::Usage(
                    "at least one side of a sync must be an s3:// URI".to_string(),
                )
                .into());
            }

            sync(&config, &options, &source, &targets, quiet).await
        }
        Command::Del {
            uri,
            recursive,
            run,
            filter,
        } => {
            options.recursive = recursive;
            run.apply(&mut options);
            filter.apply(&mut options);

            let endpoint: Endpoint = uri.parse()?;
            if !endpoint.is_remote() {
                return Err(SyncError::Usage(format!("expecting an s3:// URI, got '{}'", uri)).into());
            }
            let (store, key) = if recursive {
                (endpoint.clone(), None)
            } else {
                endpoint.object_parent()
            };
            if !recursive && key.is_none() {
                return Err(SyncError::Usage(format!(
                    "use --recursive to delete everything under '{}'",
                    endpoint
                ))
                .into());
            }
            let whole_store = matches!(&endpoint, Endpoint::S3 { prefix, .. } if prefix.is_empty());

            let backend = store.open(&config, &options)?;
            let (tx, printer) = audit_printer(None, quiet);
            let report = BatchDelete::new(backend, options)?
                .whole_store(whole_store)
                .only_key(key)
                .with_audit(tx)
                .run()
                .await;
            printer.finish().await;
            Ok(report_batch(report?))
        }
        Command::Cp {
            source,
            destination,
            recursive,
            limit_rate,
            run,
            filter,
        } => {
            copy_command(
                &config,
                options,
                CopyArgs {
                    source,
                    destination,
                    recursive,
                    limit_rate,
                    remove_source: false,
                },
                run,
                filter,
                quiet,
            )
            .await
        }
        Command::Mv {
            source,
            destination,
            recursive,
            limit_rate,
            run,
            filter,
        } => {
            copy_command(
                &config,
                options,
                CopyArgs {
                    source,
                    destination,
                    recursive,
                    limit_rate,
                    remove_source: true,
                },
                run,
                filter,
                quiet,
            )
            .await
        }
    }
}

struct CopyArgs {
    source: String,
    destination: String,
    recursive: bool,
    limit_rate: Option<u64>,
    remove_source: bool,
}

async fn copy_command(
    config: &Config,
    mut options: SyncOptions,
    args: CopyArgs,
    run: RunArgs,
    filter: FilterArgs,
    quiet: bool,
) -> Result<ExitStatus> {
    let CopyArgs {
        source,
        destination,
        recursive,
        limit_rate,
        remove_source,
    } = args;
    options.recursive = recursive;
    options.limit_rate = limit_rate.or(options.limit_rate);
    run.apply(&mut options);
    filter.apply(&mut options);

    let source: Endpoint = source.parse()?;
    let destination: Endpoint = destination.parse()?;
    if !source.is_remote() || !destination.is_remote() {
        return Err(SyncError::Usage("cp and mv expect two s3:// URIs".to_string()).into());
    }
    let (source_root, key) = if recursive {
        (source.clone(), None)
    } else {
        source.object_parent()
    };
    let target = Endpoint::destination_base(&source_root, &destination)?;

    let source_backend = source_root.open(config, &options)?;
    let dest_backend = target.open(config, &options)?;
    let copier = if remove_source {
        ObjectCopier::move_objects(source_backend, dest_backend, options)?
    } else {
        ObjectCopier::copy(source_backend, dest_backend, options)?
    };

    let (tx, printer) = audit_printer(None, quiet);
    let report = copier.only_key(key).with_audit(tx).run().await;
    printer.finish().await;
    Ok(report_batch(report?))
}

async fn sync(
    config: &Config,
    options: &SyncOptions,
    source: &Endpoint,
    targets: &[Endpoint],
    quiet: bool,
) -> Result<ExitStatus> {
    let source_backend = source
        .open(config, options)
        .with_context(|| format!("Cannot open {}", source))?;
    let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::with_capacity(targets.len());
    for target in targets {
        backends.push(
            target
                .open(config, options)
                .with_context(|| format!("Cannot open {}", target))?,
        );
    }

    let label_destinations = backends.len() > 1;
    let mut backends = backends.into_iter();
    let first = backends.next().context("No destination given")?;

    let (tx, printer) = audit_printer(Some("Building file lists..."), quiet);
    let mut engine = SyncEngine::new(source_backend, first, options.clone())?;
    for backend in backends {
        engine = engine.add_destination(backend);
    }
    let engine = engine.with_audit(tx);
    let result = engine.sync().await;
    drop(engine);
    printer.finish().await;
    let report = result?;

    for worker in &report.workers {
        let line = if label_destinations {
            format!("{}: {}", worker.destination, worker.stats.summary())
        } else {
            worker.stats.summary()
        };
        print_summary(&line, worker.status);
    }

    if options.stats {
        print!("{}", report.stats.format_output());
        println!("{}", report.stats.to_json()?);
    }
    Ok(report.status)
}

fn report_batch(report: BatchReport) -> ExitStatus {
    let board = report.scoreboard;
    let line = format!(
        "Done. {} succeeded, {} failed, {} not found.",
        board.successes(),
        board.failures(),
        board.missing()
    );
    print_summary(&line, report.status);
    report.status
}

fn print_summary(line: &str, status: ExitStatus) {
    match status {
        ExitStatus::Ok => println!("{}", line.green()),
        ExitStatus::Partial | ExitStatus::Break => println!("{}", line.yellow()),
        _ => println!("{}", line.red()),
    }
}

/// Prints audit lines on stdout while a spinner runs on stderr.
struct AuditPrinter {
    task: tokio::task::JoinHandle<()>,
    spinner: ProgressBar,
}

impl AuditPrinter {
    async fn finish(self) {
        let _ = self.task.await;
        self.spinner.finish_and_clear();
    }
}

fn audit_printer(message: Option<&str>, quiet: bool) -> (mpsc::Sender<AuditLine>, AuditPrinter) {
    let (tx, mut rx) = mpsc::channel::<AuditLine>(1024);

    let spinner = match message {
        Some(message) if !quiet => {
            let spinner = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
                spinner.set_style(style);
            }
            spinner.set_message(message.to_string());
            spinner.enable_steady_tick(Duration::from_millis(120));
            spinner
        }
        _ => ProgressBar::hidden(),
    };

    let printer = spinner.clone();
    let task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            printer.finish_and_clear();
            println!("{}", line.text);
        }
    });

    (tx, AuditPrinter { task, spinner })
}
