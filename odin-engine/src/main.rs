//! odin - project integrity, backup and rollback CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use odin_engine::daemon::ShutdownCoordinator;
use odin_engine::retention::RetentionPolicy;
use odin_engine::{utils, BackupSummary, LockGuard, OdinEngine, RollbackOutcome};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project root
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Path to configuration file (default: <root>/.odin/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create .odin/, capture the baseline and take the first backup
    Init,
    /// Check the tree for drift and write .odin/audit_report.md
    Audit {
        /// List drifted paths, recent backups and anomalies
        #[arg(long)]
        full: bool,
    },
    /// Take a backup now
    Backup {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Restore the project to a backup
    RollbackTo {
        id: String,
        /// Also delete tracked files that did not exist in the backup
        #[arg(long)]
        mirror: bool,
    },
    /// Restore the newest backup that is not a rollback safety backup
    RollbackLast {
        #[arg(long)]
        mirror: bool,
    },
    /// Delete old backups and checkpoints
    Cleanup {
        /// Number of newest items that are always kept
        #[arg(short, long)]
        keep: usize,
        /// Only delete items older than this many days
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        no_confirm: bool,
    },
    /// List backups, newest first
    ListBackups {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show one backup
    ShowBackup { id: String },
}

type Job = Box<dyn FnOnce(&OdinEngine, &LockGuard) -> Result<()> + Send>;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let engine = OdinEngine::load(&args.root, args.config.as_deref())
        .with_context(|| format!("cannot open project {}", args.root.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&engine.config().log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "odin v{} on {}",
        env!("CARGO_PKG_VERSION"),
        engine.layout().root().display()
    );

    // Read-only commands run without the lock.
    let job: Job = match args.command {
        Command::ListBackups { limit } => {
            let backups = engine.list_backups(limit);
            if backups.is_empty() {
                println!("No backups.");
            }
            for backup in &backups {
                print_summary_line(backup);
            }
            return Ok(());
        }
        Command::ShowBackup { id } => {
            print_summary(&engine.show_backup(&id)?);
            return Ok(());
        }
        Command::Init => Box::new(|engine: &OdinEngine, lock: &LockGuard| {
            let outcome = engine.init(lock)?;
            println!("Initialized {}", engine.layout().odin_dir().display());
            println!("First backup: {}", outcome.backup.backup_id);
            println!("Tracked files: {}", outcome.report.tracked_files);
            Ok(())
        }),
        Command::Audit { full } => Box::new(move |engine: &OdinEngine, lock: &LockGuard| {
            let report = engine.audit(lock, full)?;
            println!("Status: {}", report.status());
            if report.baseline_created {
                println!("Baseline captured ({} files).", report.tracked_files);
            }
            println!(
                "Added {}, removed {}, modified {}, unchanged {}",
                report.drift.added.len(),
                report.drift.removed.len(),
                report.drift.modified.len(),
                report.drift.unchanged.len()
            );
            for anomaly in &report.anomalies {
                println!("[{}] {}", anomaly.severity(), anomaly.describe());
            }
            println!("Report: {}", engine.layout().audit_report().display());
            Ok(())
        }),
        Command::Backup { reason } => Box::new(move |engine: &OdinEngine, lock: &LockGuard| {
            let record = engine.backup(lock, &reason)?;
            println!("Backup created: {}", record.backup_id);
            for warning in &record.warnings {
                println!("warning: {warning}");
            }
            Ok(())
        }),
        Command::RollbackTo { id, mirror } => {
            Box::new(move |engine: &OdinEngine, lock: &LockGuard| {
                finish_rollback(engine.rollback_to(lock, &id, mirror)?)
            })
        }
        Command::RollbackLast { mirror } => {
            Box::new(move |engine: &OdinEngine, lock: &LockGuard| {
                finish_rollback(engine.rollback_last(lock, mirror)?)
            })
        }
        Command::Cleanup {
            keep,
            max_age_days,
            no_confirm,
        } => {
            // Previewed and confirmed without the lock so a pending prompt
            // never holds it. The job plans again once the lock is held.
            let policy = engine.cleanup_policy(Some(keep), max_age_days);
            let preview = engine.cleanup_plan(&policy);
            if preview.is_empty() {
                println!(
                    "Nothing to delete ({} backups, {} checkpoints).",
                    preview.total_backups, preview.total_checkpoints
                );
                return Ok(());
            }
            println!(
                "Will delete {} of {} backups and {} of {} checkpoints:",
                preview.backups.len(),
                preview.total_backups,
                preview.checkpoints.len(),
                preview.total_checkpoints
            );
            for backup in &preview.backups {
                print_summary_line(backup);
            }
            if !no_confirm && !confirm("Proceed?")? {
                println!("Aborted.");
                return Ok(());
            }
            Box::new(move |engine: &OdinEngine, lock: &LockGuard| {
                run_cleanup(engine, lock, &policy)
            })
        }
    };

    let lock = engine.lock()?;
    execute(engine, lock, job).await
}

/// Run a mutating job on a blocking thread. A SIGINT/SIGTERM does not
/// interrupt it; we wait for it to finish and then fail.
async fn execute(engine: OdinEngine, lock: LockGuard, job: Job) -> Result<()> {
    let mut coordinator = ShutdownCoordinator::new()?;

    let mut task = tokio::task::spawn_blocking(move || {
        let result = job(&engine, &lock);
        drop(lock);
        result
    });

    tokio::select! {
        joined = &mut task => joined.context("operation panicked")?,
        signal = coordinator.wait_for_signal() => {
            task.await.context("operation panicked")??;
            bail!("interrupted by {:?}", signal)
        }
    }
}

fn run_cleanup(engine: &OdinEngine, lock: &LockGuard, policy: &RetentionPolicy) -> Result<()> {
    let report = engine.cleanup(lock, policy)?;
    println!(
        "Deleted {} backups and {} checkpoints; {} backups and {} checkpoints remain.",
        report.deleted_backups.len(),
        report.deleted_checkpoints.len(),
        report.remaining_backups,
        report.remaining_checkpoints
    );
    if !report.errors.is_empty() {
        for error in &report.errors {
            eprintln!("  {error}");
        }
        bail!("{} items could not be deleted", report.errors.len());
    }
    Ok(())
}

fn finish_rollback(outcome: RollbackOutcome) -> Result<()> {
    println!("Safety backup: {}", outcome.safety_record_id);
    println!(
        "Rolled back to {}: {} files restored, {} deleted{}",
        outcome.target_id,
        outcome.restored_count,
        outcome.deleted_count,
        if outcome.patch_reverted { ", patch reverted" } else { "" }
    );
    for warning in &outcome.warnings {
        println!("warning: {warning}");
    }
    if outcome.residual_drift.has_changes() {
        println!(
            "Residual drift: {} files differ from the backup",
            outcome.residual_drift.changed_count()
        );
    }
    outcome.into_result()?;
    Ok(())
}

fn print_summary_line(backup: &BackupSummary) {
    println!(
        "{}  {}  {:>5} files  {:>6} KB  {}{}",
        backup.id,
        backup.created_at.format("%Y-%m-%d %H:%M:%S"),
        backup.files_count,
        backup.size_kb,
        backup.reason,
        if backup.is_safety_record() { "  [safety]" } else { "" }
    );
}

fn print_summary(backup: &BackupSummary) {
    println!("ID:           {}", backup.id);
    println!("Created:      {}", backup.created_at.to_rfc3339());
    println!("Reason:       {}", backup.reason);
    println!("Project hash: {}", backup.project_hash);
    println!("Files:        {}", backup.files_count);
    println!("Size:         {} KB", backup.size_kb);
    println!("Archive:      {}", if backup.has_archive { "yes" } else { "no" });
    println!("Patch:        {}", if backup.has_patch { "yes" } else { "no" });
    if let Some(commit) = &backup.commit_hash {
        println!("Commit:       {commit}");
    }
    if let Some(target) = &backup.rollback_target {
        println!("Safety for:   {target}");
    }
    if backup.warnings > 0 {
        println!("Warnings:     {}", backup.warnings);
    }
    println!("Record:       {}", backup.path.display());
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
