//! snapsync process entry.
//!
//! The thin surface the service timer and operators drive. Exit codes:
//! 0 success, 1 any operational failure (details in the journal), 2 is
//! reserved for health-warning front-ends.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

use snapsync::cancel::CancelToken;
use snapsync::config::{self, Config, TargetConfig};
use snapsync::endpoint::{Endpoint, EndpointOptions, EndpointUrl};
use snapsync::journal::{self, Journal};
use snapsync::lock;
use snapsync::orchestrator::{Orchestrator, RunOptions, default_transaction_log};
use snapsync::restore::{RestoreContext, RestoreOptions, RestoreTarget, execute as run_restore};
use snapsync::transport::{SessionTable, is_root};
use snapsync::{pipeline, telemetry};

#[derive(Parser, Debug)]
#[command(
    name = "snapsync",
    version,
    about = "btrfs snapshot replication with incremental send/receive",
    arg_required_else_help = true
)]
struct Cli {
    /// More logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Configuration file (default: user config dir, then /etc).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot, replicate, and prune every enabled volume.
    Run {
        /// Only these volumes (paths as configured).
        #[arg(long = "volume")]
        volumes: Vec<PathBuf>,
        /// Skip space prechecks.
        #[arg(long)]
        force: bool,
        /// Take snapshots only; no transfers, no pruning.
        #[arg(long)]
        snapshot_only: bool,
    },
    /// Apply retention without snapshotting or transferring.
    Prune {
        #[arg(long = "volume")]
        volumes: Vec<PathBuf>,
    },
    /// Replay a backup chain into a local btrfs directory.
    Restore {
        /// Backup endpoint URL (ssh://…, raw://…, or a local path).
        #[arg(long)]
        from: String,
        /// Local destination directory (btrfs).
        #[arg(long)]
        to: PathBuf,
        /// Volume (as configured) whose prefix and format apply.
        #[arg(long)]
        volume: PathBuf,
        /// Restore this snapshot (default: latest).
        #[arg(long, conflicts_with_all = ["before", "all"])]
        snapshot: Option<String>,
        /// Restore the latest snapshot at or before this timestamp
        /// (in the configured timestamp format).
        #[arg(long, conflicts_with = "all")]
        before: Option<String>,
        /// Restore every snapshot the backup holds.
        #[arg(long)]
        all: bool,
        /// Destroy colliding local snapshots instead of skipping them.
        #[arg(long)]
        overwrite: bool,
        /// Restore into the live volume path.
        #[arg(long, requires = "yes_i_know_what_i_am_doing")]
        in_place: bool,
        #[arg(long, hide = true)]
        yes_i_know_what_i_am_doing: bool,
        /// Skip space prechecks.
        #[arg(long)]
        force: bool,
    },
    /// Transfer-size estimate for one volume and target.
    Estimate {
        #[arg(long)]
        volume: PathBuf,
        /// Target path as configured (defaults to the first target).
        #[arg(long)]
        target: Option<String>,
    },
    /// Inspect or break locks under a volume's snapshot directory.
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },
    /// Show the tail of the transaction journal.
    Log {
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug)]
enum LocksCommand {
    List {
        #[arg(long)]
        volume: PathBuf,
    },
    Break {
        #[arg(long)]
        volume: PathBuf,
        /// Lock file name as shown by `locks list`.
        name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = real_main(cli);
    ExitCode::from(code)
}

fn real_main(cli: Cli) -> u8 {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("snapsync: {err}");
            return 1;
        }
    };
    let _telemetry = telemetry::init(cli.verbose, config.log_file.as_deref());

    let cancel = CancelToken::new();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, cancel.flag());

    match dispatch(cli, config, cancel) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("snapsync: {err}");
            1
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, config::ConfigError> {
    match &cli.config {
        Some(path) => config::load(path),
        None => config::load_default(),
    }
}

fn open_journal(config: &Config) -> Result<Journal, snapsync::journal::JournalError> {
    let path = config
        .transaction_log
        .clone()
        .unwrap_or_else(default_transaction_log);
    Journal::open(&path)
}

fn dispatch(cli: Cli, config: Config, cancel: CancelToken) -> snapsync::Result<u8> {
    match cli.command {
        Command::Run {
            volumes,
            force,
            snapshot_only,
        } => {
            let journal = open_journal(&config)?;
            let orchestrator = Orchestrator::new(config, journal, cancel);
            let report = orchestrator.run(&RunOptions {
                volumes,
                force,
                snapshot_only,
            });
            print_run_report(&report);
            Ok(report.exit_code() as u8)
        }
        Command::Prune { volumes } => {
            let journal = open_journal(&config)?;
            let orchestrator = Orchestrator::new(config, journal, cancel);
            let report = orchestrator.prune(&RunOptions {
                volumes,
                ..RunOptions::default()
            });
            print_run_report(&report);
            Ok(report.exit_code() as u8)
        }
        Command::Restore {
            from,
            to,
            volume,
            snapshot,
            before,
            all,
            overwrite,
            in_place,
            yes_i_know_what_i_am_doing,
            force,
        } => {
            let volume_config = config
                .volumes
                .iter()
                .find(|v| v.path == volume)
                .ok_or_else(|| snapsync::config::ConfigError::InvalidVolume {
                    volume: volume.clone(),
                    detail: "volume not present in configuration".to_string(),
                })?;
            let format = config.timestamp_format.clone();
            let target = if let Some(name) = snapshot {
                RestoreTarget::Name(name)
            } else if let Some(before) = before {
                let ts = format.parse(&before).ok_or_else(|| {
                    snapsync::config::ConfigError::InvalidVolume {
                        volume: volume.clone(),
                        detail: format!("--before {before:?} does not match the timestamp format"),
                    }
                })?;
                RestoreTarget::LatestBefore(ts)
            } else if all {
                RestoreTarget::All
            } else {
                RestoreTarget::Latest
            };

            let journal = open_journal(&config)?;
            let sessions = SessionTable::new();
            let url = EndpointUrl::parse(&from)
                .map_err(|e| snapsync::config::ConfigError::InvalidVolume {
                    volume: volume.clone(),
                    detail: e.to_string(),
                })?;
            let backup_target = target_for_url(volume_config, &url);
            let backup = Endpoint::connect(
                &url,
                &backup_target,
                EndpointOptions {
                    elevate: if url.is_remote() { backup_target.ssh_sudo } else { !is_root() },
                    ..EndpointOptions::default()
                },
                &sessions,
            )?;
            let local = Endpoint::local(
                to,
                EndpointOptions {
                    elevate: !is_root(),
                    ..EndpointOptions::default()
                },
            );
            let prefix = volume_config.prefix();
            let ctx = RestoreContext {
                backup: &backup,
                local: &local,
                prefix: &prefix,
                format: &format,
                volume: volume.display().to_string(),
                options: RestoreOptions {
                    overwrite,
                    in_place,
                    confirmed: yes_i_know_what_i_am_doing,
                    force,
                },
                drain_window: pipeline::DEFAULT_DRAIN_WINDOW,
                space_margin: pipeline::DEFAULT_SPACE_MARGIN,
            };
            let report = run_restore(&ctx, &target, &journal, &cancel)?;
            println!(
                "restored {} snapshot(s), {} already present",
                report.restored.len(),
                report.skipped_existing.len()
            );
            Ok(0)
        }
        Command::Estimate { volume, target } => {
            let volume_config = config
                .volumes
                .iter()
                .find(|v| v.path == volume)
                .ok_or_else(|| snapsync::config::ConfigError::InvalidVolume {
                    volume: volume.clone(),
                    detail: "volume not present in configuration".to_string(),
                })?;
            let target_config = match &target {
                Some(path) => volume_config
                    .targets
                    .iter()
                    .find(|t| &t.path == path)
                    .ok_or_else(|| snapsync::config::ConfigError::InvalidVolume {
                        volume: volume.clone(),
                        detail: format!("target {path:?} not configured for this volume"),
                    })?,
                None => volume_config.targets.first().ok_or_else(|| {
                    snapsync::config::ConfigError::InvalidVolume {
                        volume: volume.clone(),
                        detail: "volume has no targets".to_string(),
                    }
                })?,
            };
            estimate(&config, volume_config, target_config, &cancel)
        }
        Command::Locks { command } => match command {
            LocksCommand::List { volume } => {
                let volume_config = config.volumes.iter().find(|v| v.path == volume);
                let dir = match volume_config {
                    Some(v) => v.snapshot_dir_for(&config),
                    None => volume,
                };
                for (path, meta) in lock::list_locks(&dir)? {
                    println!(
                        "{}\tpid={} host={} op={} since={}",
                        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                        meta.owner_pid,
                        meta.host,
                        meta.op_kind.as_str(),
                        meta.started_at
                    );
                }
                Ok(0)
            }
            LocksCommand::Break { volume, name } => {
                let volume_config = config.volumes.iter().find(|v| v.path == volume);
                let dir = match volume_config {
                    Some(v) => v.snapshot_dir_for(&config),
                    None => volume,
                };
                lock::break_lock(&dir.join(&name))?;
                println!("broke {name}");
                Ok(0)
            }
        },
        Command::Log { lines } => {
            let path = config
                .transaction_log
                .clone()
                .unwrap_or_else(default_transaction_log);
            for entry in journal::tail(&path, lines)? {
                println!(
                    "{} {:>3} {:?}/{:?} {}{}{}",
                    entry.timestamp_utc.format("%Y-%m-%dT%H:%M:%SZ"),
                    entry.seq,
                    entry.action,
                    entry.status,
                    entry.subject.volume,
                    entry
                        .subject
                        .destination
                        .as_deref()
                        .map(|d| format!(" → {d}"))
                        .unwrap_or_default(),
                    entry
                        .error_detail
                        .as_deref()
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default(),
                );
            }
            Ok(0)
        }
    }
}

/// Reuse the configured ssh options when the restore source matches a
/// configured target; defaults otherwise.
fn target_for_url(volume: &snapsync::config::VolumeConfig, url: &EndpointUrl) -> TargetConfig {
    volume
        .targets
        .iter()
        .find(|t| {
            EndpointUrl::parse(&t.path)
                .map(|candidate| candidate == *url)
                .unwrap_or(false)
        })
        .cloned()
        .unwrap_or_else(|| TargetConfig {
            path: url.to_string(),
            ssh_sudo: false,
            ssh_port: None,
            ssh_key: None,
            ssh_password_auth: true,
            compress: snapsync::config::Compression::None,
            rate_limit: None,
            require_mount: false,
            encrypt: snapsync::config::Encryption::None,
            gpg_recipient: None,
        })
}

fn estimate(
    config: &Config,
    volume: &snapsync::config::VolumeConfig,
    target: &TargetConfig,
    cancel: &CancelToken,
) -> snapsync::Result<u8> {
    let snapshot_dir = volume.snapshot_dir_for(config);
    let source = Endpoint::local(
        snapshot_dir,
        EndpointOptions {
            elevate: !is_root(),
            ..EndpointOptions::default()
        },
    );
    let format = config.timestamp_format.clone();
    let prefix = volume.prefix();
    let source_snapshots = source.list_snapshots(&prefix, &format)?;

    let sessions = SessionTable::new();
    let url = EndpointUrl::parse(&target.path).map_err(|e| {
        snapsync::Error::from(snapsync::config::ConfigError::InvalidTarget {
            target: target.path.clone(),
            source: e,
        })
    })?;
    let dest = Endpoint::connect(
        &url,
        target,
        EndpointOptions {
            elevate: if url.is_remote() { target.ssh_sudo } else { !is_root() },
            ..EndpointOptions::default()
        },
        &sessions,
    )?;
    let dest_snapshots = dest.list_snapshots(&prefix, &format)?;
    match snapsync::planner::plan(&source_snapshots, &dest_snapshots, config.incremental) {
        snapsync::planner::Plan::UpToDate => {
            println!("{}: up to date", url.id());
            Ok(0)
        }
        snapsync::planner::Plan::Send { snapshot, parent } => {
            let estimate =
                pipeline::estimate_stream_bytes(&source, &snapshot, parent.as_ref(), cancel)?;
            println!(
                "{}: send {} ({} stream{})",
                url.id(),
                snapshot.name,
                human_bytes(estimate),
                parent
                    .map(|p| format!(", incremental against {}", p.name))
                    .unwrap_or_else(|| ", full".to_string()),
            );
            Ok(0)
        }
    }
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn print_run_report(report: &snapsync::orchestrator::RunReport) {
    for volume in &report.volumes {
        let status = if volume.failed() { "FAILED" } else { "ok" };
        println!(
            "{}: {status}{}",
            volume.volume.display(),
            volume
                .snapshot
                .as_deref()
                .map(|s| format!(" (snapshot {s})"))
                .unwrap_or_default()
        );
        if let Some(error) = &volume.error {
            println!("  error: {error}");
        }
        for transfer in &volume.transfers {
            let status = match (&transfer.status, &transfer.error) {
                (Some(s), None) => format!("{s:?}"),
                (_, Some(err)) => format!("failed: {err}"),
                (None, None) => "skipped".to_string(),
            };
            println!(
                "  {} → {status} ({} attempt{})",
                transfer.destination,
                transfer.attempts,
                if transfer.attempts == 1 { "" } else { "s" }
            );
        }
        if volume.pruned_source + volume.pruned_destinations > 0 {
            println!(
                "  pruned {} source / {} destination snapshots",
                volume.pruned_source, volume.pruned_destinations
            );
        }
    }
}
