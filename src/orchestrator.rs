//! End-to-end run flow: snapshot → transfer per destination → prune.
//!
//! Volumes run under a bounded worker pool, destinations under a second
//! bounded pool inside each volume. One ssh session per (host, user, key)
//! is shared by every destination worker targeting that host. The only
//! shared mutable state is the journal (append-only) and the diagnostic
//! cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;
use rand::Rng;

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::config::{Config, SnapshotSource, TargetConfig, VolumeConfig};
use crate::endpoint::{Endpoint, EndpointOptions, EndpointUrl};
use crate::journal::{Action, Journal, Record, Status, Subject};
use crate::lock::{LockGuard, OpKind, volume_lock_name};
use crate::pipeline::{
    self, DEFAULT_DRAIN_WINDOW, DEFAULT_SPACE_MARGIN, OutcomeStatus, StreamShaping,
    TransferOutcome, TransferRequest,
};
use crate::planner::{self, Plan};
use crate::retention::{self, Policy};
use crate::transport::{SessionTable, is_root};

const DIAGNOSTIC_TTL: Duration = Duration::from_secs(300);

/// Retry decision for a failed transfer: transient outages and lock
/// contention go through backoff (the contended lock may belong to a
/// process that is gone by the next attempt, when acquire breaks it);
/// everything classified permanent aborts the target.
fn should_retry(error: &crate::pipeline::TransferError) -> bool {
    !matches!(error.transience(), crate::error::Transience::Permanent)
}

/// Exponential backoff for transient failures (initial 3 s, cap 30 s).
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_secs(3),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-based; attempt 1 has no delay).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(16);
        let base = self.initial.saturating_mul(1u32 << exp);
        base.min(self.cap)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        if base.is_zero() {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..500))
    }
}

/// Memoised pre-flight probes, keyed by (host, path), with a TTL so one
/// run never repeats an elevation prompt for the same destination.
#[derive(Debug, Default)]
pub struct DiagnosticCache {
    inner: Mutex<HashMap<(String, PathBuf), (Instant, Result<(), String>)>>,
}

impl DiagnosticCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        &self,
        host: &str,
        path: &PathBuf,
        probe: impl FnOnce() -> Result<(), String>,
    ) -> Result<(), String> {
        let key = (host.to_string(), path.clone());
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, result)) = cache.get(&key)
            && at.elapsed() < DIAGNOSTIC_TTL
        {
            return result.clone();
        }
        let result = probe();
        cache.insert(key, (Instant::now(), result.clone()));
        result
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Restrict the run to these volume paths.
    pub volumes: Vec<PathBuf>,
    /// Skip space prechecks.
    pub force: bool,
    /// Take snapshots and plan, but skip transfers and prunes.
    pub snapshot_only: bool,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub volumes: Vec<VolumeReport>,
}

impl RunReport {
    pub fn failed(&self) -> bool {
        self.volumes.iter().any(|v| v.failed())
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() { 1 } else { 0 }
    }
}

#[derive(Debug)]
pub struct VolumeReport {
    pub volume: PathBuf,
    pub snapshot: Option<String>,
    pub transfers: Vec<TransferReport>,
    pub pruned_source: usize,
    pub pruned_destinations: usize,
    pub error: Option<String>,
}

impl VolumeReport {
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.transfers.iter().any(|t| t.failed())
    }
}

#[derive(Debug)]
pub struct TransferReport {
    pub destination: String,
    pub status: Option<OutcomeStatus>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl TransferReport {
    pub fn failed(&self) -> bool {
        matches!(self.status, Some(OutcomeStatus::Failed) | None)
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    journal: Arc<Journal>,
    sessions: Arc<SessionTable>,
    diagnostics: DiagnosticCache,
    retry: RetryPolicy,
    cancel: CancelToken,
}

/// Default transaction log location when the config does not set one.
pub fn default_transaction_log() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("snapsync")
        .join("transactions.log")
}

impl Orchestrator {
    pub fn new(config: Config, journal: Journal, cancel: CancelToken) -> Self {
        Self {
            config: Arc::new(config),
            journal: Arc::new(journal),
            sessions: Arc::new(SessionTable::new()),
            diagnostics: DiagnosticCache::new(),
            retry: RetryPolicy::default(),
            cancel,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run every enabled volume with bounded parallelism.
    pub fn run(&self, options: &RunOptions) -> RunReport {
        let volumes: Vec<&VolumeConfig> = self
            .config
            .enabled_volumes()
            .filter(|v| options.volumes.is_empty() || options.volumes.contains(&v.path))
            .collect();
        let reports = Mutex::new(Vec::with_capacity(volumes.len()));

        let workers = self.config.parallel_volumes.min(volumes.len().max(1));
        let (tx, rx) = crossbeam::channel::unbounded::<&VolumeConfig>();
        for &volume in &volumes {
            let _ = tx.send(volume);
        }
        drop(tx);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while let Ok(volume) = rx.recv() {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        let report = self.run_volume(volume, options);
                        reports
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(report);
                    }
                });
            }
        });

        let mut volumes = reports.into_inner().unwrap_or_else(|e| e.into_inner());
        volumes.sort_by(|a, b| a.volume.cmp(&b.volume));
        RunReport { volumes }
    }

    /// Retention-only pass over every enabled volume (no snapshot, no
    /// transfers). Used by the `prune` entry point.
    pub fn prune(&self, options: &RunOptions) -> RunReport {
        let mut volumes = Vec::new();
        for volume in self.config.enabled_volumes() {
            if !options.volumes.is_empty() && !options.volumes.contains(&volume.path) {
                continue;
            }
            let snapshot_dir = volume.snapshot_dir_for(&self.config);
            let source = Endpoint::local(
                snapshot_dir.clone(),
                EndpointOptions {
                    elevate: !is_root(),
                    ..EndpointOptions::default()
                },
            );
            let mut report = VolumeReport {
                volume: volume.path.clone(),
                snapshot: None,
                transfers: Vec::new(),
                pruned_source: 0,
                pruned_destinations: 0,
                error: None,
            };
            match LockGuard::acquire(
                &snapshot_dir,
                &volume_lock_name(),
                OpKind::Volume,
                uuid::Uuid::new_v4(),
            ) {
                Ok(lock) => {
                    let (src, dst) = self.run_prune(volume, &source, &snapshot_dir);
                    report.pruned_source = src;
                    report.pruned_destinations = dst;
                    let _ = lock.release();
                }
                Err(err) => report.error = Some(format!("volume lock: {err}")),
            }
            volumes.push(report);
        }
        RunReport { volumes }
    }

    fn run_volume(&self, volume: &VolumeConfig, options: &RunOptions) -> VolumeReport {
        let mut report = VolumeReport {
            volume: volume.path.clone(),
            snapshot: None,
            transfers: Vec::new(),
            pruned_source: 0,
            pruned_destinations: 0,
            error: None,
        };
        let span = tracing::info_span!("volume", path = %volume.path.display());
        let _enter = span.enter();

        let snapshot_dir = volume.snapshot_dir_for(&self.config);
        let prefix = volume.prefix();
        let format = self.config.timestamp_format.clone();
        let source = Endpoint::local(
            snapshot_dir.clone(),
            EndpointOptions {
                elevate: !is_root(),
                ..EndpointOptions::default()
            },
        );
        if let Err(err) = source.ensure_directory(&snapshot_dir) {
            report.error = Some(format!("snapshot directory: {err}"));
            return report;
        }

        // Strict ordering inside one volume: snapshot, then transfers, then
        // prune, under the per-volume lock.
        let lock = match LockGuard::acquire(
            &snapshot_dir,
            &volume_lock_name(),
            OpKind::Volume,
            uuid::Uuid::new_v4(),
        ) {
            Ok(lock) => lock,
            Err(err) => {
                report.error = Some(format!("volume lock: {err}"));
                return report;
            }
        };

        if let Some(native) = source.native() {
            match native.is_subvolume(&volume.path) {
                Ok(true) => {}
                Ok(false) => {
                    report.error =
                        Some(format!("{} is not a btrfs subvolume", volume.path.display()));
                    let _ = lock.release();
                    return report;
                }
                Err(err) => {
                    tracing::warn!("subvolume precheck inconclusive: {err}");
                }
            }
        }

        let catalog = Catalog::new(&source, prefix.clone(), format.clone());
        let correlation = uuid::Uuid::new_v4();
        let subject = Subject::volume(volume.path.display().to_string());
        if volume.source == SnapshotSource::ForeignSnapshotManager {
            // A foreign snapshot manager takes the snapshots; we only
            // replicate and prune what it leaves under the snapshot dir.
            tracing::info!("foreign-managed volume, skipping snapshot creation");
        } else {
            match catalog.create(&volume.path, Local::now().naive_local()) {
                Ok(snapshot) => {
                    let _ = self.journal.append(Record::new(
                        Action::Snapshot,
                        Status::Completed,
                        subject.clone(),
                        correlation,
                    ));
                    report.snapshot = Some(snapshot.name);
                }
                Err(err) => {
                    let _ = self.journal.append(
                        Record::new(Action::Snapshot, Status::Failed, subject, correlation)
                            .error("snapshot", err.to_string()),
                    );
                    report.error = Some(format!("snapshot: {err}"));
                    let _ = lock.release();
                    return report;
                }
            }
        }

        if !options.snapshot_only {
            report.transfers = self.run_transfers(volume, &source, &snapshot_dir, options);
            let (src_pruned, dst_pruned) = self.run_prune(volume, &source, &snapshot_dir);
            report.pruned_source = src_pruned;
            report.pruned_destinations = dst_pruned;
        }

        if let Err(err) = lock.release() {
            tracing::warn!("volume lock release: {err}");
        }
        report
    }

    fn run_transfers(
        &self,
        volume: &VolumeConfig,
        source: &Endpoint,
        snapshot_dir: &PathBuf,
        options: &RunOptions,
    ) -> Vec<TransferReport> {
        let targets: Vec<&TargetConfig> = volume.targets.iter().collect();
        if targets.is_empty() {
            return Vec::new();
        }
        let reports = Mutex::new(Vec::with_capacity(targets.len()));
        let workers = self.config.parallel_targets.min(targets.len());
        let (tx, rx) = crossbeam::channel::unbounded::<&TargetConfig>();
        for &target in &targets {
            let _ = tx.send(target);
        }
        drop(tx);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while let Ok(target) = rx.recv() {
                        let report =
                            self.run_one_target(volume, source, snapshot_dir, target, options);
                        reports
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(report);
                    }
                });
            }
        });

        let mut out = reports.into_inner().unwrap_or_else(|e| e.into_inner());
        out.sort_by(|a, b| a.destination.cmp(&b.destination));
        out
    }

    fn run_one_target(
        &self,
        volume: &VolumeConfig,
        source: &Endpoint,
        snapshot_dir: &PathBuf,
        target: &TargetConfig,
        options: &RunOptions,
    ) -> TransferReport {
        let mut report = TransferReport {
            destination: target.path.clone(),
            status: None,
            attempts: 0,
            error: None,
        };
        let url = match EndpointUrl::parse(&target.path) {
            Ok(url) => url,
            Err(err) => {
                report.error = Some(err.to_string());
                return report;
            }
        };
        report.destination = url.id();
        let dest = match Endpoint::connect(
            &url,
            target,
            EndpointOptions {
                elevate: if url.is_remote() { target.ssh_sudo } else { !is_root() },
                ..EndpointOptions::default()
            },
            &self.sessions,
        ) {
            Ok(dest) => dest,
            Err(err) => {
                report.error = Some(err.to_string());
                return report;
            }
        };

        // One cached pre-flight per (host, path) per run.
        let host = url.ssh().map(|l| l.host.clone()).unwrap_or_else(|| "localhost".into());
        let ready = self.diagnostics.check(&host, url.path(), || {
            dest.ensure_directory(dest.base_dir()).map_err(|e| e.to_string())?;
            if !dest.is_raw() {
                dest.require_btrfs(dest.base_dir()).map_err(|e| e.to_string())?;
            }
            if target.require_mount {
                dest.require_mounted(dest.base_dir()).map_err(|e| e.to_string())?;
            }
            Ok(())
        });
        if let Err(detail) = ready {
            report.error = Some(detail);
            return report;
        }

        let format = self.config.timestamp_format.clone();
        let prefix = volume.prefix();
        for attempt in 1..=self.retry.max_attempts {
            report.attempts = attempt;
            if self.cancel.is_cancelled() {
                report.error = Some("cancelled".to_string());
                return report;
            }
            let delay = self.retry.jittered_delay(attempt);
            if !delay.is_zero() {
                tracing::info!(attempt, ?delay, "retrying after backoff");
                std::thread::sleep(delay);
            }

            // Re-plan on every attempt; the world may have moved.
            let outcome = self.plan_and_run(volume, source, snapshot_dir, target, &dest, &url, &prefix, &format, options);
            match outcome {
                Ok(None) => {
                    report.status = Some(OutcomeStatus::Completed);
                    report.error = None;
                    tracing::info!(dest = %url.id(), "destination up to date");
                    return report;
                }
                Ok(Some(outcome)) if outcome.succeeded() => {
                    report.status = Some(outcome.status);
                    report.error = None;
                    return report;
                }
                Ok(Some(outcome)) => {
                    let error = outcome.error.expect("failed outcome carries error");
                    let retry = should_retry(&error);
                    report.status = Some(OutcomeStatus::Failed);
                    report.error = Some(error.to_string());
                    if !retry {
                        return report;
                    }
                    tracing::info!(
                        dest = %url.id(),
                        kind = error.kind.as_str(),
                        "failure may clear, will retry"
                    );
                }
                Err(detail) => {
                    report.error = Some(detail);
                    return report;
                }
            }
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_and_run(
        &self,
        volume: &VolumeConfig,
        source: &Endpoint,
        snapshot_dir: &PathBuf,
        target: &TargetConfig,
        dest: &Endpoint,
        url: &EndpointUrl,
        prefix: &str,
        format: &crate::core::TimestampFormat,
        options: &RunOptions,
    ) -> Result<Option<TransferOutcome>, String> {
        let source_snapshots = source
            .list_snapshots(prefix, format)
            .map_err(|e| format!("source listing: {e}"))?;
        let dest_snapshots = dest
            .list_snapshots(prefix, format)
            .map_err(|e| format!("destination listing: {e}"))?;
        let plan = planner::plan(&source_snapshots, &dest_snapshots, self.config.incremental);
        let Plan::Send { snapshot, parent } = plan else {
            return Ok(None);
        };
        tracing::info!(
            snapshot = %snapshot.name,
            parent = parent.as_ref().map(|p| p.name.as_str()).unwrap_or("none"),
            dest = %url.id(),
            "transfer planned"
        );
        let request = TransferRequest {
            source,
            dest,
            snapshot,
            parent,
            shaping: StreamShaping {
                compress: target.compress,
                encrypt: target.encrypt,
                gpg_recipient: target.gpg_recipient.clone(),
                rate_limit: target.rate_limit.map(|r| r.0),
            },
            lock_dir: snapshot_dir,
            dest_id: url.id(),
            volume: volume.path.display().to_string(),
            require_mount: false, // checked once via the diagnostic cache
            force: options.force,
            space_margin: DEFAULT_SPACE_MARGIN,
            drain_window: DEFAULT_DRAIN_WINDOW,
        };
        Ok(Some(pipeline::run(&request, &self.journal, &self.cancel)))
    }

    fn run_prune(
        &self,
        volume: &VolumeConfig,
        source: &Endpoint,
        snapshot_dir: &PathBuf,
    ) -> (usize, usize) {
        let policy = Policy::from(self.config.effective_retention(volume));
        let format = self.config.timestamp_format.clone();
        let prefix = volume.prefix();
        let now = Local::now().naive_local();
        let subject = Subject::volume(volume.path.display().to_string());
        let correlation = uuid::Uuid::new_v4();

        let mut pruned_dest = 0;
        for target in &volume.targets {
            pruned_dest += self.prune_destination(volume, target, &prefix, &format, &policy, now, snapshot_dir);
        }

        let pruned_source = match source.list_snapshots(&prefix, &format) {
            Ok(snapshots) => {
                let evaluation = retention::evaluate(&snapshots, now, &policy, true);
                tracing::info!(
                    keep = evaluation.keep.len(),
                    prune = evaluation.prune.len(),
                    "source retention evaluated"
                );
                let catalog = Catalog::new(source, prefix.clone(), format.clone());
                let result = catalog.destroy(&evaluation.prune, snapshot_dir);
                result.destroyed.len()
            }
            Err(err) => {
                tracing::error!("source retention listing failed: {err}");
                0
            }
        };
        let _ = self.journal.append(
            Record::new(Action::Prune, Status::Completed, subject, correlation)
                .bytes((pruned_source + pruned_dest) as u64),
        );
        (pruned_source, pruned_dest)
    }

    #[allow(clippy::too_many_arguments)]
    fn prune_destination(
        &self,
        volume: &VolumeConfig,
        target: &TargetConfig,
        prefix: &str,
        format: &crate::core::TimestampFormat,
        policy: &Policy,
        now: chrono::NaiveDateTime,
        snapshot_dir: &PathBuf,
    ) -> usize {
        let Ok(url) = EndpointUrl::parse(&target.path) else {
            return 0;
        };
        let dest = Endpoint::connect(
            &url,
            target,
            EndpointOptions {
                elevate: if url.is_remote() { target.ssh_sudo } else { !is_root() },
                ..EndpointOptions::default()
            },
            &self.sessions,
        );
        let Ok(dest) = dest else {
            return 0;
        };
        match dest.list_snapshots(prefix, format) {
            Ok(snapshots) => {
                // Chain protection is mandatory on destinations: evicting
                // an ancestor would break future incremental transfers.
                let evaluation = retention::evaluate(&snapshots, now, policy, true);
                let catalog = Catalog::new(&dest, prefix.to_string(), format.clone());
                let result = catalog.destroy(&evaluation.prune, snapshot_dir);
                let _ = self.journal.append(
                    Record::new(
                        Action::Prune,
                        if result.all_ok() { Status::Completed } else { Status::Partial },
                        Subject::target(volume.path.display().to_string(), url.id()),
                        uuid::Uuid::new_v4(),
                    )
                    .bytes(result.destroyed.len() as u64),
                );
                result.destroyed.len()
            }
            Err(err) => {
                tracing::error!(dest = %url.id(), "destination retention listing failed: {err}");
                0
            }
        }
    }
}
