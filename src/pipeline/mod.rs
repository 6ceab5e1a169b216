//! Transfer pipeline: send → (compress) → (encrypt) → (throttle) → receive.
//!
//! One pipeline run is one-shot: it either moves one snapshot to one
//! destination or fails with a classified error; retries belong to the
//! orchestrator. The session walks `Planned → Locked → Prechecked →
//! Streaming → Verified → Released`, and a failure from any state runs
//! cleanup exactly once.

mod rate;
mod shaping;
mod space;
mod stage;

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::{Compression, Encryption};
use crate::core::Snapshot;
use crate::endpoint::{Endpoint, EndpointError, RawMeta};
use crate::error::Transience;
use crate::journal::{Action, Journal, Record, Status, Subject};
use crate::lock::{LockError, LockGuard, OpKind, transfer_lock_name};
use crate::transport::TransportErrorKind;

pub use rate::{TokenBucket, copy_stream};
pub use shaping::{compress_argv, decompress_argv, decrypt_argv, encrypt_argv, find_in_path};
pub use space::{DEFAULT_SPACE_MARGIN, estimate_stream_bytes, required_bytes};
pub use stage::{DEFAULT_DRAIN_WINDOW, Stage, StagePool, StageResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferErrorKind {
    NetworkTransient,
    AuthUnavailable,
    InsufficientSpace,
    ParentMissing,
    CorruptStream,
    RemoteBinaryMissing,
    CompressorUnavailable,
    LockHeld,
    Cancelled,
    Precondition,
}

impl TransferErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkTransient => "network_transient",
            Self::AuthUnavailable => "auth_unavailable",
            Self::InsufficientSpace => "insufficient_space",
            Self::ParentMissing => "parent_missing",
            Self::CorruptStream => "corrupt_stream",
            Self::RemoteBinaryMissing => "remote_binary_missing",
            Self::CompressorUnavailable => "compressor_unavailable",
            Self::LockHeld => "lock_held",
            Self::Cancelled => "cancelled",
            Self::Precondition => "precondition",
        }
    }

    /// Whether the failure is transient contention or outage.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::NetworkTransient)
    }
}

impl TransferError {
    /// Retry classification for the orchestrator's backoff.
    ///
    /// A held lock is `Unknown`, not permanent: the holder may be mid-crash,
    /// and the next acquire breaks the lock once its owner is gone.
    pub fn transience(&self) -> Transience {
        match self.kind {
            TransferErrorKind::NetworkTransient => Transience::Retryable,
            TransferErrorKind::LockHeld => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }
}

#[derive(Clone, Debug, Error)]
#[error("{kind}: {detail}", kind = .kind.as_str())]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub detail: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<EndpointError> for TransferError {
    fn from(err: EndpointError) -> Self {
        let kind = match &err {
            EndpointError::Transport(t) => match t.kind {
                TransportErrorKind::Unreachable => TransferErrorKind::NetworkTransient,
                TransportErrorKind::AuthRejected | TransportErrorKind::AuthUnavailable => {
                    TransferErrorKind::AuthUnavailable
                }
                TransportErrorKind::RemoteBinaryMissing => TransferErrorKind::RemoteBinaryMissing,
                TransportErrorKind::Protocol => TransferErrorKind::NetworkTransient,
            },
            EndpointError::NotMounted { .. }
            | EndpointError::NotBtrfs { .. }
            | EndpointError::Unsupported { .. } => TransferErrorKind::Precondition,
            _ => TransferErrorKind::Precondition,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<LockError> for TransferError {
    fn from(err: LockError) -> Self {
        let kind = match &err {
            LockError::Held { .. } => TransferErrorKind::LockHeld,
            _ => TransferErrorKind::Precondition,
        };
        Self::new(kind, err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Planned,
    Locked,
    Prechecked,
    Streaming,
    Verified,
    Released,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Locked => "locked",
            Self::Prechecked => "prechecked",
            Self::Streaming => "streaming",
            Self::Verified => "verified",
            Self::Released => "released",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    /// Succeeded, but not as planned (parent-missing downgrade).
    Partial,
    Failed,
}

#[derive(Clone, Debug)]
pub struct TransferOutcome {
    pub status: OutcomeStatus,
    pub bytes: u64,
    pub duration: Duration,
    pub downgraded: bool,
    pub error: Option<TransferError>,
    pub correlation_id: Uuid,
}

impl TransferOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self.status, OutcomeStatus::Failed)
    }
}

#[derive(Clone, Debug, Default)]
pub struct StreamShaping {
    pub compress: Compression,
    pub encrypt: Encryption,
    pub gpg_recipient: Option<String>,
    pub rate_limit: Option<u64>,
}

/// Everything one pipeline run needs. The planner decides snapshot and
/// parent; the orchestrator supplies endpoints and policy knobs.
pub struct TransferRequest<'a> {
    pub source: &'a Endpoint,
    pub dest: &'a Endpoint,
    pub snapshot: Snapshot,
    pub parent: Option<Snapshot>,
    pub shaping: StreamShaping,
    /// Where transfer locks live: the volume's snapshot directory.
    pub lock_dir: &'a Path,
    /// Stable destination identity for lock keys and journal subjects.
    pub dest_id: String,
    pub volume: String,
    pub require_mount: bool,
    pub force: bool,
    pub space_margin: f64,
    pub drain_window: Duration,
}

pub fn run(request: &TransferRequest<'_>, journal: &Journal, cancel: &CancelToken) -> TransferOutcome {
    Session::new(request, journal, cancel).run()
}

struct Session<'a> {
    request: &'a TransferRequest<'a>,
    journal: &'a Journal,
    cancel: &'a CancelToken,
    correlation_id: Uuid,
    state: SessionState,
    started: Instant,
    lock: Option<LockGuard>,
    downgraded: bool,
    bytes: u64,
    streamed: bool,
}

struct StreamStats {
    bytes: u64,
    sha256: String,
}

impl<'a> Session<'a> {
    fn new(request: &'a TransferRequest<'a>, journal: &'a Journal, cancel: &'a CancelToken) -> Self {
        Self {
            request,
            journal,
            cancel,
            correlation_id: Uuid::new_v4(),
            state: SessionState::Planned,
            started: Instant::now(),
            lock: None,
            downgraded: false,
            bytes: 0,
            streamed: false,
        }
    }

    fn subject(&self) -> Subject {
        Subject::target(self.request.volume.clone(), self.request.dest_id.clone())
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            snapshot = %self.request.snapshot.name,
            from = self.state.as_str(),
            to = next.as_str(),
            "transfer state"
        );
        self.state = next;
    }

    fn run(mut self) -> TransferOutcome {
        let _ = self.journal.append(Record::new(
            Action::Transfer,
            Status::Started,
            self.subject(),
            self.correlation_id,
        ));
        let result = self.execute();
        let duration = self.started.elapsed();
        match result {
            Ok(()) => {
                let status = if self.downgraded {
                    OutcomeStatus::Partial
                } else {
                    OutcomeStatus::Completed
                };
                let mut record = Record::new(
                    Action::Transfer,
                    if self.downgraded { Status::Partial } else { Status::Completed },
                    self.subject(),
                    self.correlation_id,
                )
                .bytes(self.bytes)
                .duration_ms(duration.as_millis() as u64);
                if self.downgraded {
                    record = record.error(
                        "parent_missing",
                        "parent absent at destination; sent full stream",
                    );
                }
                let _ = self.journal.append(record);
                TransferOutcome {
                    status,
                    bytes: self.bytes,
                    duration,
                    downgraded: self.downgraded,
                    error: None,
                    correlation_id: self.correlation_id,
                }
            }
            Err(error) => {
                // Cleanup runs exactly once, from whatever state failed.
                self.cleanup_partial();
                let _ = self.journal.append(
                    Record::new(
                        Action::Transfer,
                        Status::Failed,
                        self.subject(),
                        self.correlation_id,
                    )
                    .duration_ms(duration.as_millis() as u64)
                    .error(error.kind.as_str(), error.detail.clone())
                    .phase(self.state.as_str()),
                );
                tracing::error!(
                    snapshot = %self.request.snapshot.name,
                    dest = %self.request.dest_id,
                    phase = self.state.as_str(),
                    "transfer failed: {error}"
                );
                TransferOutcome {
                    status: OutcomeStatus::Failed,
                    bytes: self.bytes,
                    duration,
                    downgraded: self.downgraded,
                    error: Some(error),
                    correlation_id: self.correlation_id,
                }
            }
        }
    }

    fn execute(&mut self) -> Result<(), TransferError> {
        let request = self.request;

        self.check_cancelled()?;
        self.lock = Some(LockGuard::acquire(
            request.lock_dir,
            &transfer_lock_name(&request.dest_id, &request.snapshot.name),
            OpKind::Transfer,
            self.correlation_id,
        )?);
        self.transition(SessionState::Locked);

        self.precheck()?;
        self.transition(SessionState::Prechecked);

        // Chain match: an incremental plan survives only if the destination
        // still holds the parent under its replication id.
        let parent = self.elect_parent()?;

        self.check_cancelled()?;
        self.transition(SessionState::Streaming);
        self.streamed = true;
        let stats = self.stream(parent.as_ref())?;
        self.bytes = stats.bytes;

        self.verify(&stats)?;
        self.transition(SessionState::Verified);
        let _ = self.journal.append(Record::new(
            Action::Verify,
            Status::Completed,
            self.subject(),
            self.correlation_id,
        ));

        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        self.transition(SessionState::Released);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            Err(TransferError::new(
                TransferErrorKind::Cancelled,
                "cancellation requested",
            ))
        } else {
            Ok(())
        }
    }

    fn precheck(&mut self) -> Result<(), TransferError> {
        let request = self.request;
        let dest_dir = request.dest.base_dir().to_path_buf();

        request.dest.ensure_directory(&dest_dir)?;
        if !request.dest.is_raw() {
            request.dest.require_btrfs(&dest_dir)?;
        }
        if request.require_mount {
            request.dest.require_mounted(&dest_dir)?;
        }

        if request.force {
            tracing::debug!("space precheck skipped (--force)");
            return Ok(());
        }
        let estimate = estimate_stream_bytes(
            request.source,
            &request.snapshot,
            request.parent.as_ref(),
            self.cancel,
        )?;
        let free = request.dest.free_bytes(&dest_dir)?;
        let required = required_bytes(estimate, request.space_margin);
        if free.effective() < required {
            return Err(TransferError::new(
                TransferErrorKind::InsufficientSpace,
                format!(
                    "destination has {} free but {} is required (estimate {} plus margin)",
                    free.effective(),
                    required,
                    estimate
                ),
            ));
        }
        tracing::debug!(estimate, required, free = free.effective(), "space precheck ok");
        Ok(())
    }

    fn elect_parent(&mut self) -> Result<Option<Snapshot>, TransferError> {
        let request = self.request;
        let Some(parent) = &request.parent else {
            return Ok(None);
        };
        let Some(parent_id) = parent.replication_id() else {
            self.downgrade("parent has no replication id");
            return Ok(None);
        };
        match request.dest.holds_replication_id(parent_id) {
            Ok(true) => Ok(Some(parent.clone())),
            Ok(false) => {
                self.downgrade("parent not present at destination");
                Ok(None)
            }
            Err(err) => {
                self.downgrade(&format!("destination listing failed ({err})"));
                Ok(None)
            }
        }
    }

    fn downgrade(&mut self, reason: &str) {
        tracing::warn!(
            snapshot = %self.request.snapshot.name,
            dest = %self.request.dest_id,
            "downgrading to full stream: {reason}"
        );
        self.downgraded = true;
    }

    fn stream(&mut self, parent: Option<&Snapshot>) -> Result<StreamStats, TransferError> {
        let request = self.request;
        let mut pool = StagePool::new();

        // Originating chain: send, then local filters.
        let send_child = request
            .source
            .open_send_stream(&request.snapshot, parent, false)?;
        let mut head = Stage::new("send", send_child);
        let mut upstream = head.child.stdout.take().ok_or_else(|| {
            TransferError::new(TransferErrorKind::CorruptStream, "send stage has no stdout")
        })?;
        pool.push(head);

        for (name, argv) in self.originating_filters()? {
            let mut cmd = std::process::Command::new(&argv[0]);
            cmd.args(&argv[1..])
                .stdin(Stdio::from(upstream))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let mut child = cmd.spawn().map_err(|e| {
                TransferError::new(
                    TransferErrorKind::CompressorUnavailable,
                    format!("failed to spawn {name}: {e}"),
                )
            })?;
            upstream = child.stdout.take().ok_or_else(|| {
                TransferError::new(
                    TransferErrorKind::CorruptStream,
                    format!("{name} stage has no stdout"),
                )
            })?;
            pool.push(Stage::new(name, child));
        }

        // Sink side.
        let (sink_name, mut sink_child, raw_file): (&'static str, _, Option<String>) =
            if let Some(raw) = request.dest.raw() {
                let meta = self.raw_meta_template();
                let file_name = meta.data_file_name(&request.snapshot.name);
                let child = raw.open_write_stream(&file_name)?;
                ("raw-write", child, Some(file_name))
            } else {
                let child = self.open_native_sink()?;
                ("receive", child, None)
            };
        let sink_stdin = sink_child.stdin.take().ok_or_else(|| {
            TransferError::new(TransferErrorKind::CorruptStream, "sink stage has no stdin")
        })?;
        pool.push(Stage::new(sink_name, sink_child));

        // The copier counts, digests, throttles, and watches cancellation.
        let mut hasher = Sha256::new();
        let copied = copy_stream(
            upstream,
            sink_stdin,
            request.shaping.rate_limit,
            self.cancel,
            |chunk| hasher.update(chunk),
        );

        let results = match &copied {
            Ok(_) => pool.settle(request.drain_window),
            Err(_) => pool.abort(request.drain_window),
        };
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                return Err(TransferError::new(
                    TransferErrorKind::Cancelled,
                    "transfer cancelled mid-stream",
                ));
            }
            Err(err) => {
                // The copy broke because a stage died; classify from the
                // stages if possible, else report the pipe error.
                if let Some(stage_error) = classify_stage_results(&results) {
                    return Err(stage_error);
                }
                return Err(TransferError::new(
                    TransferErrorKind::CorruptStream,
                    format!("pipeline byte copy failed: {err}"),
                ));
            }
        };
        if let Some(stage_error) = classify_stage_results(&results) {
            return Err(stage_error);
        }

        let stats = StreamStats {
            bytes,
            sha256: format!("{:x}", hasher.finalize()),
        };

        // Raw sinks persist their sidecar as part of the streaming step so
        // verification can read it back.
        if let (Some(raw), Some(_)) = (request.dest.raw(), raw_file) {
            let mut meta = self.raw_meta_template();
            meta.bytes = stats.bytes;
            meta.sha256 = stats.sha256.clone();
            raw.write_sidecar(&request.snapshot.name, &meta)?;
        }
        Ok(stats)
    }

    /// Local filter stages between send and transport, in order.
    fn originating_filters(&self) -> Result<Vec<(&'static str, Vec<String>)>, TransferError> {
        let request = self.request;
        let mut filters = Vec::new();
        if request.source.is_raw() {
            // Restore direction: reverse the stored shaping locally.
            let meta = request
                .source
                .raw()
                .map(|r| r.read_sidecar(&request.snapshot.name))
                .transpose()?;
            if let Some(meta) = meta {
                if let Some(argv) = decrypt_argv(meta.encryption) {
                    filters.push(("decrypt", argv));
                }
                if let Some(argv) = decompress_argv(meta.compression) {
                    filters.push(("decompress", argv));
                }
            }
        } else {
            if let Some(argv) = compress_argv(request.shaping.compress) {
                filters.push(("compress", argv));
            }
            if request.dest.is_raw()
                && let Some(argv) =
                    encrypt_argv(request.shaping.encrypt, request.shaping.gpg_recipient.as_deref())
            {
                filters.push(("encrypt", argv));
            }
        }
        for (name, argv) in &filters {
            if find_in_path(&argv[0]).is_none() {
                return Err(TransferError::new(
                    TransferErrorKind::CompressorUnavailable,
                    format!("{name} tool {:?} not found in PATH", argv[0]),
                ));
            }
        }
        Ok(filters)
    }

    /// Native receive child; a compressed stream is undone on the
    /// destination side before `btrfs receive` sees it.
    fn open_native_sink(&self) -> Result<std::process::Child, TransferError> {
        let request = self.request;
        let dest_dir = request.dest.base_dir();
        if request.source.raw().is_some() || request.shaping.compress == Compression::None {
            return Ok(request.dest.open_receive_stream(dest_dir)?);
        }
        let decompress = decompress_argv(request.shaping.compress).unwrap_or_default();
        let native = request.dest.native().ok_or_else(|| {
            TransferError::new(TransferErrorKind::Precondition, "native sink expected")
        })?;
        let receive = crate::transport::sh_join(&[
            "btrfs".to_string(),
            "receive".to_string(),
            "-q".to_string(),
            dest_dir.display().to_string(),
        ]);
        let filter = crate::transport::sh_join(&decompress);
        let script = format!("{filter} | {receive}");
        let spec = crate::transport::CommandSpec::new(["sh".to_string(), "-c".to_string(), script])
            .elevated(false);
        let mut cmd = native.transport().command(&spec).map_err(EndpointError::from)?;
        cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());
        cmd.spawn().map_err(|e| {
            TransferError::new(
                TransferErrorKind::Precondition,
                format!("failed to spawn receive pipeline: {e}"),
            )
        })
    }

    fn raw_meta_template(&self) -> RawMeta {
        let request = self.request;
        let snapshot = &request.snapshot;
        RawMeta {
            uuid: snapshot.uuid.unwrap_or_else(Uuid::new_v4),
            received_uuid: snapshot.replication_id(),
            parent_uuid: if self.downgraded {
                None
            } else {
                request.parent.as_ref().and_then(|p| p.replication_id())
            },
            compression: request.shaping.compress,
            encryption: request.shaping.encrypt,
            bytes: 0,
            sha256: String::new(),
            created_at: Utc::now(),
        }
    }

    fn verify(&self, stats: &StreamStats) -> Result<(), TransferError> {
        let request = self.request;
        if let Some(raw) = request.dest.raw() {
            let meta = raw.read_sidecar(&request.snapshot.name)?;
            let stored = raw.file_size(&meta.data_file_name(&request.snapshot.name))?;
            if stored != stats.bytes {
                return Err(TransferError::new(
                    TransferErrorKind::CorruptStream,
                    format!(
                        "stored file is {stored} bytes but {} were sent",
                        stats.bytes
                    ),
                ));
            }
            return Ok(());
        }
        let expected = request.snapshot.replication_id();
        let received_path = request.dest.base_dir().join(&request.snapshot.name);
        let info = request.dest.subvolume_show(&received_path)?;
        if info.received_uuid.is_none() || info.received_uuid != expected {
            return Err(TransferError::new(
                TransferErrorKind::CorruptStream,
                format!(
                    "post-receive received_uuid {:?} does not match source {:?}",
                    info.received_uuid, expected
                ),
            ));
        }
        Ok(())
    }

    /// A failed receive leaves a partial subvolume (or file); delete it,
    /// best-effort, with a diagnostic.
    fn cleanup_partial(&mut self) {
        if !self.streamed {
            return;
        }
        let request = self.request;
        let result = if let Some(raw) = request.dest.raw() {
            raw.remove_stream(&request.snapshot.name)
        } else {
            match request.dest.native() {
                Some(native) => {
                    native.destroy_path(&request.dest.base_dir().join(&request.snapshot.name))
                }
                None => Ok(()),
            }
        };
        if let Err(err) = result {
            tracing::warn!(
                snapshot = %self.request.snapshot.name,
                "could not remove partial receive: {err}"
            );
        }
    }
}

/// Map failing stages to a transfer error, worst first.
pub fn classify_stage_results(results: &[StageResult]) -> Option<TransferError> {
    let failed: Vec<&StageResult> = results.iter().filter(|r| r.failed()).collect();
    let first = failed.first()?;
    let stderr = failed
        .iter()
        .map(|r| format!("[{}] {}", r.name, r.stderr))
        .collect::<Vec<_>>()
        .join("; ");
    let lower = stderr.to_ascii_lowercase();
    let kind = if lower.contains("cannot find parent subvolume")
        || lower.contains("unable to find parent")
    {
        TransferErrorKind::ParentMissing
    } else if lower.contains("no space left") {
        TransferErrorKind::InsufficientSpace
    } else if first.exit_code() == Some(255)
        || lower.contains("connection reset")
        || lower.contains("connection closed")
        || lower.contains("broken pipe")
        || lower.contains("connection timed out")
    {
        TransferErrorKind::NetworkTransient
    } else if lower.contains("command not found") {
        TransferErrorKind::RemoteBinaryMissing
    } else {
        TransferErrorKind::CorruptStream
    };
    Some(TransferError::new(kind, stderr))
}
