//! File-based cross-process exclusion with crash detection.
//!
//! A lock is an O_EXCL-created file under the snapshot directory holding the
//! owner's identity. Staleness is judged by process liveness: a lock whose
//! owner pid is gone on the same host may be broken; a live owner or a
//! foreign host means the lock is genuinely held.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lock classes. Restores use a dedicated class so concurrent transfers do
/// not starve them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Transfer,
    Restore,
    Volume,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Transfer => "transfer",
            OpKind::Restore => "restore",
            OpKind::Volume => "volume",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub owner_pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub op_kind: OpKind,
    pub session_id: Uuid,
}

impl LockMeta {
    fn new(op_kind: OpKind, session_id: Uuid) -> Self {
        Self {
            owner_pid: std::process::id(),
            host: local_host(),
            started_at: Utc::now(),
            op_kind,
            session_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held by pid {owner_pid} on {host} since {started_at} ({op})", owner_pid = .meta.owner_pid, host = .meta.host, started_at = .meta.started_at, op = .meta.op_kind.as_str())]
    Held { path: PathBuf, meta: Box<LockMeta> },
    #[error("lock at {path:?} exists but its metadata is unreadable: {detail}")]
    Unreadable { path: PathBuf, detail: String },
    #[error("lock path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("io error on lock {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An acquired lock. Dropping releases it; `release` reports unlink errors.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    meta: LockMeta,
    released: bool,
}

impl LockGuard {
    /// Acquire the lock at `dir/name`. A stale lock (same host, dead owner)
    /// is broken with a warning and acquisition retried once.
    pub fn acquire(
        dir: &Path,
        name: &str,
        op_kind: OpKind,
        session_id: Uuid,
    ) -> Result<Self, LockError> {
        let path = dir.join(name);
        match Self::try_create(&path, op_kind, session_id) {
            Ok(guard) => Ok(guard),
            Err(LockError::Held { path, meta }) => {
                if meta.host == local_host() && !pid_alive(meta.owner_pid) {
                    tracing::warn!(
                        path = %path.display(),
                        pid = meta.owner_pid,
                        "breaking stale lock left by dead process"
                    );
                    fs::remove_file(&path).map_err(|source| LockError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    Self::try_create(&path, op_kind, session_id)
                } else {
                    Err(LockError::Held { path, meta })
                }
            }
            Err(err) => Err(err),
        }
    }

    fn try_create(path: &Path, op_kind: OpKind, session_id: Uuid) -> Result<Self, LockError> {
        reject_symlink(path)?;
        let meta = LockMeta::new(op_kind, session_id);
        let file = open_new(path);
        let mut file = match file {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let meta = read_meta(path)?;
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    meta: Box::new(meta),
                });
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::to_writer(&mut file, &meta).map_err(|e| LockError::Unreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        file.sync_all().map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            meta,
            released: false,
        })
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        if !self.released {
            fs::remove_file(&self.path).map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Lock file name for a transfer keyed on `(destination, snapshot name)`.
///
/// The destination collapses to a fixed-width digest so the snapshot name
/// can be recovered from the file name (retention skips locked snapshots).
pub fn transfer_lock_name(destination_id: &str, snapshot_name: &str) -> String {
    format!(
        ".snapsync.transfer.{}.{snapshot_name}.lock",
        short_digest(destination_id)
    )
}

/// Snapshot name embedded in a transfer lock file name, if any.
pub fn transfer_lock_snapshot(file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix(".snapsync.transfer.")?;
    let rest = rest.strip_suffix(".lock")?;
    let (digest, snapshot) = rest.split_once('.')?;
    if digest.len() == 8 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(snapshot)
    } else {
        None
    }
}

/// Snapshot names currently pinned by transfer locks under `dir`.
pub fn locked_snapshot_names(dir: &Path) -> std::collections::HashSet<String> {
    let mut out = std::collections::HashSet::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if let Some(snapshot) = transfer_lock_snapshot(&name.to_string_lossy()) {
            out.insert(snapshot.to_string());
        }
    }
    out
}

fn short_digest(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(input.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

pub fn restore_lock_name() -> String {
    ".snapsync.restore.lock".to_string()
}

pub fn volume_lock_name() -> String {
    ".snapsync.volume.lock".to_string()
}

/// Metadata for the maintenance surface ("list locks", "break named lock").
pub fn list_locks(dir: &Path) -> Result<Vec<(PathBuf, LockMeta)>, LockError> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(source) => {
            return Err(LockError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| LockError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(".snapsync.") || !name.ends_with(".lock") {
            continue;
        }
        let path = entry.path();
        match read_meta(&path) {
            Ok(meta) => out.push((path, meta)),
            Err(err) => tracing::warn!(path = %path.display(), "skipping unreadable lock: {err}"),
        }
    }
    Ok(out)
}

pub fn break_lock(path: &Path) -> Result<(), LockError> {
    fs::remove_file(path).map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_meta(path: &Path) -> Result<LockMeta, LockError> {
    reject_symlink(path)?;
    let bytes = fs::read(path).map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| LockError::Unreadable {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Liveness via /proc; this tool only targets Linux hosts.
pub fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

pub fn local_host() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string())
}

fn reject_symlink(path: &Path) -> Result<(), LockError> {
    if let Ok(meta) = fs::symlink_metadata(path)
        && meta.file_type().is_symlink()
    {
        return Err(LockError::Symlink {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn open_new(path: &Path) -> io::Result<fs::File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
    }
    #[cfg(not(unix))]
    {
        fs::OpenOptions::new().write(true).create_new(true).open(path)
    }
}
