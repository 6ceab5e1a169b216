//! Append-only transaction journal.
//!
//! One self-contained JSON document per line, O_APPEND and fsync'd on every
//! record. The core never rotates this file. Readers tail it by seeking
//! backward in 64 KiB chunks.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const TAIL_CHUNK: u64 = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Snapshot,
    Transfer,
    Prune,
    Restore,
    Verify,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Started,
    Completed,
    Failed,
    Partial,
}

/// What the entry is about: a volume and, for per-target records, the
/// destination endpoint id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub volume: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl Subject {
    pub fn volume(volume: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            destination: None,
        }
    }

    pub fn target(volume: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            destination: Some(destination.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp_utc: DateTime<Utc>,
    /// Per-process monotonic sequence; ties on timestamp break by sequence.
    pub seq: u64,
    pub action: Action,
    pub status: Status,
    pub subject: Subject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub correlation_id: Uuid,
}

/// A draft entry; the journal stamps timestamp and sequence on append.
#[derive(Clone, Debug)]
pub struct Record {
    pub action: Action,
    pub status: Status,
    pub subject: Subject,
    pub bytes_transferred: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    pub phase: Option<String>,
    pub correlation_id: Uuid,
}

impl Record {
    pub fn new(action: Action, status: Status, subject: Subject, correlation_id: Uuid) -> Self {
        Self {
            action,
            status,
            subject,
            bytes_transferred: None,
            duration_ms: None,
            error_kind: None,
            error_detail: None,
            phase: None,
            correlation_id,
        }
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes_transferred = Some(bytes);
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn error(mut self, kind: impl Into<String>, detail: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self.error_detail = Some(detail.into());
        self
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("failed to open journal {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to append to journal: {0}")]
    Append(#[source] io::Error),
    #[error("failed to read journal {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Thread-safe appender. All writers in one process share the file handle
/// and the sequence counter, giving a total order within the process.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
    seq: AtomicU64,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| JournalError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| JournalError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            seq: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: Record) -> Result<Entry, JournalError> {
        let entry = Entry {
            timestamp_utc: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            action: record.action,
            status: record.status,
            subject: record.subject,
            bytes_transferred: record.bytes_transferred,
            duration_ms: record.duration_ms,
            error_kind: record.error_kind,
            error_detail: record.error_detail,
            phase: record.phase,
            correlation_id: record.correlation_id,
        };
        let mut line = serde_json::to_vec(&entry).map_err(|e| {
            JournalError::Append(io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&line).map_err(JournalError::Append)?;
        file.sync_data().map_err(JournalError::Append)?;
        Ok(entry)
    }
}

/// Read the last `n` entries without scanning the whole file.
///
/// Seeks backward in 64 KiB chunks splitting on newlines; unparseable lines
/// (truncated writes, operator edits) are skipped.
pub fn tail(path: &Path, n: usize) -> Result<Vec<Entry>, JournalError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(JournalError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let read_err = |source: io::Error| JournalError::Read {
        path: path.to_path_buf(),
        source,
    };

    let len = file.seek(SeekFrom::End(0)).map_err(&read_err)?;
    let mut buf: Vec<u8> = Vec::new();
    let mut pos = len;

    // Prepend chunks until the buffer holds more than n complete lines (the
    // first line may be a partial record and is discarded below).
    while pos > 0 {
        let chunk = TAIL_CHUNK.min(pos);
        pos -= chunk;
        file.seek(SeekFrom::Start(pos)).map_err(&read_err)?;
        let mut chunk_buf = vec![0u8; chunk as usize];
        file.read_exact(&mut chunk_buf).map_err(&read_err)?;
        chunk_buf.extend_from_slice(&buf);
        buf = chunk_buf;
        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        if newlines > n + 1 {
            break;
        }
    }

    let usable: &[u8] = if pos == 0 {
        &buf
    } else {
        match buf.iter().position(|&b| b == b'\n') {
            Some(idx) => &buf[idx + 1..],
            None => &[],
        }
    };
    let text = String::from_utf8_lossy(usable);
    let parsed: Vec<Entry> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    let start = parsed.len().saturating_sub(n);
    Ok(parsed[start..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(i: u64) -> Record {
        Record::new(
            Action::Transfer,
            Status::Completed,
            Subject::target("/home", "ssh://nas:/srv"),
            Uuid::from_bytes([9; 16]),
        )
        .bytes(i)
    }

    #[test]
    fn append_assigns_monotonic_sequence() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(&dir.path().join("tx.log")).unwrap();
        let a = journal.append(record(1)).unwrap();
        let b = journal.append(record(2)).unwrap();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn tail_returns_last_entries_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let journal = Journal::open(&path).unwrap();
        for i in 0..50 {
            journal.append(record(i)).unwrap();
        }
        let entries = tail(&path, 10).unwrap();
        assert_eq!(entries.len(), 10);
        let bytes: Vec<_> = entries
            .iter()
            .map(|e| e.bytes_transferred.unwrap())
            .collect();
        assert_eq!(bytes, (40..50).collect::<Vec<_>>());
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(tail(&dir.path().join("nope.log"), 5).unwrap().is_empty());
    }

    #[test]
    fn tail_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let journal = Journal::open(&path).unwrap();
        journal.append(record(1)).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"not json\n").unwrap();
        }
        journal.append(record(2)).unwrap();
        let entries = tail(&path, 10).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn tail_crosses_chunk_boundaries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let journal = Journal::open(&path).unwrap();
        // Enough entries to exceed a single 64 KiB chunk.
        for i in 0..600 {
            journal
                .append(record(i).error("none", "x".repeat(200)))
                .unwrap();
        }
        let entries = tail(&path, 250).unwrap();
        assert_eq!(entries.len(), 250);
        assert_eq!(entries.last().unwrap().bytes_transferred, Some(599));
        assert_eq!(entries.first().unwrap().bytes_transferred, Some(350));
    }
}
