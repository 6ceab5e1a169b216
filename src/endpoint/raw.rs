//! Raw-file endpoint: streams stored as opaque files plus `.meta` sidecars.
//!
//! Raw destinations accept any filesystem (the stream is never
//! materialised), at the cost of incremental-after-restore integration. The
//! sidecar is mandatory; a data file without one is invisible to restore
//! and retention.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Compression, Encryption};
use crate::core::{Snapshot, SubvolumeInfo, TimestampFormat, naming};
use crate::transport::{CommandSpec, Transport};

use super::{EndpointError, EndpointOptions};

pub const SIDECAR_EXT: &str = "meta";

/// Sidecar contents, one JSON document per stored stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMeta {
    pub uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<Uuid>,
    pub compression: Compression,
    pub encryption: Encryption,
    pub bytes: u64,
    /// Hex digest of the stored file as written (post compression and
    /// encryption), re-checked before restore.
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

impl RawMeta {
    /// File name of the data file this sidecar describes.
    pub fn data_file_name(&self, snapshot_name: &str) -> String {
        let mut name = format!("{snapshot_name}.btrfs");
        match self.compression {
            Compression::None => {}
            Compression::Gzip | Compression::Pigz => name.push_str(".gz"),
            Compression::Zstd => name.push_str(".zst"),
            Compression::Lz4 => name.push_str(".lz4"),
            Compression::Lzop => name.push_str(".lzo"),
            Compression::Bzip2 => name.push_str(".bz2"),
            Compression::Xz => name.push_str(".xz"),
        }
        match self.encryption {
            Encryption::None => {}
            Encryption::Gpg => name.push_str(".gpg"),
            Encryption::Openssl => name.push_str(".enc"),
        }
        name
    }
}

#[derive(Debug)]
pub struct RawEndpoint {
    transport: Transport,
    base_dir: PathBuf,
    options: EndpointOptions,
}

impl RawEndpoint {
    pub fn new(transport: Transport, base_dir: PathBuf, options: EndpointOptions) -> Self {
        Self {
            transport,
            base_dir,
            options,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn spec(&self, argv: Vec<String>) -> CommandSpec {
        CommandSpec::new(argv).elevated(self.options.elevate)
    }

    fn run(&self, argv: Vec<String>) -> Result<Vec<u8>, EndpointError> {
        let program = argv.first().cloned().unwrap_or_default();
        let output = self.transport.output(&self.spec(argv))?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(EndpointError::CommandFailed {
                program,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn list_sidecar_names(&self) -> Result<Vec<String>, EndpointError> {
        if self.transport.is_remote() {
            let stdout = self.run(vec![
                "ls".to_string(),
                "-1A".to_string(),
                self.base_dir.display().to_string(),
            ])?;
            Ok(String::from_utf8_lossy(&stdout)
                .lines()
                .filter(|n| n.ends_with(&format!(".{SIDECAR_EXT}")))
                .map(|n| n.to_string())
                .collect())
        } else {
            let entries = fs::read_dir(&self.base_dir).map_err(|e| EndpointError::Enumeration {
                path: self.base_dir.clone(),
                detail: e.to_string(),
            })?;
            let mut out = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| EndpointError::Enumeration {
                    path: self.base_dir.clone(),
                    detail: e.to_string(),
                })?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(&format!(".{SIDECAR_EXT}")) {
                    out.push(name);
                }
            }
            Ok(out)
        }
    }

    pub fn read_sidecar(&self, snapshot_name: &str) -> Result<RawMeta, EndpointError> {
        let path = self.sidecar_path(snapshot_name);
        let bytes = if self.transport.is_remote() {
            self.run(vec!["cat".to_string(), path.display().to_string()])?
        } else {
            fs::read(&path).map_err(|source| EndpointError::Io {
                path: path.clone(),
                source,
            })?
        };
        serde_json::from_slice(&bytes).map_err(|e| EndpointError::Parse {
            detail: format!("sidecar {} is invalid: {e}", path.display()),
        })
    }

    pub fn write_sidecar(&self, snapshot_name: &str, meta: &RawMeta) -> Result<(), EndpointError> {
        let path = self.sidecar_path(snapshot_name);
        let bytes = serde_json::to_vec_pretty(meta).map_err(|e| EndpointError::Parse {
            detail: format!("sidecar encode: {e}"),
        })?;
        if self.transport.is_remote() {
            let argv = vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "cat > {p} && sync {p}",
                    p = crate::transport::sh_quote(&path.display().to_string())
                ),
            ];
            let mut cmd = self.transport.command(&self.spec(argv))?;
            cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());
            let mut child = cmd.spawn().map_err(|source| EndpointError::Io {
                path: path.clone(),
                source,
            })?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&bytes).map_err(|source| EndpointError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            let status = child.wait().map_err(|source| EndpointError::Io {
                path: path.clone(),
                source,
            })?;
            if !status.success() {
                return Err(EndpointError::CommandFailed {
                    program: "sh".to_string(),
                    status: status.code(),
                    stderr: format!("writing sidecar {}", path.display()),
                });
            }
            Ok(())
        } else {
            let mut file = fs::File::create(&path).map_err(|source| EndpointError::Io {
                path: path.clone(),
                source,
            })?;
            file.write_all(&bytes)
                .and_then(|_| file.sync_all())
                .map_err(|source| EndpointError::Io {
                    path: path.clone(),
                    source,
                })
        }
    }

    pub fn sidecar_path(&self, snapshot_name: &str) -> PathBuf {
        self.base_dir.join(format!("{snapshot_name}.{SIDECAR_EXT}"))
    }

    pub fn data_path(&self, snapshot_name: &str, meta: &RawMeta) -> PathBuf {
        self.base_dir.join(meta.data_file_name(snapshot_name))
    }

    /// Enumerate stored streams via their sidecars.
    pub fn list_snapshots(
        &self,
        prefix: &str,
        format: &TimestampFormat,
    ) -> Result<Vec<Snapshot>, EndpointError> {
        let mut snapshots = Vec::new();
        for sidecar in self.list_sidecar_names()? {
            let Some(name) = sidecar.strip_suffix(&format!(".{SIDECAR_EXT}")) else {
                continue;
            };
            let Some(timestamp) = naming::parse_snapshot_name(name, prefix, format) else {
                tracing::debug!(name, "ignoring raw file outside the snapshot format");
                continue;
            };
            let meta = match self.read_sidecar(name) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!(name, "skipping stream with broken sidecar: {err}");
                    continue;
                }
            };
            snapshots.push(Snapshot {
                name: name.to_string(),
                path: self.data_path(name, &meta),
                timestamp,
                uuid: Some(meta.uuid),
                received_uuid: meta.received_uuid.or(Some(meta.uuid)),
                parent_uuid: meta.parent_uuid,
            });
        }
        snapshots.sort();
        Ok(snapshots)
    }

    /// Whether any stored stream carries `id` as its received identity.
    pub fn holds_replication_id(&self, id: Uuid) -> Result<bool, EndpointError> {
        for sidecar in self.list_sidecar_names()? {
            let Some(name) = sidecar.strip_suffix(&format!(".{SIDECAR_EXT}")) else {
                continue;
            };
            if let Ok(meta) = self.read_sidecar(name)
                && meta.received_uuid.or(Some(meta.uuid)) == Some(id)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stored-stream info from the sidecar, mirroring `subvolume_show`.
    pub fn stream_info(&self, snapshot_name: &str) -> Result<SubvolumeInfo, EndpointError> {
        let meta = self.read_sidecar(snapshot_name)?;
        Ok(SubvolumeInfo {
            uuid: meta.uuid,
            received_uuid: meta.received_uuid.or(Some(meta.uuid)),
            parent_uuid: meta.parent_uuid,
            readonly: true,
        })
    }

    /// Open the stored stream for reading (restore direction). The caller
    /// chains decompression/decryption locally.
    pub fn open_read_stream(&self, snapshot_name: &str) -> Result<(Child, RawMeta), EndpointError> {
        let meta = self.read_sidecar(snapshot_name)?;
        let path = self.data_path(snapshot_name, &meta);
        let argv = vec!["cat".to_string(), path.display().to_string()];
        let mut cmd = self.transport.command(&self.spec(argv))?;
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|source| EndpointError::Io { path, source })?;
        Ok((child, meta))
    }

    /// Open a writer child for a new stream file. The sidecar is written by
    /// the pipeline after the byte count and digest are known.
    pub fn open_write_stream(&self, file_name: &str) -> Result<Child, EndpointError> {
        let path = self.base_dir.join(file_name);
        let quoted = crate::transport::sh_quote(&path.display().to_string());
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {quoted} && sync {quoted}"),
        ];
        let mut cmd = self.transport.command(&self.spec(argv))?;
        cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());
        cmd.spawn().map_err(|source| EndpointError::Io { path, source })
    }

    /// Size of a stored file, for post-transfer verification.
    pub fn file_size(&self, file_name: &str) -> Result<u64, EndpointError> {
        let path = self.base_dir.join(file_name);
        if self.transport.is_remote() {
            let stdout = self.run(vec![
                "stat".to_string(),
                "-c".to_string(),
                "%s".to_string(),
                path.display().to_string(),
            ])?;
            String::from_utf8_lossy(&stdout)
                .trim()
                .parse()
                .map_err(|_| EndpointError::Parse {
                    detail: format!("unparseable stat output for {}", path.display()),
                })
        } else {
            Ok(fs::metadata(&path)
                .map_err(|source| EndpointError::Io {
                    path: path.clone(),
                    source,
                })?
                .len())
        }
    }

    pub fn remove_stream(&self, snapshot_name: &str) -> Result<(), EndpointError> {
        let meta = match self.read_sidecar(snapshot_name) {
            Ok(meta) => Some(meta),
            Err(EndpointError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                None
            }
            Err(_) => None,
        };
        let mut paths = vec![self.sidecar_path(snapshot_name)];
        if let Some(meta) = meta {
            paths.push(self.data_path(snapshot_name, &meta));
        }
        for path in paths {
            if self.transport.is_remote() {
                let _ = self.run(vec![
                    "rm".to_string(),
                    "-f".to_string(),
                    path.display().to_string(),
                ]);
            } else {
                match fs::remove_file(&path) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(EndpointError::Io { path, source }),
                }
            }
        }
        Ok(())
    }

    pub fn ensure_directory(&self, path: &Path) -> Result<(), EndpointError> {
        if self.transport.is_remote() {
            self.run(super::btrfs::mkdir_argv(path)).map(|_| ())
        } else {
            fs::create_dir_all(path).map_err(|source| EndpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(compression: Compression, encryption: Encryption) -> RawMeta {
        RawMeta {
            uuid: Uuid::from_bytes([1; 16]),
            received_uuid: None,
            parent_uuid: None,
            compression,
            encryption,
            bytes: 42,
            sha256: "00".repeat(32),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn data_file_names_follow_shaping() {
        let name = "home-20260101-000000";
        assert_eq!(
            meta(Compression::None, Encryption::None).data_file_name(name),
            "home-20260101-000000.btrfs"
        );
        assert_eq!(
            meta(Compression::Zstd, Encryption::None).data_file_name(name),
            "home-20260101-000000.btrfs.zst"
        );
        assert_eq!(
            meta(Compression::Gzip, Encryption::Gpg).data_file_name(name),
            "home-20260101-000000.btrfs.gz.gpg"
        );
    }

    #[test]
    fn sidecar_round_trips_locally() {
        let dir = tempfile::TempDir::new().unwrap();
        let endpoint = RawEndpoint::new(
            Transport::local(),
            dir.path().to_path_buf(),
            EndpointOptions::default(),
        );
        let m = meta(Compression::Zstd, Encryption::None);
        endpoint.write_sidecar("home-20260101-000000", &m).unwrap();
        let read = endpoint.read_sidecar("home-20260101-000000").unwrap();
        assert_eq!(read, m);
    }

    #[test]
    fn listing_reads_sidecars() {
        let dir = tempfile::TempDir::new().unwrap();
        let endpoint = RawEndpoint::new(
            Transport::local(),
            dir.path().to_path_buf(),
            EndpointOptions::default(),
        );
        let mut a = meta(Compression::None, Encryption::None);
        a.uuid = Uuid::from_bytes([7; 16]);
        endpoint.write_sidecar("home-20260101-000000", &a).unwrap();
        let mut b = meta(Compression::None, Encryption::None);
        b.uuid = Uuid::from_bytes([8; 16]);
        b.parent_uuid = Some(a.uuid);
        endpoint.write_sidecar("home-20260101-010000", &b).unwrap();
        // Foreign and sidecar-less files are invisible.
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("home-20260101-020000.btrfs"), b"x").unwrap();

        let format = TimestampFormat::default();
        let snapshots = endpoint.list_snapshots("home-", &format).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "home-20260101-000000");
        assert_eq!(snapshots[0].received_uuid, Some(a.uuid));
        assert_eq!(snapshots[1].parent_uuid, Some(a.uuid));
    }

    #[test]
    fn remove_stream_deletes_both_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let endpoint = RawEndpoint::new(
            Transport::local(),
            dir.path().to_path_buf(),
            EndpointOptions::default(),
        );
        let m = meta(Compression::None, Encryption::None);
        endpoint.write_sidecar("home-20260101-000000", &m).unwrap();
        fs::write(endpoint.data_path("home-20260101-000000", &m), b"stream").unwrap();

        endpoint.remove_stream("home-20260101-000000").unwrap();
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
