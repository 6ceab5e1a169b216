//! Native endpoint: a btrfs filesystem reachable locally or over ssh.
//!
//! All operations go through the transport, so the local and remote
//! variants share one implementation. Cross-endpoint logic (piping a send
//! into a receive) lives in the pipeline, never here.

use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};

use crate::core::{Snapshot, SubvolumeInfo, TimestampFormat, naming};
use crate::transport::{CommandSpec, Transport};

use super::btrfs;
use super::{EndpointError, EndpointOptions, FreeBytes};

#[derive(Debug)]
pub struct NativeEndpoint {
    transport: Transport,
    base_dir: PathBuf,
    options: EndpointOptions,
}

impl NativeEndpoint {
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

    /// Run to completion; nonzero exit becomes `CommandFailed`.
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

    pub fn list_snapshots(
        &self,
        prefix: &str,
        format: &TimestampFormat,
    ) -> Result<Vec<Snapshot>, EndpointError> {
        let stdout = self
            .run(btrfs::list_argv(&self.base_dir))
            .map_err(|e| EndpointError::Enumeration {
                path: self.base_dir.clone(),
                detail: e.to_string(),
            })?;
        let stdout = String::from_utf8_lossy(&stdout);
        let mut snapshots = Vec::new();
        for row in btrfs::parse_list(&stdout) {
            let Some(name) = row.file_name() else {
                continue;
            };
            let Some(timestamp) = naming::parse_snapshot_name(name, prefix, format) else {
                tracing::debug!(name, "ignoring name outside the snapshot format");
                continue;
            };
            snapshots.push(Snapshot {
                name: name.to_string(),
                path: self.base_dir.join(name),
                timestamp,
                uuid: row.uuid,
                received_uuid: row.received_uuid,
                parent_uuid: row.parent_uuid,
            });
        }
        snapshots.sort();
        Ok(snapshots)
    }

    /// Take a read-only snapshot of `volume` at `base_dir/name`.
    ///
    /// btrfs makes the operation atomic; on a failed exit we double-check
    /// that nothing half-made is left behind.
    pub fn create_snapshot(
        &self,
        volume: &Path,
        name: &str,
        format: &TimestampFormat,
        prefix: &str,
    ) -> Result<Snapshot, EndpointError> {
        let dest = self.base_dir.join(name);
        let result = self.run(btrfs::snapshot_argv(volume, &dest, true));
        if let Err(err) = result {
            if self.subvolume_show(&dest).is_ok() {
                let _ = self.destroy_path(&dest);
            }
            return Err(err);
        }
        let info = self.subvolume_show(&dest)?;
        let timestamp = naming::parse_snapshot_name(name, prefix, format).ok_or_else(|| {
            EndpointError::Parse {
                detail: format!("created snapshot name {name:?} does not match the format"),
            }
        })?;
        Ok(Snapshot {
            name: name.to_string(),
            path: dest,
            timestamp,
            uuid: Some(info.uuid),
            received_uuid: info.received_uuid,
            parent_uuid: info.parent_uuid,
        })
    }

    /// Delete the subvolume at `path`; idempotent on "already gone".
    pub fn destroy_path(&self, path: &Path) -> Result<(), EndpointError> {
        if self.options.convert_rw {
            // Ignore failures here; deletion itself will surface the truth.
            let _ = self.run(btrfs::make_writable_argv(path));
        }
        match self.run(btrfs::delete_argv(path)) {
            Ok(_) => {}
            Err(EndpointError::CommandFailed { stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                tracing::debug!(path = %path.display(), "destroy: already gone");
            }
            Err(err) => return Err(err),
        }
        if self.options.subvolume_sync {
            self.run(btrfs::subvolume_sync_argv(&self.base_dir))?;
        }
        Ok(())
    }

    /// `btrfs send` as a running child; stdout is the stream.
    pub fn open_send_stream(
        &self,
        snapshot: &Path,
        parent: Option<&Path>,
        no_data: bool,
    ) -> Result<Child, EndpointError> {
        let argv = btrfs::send_argv(snapshot, parent, no_data);
        let mut cmd = self.transport.command(&self.spec(argv))?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn().map_err(|source| EndpointError::Io {
            path: snapshot.to_path_buf(),
            source,
        })
    }

    /// `btrfs receive` as a running child; stdin is the sink.
    pub fn open_receive_stream(&self, dest_dir: &Path) -> Result<Child, EndpointError> {
        let argv = btrfs::receive_argv(dest_dir);
        let mut cmd = self.transport.command(&self.spec(argv))?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.spawn().map_err(|source| EndpointError::Io {
            path: dest_dir.to_path_buf(),
            source,
        })
    }

    /// Whether any direct-child subvolume carries `id` as received_uuid.
    pub fn holds_replication_id(&self, id: uuid::Uuid) -> Result<bool, EndpointError> {
        let stdout = self.run(btrfs::list_argv(&self.base_dir))?;
        let stdout = String::from_utf8_lossy(&stdout);
        Ok(btrfs::parse_list(&stdout)
            .iter()
            .any(|row| row.received_uuid == Some(id)))
    }

    pub fn subvolume_show(&self, path: &Path) -> Result<SubvolumeInfo, EndpointError> {
        let stdout = self.run(btrfs::show_argv(path))?;
        btrfs::parse_show(&String::from_utf8_lossy(&stdout)).ok_or_else(|| EndpointError::Parse {
            detail: format!("unparseable `subvolume show` output for {}", path.display()),
        })
    }

    pub fn free_bytes(&self, path: &Path) -> Result<FreeBytes, EndpointError> {
        let stdout = self.run(btrfs::df_avail_argv(path))?;
        let filesystem_free = btrfs::parse_df_avail(&String::from_utf8_lossy(&stdout))
            .ok_or_else(|| EndpointError::Parse {
                detail: format!("unparseable df output for {}", path.display()),
            })?;
        // Quota headroom is best-effort: quotas off or qgroup errors mean None.
        let quota_free = self
            .run(btrfs::qgroup_argv(path))
            .ok()
            .and_then(|out| btrfs::parse_qgroup_free(&String::from_utf8_lossy(&out)));
        Ok(FreeBytes {
            filesystem_free,
            quota_free,
        })
    }

    pub fn ensure_directory(&self, path: &Path) -> Result<(), EndpointError> {
        self.run(btrfs::mkdir_argv(path)).map(|_| ())
    }

    fn read_mounts(&self) -> Result<String, EndpointError> {
        let stdout = self.run(vec!["cat".to_string(), "/proc/mounts".to_string()])?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    pub fn require_mounted(&self, path: &Path) -> Result<(), EndpointError> {
        let mounts = self.read_mounts()?;
        if btrfs::is_mount_point(&mounts, path) {
            Ok(())
        } else {
            Err(EndpointError::NotMounted {
                path: path.to_path_buf(),
            })
        }
    }

    pub fn require_btrfs(&self, path: &Path) -> Result<(), EndpointError> {
        let mounts = self.read_mounts()?;
        if btrfs::is_btrfs(&mounts, path) {
            Ok(())
        } else {
            Err(EndpointError::NotBtrfs {
                path: path.to_path_buf(),
            })
        }
    }

    pub fn is_btrfs(&self, path: &Path) -> Result<bool, EndpointError> {
        Ok(btrfs::is_btrfs(&self.read_mounts()?, path))
    }

    /// Source precondition: the configured path must be a subvolume, not a
    /// plain directory on btrfs.
    pub fn is_subvolume(&self, path: &Path) -> Result<bool, EndpointError> {
        if !self.is_btrfs(path)? {
            return Ok(false);
        }
        Ok(self.subvolume_show(path).is_ok())
    }
}
