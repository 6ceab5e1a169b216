//! Endpoint abstraction: a place where snapshots live or are going.
//!
//! A tagged variant over local, remote (ssh), and raw-file locations. The
//! capability set is uniform; per-variant free functions do the work and
//! cross-endpoint logic stays in the pipeline.

mod btrfs;
mod native;
mod raw;
pub mod url;

use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;

use thiserror::Error;

use crate::config::TargetConfig;
use crate::core::{Snapshot, SubvolumeInfo, TimestampFormat};
use crate::transport::{SessionTable, SshConfig, Transport, TransportError};

pub use btrfs::{fs_type_for, is_btrfs, is_mount_point};
pub use native::NativeEndpoint;
pub use raw::{RawEndpoint, RawMeta, SIDECAR_EXT};
pub use url::{EndpointUrl, SshLocation, UrlError};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("cannot enumerate snapshots under {path}: {detail}")]
    Enumeration { path: PathBuf, detail: String },
    #[error("{path} is not a mount point and require_mount is set")]
    NotMounted { path: PathBuf },
    #[error("{path} is not on a btrfs filesystem")]
    NotBtrfs { path: PathBuf },
    #[error("{program} failed with status {status:?}: {stderr}")]
    CommandFailed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("operation {op} is not supported by endpoint {endpoint}")]
    Unsupported { op: &'static str, endpoint: String },
    #[error("{detail}")]
    Parse { detail: String },
}

/// Behavioural flags shared by all variants.
#[derive(Clone, Debug, Default)]
pub struct EndpointOptions {
    /// Run filesystem commands through sudo at the endpoint's side.
    pub elevate: bool,
    /// Flip read-only off before deleting (some setups require it).
    pub convert_rw: bool,
    /// `btrfs subvolume sync` after deletions.
    pub subvolume_sync: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeBytes {
    pub filesystem_free: u64,
    pub quota_free: Option<u64>,
}

impl FreeBytes {
    /// The binding limit for the space precheck.
    pub fn effective(&self) -> u64 {
        match self.quota_free {
            Some(quota) => quota.min(self.filesystem_free),
            None => self.filesystem_free,
        }
    }
}

#[derive(Debug)]
pub enum Endpoint {
    Local(NativeEndpoint),
    Remote(NativeEndpoint),
    Raw(RawEndpoint),
}

impl Endpoint {
    /// Build an endpoint for a configured target.
    pub fn connect(
        url: &EndpointUrl,
        target: &TargetConfig,
        options: EndpointOptions,
        sessions: &SessionTable,
    ) -> Result<Self, EndpointError> {
        let base_dir = url.path().clone();
        match url {
            EndpointUrl::Local { .. } => Ok(Self::Local(NativeEndpoint::new(
                Transport::local(),
                base_dir,
                options,
            ))),
            EndpointUrl::Raw { .. } => Ok(Self::Raw(RawEndpoint::new(
                Transport::local(),
                base_dir,
                options,
            ))),
            EndpointUrl::Ssh(location) | EndpointUrl::RawSsh(location) => {
                let mut location = location.clone();
                if location.port.is_none() {
                    location.port = target.ssh_port;
                }
                let mut config = SshConfig::new(location);
                config.identity = target.ssh_key.clone();
                config.password_auth = target.ssh_password_auth;
                config.elevate = target.ssh_sudo;
                let session = sessions.get_or_create(config);
                let transport = Transport::Ssh(session);
                if url.is_raw() {
                    Ok(Self::Raw(RawEndpoint::new(transport, base_dir, options)))
                } else {
                    Ok(Self::Remote(NativeEndpoint::new(transport, base_dir, options)))
                }
            }
        }
    }

    /// A local native endpoint rooted at `base_dir` (source side, restore
    /// destinations).
    pub fn local(base_dir: PathBuf, options: EndpointOptions) -> Self {
        Self::Local(NativeEndpoint::new(Transport::local(), base_dir, options))
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    pub fn is_remote(&self) -> bool {
        match self {
            Self::Local(_) => false,
            Self::Remote(_) => true,
            Self::Raw(raw) => raw.transport().is_remote(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        match self {
            Self::Local(n) | Self::Remote(n) => n.base_dir(),
            Self::Raw(r) => r.base_dir(),
        }
    }

    pub fn describe(&self) -> String {
        let transport = match self {
            Self::Local(n) | Self::Remote(n) => n.transport(),
            Self::Raw(r) => r.transport(),
        };
        match self {
            Self::Raw(_) => format!("raw:{}:{}", transport.describe(), self.base_dir().display()),
            _ => format!("{}:{}", transport.describe(), self.base_dir().display()),
        }
    }

    pub fn list_snapshots(
        &self,
        prefix: &str,
        format: &TimestampFormat,
    ) -> Result<Vec<Snapshot>, EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.list_snapshots(prefix, format),
            Self::Raw(r) => r.list_snapshots(prefix, format),
        }
    }

    pub fn create_snapshot(
        &self,
        volume: &Path,
        name: &str,
        format: &TimestampFormat,
        prefix: &str,
    ) -> Result<Snapshot, EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.create_snapshot(volume, name, format, prefix),
            Self::Raw(_) => Err(EndpointError::Unsupported {
                op: "create_snapshot",
                endpoint: self.describe(),
            }),
        }
    }

    pub fn destroy_snapshot(&self, snapshot: &Snapshot) -> Result<(), EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.destroy_path(&snapshot.path),
            Self::Raw(r) => r.remove_stream(&snapshot.name),
        }
    }

    /// Open the replication byte source for a snapshot.
    ///
    /// Native endpoints run `btrfs send`; raw endpoints stream the stored
    /// file (the caller reverses compression/encryption locally using the
    /// sidecar, available via `raw()`).
    pub fn open_send_stream(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        no_data: bool,
    ) -> Result<Child, EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => {
                n.open_send_stream(&snapshot.path, parent.map(|p| p.path.as_path()), no_data)
            }
            Self::Raw(r) => r.open_read_stream(&snapshot.name).map(|(child, _)| child),
        }
    }

    /// Open the byte sink. Native: `btrfs receive` into `dest_dir`. Raw
    /// endpoints write a data file named by the pipeline instead.
    pub fn open_receive_stream(&self, dest_dir: &Path) -> Result<Child, EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.open_receive_stream(dest_dir),
            Self::Raw(_) => Err(EndpointError::Unsupported {
                op: "open_receive_stream",
                endpoint: self.describe(),
            }),
        }
    }

    pub fn subvolume_show(&self, path: &Path) -> Result<SubvolumeInfo, EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.subvolume_show(path),
            Self::Raw(r) => {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| EndpointError::Parse {
                        detail: format!("no file name in {}", path.display()),
                    })?;
                r.stream_info(name)
            }
        }
    }

    pub fn free_bytes(&self, path: &Path) -> Result<FreeBytes, EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.free_bytes(path),
            Self::Raw(r) => {
                // Raw stores plain files; plain df is the honest answer.
                let endpoint = NativeEndpoint::new(
                    r.transport().clone(),
                    r.base_dir().to_path_buf(),
                    EndpointOptions::default(),
                );
                let free = endpoint.free_bytes(path)?;
                Ok(FreeBytes {
                    filesystem_free: free.filesystem_free,
                    quota_free: None,
                })
            }
        }
    }

    pub fn ensure_directory(&self, path: &Path) -> Result<(), EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.ensure_directory(path),
            Self::Raw(r) => r.ensure_directory(path),
        }
    }

    pub fn require_mounted(&self, path: &Path) -> Result<(), EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.require_mounted(path),
            Self::Raw(r) => {
                let endpoint = NativeEndpoint::new(
                    r.transport().clone(),
                    r.base_dir().to_path_buf(),
                    EndpointOptions::default(),
                );
                endpoint.require_mounted(path)
            }
        }
    }

    pub fn require_btrfs(&self, path: &Path) -> Result<(), EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.require_btrfs(path),
            Self::Raw(_) => Ok(()),
        }
    }

    /// Whether this endpoint holds a snapshot whose received identity is
    /// `id` (the chain-match probe before an incremental transfer).
    pub fn holds_replication_id(&self, id: uuid::Uuid) -> Result<bool, EndpointError> {
        match self {
            Self::Local(n) | Self::Remote(n) => n.holds_replication_id(id),
            Self::Raw(r) => r.holds_replication_id(id),
        }
    }

    pub fn native(&self) -> Option<&NativeEndpoint> {
        match self {
            Self::Local(n) | Self::Remote(n) => Some(n),
            Self::Raw(_) => None,
        }
    }

    pub fn raw(&self) -> Option<&RawEndpoint> {
        match self {
            Self::Raw(r) => Some(r),
            _ => None,
        }
    }
}

/// Keep sessions alive as long as any endpoint borrows them.
pub type SharedEndpoint = Arc<Endpoint>;
