//! Typed configuration schema.
//!
//! The loader hands the core fully validated data: URL schemes, retention
//! counts, durations, and rate limits are checked eagerly at load time so
//! nothing downstream has to re-validate.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::TimestampFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Default snapshot directory, absolute or relative to each volume.
    pub snapshot_dir: String,
    pub timestamp_format: TimestampFormat,
    /// Prefer incremental transfers against a common ancestor.
    pub incremental: bool,
    pub parallel_volumes: usize,
    pub parallel_targets: usize,
    pub log_file: Option<PathBuf>,
    /// Append-only transaction journal. Defaults to the state directory.
    pub transaction_log: Option<PathBuf>,
    pub retention: RetentionConfig,
    /// Consumed by the external notification sink; carried opaquely.
    pub notifications: Option<toml::Value>,
    #[serde(rename = "volume")]
    pub volumes: Vec<VolumeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot_dir: ".snapshots".to_string(),
            timestamp_format: TimestampFormat::default(),
            incremental: true,
            parallel_volumes: 2,
            parallel_targets: 3,
            log_file: None,
            transaction_log: None,
            retention: RetentionConfig::default(),
            notifications: None,
            volumes: Vec::new(),
        }
    }
}

impl Config {
    pub fn enabled_volumes(&self) -> impl Iterator<Item = &VolumeConfig> {
        self.volumes.iter().filter(|v| v.enabled)
    }

    /// Volume retention overrides global.
    pub fn effective_retention<'a>(&'a self, volume: &'a VolumeConfig) -> &'a RetentionConfig {
        volume.retention.as_ref().unwrap_or(&self.retention)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    /// Path to the subvolume to snapshot.
    pub path: PathBuf,
    /// Snapshot name prefix; derived from the path when omitted
    /// (`/var/log` → `var-log-`).
    #[serde(default)]
    pub snapshot_prefix: Option<String>,
    #[serde(default)]
    pub snapshot_dir: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
    #[serde(default)]
    pub source: SnapshotSource,
    #[serde(rename = "target", default)]
    pub targets: Vec<TargetConfig>,
}

impl VolumeConfig {
    pub fn prefix(&self) -> String {
        match &self.snapshot_prefix {
            Some(p) => p.clone(),
            None => {
                let stem: String = self
                    .path
                    .to_string_lossy()
                    .trim_matches('/')
                    .replace('/', "-");
                if stem.is_empty() {
                    "root-".to_string()
                } else {
                    format!("{stem}-")
                }
            }
        }
    }

    /// Snapshot directory resolved against the volume path.
    pub fn snapshot_dir_for(&self, global: &Config) -> PathBuf {
        let dir = self.snapshot_dir.as_ref().unwrap_or(&global.snapshot_dir);
        let dir = PathBuf::from(dir);
        if dir.is_absolute() {
            dir
        } else {
            self.path.join(dir)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotSource {
    #[default]
    Native,
    /// Snapshots are taken by a foreign snapshot manager; we only replicate.
    ForeignSnapshotManager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// `ssh://user@host:/dir`, `raw://…`, or a local absolute path.
    pub path: String,
    #[serde(default)]
    pub ssh_sudo: bool,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub ssh_password_auth: bool,
    #[serde(default)]
    pub compress: Compression,
    /// Bytes per second, with K/M/G suffixes in the document.
    #[serde(default)]
    pub rate_limit: Option<ScaledBytes>,
    /// Refuse to receive when the destination is not a mount point.
    #[serde(default)]
    pub require_mount: bool,
    #[serde(default)]
    pub encrypt: Encryption,
    #[serde(default)]
    pub gpg_recipient: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Pigz,
    Zstd,
    Lz4,
    Lzop,
    Bzip2,
    Xz,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    None,
    Gpg,
    Openssl,
}

/// Retention policy in document form. `min` is a duration like `30m`, `2h`,
/// `1d`, `2w`; bucket counts are snapshots to keep per interval class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub min: DurationSpec,
    pub hourly: u32,
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min: DurationSpec(Duration::from_secs(24 * 3600)),
            hourly: 24,
            daily: 7,
            weekly: 4,
            monthly: 12,
            yearly: 0,
        }
    }
}

/// Duration parsed from `N[mhdw]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DurationSpec(pub Duration);

impl TryFrom<String> for DurationSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_duration(&value).map(DurationSpec)
    }
}

impl From<DurationSpec> for String {
    fn from(value: DurationSpec) -> Self {
        render_duration(value.0)
    }
}

/// Byte count parsed from a scaled integer with K/M/G suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScaledBytes(pub u64);

impl TryFrom<String> for ScaledBytes {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_scaled_bytes(&value).map(ScaledBytes)
    }
}

impl From<ScaledBytes> for String {
    fn from(value: ScaledBytes) -> Self {
        value.0.to_string()
    }
}

pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    let Some(unit) = input.chars().last() else {
        return Err("empty duration, expected N[mhdw]".to_string());
    };
    let digits = &input[..input.len() - unit.len_utf8()];
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {input:?}, expected N[mhdw]"))?;
    let secs = match unit {
        'm' => n * 60,
        'h' => n * 3600,
        'd' => n * 86_400,
        'w' => n * 7 * 86_400,
        _ => return Err(format!("invalid duration unit in {input:?}, expected m, h, d or w")),
    };
    Ok(Duration::from_secs(secs))
}

fn render_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        "0".to_string()
    } else if secs % (7 * 86_400) == 0 {
        format!("{}w", secs / (7 * 86_400))
    } else if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}m", secs / 60)
    }
}

pub fn parse_scaled_bytes(input: &str) -> Result<u64, String> {
    let input = input.trim();
    let (digits, scale) = match input.chars().last() {
        Some('K' | 'k') => (&input[..input.len() - 1], 1024u64),
        Some('M' | 'm') => (&input[..input.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&input[..input.len() - 1], 1024 * 1024 * 1024),
        _ => (input, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid scaled integer {input:?}, expected N[KMG]"))?;
    n.checked_mul(scale)
        .ok_or_else(|| format!("scaled integer {input:?} overflows"))
}

fn default_true() -> bool {
    true
}
