//! Configuration loading and eager validation.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::endpoint::url::{EndpointUrl, UrlError};

use super::schema::{Config, TargetConfig};

pub const CONFIG_FILE_NAME: &str = "snapsync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found (looked for {CONFIG_FILE_NAME} in /etc and the user config dir)")]
    NotFound,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("volume {volume}: {detail}")]
    InvalidVolume { volume: PathBuf, detail: String },
    #[error("target {target}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: UrlError,
    },
}

/// Well-known config locations, most specific first.
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        out.push(dir.join("snapsync").join(CONFIG_FILE_NAME));
    }
    out.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));
    out
}

pub fn find_config_file() -> Option<PathBuf> {
    candidate_paths().into_iter().find(|p| p.is_file())
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    validate(&config)?;
    Ok(config)
}

pub fn load_default() -> Result<Config, ConfigError> {
    let path = find_config_file().ok_or(ConfigError::NotFound)?;
    load(&path)
}

/// Eager validation so the core only ever sees well-formed data.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    for volume in &config.volumes {
        if !volume.path.is_absolute() {
            return Err(ConfigError::InvalidVolume {
                volume: volume.path.clone(),
                detail: "volume path must be absolute".to_string(),
            });
        }
        if volume.targets.is_empty() && volume.enabled {
            tracing::warn!(volume = %volume.path.display(), "volume has no targets; snapshots will be local only");
        }
        for target in &volume.targets {
            parse_target_url(target).map_err(|source| ConfigError::InvalidTarget {
                target: target.path.clone(),
                source,
            })?;
            if target.gpg_recipient.is_some()
                && target.encrypt != super::schema::Encryption::Gpg
            {
                return Err(ConfigError::InvalidVolume {
                    volume: volume.path.clone(),
                    detail: format!(
                        "target {} sets gpg_recipient without encrypt = \"gpg\"",
                        target.path
                    ),
                });
            }
        }
    }
    if config.parallel_volumes == 0 || config.parallel_targets == 0 {
        return Err(ConfigError::InvalidVolume {
            volume: PathBuf::new(),
            detail: "parallel_volumes and parallel_targets must be >= 1".to_string(),
        });
    }
    Ok(())
}

pub fn parse_target_url(target: &TargetConfig) -> Result<EndpointUrl, UrlError> {
    EndpointUrl::parse(&target.path)
}
