//! Endpoint URL parsing.
//!
//! Recognised forms:
//! - `/abs/path` or `file:///abs/path` — local native endpoint
//! - `ssh://[user@]host[:port]/abs/path` — remote native endpoint
//! - `raw:///abs/path`, `raw+ssh://[user@]host[:port]/abs/path` — raw-file
//!   endpoints storing streams as files with sidecars

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("endpoint path must be absolute: {0:?}")]
    RelativePath(String),
    #[error("missing host in {0:?}")]
    MissingHost(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SshLocation {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointUrl {
    Local { path: PathBuf },
    Ssh(SshLocation),
    Raw { path: PathBuf },
    RawSsh(SshLocation),
}

impl EndpointUrl {
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix("file://") {
            return Ok(Self::Local {
                path: absolute(rest, input)?,
            });
        }
        if let Some(rest) = input.strip_prefix("ssh://") {
            return Ok(Self::Ssh(parse_ssh(rest, input)?));
        }
        if let Some(rest) = input.strip_prefix("raw+ssh://") {
            return Ok(Self::RawSsh(parse_ssh(rest, input)?));
        }
        if let Some(rest) = input.strip_prefix("raw://") {
            return Ok(Self::Raw {
                path: absolute(rest, input)?,
            });
        }
        if let Some((scheme, _)) = input.split_once("://") {
            return Err(UrlError::UnsupportedScheme(scheme.to_string()));
        }
        Ok(Self::Local {
            path: absolute(input, input)?,
        })
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw { .. } | Self::RawSsh(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Ssh(_) | Self::RawSsh(_))
    }

    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Local { path } | Self::Raw { path } => path,
            Self::Ssh(loc) | Self::RawSsh(loc) => &loc.path,
        }
    }

    pub fn ssh(&self) -> Option<&SshLocation> {
        match self {
            Self::Ssh(loc) | Self::RawSsh(loc) => Some(loc),
            _ => None,
        }
    }

    /// Stable identity string used for lock keys and journal subjects.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(f, "file://{}", path.display()),
            Self::Raw { path } => write!(f, "raw://{}", path.display()),
            Self::Ssh(loc) => write!(f, "ssh://{loc}"),
            Self::RawSsh(loc) => write!(f, "raw+ssh://{loc}"),
        }
    }
}

impl fmt::Display for SshLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, ":{}", self.path.display())
    }
}

fn absolute(path: &str, original: &str) -> Result<PathBuf, UrlError> {
    if path.starts_with('/') {
        Ok(PathBuf::from(path))
    } else {
        Err(UrlError::RelativePath(original.to_string()))
    }
}

/// `[user@]host[:port]/abs/path` — also tolerates the scp-like
/// `[user@]host:/abs/path` spelling the original accepted.
fn parse_ssh(rest: &str, original: &str) -> Result<SshLocation, UrlError> {
    let (user, rest) = match rest.split_once('@') {
        Some((user, tail)) if !user.is_empty() => (Some(user.to_string()), tail),
        _ => (None, rest),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => return Err(UrlError::RelativePath(original.to_string())),
    };
    let authority = authority.strip_suffix(':').unwrap_or(authority);
    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| UrlError::InvalidPort(original.to_string()))?;
            (host, Some(port))
        }
        None => (authority, None),
    };
    if host.is_empty() {
        return Err(UrlError::MissingHost(original.to_string()));
    }
    Ok(SshLocation {
        user,
        host: host.to_string(),
        port,
        path: absolute(path, original)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_absolute_path_is_local() {
        let url = EndpointUrl::parse("/mnt/backups").unwrap();
        assert_eq!(
            url,
            EndpointUrl::Local {
                path: PathBuf::from("/mnt/backups")
            }
        );
        assert!(!url.is_remote());
        assert!(!url.is_raw());
    }

    #[test]
    fn file_scheme_is_local() {
        let url = EndpointUrl::parse("file:///mnt/backups").unwrap();
        assert_eq!(url.path(), &PathBuf::from("/mnt/backups"));
    }

    #[test]
    fn ssh_with_user_and_port() {
        let url = EndpointUrl::parse("ssh://backup@nas:2222/srv/backups").unwrap();
        let loc = url.ssh().unwrap();
        assert_eq!(loc.user.as_deref(), Some("backup"));
        assert_eq!(loc.host, "nas");
        assert_eq!(loc.port, Some(2222));
        assert_eq!(loc.path, PathBuf::from("/srv/backups"));
    }

    #[test]
    fn ssh_scp_style_colon_before_path() {
        let url = EndpointUrl::parse("ssh://backup@nas:/srv/backups").unwrap();
        let loc = url.ssh().unwrap();
        assert_eq!(loc.host, "nas");
        assert_eq!(loc.port, None);
        assert_eq!(loc.path, PathBuf::from("/srv/backups"));
    }

    #[test]
    fn raw_variants() {
        assert!(EndpointUrl::parse("raw:///srv/streams").unwrap().is_raw());
        let remote = EndpointUrl::parse("raw+ssh://nas/srv/streams").unwrap();
        assert!(remote.is_raw() && remote.is_remote());
    }

    #[test]
    fn rejects_bad_inputs() {
        assert_eq!(
            EndpointUrl::parse("ftp://host/dir"),
            Err(UrlError::UnsupportedScheme("ftp".to_string()))
        );
        assert!(matches!(
            EndpointUrl::parse("relative/dir"),
            Err(UrlError::RelativePath(_))
        ));
        assert!(matches!(
            EndpointUrl::parse("ssh://nas:notaport/dir"),
            Err(UrlError::InvalidPort(_))
        ));
        assert!(matches!(
            EndpointUrl::parse("ssh:///dir"),
            Err(UrlError::MissingHost(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        for input in [
            "file:///mnt/backups",
            "ssh://backup@nas:2222/srv/backups",
            "raw:///srv/streams",
        ] {
            let url = EndpointUrl::parse(input).unwrap();
            assert_eq!(EndpointUrl::parse(&url.to_string()).unwrap(), url);
        }
    }
}
