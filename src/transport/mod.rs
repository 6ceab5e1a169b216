//! Command transports: local subprocesses and multiplexed ssh.
//!
//! A transport executes an argv at its location and wires the caller's
//! stdin/stdout/stderr. Channel-level failures (unreachable host, rejected
//! auth, missing remote binary) surface as structured `TransportError`s;
//! ordinary nonzero exits of the executed command are the caller's to
//! interpret.

mod local;
mod session;
mod ssh;

use std::process::{Command, Output, Stdio};

use thiserror::Error;

pub use local::{LocalTransport, is_root};
pub use session::{SessionKey, SessionTable};
pub use ssh::{
    AuthFamily, ElevationMode, RemoteElevation, SshConfig, SshSession, askpass_script,
    classify_ssh_stderr,
};

use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    Unreachable,
    AuthRejected,
    AuthUnavailable,
    RemoteBinaryMissing,
    Protocol,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::AuthRejected => "auth_rejected",
            Self::AuthUnavailable => "auth_unavailable",
            Self::RemoteBinaryMissing => "remote_binary_missing",
            Self::Protocol => "protocol",
        }
    }
}

#[derive(Debug, Error)]
#[error("transport error ({kind}): {detail}", kind = .kind.as_str())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// An argv to run at the transport's location, with optional elevation.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub elevate: bool,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            elevate: false,
        }
    }

    pub fn elevated(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }
}

#[derive(Clone, Debug)]
pub enum Transport {
    Local(LocalTransport),
    Ssh(Arc<SshSession>),
}

impl Transport {
    pub fn local() -> Self {
        Self::Local(LocalTransport::new())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Ssh(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local(_) => "local".to_string(),
            Self::Ssh(session) => session.target(),
        }
    }

    /// Build a ready-to-spawn `Command` for the spec. For ssh this ensures
    /// the multiplexed master is up and elevation is primed first.
    pub fn command(&self, spec: &CommandSpec) -> Result<Command, TransportError> {
        match self {
            Self::Local(local) => local.command(spec),
            Self::Ssh(session) => {
                session.ensure_master()?;
                if spec.elevate {
                    session.prime_elevation()?;
                }
                session.command(spec)
            }
        }
    }

    /// Run to completion capturing stdout/stderr.
    ///
    /// `Err` means the channel failed (spawn error, ssh exit 255); a nonzero
    /// command exit is returned as `Ok` with the status for the caller.
    pub fn output(&self, spec: &CommandSpec) -> Result<Output, TransportError> {
        let mut cmd = self.command(spec)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = cmd.output().map_err(|e| {
            TransportError::new(
                TransportErrorKind::Protocol,
                format!("failed to spawn {:?}: {e}", spec.argv.first()),
            )
        })?;
        if let Self::Ssh(_) = self
            && output.status.code() == Some(255)
        {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ssh_stderr(&stderr));
        }
        Ok(output)
    }
}

/// Quote one word for a POSIX shell.
pub fn sh_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

pub fn sh_join(argv: &[String]) -> String {
    argv.iter()
        .map(|w| sh_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_passes_safe_words_through() {
        assert_eq!(sh_quote("btrfs"), "btrfs");
        assert_eq!(sh_quote("/srv/backups/home-20260101"), "/srv/backups/home-20260101");
        assert_eq!(sh_quote("-p"), "-p");
    }

    #[test]
    fn quote_wraps_unsafe_words() {
        assert_eq!(sh_quote("a b"), "'a b'");
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn join_builds_a_single_shell_word_list() {
        let argv = vec![
            "btrfs".to_string(),
            "subvolume".to_string(),
            "snapshot".to_string(),
            "-r".to_string(),
            "/home".to_string(),
            "/home/.snapshots/home a".to_string(),
        ];
        assert_eq!(
            sh_join(&argv),
            "btrfs subvolume snapshot -r /home '/home/.snapshots/home a'"
        );
    }

    #[test]
    fn local_output_runs_commands() {
        let transport = Transport::local();
        let out = transport
            .output(&CommandSpec::new(["sh", "-c", "echo hi"]))
            .unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hi");
    }

    #[test]
    fn local_nonzero_exit_is_ok_at_transport_level() {
        let transport = Transport::local();
        let out = transport
            .output(&CommandSpec::new(["sh", "-c", "exit 3"]))
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
    }
}
