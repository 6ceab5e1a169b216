//! Multiplexed ssh transport.
//!
//! One ControlMaster handshake is amortised over every operation of a
//! session; data channels share the master and run in parallel. Elevation on
//! the far side never mixes its password with a data channel: the sudo
//! timestamp is primed on a dedicated control channel (with tty allocation
//! suppressed), after which data commands use non-interactive `sudo -n`.

use std::fs;
use std::io::{self, BufRead, BufReader, IsTerminal, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::endpoint::url::SshLocation;

use super::session::Secret;
use super::{CommandSpec, TransportError, TransportErrorKind, sh_join, sh_quote};

pub const SUDO_PASSWORD_ENV: &str = "SNAPSYNC_SUDO_PASSWORD";
pub const NO_PASSWORD_SUDO_ENV: &str = "SNAPSYNC_NO_PASSWORD_SUDO";
const DEFAULT_PERSIST_SECS: u32 = 60;

#[derive(Clone, Debug)]
pub struct SshConfig {
    pub location: SshLocation,
    pub identity: Option<PathBuf>,
    pub password_auth: bool,
    pub elevate: bool,
    /// ControlPersist idle window; the master flushes itself after the last
    /// borrower goes away and this many seconds pass.
    pub persist_secs: u32,
}

impl SshConfig {
    pub fn new(location: SshLocation) -> Self {
        Self {
            location,
            identity: None,
            password_auth: true,
            elevate: false,
            persist_secs: DEFAULT_PERSIST_SECS,
        }
    }
}

/// Which authentication family got the master up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthFamily {
    Key,
    KeyWithPassphrase,
    Password,
}

/// How commands get root on the far side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElevationMode {
    None,
    /// `sudo -n` only; fails fast if a password would be needed.
    NonInteractive,
    /// Prime the sudo timestamp once with a cached secret, then `sudo -n`.
    CachedSecret,
    /// A remote helper script feeds sudo via SUDO_ASKPASS. Used when the
    /// primed timestamp does not stick (timestamp_timeout=0 hosts); data
    /// channels stay free of control bytes because sudo never reads stdin.
    AskpassHelper,
}

/// The elevation prefix a data-channel command actually gets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteElevation {
    None,
    /// `sudo -n` against the primed timestamp.
    Sudo,
    /// `SUDO_ASKPASS=<helper> sudo -A`.
    Askpass { helper: String },
}

#[derive(Debug, Default)]
struct SessionState {
    master_ready: bool,
    auth: Option<AuthFamily>,
    elevation: Option<ElevationMode>,
    secret: Option<Secret>,
    sudo_primed: bool,
    askpass_helper: Option<String>,
}

#[derive(Debug)]
pub struct SshSession {
    config: SshConfig,
    control_path: PathBuf,
    state: Mutex<SessionState>,
}

impl SshSession {
    pub fn new(config: SshConfig) -> Self {
        let control_path = control_path_for(&config.location, config.identity.as_deref());
        Self {
            config,
            control_path,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn target(&self) -> String {
        match &self.config.location.user {
            Some(user) => format!("{user}@{}", self.config.location.host),
            None => self.config.location.host.clone(),
        }
    }

    pub fn host(&self) -> &str {
        &self.config.location.host
    }

    pub fn auth_family(&self) -> Option<AuthFamily> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).auth
    }

    /// Shared ssh options. `batch` forbids interactive prompts; tty
    /// allocation is always suppressed (`-T`) so remote stdin stays a clean
    /// byte channel.
    fn base_args(&self, batch: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={}s", self.config.persist_secs),
            "-T".to_string(),
        ];
        if batch {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
            args.push("-o".to_string());
            args.push("NumberOfPasswordPrompts=0".to_string());
        }
        if let Some(port) = self.config.location.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.config.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    /// Bring the multiplexed master up, detecting the auth family on the
    /// way. Idempotent and cheap once established.
    pub fn ensure_master(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.master_ready && self.master_alive() {
            return Ok(());
        }
        if self.master_alive() {
            state.master_ready = true;
            return Ok(());
        }

        // Key-based first: one batch attempt tells us whether the key works
        // without ever hanging on a prompt.
        let mut argv = vec!["ssh".to_string()];
        argv.extend(self.base_args(true));
        argv.extend(["-M".to_string(), "-N".to_string(), "-f".to_string(), self.target()]);
        let output = run_capture(&argv)?;
        if output.status.success() {
            state.master_ready = true;
            state.auth = Some(AuthFamily::Key);
            tracing::debug!(target = %self.target(), "ssh master established (key auth)");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let batch_err = classify_ssh_stderr(&stderr);
        if batch_err.kind != TransportErrorKind::AuthRejected {
            return Err(batch_err);
        }

        // The key needs a passphrase or the server wants a password; both
        // require a terminal.
        if !io::stdin().is_terminal() {
            return Err(TransportError::new(
                TransportErrorKind::AuthUnavailable,
                format!(
                    "{}: key auth rejected and no terminal for interactive auth",
                    self.target()
                ),
            ));
        }
        if !self.config.password_auth && self.config.identity.is_none() {
            return Err(batch_err);
        }

        let mut argv = vec!["ssh".to_string()];
        argv.extend(self.base_args(false));
        argv.extend(["-M".to_string(), "-N".to_string(), "-f".to_string(), self.target()]);
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .status()
            .map_err(|e| {
                TransportError::new(TransportErrorKind::Protocol, format!("spawn ssh: {e}"))
            })?;
        if !status.success() {
            return Err(TransportError::new(
                TransportErrorKind::AuthRejected,
                format!("{}: interactive authentication failed", self.target()),
            ));
        }
        state.master_ready = true;
        state.auth = Some(if self.config.identity.is_some() {
            AuthFamily::KeyWithPassphrase
        } else {
            AuthFamily::Password
        });
        tracing::debug!(target = %self.target(), "ssh master established (interactive auth)");
        Ok(())
    }

    fn master_alive(&self) -> bool {
        let mut argv = vec!["ssh".to_string()];
        argv.extend([
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-O".to_string(),
            "check".to_string(),
            self.target(),
        ]);
        run_capture(&argv)
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Decide and execute the elevation strategy once per session.
    ///
    /// Secret resolution order: environment → previously cached value →
    /// terminal prompt. With none of those, `AuthUnavailable` — never a
    /// hang.
    pub fn prime_elevation(&self) -> Result<(), TransportError> {
        if !self.config.elevate {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.sudo_primed {
            return Ok(());
        }
        let mode = match state.elevation {
            Some(mode) => mode,
            None => {
                let mode = if std::env::var_os(NO_PASSWORD_SUDO_ENV).is_some() {
                    ElevationMode::NonInteractive
                } else {
                    ElevationMode::CachedSecret
                };
                state.elevation = Some(mode);
                mode
            }
        };
        match mode {
            ElevationMode::None => Ok(()),
            ElevationMode::NonInteractive => {
                let out = self.run_remote_control("sudo -n true")?;
                if out.status.success() {
                    state.sudo_primed = true;
                    Ok(())
                } else {
                    Err(TransportError::new(
                        TransportErrorKind::AuthUnavailable,
                        format!("{}: sudo requires a password but passwordless mode is forced", self.target()),
                    ))
                }
            }
            ElevationMode::CachedSecret | ElevationMode::AskpassHelper => {
                // Passwordless sudo needs no secret at all; probe first.
                let out = self.run_remote_control("sudo -n true")?;
                if out.status.success() {
                    state.sudo_primed = true;
                    return Ok(());
                }
                let secret = resolve_secret(&mut state, &self.target())?;
                let bytes = secret.bytes();
                let out = self.run_remote_control_with_stdin("sudo -S -v -p ''", &bytes)?;
                drop(bytes);
                if !out.status.success() {
                    state.secret = None;
                    return Err(TransportError::new(
                        TransportErrorKind::AuthRejected,
                        format!(
                            "{}: sudo rejected the cached password: {}",
                            self.target(),
                            String::from_utf8_lossy(&out.stderr).trim()
                        ),
                    ));
                }
                // Some hosts run timestamp_timeout=0, so the primed
                // timestamp is gone by the next sudo. Fall back to a
                // helper script the data channel reaches via SUDO_ASKPASS,
                // keeping its stdin a pure byte stream.
                let out = self.run_remote_control("sudo -n true")?;
                if out.status.success() {
                    state.elevation = Some(ElevationMode::CachedSecret);
                    state.sudo_primed = true;
                    return Ok(());
                }
                let helper = self.install_askpass_helper(&mut state)?;
                let probe = format!(
                    "SUDO_ASKPASS={} sudo -A true",
                    sh_quote(&helper)
                );
                let out = self.run_remote_control(&probe)?;
                if out.status.success() {
                    state.elevation = Some(ElevationMode::AskpassHelper);
                    state.askpass_helper = Some(helper);
                    state.sudo_primed = true;
                    Ok(())
                } else {
                    let _ = self.run_remote_control(&format!("rm -f {}", sh_quote(&helper)));
                    Err(TransportError::new(
                        TransportErrorKind::AuthRejected,
                        format!(
                            "{}: askpass elevation failed: {}",
                            self.target(),
                            String::from_utf8_lossy(&out.stderr).trim()
                        ),
                    ))
                }
            }
        }
    }

    /// Write the askpass helper on the far side, 0700, holding the cached
    /// secret. Removed again on session stop.
    fn install_askpass_helper(
        &self,
        state: &mut SessionState,
    ) -> Result<String, TransportError> {
        let secret = resolve_secret(state, &self.target())?;
        let path = self.askpass_helper_path();
        let script = {
            let bytes = secret.bytes();
            askpass_script(&String::from_utf8_lossy(&bytes))
        };
        let install = format!(
            "umask 077; cat > {p} && chmod 700 {p}",
            p = sh_quote(&path)
        );
        let remote = format!("sh -c {}", sh_quote(&install));
        let out = self.run_remote_control_with_stdin(&remote, script.as_bytes())?;
        if out.status.success() {
            Ok(path)
        } else {
            Err(TransportError::new(
                TransportErrorKind::Protocol,
                format!(
                    "{}: could not install askpass helper: {}",
                    self.target(),
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            ))
        }
    }

    fn askpass_helper_path(&self) -> String {
        let tag = self
            .control_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "session".to_string());
        format!("/tmp/{tag}-askpass.sh")
    }

    /// Elevation prefix for a data-channel command, per the session's
    /// settled mode.
    fn remote_elevation(&self, elevate: bool) -> RemoteElevation {
        if !elevate {
            return RemoteElevation::None;
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match (state.elevation, &state.askpass_helper) {
            (Some(ElevationMode::AskpassHelper), Some(helper)) => RemoteElevation::Askpass {
                helper: helper.clone(),
            },
            _ => RemoteElevation::Sudo,
        }
    }

    /// Data-channel command. Elevated commands rely on the primed timestamp
    /// (or the askpass helper) and therefore never read the data stdin.
    pub fn command(&self, spec: &CommandSpec) -> Result<Command, TransportError> {
        if spec.argv.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Protocol,
                "empty argv",
            ));
        }
        let remote = remote_command_line(spec, &self.remote_elevation(spec.elevate));
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args(true));
        cmd.arg(self.target());
        cmd.arg("--");
        cmd.arg(remote);
        Ok(cmd)
    }

    fn run_remote_control(&self, remote: &str) -> Result<std::process::Output, TransportError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args(true));
        cmd.arg(self.target()).arg("--").arg(remote);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.output()
            .map_err(|e| TransportError::new(TransportErrorKind::Protocol, format!("spawn ssh: {e}")))
    }

    fn run_remote_control_with_stdin(
        &self,
        remote: &str,
        stdin_bytes: &[u8],
    ) -> Result<std::process::Output, TransportError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args(true));
        cmd.arg(self.target()).arg("--").arg(remote);
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::new(TransportErrorKind::Protocol, format!("spawn ssh: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(stdin_bytes);
            let _ = stdin.write_all(b"\n");
        }
        child
            .wait_with_output()
            .map_err(|e| TransportError::new(TransportErrorKind::Protocol, format!("wait ssh: {e}")))
    }

    /// Tear the master down. Called when the session table shuts down. The
    /// askpass helper (if any) is removed first, while the master is still
    /// up to carry the command.
    pub fn stop(&self) {
        let helper = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.askpass_helper.take()
        };
        if let Some(helper) = helper {
            let _ = self.run_remote_control(&format!("rm -f {}", sh_quote(&helper)));
        }
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            &format!("ControlPath={}", self.control_path.display()),
            "-O",
            "exit",
        ]);
        cmd.arg(self.target());
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let _ = cmd.status();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.master_ready = false;
        state.secret = None;
        state.sudo_primed = false;
    }
}

/// The single remote shell word for a data command, elevation included.
pub fn remote_command_line(spec: &CommandSpec, elevation: &RemoteElevation) -> String {
    if !spec.elevate {
        return sh_join(&spec.argv);
    }
    match elevation {
        RemoteElevation::None => sh_join(&spec.argv),
        RemoteElevation::Sudo => {
            let mut argv = vec!["sudo".to_string(), "-n".to_string()];
            argv.extend(spec.argv.iter().cloned());
            sh_join(&argv)
        }
        RemoteElevation::Askpass { helper } => {
            let mut argv = vec!["sudo".to_string(), "-A".to_string()];
            argv.extend(spec.argv.iter().cloned());
            format!("SUDO_ASKPASS={} {}", sh_quote(helper), sh_join(&argv))
        }
    }
}

/// The helper sudo invokes via SUDO_ASKPASS: prints the secret and nothing
/// else.
pub fn askpass_script(secret: &str) -> String {
    format!("#!/bin/sh\nprintf '%s\\n' {}\n", sh_quote(secret))
}

/// Map ssh's stderr chatter to a structured kind.
pub fn classify_ssh_stderr(stderr: &str) -> TransportError {
    let lower = stderr.to_ascii_lowercase();
    let kind = if lower.contains("permission denied")
        || lower.contains("too many authentication failures")
    {
        TransportErrorKind::AuthRejected
    } else if lower.contains("could not resolve hostname")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("no route to host")
        || lower.contains("network is unreachable")
        || lower.contains("connection closed by remote host")
        || lower.contains("broken pipe")
    {
        TransportErrorKind::Unreachable
    } else if lower.contains("command not found") || lower.contains("not found") {
        TransportErrorKind::RemoteBinaryMissing
    } else {
        TransportErrorKind::Protocol
    };
    TransportError::new(kind, stderr.trim().to_string())
}

fn resolve_secret(state: &mut SessionState, target: &str) -> Result<Secret, TransportError> {
    if let Ok(value) = std::env::var(SUDO_PASSWORD_ENV) {
        let secret = Secret::new(value.into_bytes());
        state.secret = Some(secret.clone());
        return Ok(secret);
    }
    if let Some(secret) = &state.secret {
        return Ok(secret.clone());
    }
    if io::stdin().is_terminal() {
        let prompt = format!("[sudo] password for {target}: ");
        let secret = prompt_secret(&prompt).map_err(|e| {
            TransportError::new(
                TransportErrorKind::AuthUnavailable,
                format!("terminal prompt failed: {e}"),
            )
        })?;
        state.secret = Some(secret.clone());
        return Ok(secret);
    }
    Err(TransportError::new(
        TransportErrorKind::AuthUnavailable,
        format!("{target}: no elevation secret in environment or cache and no terminal to prompt"),
    ))
}

/// Read a secret from /dev/tty with echo off (restored afterwards).
fn prompt_secret(prompt: &str) -> io::Result<Secret> {
    let mut tty = fs::OpenOptions::new().read(true).write(true).open("/dev/tty")?;
    tty.write_all(prompt.as_bytes())?;
    tty.flush()?;
    let echo_off = Command::new("stty")
        .arg("-echo")
        .stdin(Stdio::from(tty.try_clone()?))
        .status();
    let mut line = String::new();
    let read_result = BufReader::new(tty.try_clone()?).read_line(&mut line);
    if echo_off.map(|s| s.success()).unwrap_or(false) {
        let _ = Command::new("stty")
            .arg("echo")
            .stdin(Stdio::from(tty.try_clone()?))
            .status();
        let _ = tty.write_all(b"\n");
    }
    read_result?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    Ok(Secret::new(trimmed.as_bytes().to_vec()))
}

fn run_capture(argv: &[String]) -> Result<std::process::Output, TransportError> {
    Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| TransportError::new(TransportErrorKind::Protocol, format!("spawn ssh: {e}")))
}

fn control_path_for(location: &SshLocation, identity: Option<&std::path::Path>) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(location.host.as_bytes());
    if let Some(user) = &location.user {
        hasher.update(user.as_bytes());
    }
    if let Some(port) = location.port {
        hasher.update(port.to_le_bytes());
    }
    if let Some(identity) = identity {
        hasher.update(identity.as_os_str().as_encoded_bytes());
    }
    let digest = hasher.finalize();
    let short: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    std::env::temp_dir().join(format!("snapsync-cm-{}-{short}", std::process::id()))
}
