//! Local subprocess transport.

use std::fs;
use std::process::Command;

use super::{CommandSpec, TransportError, TransportErrorKind};

#[derive(Clone, Debug, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }

    pub fn command(&self, spec: &CommandSpec) -> Result<Command, TransportError> {
        let mut argv = spec.argv.clone();
        if argv.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Protocol,
                "empty argv",
            ));
        }
        if spec.elevate && !is_root() {
            // Non-interactive only: if a password would be needed this fails
            // fast instead of hanging a pipeline on a hidden prompt.
            let mut elevated = vec!["sudo".to_string(), "-n".to_string()];
            elevated.append(&mut argv);
            argv = elevated;
        }
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        Ok(cmd)
    }
}

/// Effective-uid probe via /proc; this tool targets Linux hosts only.
pub fn is_root() -> bool {
    let status = match fs::read_to_string("/proc/self/status") {
        Ok(s) => s,
        Err(_) => return false,
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            let mut fields = rest.split_whitespace();
            let _real = fields.next();
            return fields.next() == Some("0");
        }
    }
    false
}
