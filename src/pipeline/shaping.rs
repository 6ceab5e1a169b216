//! Stream shaping: compression and encryption stages.
//!
//! Stages are external filter processes on the originating side of the
//! pipeline. The configured tool must exist there before anything is
//! spawned; a missing tool aborts the transfer before the first byte.

use std::path::{Path, PathBuf};

use crate::config::{Compression, Encryption};

/// Filter argv that compresses stdin to stdout.
pub fn compress_argv(kind: Compression) -> Option<Vec<String>> {
    let argv: &[&str] = match kind {
        Compression::None => return None,
        Compression::Gzip => &["gzip", "-c"],
        Compression::Pigz => &["pigz", "-c"],
        Compression::Zstd => &["zstd", "-q", "-c"],
        Compression::Lz4 => &["lz4", "-q", "-c"],
        Compression::Lzop => &["lzop", "-c"],
        Compression::Bzip2 => &["bzip2", "-c"],
        Compression::Xz => &["xz", "-T0", "-c"],
    };
    Some(argv.iter().map(|s| s.to_string()).collect())
}

/// Filter argv that reverses `compress_argv`.
pub fn decompress_argv(kind: Compression) -> Option<Vec<String>> {
    let argv: &[&str] = match kind {
        Compression::None => return None,
        Compression::Gzip => &["gzip", "-dc"],
        Compression::Pigz => &["pigz", "-dc"],
        Compression::Zstd => &["zstd", "-q", "-dc"],
        Compression::Lz4 => &["lz4", "-q", "-dc"],
        Compression::Lzop => &["lzop", "-dc"],
        Compression::Bzip2 => &["bzip2", "-dc"],
        Compression::Xz => &["xz", "-dc"],
    };
    Some(argv.iter().map(|s| s.to_string()).collect())
}

pub fn encrypt_argv(kind: Encryption, gpg_recipient: Option<&str>) -> Option<Vec<String>> {
    match kind {
        Encryption::None => None,
        Encryption::Gpg => {
            let mut argv = vec![
                "gpg".to_string(),
                "--batch".to_string(),
                "--yes".to_string(),
                "-o".to_string(),
                "-".to_string(),
                "-e".to_string(),
            ];
            if let Some(recipient) = gpg_recipient {
                argv.push("-r".to_string());
                argv.push(recipient.to_string());
            } else {
                argv.push("--default-recipient-self".to_string());
            }
            Some(argv)
        }
        Encryption::Openssl => Some(
            [
                "openssl", "enc", "-aes-256-cbc", "-salt", "-pbkdf2", "-pass",
                "env:SNAPSYNC_ENC_PASSWORD",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        ),
    }
}

pub fn decrypt_argv(kind: Encryption) -> Option<Vec<String>> {
    match kind {
        Encryption::None => None,
        Encryption::Gpg => Some(
            ["gpg", "--batch", "--quiet", "-d"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        ),
        Encryption::Openssl => Some(
            [
                "openssl", "enc", "-d", "-aes-256-cbc", "-pbkdf2", "-pass",
                "env:SNAPSYNC_ENC_PASSWORD",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        ),
    }
}

/// Locate `program` in PATH.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
