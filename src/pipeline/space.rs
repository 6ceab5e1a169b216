//! Space precheck: estimate the stream, compare against free bytes.

use crate::cancel::CancelToken;
use crate::core::Snapshot;
use crate::endpoint::{Endpoint, EndpointError};

use super::rate::copy_stream;

pub const DEFAULT_SPACE_MARGIN: f64 = 0.10;
const MIN_REQUIRED_BYTES: u64 = 100 * 1024 * 1024;

/// Bytes the destination must have free for an `estimate`-sized stream:
/// `max(estimate × (1 + margin), 100 MiB)`.
pub fn required_bytes(estimate: u64, margin: f64) -> u64 {
    let margin = margin.max(0.0);
    let with_margin = (estimate as f64 * (1.0 + margin)).ceil() as u64;
    with_margin.max(MIN_REQUIRED_BYTES)
}

/// Estimate the on-wire size of sending `snapshot` (against `parent`).
///
/// Native sources run `btrfs send --no-data` and count; the metadata-only
/// stream bounds the real stream's bookkeeping while the file data adds the
/// bulk, so this is a floor, not a promise. Raw sources already know their
/// file size.
pub fn estimate_stream_bytes(
    source: &Endpoint,
    snapshot: &Snapshot,
    parent: Option<&Snapshot>,
    cancel: &CancelToken,
) -> Result<u64, EndpointError> {
    if let Some(raw) = source.raw() {
        let meta = raw.read_sidecar(&snapshot.name)?;
        return Ok(meta.bytes);
    }
    let mut child = source.open_send_stream(snapshot, parent, true)?;
    let stdout = child.stdout.take().ok_or_else(|| EndpointError::Parse {
        detail: "send stream has no stdout".to_string(),
    })?;
    let counted = copy_stream(stdout, std::io::sink(), None, cancel, |_| {});
    let status = child.wait().map_err(|source| EndpointError::Io {
        path: snapshot.path.clone(),
        source,
    })?;
    let counted = counted.map_err(|source| EndpointError::Io {
        path: snapshot.path.clone(),
        source,
    })?;
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            use std::io::Read;
            let _ = pipe.read_to_string(&mut stderr);
        }
        return Err(EndpointError::CommandFailed {
            program: "btrfs send --no-data".to_string(),
            status: status.code(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(counted)
}
