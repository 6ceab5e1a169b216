//! In-process byte copier with optional token-bucket throttling.
//!
//! The copier sits between the last originating stage and the sink on every
//! transfer: it is where bytes are counted, the digest is fed, throttling
//! sleeps happen, and cancellation is observed.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

const CHUNK: usize = 128 * 1024;

/// Wall-clock token bucket: `rate` bytes per second with one second of
/// burst capacity.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let rate = rate_bytes_per_sec.max(1) as f64;
        Self {
            rate,
            capacity: rate,
            tokens: rate,
            refilled: Instant::now(),
        }
    }

    /// How long to sleep before `n` bytes may pass.
    pub fn delay_for(&mut self, n: usize) -> Duration {
        let now = Instant::now();
        self.tokens = (self.tokens + now.duration_since(self.refilled).as_secs_f64() * self.rate)
            .min(self.capacity);
        self.refilled = now;
        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// Copy `reader` to `writer` until EOF.
///
/// Returns the byte count. Cancellation surfaces as `Interrupted`; the
/// caller maps it to its own error kind. `observe` sees every chunk in
/// order (digest feeding).
pub fn copy_stream(
    mut reader: impl Read,
    mut writer: impl Write,
    rate_limit: Option<u64>,
    cancel: &CancelToken,
    mut observe: impl FnMut(&[u8]),
) -> io::Result<u64> {
    let mut bucket = rate_limit.map(TokenBucket::new);
    let mut buf = vec![0u8; CHUNK];
    let mut total: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if let Some(bucket) = bucket.as_mut() {
            let delay = bucket.delay_for(n);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        observe(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}
