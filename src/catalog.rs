//! Snapshot catalog: naming, creation, and destruction at one endpoint.
//!
//! Names failing the configured timestamp format are treated as
//! user-managed: they never enter planning or retention and are never
//! deleted here.

use std::path::Path;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::core::{Snapshot, TimestampFormat, naming};
use crate::endpoint::{Endpoint, EndpointError};
use crate::lock;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("could not find a free name for {base:?} after {attempts} attempts")]
    NameExhausted { base: String, attempts: u32 },
}

const MAX_COLLISION_SUFFIX: u32 = 100;

pub struct Catalog<'a> {
    endpoint: &'a Endpoint,
    prefix: String,
    format: TimestampFormat,
}

impl<'a> Catalog<'a> {
    pub fn new(endpoint: &'a Endpoint, prefix: impl Into<String>, format: TimestampFormat) -> Self {
        Self {
            endpoint,
            prefix: prefix.into(),
            format,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn format(&self) -> &TimestampFormat {
        &self.format
    }

    pub fn list(&self) -> Result<Vec<Snapshot>, CatalogError> {
        Ok(self.endpoint.list_snapshots(&self.prefix, &self.format)?)
    }

    /// Take a read-only snapshot named for `now`. A same-second collision
    /// gets a monotonic `-N` suffix.
    pub fn create(&self, volume: &Path, now: NaiveDateTime) -> Result<Snapshot, CatalogError> {
        let base = naming::render_snapshot_name(&self.prefix, &self.format, now);
        let taken: std::collections::HashSet<String> =
            self.list()?.into_iter().map(|s| s.name).collect();
        let name = if !taken.contains(&base) {
            base
        } else {
            let mut found = None;
            for n in 1..MAX_COLLISION_SUFFIX {
                let candidate = format!("{base}-{n}");
                if !taken.contains(&candidate) {
                    found = Some(candidate);
                    break;
                }
            }
            found.ok_or(CatalogError::NameExhausted {
                base,
                attempts: MAX_COLLISION_SUFFIX,
            })?
        };
        tracing::info!(volume = %volume.display(), name, "creating snapshot");
        Ok(self
            .endpoint
            .create_snapshot(volume, &name, &self.format, &self.prefix)?)
    }

    /// Destroy `snapshots`, skipping any that hold a transfer lock under
    /// `lock_dir`. Failures are collected, not fatal: one stuck subvolume
    /// must not keep the rest of the prune set alive.
    pub fn destroy(&self, snapshots: &[Snapshot], lock_dir: &Path) -> DestroyReport {
        let locked = lock::locked_snapshot_names(lock_dir);
        let mut report = DestroyReport::default();
        for snapshot in snapshots {
            if locked.contains(&snapshot.name) {
                tracing::info!(name = %snapshot.name, "skipping locked snapshot");
                report.skipped_locked.push(snapshot.name.clone());
                continue;
            }
            match self.endpoint.destroy_snapshot(snapshot) {
                Ok(()) => {
                    tracing::info!(name = %snapshot.name, "destroyed snapshot");
                    report.destroyed.push(snapshot.name.clone());
                }
                Err(err) => {
                    tracing::error!(name = %snapshot.name, "destroy failed: {err}");
                    report.failed.push((snapshot.name.clone(), err.to_string()));
                }
            }
        }
        report
    }
}

#[derive(Debug, Default)]
pub struct DestroyReport {
    pub destroyed: Vec<String>,
    pub skipped_locked: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl DestroyReport {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_suffix_is_monotonic() {
        // Exercised through the naming helper: the catalog probes taken
        // names in order base, base-1, base-2, …
        let format = TimestampFormat::default();
        let ts = format.parse("20260101-000000").unwrap();
        let base = naming::render_snapshot_name("home-", &format, ts);
        assert_eq!(base, "home-20260101-000000");
        assert_eq!(format!("{base}-1"), "home-20260101-000000-1");
        // Both names parse back to the same instant.
        assert_eq!(
            naming::parse_snapshot_name(&base, "home-", &format),
            naming::parse_snapshot_name(&format!("{base}-1"), "home-", &format),
        );
    }
}
