//! Disaster-recovery restore: replay a destination-held chain back into a
//! local filesystem.
//!
//! The planner half is pure: resolve the target spec, reconstruct the
//! parent chain inside the backup endpoint, drop the prefix the local side
//! already holds, and order what remains. Execution replays each element
//! through the transfer pipeline in the reverse direction.

use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::core::{Snapshot, TimestampFormat, chain};
use crate::endpoint::{Endpoint, EndpointError};
use crate::journal::{Action, Journal, Record, Status, Subject};
use crate::lock::{LockError, LockGuard, OpKind, restore_lock_name};
use crate::pipeline::{self, StreamShaping, TransferRequest};

/// What to restore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreTarget {
    /// A specific snapshot by name.
    Name(String),
    /// The latest snapshot at or before the cut-off.
    LatestBefore(NaiveDateTime),
    Latest,
    All,
}

#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// Destroy a colliding local snapshot instead of skipping it.
    pub overwrite: bool,
    /// Restore into the volume's live path.
    pub in_place: bool,
    /// Explicit confirmation required by `in_place`.
    pub confirmed: bool,
    /// Skip the space precheck.
    pub force: bool,
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("no snapshot matches {0:?} at the backup endpoint")]
    TargetNotFound(String),
    #[error("backup endpoint holds no snapshots")]
    NothingToRestore,
    #[error(
        "chain for {target} is broken: {missing} is referenced as parent but held nowhere"
    )]
    BrokenChain { target: String, missing: String },
    #[error("in-place restore requires explicit confirmation")]
    InPlaceNotConfirmed,
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("restore of {name} failed: {detail}")]
    StepFailed { name: String, detail: String },
}

/// Resolve `target` against the backup listing.
pub fn resolve_targets<'a>(
    backup: &'a [Snapshot],
    target: &RestoreTarget,
) -> Result<Vec<&'a Snapshot>, RestoreError> {
    let mut ordered: Vec<&Snapshot> = backup.iter().collect();
    ordered.sort();
    if ordered.is_empty() {
        return Err(RestoreError::NothingToRestore);
    }
    match target {
        RestoreTarget::Name(name) => ordered
            .iter()
            .find(|s| &s.name == name)
            .map(|s| vec![*s])
            .ok_or_else(|| RestoreError::TargetNotFound(name.clone())),
        RestoreTarget::LatestBefore(cutoff) => ordered
            .iter()
            .rev()
            .find(|s| s.timestamp <= *cutoff)
            .map(|s| vec![*s])
            .ok_or_else(|| RestoreError::TargetNotFound(format!("latest before {cutoff}"))),
        RestoreTarget::Latest => Ok(vec![*ordered.last().expect("nonempty")]),
        RestoreTarget::All => Ok(ordered),
    }
}

/// Compute the replay sequence, oldest first.
///
/// Each target's chain is followed through `parent_uuid` within the backup
/// endpoint, the prefix already present locally (matched by replication id)
/// is dropped, and the union is ordered. A chain whose next element needs a
/// parent held neither side is broken.
pub fn plan(
    backup: &[Snapshot],
    local: &[Snapshot],
    target: &RestoreTarget,
) -> Result<Vec<Snapshot>, RestoreError> {
    let targets = resolve_targets(backup, target)?;
    let backup_index = chain::index_by_replication_id(backup);
    let local_ids: std::collections::HashSet<uuid::Uuid> = local
        .iter()
        .filter_map(|s| s.replication_id())
        .collect();

    let mut selected: Vec<&Snapshot> = Vec::new();
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for t in targets {
        let full_chain = chain::chain_to(t, &backup_index);
        // Drop the longest prefix the local endpoint already holds.
        let mut remaining: &[&Snapshot] = &full_chain;
        while let Some((head, rest)) = remaining.split_first() {
            match head.replication_id() {
                Some(id) if local_ids.contains(&id) => remaining = rest,
                _ => break,
            }
        }
        // What survives must be replayable: its first element is either a
        // full stream or incremental against something already local.
        if let Some(first) = remaining.first()
            && let Some(parent_id) = first.parent_uuid
            && !local_ids.contains(&parent_id)
        {
            return Err(RestoreError::BrokenChain {
                target: t.name.clone(),
                missing: parent_id.to_string(),
            });
        }
        for snapshot in remaining {
            if seen.insert(snapshot.name.as_str()) {
                selected.push(snapshot);
            }
        }
    }
    let mut plan: Vec<Snapshot> = selected.into_iter().cloned().collect();
    plan.sort();
    Ok(plan)
}

pub struct RestoreContext<'a> {
    pub backup: &'a Endpoint,
    pub local: &'a Endpoint,
    pub prefix: &'a str,
    pub format: &'a TimestampFormat,
    /// Journal subject (the volume being restored).
    pub volume: String,
    pub options: RestoreOptions,
    pub drain_window: Duration,
    pub space_margin: f64,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub skipped_existing: Vec<String>,
}

/// Replay the planned chain into the local endpoint.
pub fn execute(
    ctx: &RestoreContext<'_>,
    target: &RestoreTarget,
    journal: &Journal,
    cancel: &CancelToken,
) -> Result<RestoreReport, RestoreError> {
    if ctx.options.in_place && !ctx.options.confirmed {
        return Err(RestoreError::InPlaceNotConfirmed);
    }
    let dest_dir = ctx.local.base_dir().to_path_buf();
    ctx.local.ensure_directory(&dest_dir)?;
    ctx.local.require_btrfs(&dest_dir)?;

    // Restores hold their own lock class so running transfers cannot
    // starve them (and vice versa).
    let correlation_id = uuid::Uuid::new_v4();
    let _lock = LockGuard::acquire(
        &dest_dir,
        &restore_lock_name(),
        OpKind::Restore,
        correlation_id,
    )?;

    let subject = Subject::target(ctx.volume.clone(), ctx.local.describe());
    let _ = journal.append(Record::new(
        Action::Restore,
        Status::Started,
        subject.clone(),
        correlation_id,
    ));

    let result = execute_steps(ctx, target, journal, cancel);
    match &result {
        Ok(report) => {
            let _ = journal.append(
                Record::new(Action::Restore, Status::Completed, subject, correlation_id)
                    .bytes(report.restored.len() as u64),
            );
        }
        Err(err) => {
            let _ = journal.append(
                Record::new(Action::Restore, Status::Failed, subject, correlation_id)
                    .error("restore", err.to_string()),
            );
        }
    }
    result
}

fn execute_steps(
    ctx: &RestoreContext<'_>,
    target: &RestoreTarget,
    journal: &Journal,
    cancel: &CancelToken,
) -> Result<RestoreReport, RestoreError> {
    let backup_snapshots = ctx.backup.list_snapshots(ctx.prefix, ctx.format)?;
    let mut local_snapshots = ctx.local.list_snapshots(ctx.prefix, ctx.format)?;
    let steps = plan(&backup_snapshots, &local_snapshots, target)?;
    tracing::info!(
        steps = steps.len(),
        backup = %ctx.backup.describe(),
        "restore chain planned"
    );

    let backup_index = chain::index_by_replication_id(&backup_snapshots);
    let mut report = RestoreReport::default();
    for step in steps {
        if cancel.is_cancelled() {
            return Err(RestoreError::StepFailed {
                name: step.name.clone(),
                detail: "cancelled".to_string(),
            });
        }
        // Collision policy: skip unless overwrite, then destroy first.
        let existing = step.replication_id().and_then(|id| {
            local_snapshots
                .iter()
                .find(|s| s.replication_id() == Some(id))
                .cloned()
        });
        if let Some(existing) = existing {
            if ctx.options.overwrite {
                tracing::warn!(name = %existing.name, "overwriting existing local snapshot");
                ctx.local.destroy_snapshot(&existing)?;
                local_snapshots.retain(|s| s.name != existing.name);
            } else {
                tracing::info!(name = %existing.name, "already present locally, skipping");
                report.skipped_existing.push(step.name.clone());
                continue;
            }
        }

        let parent = step
            .parent_uuid
            .and_then(|id| backup_index.get(&id).copied().cloned());
        let request = TransferRequest {
            source: ctx.backup,
            dest: ctx.local,
            snapshot: step.clone(),
            parent,
            shaping: StreamShaping::default(),
            lock_dir: ctx.local.base_dir(),
            dest_id: ctx.local.describe(),
            volume: ctx.volume.clone(),
            require_mount: false,
            force: ctx.options.force,
            space_margin: ctx.space_margin,
            drain_window: ctx.drain_window,
        };
        let outcome = pipeline::run(&request, journal, cancel);
        if let Some(error) = outcome.error {
            return Err(RestoreError::StepFailed {
                name: step.name.clone(),
                detail: error.to_string(),
            });
        }
        local_snapshots = ctx.local.list_snapshots(ctx.prefix, ctx.format)?;
        report.restored.push(step.name.clone());
    }
    Ok(report)
}
