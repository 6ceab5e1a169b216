//! Parent-chain arithmetic over endpoint-local snapshot sets.
//!
//! Edges are recorded at receive time: a snapshot's `parent_uuid` names the
//! replication id of the snapshot it was incrementally derived from. Per
//! endpoint every snapshot has at most one parent edge, so chains are linear
//! and the filesystem guarantees acyclicity; the walks below still carry a
//! visited set so corrupt metadata degrades to a short chain instead of a
//! spin.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::snapshot::Snapshot;

/// Index a snapshot set by replication id for chain lookups.
pub fn index_by_replication_id(snapshots: &[Snapshot]) -> HashMap<Uuid, &Snapshot> {
    snapshots
        .iter()
        .filter_map(|s| s.replication_id().map(|id| (id, s)))
        .collect()
}

/// All ancestors of `snapshot` present in `index`, nearest first.
pub fn ancestors<'a>(
    snapshot: &Snapshot,
    index: &HashMap<Uuid, &'a Snapshot>,
) -> Vec<&'a Snapshot> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = snapshot.parent_uuid;
    while let Some(id) = cursor {
        if !seen.insert(id) {
            break;
        }
        match index.get(&id) {
            Some(parent) => {
                out.push(*parent);
                cursor = parent.parent_uuid;
            }
            None => break,
        }
    }
    out
}

/// The chain rooted at a full snapshot and ending at `target`, oldest first.
///
/// Returns `None` for the root when the walk leaves the set before reaching
/// a full snapshot; callers decide whether a dangling root is an error (it
/// is for restore, it is not for retention protection).
pub fn chain_to<'a>(
    target: &'a Snapshot,
    index: &HashMap<Uuid, &'a Snapshot>,
) -> Vec<&'a Snapshot> {
    let mut chain = ancestors(target, index);
    chain.reverse();
    chain.push(target);
    chain
}
