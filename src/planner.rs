//! Transfer planning: which snapshot to send, against which parent.
//!
//! Planning is a pure function of the two snapshot listings. Equal
//! timestamps order by full name, so independent planners over the same
//! inputs agree on every host.

use std::collections::HashSet;

use uuid::Uuid;

use crate::core::Snapshot;

/// The decision for one (volume, destination) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Destination already holds the latest snapshot.
    UpToDate,
    Send {
        snapshot: Snapshot,
        /// Common ancestor for an incremental stream; `None` sends full.
        parent: Option<Snapshot>,
    },
}

impl Plan {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Plan::UpToDate)
    }
}

/// Plan the next transfer.
///
/// `source` must already be filtered to the volume's prefix and parseable
/// timestamps (the catalog guarantees this). `incremental = false` forces
/// full streams.
///
/// Target selection: with nothing in common yet, bootstrap from the oldest
/// snapshot so every later one can ride an incremental stream; otherwise
/// take the oldest snapshot newer than the newest common ancestor (the
/// steady-state "latest missing"), falling back to the newest missing one
/// when the only gaps are older than history the destination already has.
pub fn plan(source: &[Snapshot], dest: &[Snapshot], incremental: bool) -> Plan {
    let mut source: Vec<&Snapshot> = source.iter().collect();
    source.sort();

    let received_at_dest: HashSet<Uuid> =
        dest.iter().filter_map(|s| s.received_uuid).collect();

    // Source snapshots the destination already holds, matched by the
    // identity that survives send/receive.
    let common: Vec<&Snapshot> = source
        .iter()
        .copied()
        .filter(|s| {
            s.replication_id()
                .map(|id| received_at_dest.contains(&id))
                .unwrap_or(false)
        })
        .collect();
    let common_ids: HashSet<&str> = common.iter().map(|s| s.name.as_str()).collect();

    let missing: Vec<&Snapshot> = source
        .iter()
        .copied()
        .filter(|s| !common_ids.contains(s.name.as_str()))
        .collect();
    let Some(target) = (match (missing.first().copied(), common.last().copied()) {
        (None, _) => None,
        (Some(oldest), None) => Some(oldest),
        (Some(_), Some(newest_common)) => missing
            .iter()
            .copied()
            .find(|&s| s > newest_common)
            .or_else(|| missing.last().copied()),
    }) else {
        return Plan::UpToDate;
    };

    let parent = if incremental {
        common
            .iter()
            .rev()
            .find(|p| p.timestamp < target.timestamp)
            .copied()
            .cloned()
    } else {
        None
    };

    Plan::Send {
        snapshot: target.clone(),
        parent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn src(name: &str, h: u32, id: u8) -> Snapshot {
        let mut s = Snapshot::new(name, format!("/v/.snapshots/{name}"), ts(h, 0));
        s.uuid = Some(uuid::Uuid::from_bytes([id; 16]));
        s
    }

    fn received(name: &str, h: u32, from: u8) -> Snapshot {
        let mut s = Snapshot::new(name, format!("/srv/{name}"), ts(h, 0));
        s.uuid = Some(uuid::Uuid::from_bytes([100 + from; 16]));
        s.received_uuid = Some(uuid::Uuid::from_bytes([from; 16]));
        s
    }

    #[test]
    fn empty_destination_bootstraps_from_the_oldest() {
        let source = vec![src("home-20260101-000000", 0, 1), src("home-20260101-010000", 1, 2)];
        match plan(&source, &[], true) {
            Plan::Send { snapshot, parent } => {
                assert_eq!(snapshot.name, "home-20260101-000000");
                assert!(parent.is_none());
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn gaps_older_than_common_history_resend_the_newest_missing() {
        // Destination holds only the newest snapshot; the older gap does
        // not block steady-state planning.
        let source = vec![
            src("home-20260101-000000", 0, 1),
            src("home-20260101-010000", 1, 2),
            src("home-20260101-020000", 2, 3),
        ];
        let dest = vec![received("home-20260101-020000", 2, 3)];
        match plan(&source, &dest, true) {
            Plan::Send { snapshot, parent } => {
                assert_eq!(snapshot.name, "home-20260101-010000");
                assert!(parent.is_none(), "no common ancestor is older");
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn parent_elected_from_most_recent_common_ancestor() {
        let source = vec![
            src("home-20260101-000000", 0, 1),
            src("home-20260101-010000", 1, 2),
            src("home-20260101-020000", 2, 3),
        ];
        let dest = vec![
            received("home-20260101-000000", 0, 1),
            received("home-20260101-010000", 1, 2),
        ];
        match plan(&source, &dest, true) {
            Plan::Send { snapshot, parent } => {
                assert_eq!(snapshot.name, "home-20260101-020000");
                assert_eq!(parent.unwrap().name, "home-20260101-010000");
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn up_to_date_when_latest_already_received() {
        let source = vec![src("home-20260101-000000", 0, 1)];
        let dest = vec![received("home-20260101-000000", 0, 1)];
        assert!(plan(&source, &dest, true).is_up_to_date());
    }

    #[test]
    fn incremental_disabled_forces_full() {
        let source = vec![src("home-20260101-000000", 0, 1), src("home-20260101-010000", 1, 2)];
        let dest = vec![received("home-20260101-000000", 0, 1)];
        match plan(&source, &dest, false) {
            Plan::Send { parent, .. } => assert!(parent.is_none()),
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn name_matching_alone_is_not_commonality() {
        // Same name at destination but different received identity (the
        // destination copy was deleted and recreated out of band).
        let source = vec![src("home-20260101-000000", 0, 1), src("home-20260101-010000", 1, 2)];
        let dest = vec![received("home-20260101-000000", 0, 9)];
        match plan(&source, &dest, true) {
            Plan::Send { snapshot, parent } => {
                assert_eq!(
                    snapshot.name, "home-20260101-000000",
                    "nothing is common, so bootstrap from the oldest"
                );
                assert!(parent.is_none(), "stale name must not become a parent");
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn planning_is_idempotent() {
        let source = vec![
            src("home-20260101-000000", 0, 1),
            src("home-20260101-010000", 1, 2),
            src("home-20260101-020000", 2, 3),
        ];
        let dest = vec![received("home-20260101-000000", 0, 1)];
        let first = plan(&source, &dest, true);
        for _ in 0..5 {
            assert_eq!(plan(&source, &dest, true), first);
        }
    }

    #[test]
    fn equal_timestamps_break_ties_by_name() {
        let mut a = src("home-20260101-000000", 0, 1);
        let mut b = src("home-20260101-000000-1", 0, 2);
        a.timestamp = ts(0, 0);
        b.timestamp = ts(0, 0);
        let source = vec![b.clone(), a.clone()];
        // The bare name sorts before its collision-suffixed sibling, so it
        // bootstraps first regardless of input order.
        match plan(&source, &[], true) {
            Plan::Send { snapshot, .. } => assert_eq!(snapshot.name, "home-20260101-000000"),
            other => panic!("expected send, got {other:?}"),
        }
    }
}
