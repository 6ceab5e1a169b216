//! Retention over realistic snapshot populations.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use snapsync::Snapshot;
use snapsync::core::chain;
use snapsync::retention::{Policy, evaluate};

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn snap(day: u32, hour: u32) -> Snapshot {
    let name = format!("home-202601{day:02}-{hour:02}0000");
    Snapshot::new(name.clone(), format!("/home/.snapshots/{name}"), at(day, hour))
}

fn policy(hourly: u32, daily: u32) -> Policy {
    Policy {
        min_age: Duration::ZERO,
        hourly,
        daily,
        weekly: 0,
        monthly: 0,
        yearly: 0,
    }
}

/// 25 hourly snapshots from 2026-01-01T00:00 through 2026-01-02T00:00.
fn twenty_five_hours() -> Vec<Snapshot> {
    let mut snapshots: Vec<Snapshot> = (0..24).map(|h| snap(1, h)).collect();
    snapshots.push(snap(2, 0));
    snapshots
}

#[test]
fn generous_buckets_keep_everything() {
    let snapshots = twenty_five_hours();
    let result = evaluate(&snapshots, at(2, 0), &policy(24, 7), false);
    assert_eq!(result.keep.len(), 25);
    assert!(result.prune.is_empty());
}

#[test]
fn tight_buckets_keep_three() {
    let snapshots = twenty_five_hours();
    let result = evaluate(&snapshots, at(2, 0), &policy(3, 1), false);
    let kept: Vec<&str> = result.keep.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        kept,
        [
            "home-20260101-220000",
            "home-20260101-230000",
            "home-20260102-000000",
        ]
    );
    assert_eq!(result.prune.len(), 22);
}

#[test]
fn evaluation_is_stable_under_input_order() {
    let mut snapshots = twenty_five_hours();
    snapshots.reverse();
    let shuffled = evaluate(&snapshots, at(2, 0), &policy(3, 1), false);
    snapshots.reverse();
    let ordered = evaluate(&snapshots, at(2, 0), &policy(3, 1), false);
    assert_eq!(shuffled, ordered);
}

/// A destination-shaped population: incremental chain where pruning any
/// keeper's ancestor would break future transfers.
#[test]
fn destination_chains_survive_aggressive_policies() {
    let mut snapshots = Vec::new();
    let mut previous: Option<Uuid> = None;
    for (i, hour) in (0..24).enumerate() {
        let mut s = snap(1, hour);
        let id = Uuid::from_bytes([i as u8 + 1; 16]);
        s.uuid = Some(Uuid::from_bytes([200 + i as u8; 16]));
        s.received_uuid = Some(id);
        s.parent_uuid = previous;
        previous = Some(id);
        snapshots.push(s);
    }

    let result = evaluate(&snapshots, at(1, 23), &policy(1, 0), true);
    // The hourly keeper is the newest hour, and the whole chain under it
    // must survive.
    assert_eq!(result.keep.len(), snapshots.len());
    assert!(result.prune.is_empty());

    // Property: every kept snapshot's ancestor set is kept.
    let kept: HashSet<&str> = result.keep.iter().map(|s| s.name.as_str()).collect();
    let index = chain::index_by_replication_id(&snapshots);
    for snapshot in &result.keep {
        for ancestor in chain::ancestors(snapshot, &index) {
            assert!(kept.contains(ancestor.name.as_str()));
        }
    }
}

/// Independent full snapshots on a destination prune normally even with
/// chain protection on.
#[test]
fn chain_protection_does_not_pin_full_snapshots() {
    let mut snapshots = Vec::new();
    for (i, hour) in (0..6).enumerate() {
        let mut s = snap(1, hour);
        s.uuid = Some(Uuid::from_bytes([i as u8 + 1; 16]));
        s.received_uuid = Some(Uuid::from_bytes([100 + i as u8; 16]));
        snapshots.push(s);
    }
    let result = evaluate(&snapshots, at(1, 6), &policy(2, 0), true);
    assert_eq!(result.keep.len(), 2);
    assert_eq!(result.prune.len(), 4);
}

#[test]
fn monotonicity_across_policy_lattice() {
    let mut snapshots = twenty_five_hours();
    snapshots.extend((1..=12).map(|h| snap(2, h)));
    let now = at(2, 12);
    let policies = [
        policy(0, 0),
        policy(1, 0),
        policy(1, 1),
        policy(3, 1),
        policy(3, 2),
        policy(24, 2),
        policy(24, 7),
    ];
    for pair in policies.windows(2) {
        let small: HashSet<String> = evaluate(&snapshots, now, &pair[0], false)
            .keep
            .into_iter()
            .map(|s| s.name)
            .collect();
        let large: HashSet<String> = evaluate(&snapshots, now, &pair[1], false)
            .keep
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert!(
            small.is_subset(&large),
            "keep({:?}) ⊄ keep({:?})",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn min_age_floor_beats_empty_buckets() {
    let snapshots = twenty_five_hours();
    let p = Policy {
        min_age: Duration::from_secs(6 * 3600),
        hourly: 0,
        daily: 0,
        weekly: 0,
        monthly: 0,
        yearly: 0,
    };
    let result = evaluate(&snapshots, at(2, 0), &p, false);
    // Snapshots younger than six hours survive with no buckets at all:
    // hours 19..23 of the first day plus the midnight snapshot.
    assert_eq!(result.keep.len(), 6);
    assert!(result.keep.iter().all(|s| s.timestamp > at(1, 18)));
}
