//! Planner behaviour over simulated replication histories.
//!
//! Receives are simulated the way the wire protocol behaves: the
//! destination copy's received_uuid equals the source snapshot's
//! replication id, and its parent_uuid records the parent used.

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use snapsync::Snapshot;
use snapsync::planner::{Plan, plan};

fn ts(h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 1)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
}

fn source_snap(name: &str, h: u32, id: u8) -> Snapshot {
    let mut s = Snapshot::new(name, format!("/home/.snapshots/{name}"), ts(h));
    s.uuid = Some(Uuid::from_bytes([id; 16]));
    s
}

/// Simulate `btrfs receive` of `snapshot` (with `parent`) at a destination.
fn simulate_receive(snapshot: &Snapshot, parent: Option<&Snapshot>, local_id: u8) -> Snapshot {
    let mut received = snapshot.clone();
    received.path = format!("/srv/backups/{}", snapshot.name).into();
    received.uuid = Some(Uuid::from_bytes([local_id; 16]));
    received.received_uuid = snapshot.replication_id();
    received.parent_uuid = parent.and_then(|p| p.replication_id());
    received
}

/// Scenario S1: full transfer first, then incremental with the first as
/// parent, then up to date.
#[test]
fn full_then_incremental() {
    let a = source_snap("home-20260101-000000", 0, 1);
    let b = source_snap("home-20260101-010000", 1, 2);
    let source = vec![a.clone(), b.clone()];
    let mut dest: Vec<Snapshot> = Vec::new();

    // First run bootstraps with the oldest snapshot, full.
    let first = plan(&source, &dest, true);
    let Plan::Send { snapshot, parent } = first else {
        panic!("expected a send");
    };
    assert_eq!(snapshot.name, a.name);
    assert!(parent.is_none());
    dest.push(simulate_receive(&snapshot, None, 100));

    // Second run sends the newer snapshot incrementally against it.
    let second = plan(&source, &dest, true);
    let Plan::Send { snapshot, parent } = second else {
        panic!("expected a send");
    };
    assert_eq!(snapshot.name, b.name);
    let parent = parent.expect("incremental against the bootstrap");
    assert_eq!(parent.name, a.name);
    dest.push(simulate_receive(&snapshot, Some(&parent), 101));

    // Both present: nothing to do, and the destination copies carry the
    // protocol invariant.
    assert!(plan(&source, &dest, true).is_up_to_date());
    for (src, dst) in [(&a, &dest[0]), (&b, &dest[1])] {
        assert_eq!(dst.received_uuid, Some(src.uuid.unwrap()));
    }
    assert_eq!(dest[1].parent_uuid, Some(a.uuid.unwrap()));
}

/// The steady-state cycle: each new snapshot goes incremental against the
/// previous one.
#[test]
fn steady_state_incremental_chain() {
    let mut source = vec![source_snap("home-20260101-000000", 0, 1)];
    let mut dest = vec![simulate_receive(&source[0], None, 100)];

    for hour in 1..5u8 {
        let name = format!("home-20260101-0{hour}0000");
        source.push(source_snap(&name, hour as u32, hour + 1));

        let Plan::Send { snapshot, parent } = plan(&source, &dest, true) else {
            panic!("expected a send at hour {hour}");
        };
        assert_eq!(snapshot.name, name);
        let parent = parent.expect("steady state is incremental");
        assert_eq!(
            parent.name,
            source[source.len() - 2].name,
            "parent is the previous snapshot"
        );
        let received = simulate_receive(&snapshot, Some(&parent), 100 + hour);
        dest.push(received);
    }
    assert!(plan(&source, &dest, true).is_up_to_date());
}

/// Scenario S3 (planner half): destination lost A out-of-band; planning C
/// elects B as parent based on source/destination listings alone. (The
/// pipeline's chain match handles the missing-parent downgrade.)
#[test]
fn parent_election_after_out_of_band_deletion() {
    let a = source_snap("home-20260101-000000", 0, 1);
    let b = source_snap("home-20260101-010000", 1, 2);
    let c = source_snap("home-20260101-020000", 2, 3);
    let source = vec![a.clone(), b.clone(), c.clone()];
    // A was deleted at the destination; only B remains.
    let dest = vec![simulate_receive(&b, Some(&a), 101)];

    let Plan::Send { snapshot, parent } = plan(&source, &dest, true) else {
        panic!("expected a send");
    };
    assert_eq!(snapshot.name, c.name);
    assert_eq!(parent.unwrap().name, b.name);
}

/// A destination relayed through another host still matches: received
/// copies keep the original identity through re-transmission.
#[test]
fn relayed_destination_still_matches() {
    let a = source_snap("home-20260101-000000", 0, 1);
    let source = vec![a.clone()];
    let first_hop = simulate_receive(&a, None, 50);
    let second_hop = simulate_receive(&first_hop, None, 60);
    assert_eq!(second_hop.received_uuid, Some(a.uuid.unwrap()));
    assert!(plan(&source, &[second_hop], true).is_up_to_date());
}
