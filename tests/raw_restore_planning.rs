//! Restore planning against a real raw endpoint on disk.

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use snapsync::config::{Compression, Encryption};
use snapsync::core::TimestampFormat;
use snapsync::endpoint::{Endpoint, EndpointOptions, RawEndpoint, RawMeta};
use snapsync::restore::{RestoreTarget, plan};
use snapsync::transport::Transport;

fn sidecar(uuid: u8, parent: Option<u8>) -> RawMeta {
    RawMeta {
        uuid: Uuid::from_bytes([uuid; 16]),
        received_uuid: None,
        parent_uuid: parent.map(|p| Uuid::from_bytes([p; 16])),
        compression: Compression::Zstd,
        encryption: Encryption::None,
        bytes: 1024,
        sha256: "ab".repeat(32),
        created_at: Utc::now(),
    }
}

fn backup_dir_with_chain() -> (TempDir, Endpoint) {
    let dir = TempDir::new().unwrap();
    let raw = RawEndpoint::new(
        Transport::local(),
        dir.path().to_path_buf(),
        EndpointOptions::default(),
    );
    // Chain: 000000 (full) ← 010000 ← 020000 ← 030000.
    let names_and_ids = [
        ("home-20260101-000000", 1, None),
        ("home-20260101-010000", 2, Some(1)),
        ("home-20260101-020000", 3, Some(2)),
        ("home-20260101-030000", 4, Some(3)),
    ];
    for (name, id, parent) in names_and_ids {
        let meta = sidecar(id, parent);
        raw.write_sidecar(name, &meta).unwrap();
        std::fs::write(dir.path().join(meta.data_file_name(name)), b"stream").unwrap();
    }
    let endpoint = Endpoint::Raw(RawEndpoint::new(
        Transport::local(),
        dir.path().to_path_buf(),
        EndpointOptions::default(),
    ));
    (dir, endpoint)
}

#[test]
fn raw_listing_feeds_the_restore_planner() {
    let (_dir, backup) = backup_dir_with_chain();
    let format = TimestampFormat::default();
    let snapshots = backup.list_snapshots("home-", &format).unwrap();
    assert_eq!(snapshots.len(), 4);
    // Sidecars without received_uuid expose their own uuid as identity.
    assert_eq!(
        snapshots[0].received_uuid,
        Some(Uuid::from_bytes([1; 16]))
    );

    let steps = plan(&snapshots, &[], &RestoreTarget::Latest).unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "home-20260101-000000",
            "home-20260101-010000",
            "home-20260101-020000",
            "home-20260101-030000",
        ]
    );
}

#[test]
fn local_prefix_is_pruned_from_the_replay() {
    let (_dir, backup) = backup_dir_with_chain();
    let format = TimestampFormat::default();
    let snapshots = backup.list_snapshots("home-", &format).unwrap();

    // The local side already restored the first two elements.
    let local: Vec<snapsync::Snapshot> = snapshots[..2]
        .iter()
        .map(|s| {
            let mut copy = s.clone();
            copy.uuid = Some(Uuid::new_v4());
            copy.received_uuid = s.replication_id();
            copy
        })
        .collect();

    let steps = plan(&snapshots, &local, &RestoreTarget::Latest).unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["home-20260101-020000", "home-20260101-030000"]);
}

#[test]
fn chain_match_probe_sees_raw_identities() {
    let (_dir, backup) = backup_dir_with_chain();
    assert!(backup
        .holds_replication_id(Uuid::from_bytes([2; 16]))
        .unwrap());
    assert!(!backup
        .holds_replication_id(Uuid::from_bytes([99; 16]))
        .unwrap());
}

#[test]
fn subvolume_show_equivalent_reads_the_sidecar() {
    let (_dir, backup) = backup_dir_with_chain();
    let info = backup
        .subvolume_show(std::path::Path::new("home-20260101-010000"))
        .unwrap();
    assert_eq!(info.uuid, Uuid::from_bytes([2; 16]));
    assert_eq!(info.parent_uuid, Some(Uuid::from_bytes([1; 16])));
    assert!(info.readonly);
}
