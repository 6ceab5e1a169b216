//! Snapshot model shared by every endpoint variant.

use std::cmp::Ordering;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A read-only point-in-time image of a subvolume, as seen at one endpoint.
///
/// Immutable after creation; destruction is the only mutation. The name is
/// `{prefix}{timestamp}` in the volume's configured format and uniquely
/// identifies the snapshot within an endpoint+prefix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    /// Location within the owning endpoint (not globally unique).
    pub path: PathBuf,
    /// Instant parsed from the name, naive in the configured format.
    pub timestamp: NaiveDateTime,
    /// Local subvolume uuid, when known (`btrfs subvolume show`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    /// Identity preserved through send/receive. Set on received copies,
    /// unset on snapshots born locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_uuid: Option<Uuid>,
    /// The replication id of the snapshot this one was incrementally
    /// derived from. `None` iff the snapshot was sent as a full stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<Uuid>,
}

impl Snapshot {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, timestamp: NaiveDateTime) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            timestamp,
            uuid: None,
            received_uuid: None,
            parent_uuid: None,
        }
    }

    /// The identity under which this snapshot is matched across endpoints.
    ///
    /// A received copy keeps the original's identity; a locally created
    /// snapshot is identified by its own uuid. Re-transmission to a further
    /// endpoint preserves the result of this method.
    pub fn replication_id(&self) -> Option<Uuid> {
        self.received_uuid.or(self.uuid)
    }

    /// True when this snapshot was materialised from a full stream.
    pub fn is_full(&self) -> bool {
        self.parent_uuid.is_none()
    }
}

impl Ord for Snapshot {
    /// Ascending by timestamp; equal timestamps order by full name so that
    /// independent planners on the same inputs agree across hosts.
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for Snapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Metadata reported by `btrfs subvolume show` (or a raw sidecar).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeInfo {
    pub uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<Uuid>,
    pub readonly: bool,
}
