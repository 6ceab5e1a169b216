//! btrfs command construction and output parsing.
//!
//! Everything here is pure: argv builders feed the transport, parsers
//! consume captured stdout. Keeping both sides free of I/O makes the whole
//! surface unit-testable without a btrfs filesystem.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::core::SubvolumeInfo;

pub fn snapshot_argv(source: &Path, dest: &Path, readonly: bool) -> Vec<String> {
    let mut argv = vec![
        "btrfs".to_string(),
        "subvolume".to_string(),
        "snapshot".to_string(),
    ];
    if readonly {
        argv.push("-r".to_string());
    }
    argv.push(source.display().to_string());
    argv.push(dest.display().to_string());
    argv
}

pub fn send_argv(snapshot: &Path, parent: Option<&Path>, no_data: bool) -> Vec<String> {
    let mut argv = vec!["btrfs".to_string(), "send".to_string(), "-q".to_string()];
    if no_data {
        argv.push("--no-data".to_string());
    }
    if let Some(parent) = parent {
        argv.push("-p".to_string());
        argv.push(parent.display().to_string());
    }
    argv.push(snapshot.display().to_string());
    argv
}

pub fn receive_argv(dest_dir: &Path) -> Vec<String> {
    vec![
        "btrfs".to_string(),
        "receive".to_string(),
        "-q".to_string(),
        dest_dir.display().to_string(),
    ]
}

pub fn delete_argv(path: &Path) -> Vec<String> {
    vec![
        "btrfs".to_string(),
        "subvolume".to_string(),
        "delete".to_string(),
        path.display().to_string(),
    ]
}

pub fn make_writable_argv(path: &Path) -> Vec<String> {
    vec![
        "btrfs".to_string(),
        "property".to_string(),
        "set".to_string(),
        "-ts".to_string(),
        path.display().to_string(),
        "ro".to_string(),
        "false".to_string(),
    ]
}

pub fn subvolume_sync_argv(dir: &Path) -> Vec<String> {
    vec![
        "btrfs".to_string(),
        "subvolume".to_string(),
        "sync".to_string(),
        dir.display().to_string(),
    ]
}

pub fn show_argv(path: &Path) -> Vec<String> {
    vec![
        "btrfs".to_string(),
        "subvolume".to_string(),
        "show".to_string(),
        path.display().to_string(),
    ]
}

/// Direct-child subvolumes of `dir` with all three uuid columns.
pub fn list_argv(dir: &Path) -> Vec<String> {
    vec![
        "btrfs".to_string(),
        "subvolume".to_string(),
        "list".to_string(),
        "-o".to_string(),
        "-u".to_string(),
        "-q".to_string(),
        "-R".to_string(),
        dir.display().to_string(),
    ]
}

pub fn df_avail_argv(path: &Path) -> Vec<String> {
    vec![
        "df".to_string(),
        "-B1".to_string(),
        "--output=avail".to_string(),
        "--".to_string(),
        path.display().to_string(),
    ]
}

pub fn qgroup_argv(path: &Path) -> Vec<String> {
    vec![
        "btrfs".to_string(),
        "qgroup".to_string(),
        "show".to_string(),
        "-e".to_string(),
        "-f".to_string(),
        "--raw".to_string(),
        path.display().to_string(),
    ]
}

pub fn mkdir_argv(path: &Path) -> Vec<String> {
    vec![
        "mkdir".to_string(),
        "-p".to_string(),
        path.display().to_string(),
    ]
}

/// One row of `btrfs subvolume list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedSubvolume {
    pub path: PathBuf,
    pub uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
    pub parent_uuid: Option<Uuid>,
}

impl ListedSubvolume {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Parse `btrfs subvolume list -o -u -q -R` output.
///
/// Rows look like
/// `ID 270 gen 32 top level 5 parent_uuid - received_uuid <u> uuid <u> path sub/name`;
/// the path field runs to end of line and may contain spaces, so it is
/// split off first and the remainder scanned as key/value tokens.
pub fn parse_list(stdout: &str) -> Vec<ListedSubvolume> {
    let mut out = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(idx) = line.find(" path ") else {
            continue;
        };
        let path = PathBuf::from(&line[idx + " path ".len()..]);
        let head = &line[..idx];
        let mut uuid = None;
        let mut received_uuid = None;
        let mut parent_uuid = None;
        let tokens: Vec<&str> = head.split_whitespace().collect();
        let mut i = 0;
        while i + 1 < tokens.len() {
            match tokens[i] {
                "uuid" => uuid = parse_uuid_field(tokens[i + 1]),
                "received_uuid" => received_uuid = parse_uuid_field(tokens[i + 1]),
                "parent_uuid" => parent_uuid = parse_uuid_field(tokens[i + 1]),
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
        out.push(ListedSubvolume {
            path,
            uuid,
            received_uuid,
            parent_uuid,
        });
    }
    out
}

/// Parse `btrfs subvolume show` output.
pub fn parse_show(stdout: &str) -> Option<SubvolumeInfo> {
    let mut uuid = None;
    let mut received_uuid = None;
    let mut parent_uuid = None;
    let mut readonly = false;
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("UUID:") {
            uuid = parse_uuid_field(value.trim());
        } else if let Some(value) = line.strip_prefix("Received UUID:") {
            received_uuid = parse_uuid_field(value.trim());
        } else if let Some(value) = line.strip_prefix("Parent UUID:") {
            parent_uuid = parse_uuid_field(value.trim());
        } else if let Some(value) = line.strip_prefix("Flags:") {
            readonly = value.split(',').any(|f| f.trim() == "readonly");
        }
    }
    Some(SubvolumeInfo {
        uuid: uuid?,
        received_uuid,
        parent_uuid,
        readonly,
    })
}

fn parse_uuid_field(field: &str) -> Option<Uuid> {
    if field == "-" {
        return None;
    }
    let parsed = Uuid::parse_str(field).ok()?;
    if parsed.is_nil() { None } else { Some(parsed) }
}

/// Parse `df -B1 --output=avail` output (header line plus one number).
pub fn parse_df_avail(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().parse::<u64>().ok())
}

/// Best-effort quota headroom from `btrfs qgroup show -e -f --raw`.
///
/// Returns `None` when quotas are off, the output is unrecognised, or no
/// exclusive limit is set.
pub fn parse_qgroup_free(stdout: &str) -> Option<u64> {
    for line in stdout.lines().rev() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || !fields[0].contains('/') {
            continue;
        }
        let excl: u64 = fields[2].parse().ok()?;
        let max_excl = fields[3];
        if max_excl == "none" || max_excl == "-" {
            return None;
        }
        let max_excl: u64 = max_excl.parse().ok()?;
        return Some(max_excl.saturating_sub(excl));
    }
    None
}

/// Decode the octal escapes /proc/mounts uses for spaces and friends.
fn decode_mounts_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3
                && let Ok(code) = u8::from_str_radix(&digits, 8)
            {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Filesystem type of the longest mount-point prefix of `path`.
pub fn fs_type_for(mounts: &str, path: &Path) -> Option<String> {
    let mut best: Option<(PathBuf, String)> = None;
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let mount_point = PathBuf::from(decode_mounts_field(fields[1]));
        let fs_type = fields[2];
        if path.starts_with(&mount_point)
            && best
                .as_ref()
                .map(|(b, _)| mount_point.as_os_str().len() > b.as_os_str().len())
                .unwrap_or(true)
        {
            best = Some((mount_point, fs_type.to_string()));
        }
    }
    best.map(|(_, t)| t)
}

pub fn is_btrfs(mounts: &str, path: &Path) -> bool {
    fs_type_for(mounts, path).as_deref() == Some("btrfs")
}

/// Whether `path` is itself a mount point.
pub fn is_mount_point(mounts: &str, path: &Path) -> bool {
    mounts.lines().any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        fields.len() >= 2 && PathBuf::from(decode_mounts_field(fields[1])) == path
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_OUTPUT: &str = "\
ID 270 gen 32 top level 5 parent_uuid - received_uuid - uuid 5e076fb9-5329-4d4a-b44e-2be08e24ba24 path .snapshots/home-20260101-000000
ID 271 gen 40 top level 5 parent_uuid 5e076fb9-5329-4d4a-b44e-2be08e24ba24 received_uuid 9c9d8e1f-7a7b-4444-9999-aaaaaaaaaaaa uuid 0e1d2c3b-0000-4d4a-b44e-2be08e24ba99 path .snapshots/home with space-20260101-010000
";

    #[test]
    fn list_parses_uuids_and_paths() {
        let rows = parse_list(LIST_OUTPUT);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].path,
            PathBuf::from(".snapshots/home-20260101-000000")
        );
        assert!(rows[0].uuid.is_some());
        assert!(rows[0].received_uuid.is_none());
        assert!(rows[0].parent_uuid.is_none());
        assert_eq!(
            rows[1].file_name(),
            Some("home with space-20260101-010000")
        );
        assert!(rows[1].parent_uuid.is_some());
        assert!(rows[1].received_uuid.is_some());
    }

    const SHOW_OUTPUT: &str = "\
home-20260101-000000
\tName: \t\t\thome-20260101-000000
\tUUID: \t\t\t5e076fb9-5329-4d4a-b44e-2be08e24ba24
\tParent UUID: \t\t-
\tReceived UUID: \t\t9c9d8e1f-7a7b-4444-9999-aaaaaaaaaaaa
\tCreation time: \t\t2026-01-01 00:00:00 +0000
\tFlags: \t\t\treadonly
";

    #[test]
    fn show_parses_info() {
        let info = parse_show(SHOW_OUTPUT).unwrap();
        assert_eq!(
            info.uuid,
            Uuid::parse_str("5e076fb9-5329-4d4a-b44e-2be08e24ba24").unwrap()
        );
        assert!(info.parent_uuid.is_none());
        assert!(info.received_uuid.is_some());
        assert!(info.readonly);
    }

    #[test]
    fn show_without_uuid_is_none() {
        assert!(parse_show("garbage\n").is_none());
    }

    #[test]
    fn nil_uuid_reads_as_unset() {
        assert!(parse_uuid_field("00000000-0000-0000-0000-000000000000").is_none());
        assert!(parse_uuid_field("-").is_none());
    }

    #[test]
    fn df_avail_takes_the_number() {
        assert_eq!(parse_df_avail("     Avail\n1073741824\n"), Some(1_073_741_824));
        assert_eq!(parse_df_avail(""), None);
    }

    #[test]
    fn qgroup_free_is_best_effort() {
        let with_limit = "\
Qgroupid    Referenced    Exclusive   Max exclusive\n\
--------    ----------    ---------   -------------\n\
0/270       1048576       524288      2097152\n";
        assert_eq!(parse_qgroup_free(with_limit), Some(2_097_152 - 524_288));
        let no_limit = "0/270 1048576 524288 none\n";
        assert_eq!(parse_qgroup_free(no_limit), None);
        assert_eq!(parse_qgroup_free("ERROR: can't list qgroups\n"), None);
    }

    const MOUNTS: &str = "\
/dev/root / ext4 rw 0 0
/dev/sdb1 /mnt/backups btrfs rw,compress=zstd 0 0
/dev/sdc1 /mnt/with\\040space btrfs rw 0 0
";

    #[test]
    fn fs_type_uses_longest_prefix() {
        assert_eq!(
            fs_type_for(MOUNTS, Path::new("/mnt/backups/home")).as_deref(),
            Some("btrfs")
        );
        assert_eq!(fs_type_for(MOUNTS, Path::new("/etc")).as_deref(), Some("ext4"));
        assert!(is_btrfs(MOUNTS, Path::new("/mnt/backups")));
        assert!(!is_btrfs(MOUNTS, Path::new("/home")));
    }

    #[test]
    fn mounts_octal_escapes_decode() {
        assert!(is_btrfs(MOUNTS, Path::new("/mnt/with space/sub")));
        assert!(is_mount_point(MOUNTS, Path::new("/mnt/with space")));
        assert!(!is_mount_point(MOUNTS, Path::new("/mnt/with space/sub")));
    }

    #[test]
    fn send_argv_shapes() {
        let full = send_argv(Path::new("/s/a"), None, false);
        assert_eq!(full, ["btrfs", "send", "-q", "/s/a"]);
        let incr = send_argv(Path::new("/s/b"), Some(Path::new("/s/a")), false);
        assert_eq!(incr, ["btrfs", "send", "-q", "-p", "/s/a", "/s/b"]);
        let dry = send_argv(Path::new("/s/b"), Some(Path::new("/s/a")), true);
        assert!(dry.contains(&"--no-data".to_string()));
    }
}
