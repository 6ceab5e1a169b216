//! The full configuration surface, end to end through the loader.

use std::io::Write;

use snapsync::config::{self, Compression, Encryption, SnapshotSource};
use snapsync::endpoint::EndpointUrl;

const FULL: &str = r#"
snapshot_dir = "/srv/snapshots"
timestamp_format = "%Y%m%d-%H%M%S"
incremental = true
parallel_volumes = 4
parallel_targets = 2
log_file = "/var/log/snapsync/snapsync.log"
transaction_log = "/var/lib/snapsync/transactions.log"

[retention]
min = "1d"
hourly = 24
daily = 7
weekly = 4
monthly = 12
yearly = 1

[notifications]
email = "admin@example.org"

[[volume]]
path = "/home"
snapshot_prefix = "home-"
enabled = true
source = "native"

[volume.retention]
min = "2h"
hourly = 48
daily = 14
weekly = 0
monthly = 0
yearly = 0

[[volume.target]]
path = "ssh://backup@nas:2222/srv/backups/home"
ssh_sudo = true
ssh_key = "/root/.ssh/id_ed25519"
ssh_password_auth = false
compress = "zstd"
rate_limit = "25M"

[[volume.target]]
path = "raw+ssh://vault/srv/streams/home"
compress = "xz"
encrypt = "gpg"
gpg_recipient = "backups@example.org"

[[volume.target]]
path = "/mnt/external/home"
require_mount = true

[[volume]]
path = "/var/log"
enabled = false

[[volume.target]]
path = "raw:///srv/streams/var-log"
encrypt = "openssl"
"#;

#[test]
fn every_documented_option_parses() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL.as_bytes()).unwrap();
    let config = config::load(file.path()).unwrap();

    assert_eq!(config.parallel_volumes, 4);
    assert_eq!(config.parallel_targets, 2);
    assert!(config.incremental);
    assert_eq!(config.retention.yearly, 1);
    assert!(config.notifications.is_some());
    assert_eq!(config.volumes.len(), 2);

    let home = &config.volumes[0];
    assert_eq!(home.prefix(), "home-");
    assert_eq!(home.source, SnapshotSource::Native);
    let retention = config.effective_retention(home);
    assert_eq!(retention.hourly, 48);
    assert_eq!(retention.min.0, std::time::Duration::from_secs(2 * 3600));

    let ssh = &home.targets[0];
    assert!(ssh.ssh_sudo);
    assert!(!ssh.ssh_password_auth);
    assert_eq!(ssh.compress, Compression::Zstd);
    assert_eq!(ssh.rate_limit.unwrap().0, 25 * 1024 * 1024);
    let url = EndpointUrl::parse(&ssh.path).unwrap();
    assert_eq!(url.ssh().unwrap().port, Some(2222));

    let raw = &home.targets[1];
    assert_eq!(raw.encrypt, Encryption::Gpg);
    assert_eq!(raw.gpg_recipient.as_deref(), Some("backups@example.org"));
    assert!(EndpointUrl::parse(&raw.path).unwrap().is_raw());

    let external = &home.targets[2];
    assert!(external.require_mount);
    assert_eq!(external.compress, Compression::None);

    // Disabled volumes stay parsed but out of the run set.
    assert_eq!(config.enabled_volumes().count(), 1);

    // Snapshot dir falls back to the global (absolute) setting.
    assert_eq!(
        home.snapshot_dir_for(&config),
        std::path::PathBuf::from("/srv/snapshots")
    );
}

#[test]
fn defaults_match_the_documented_baseline() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[[volume]]\npath = \"/home\"\n").unwrap();
    let config = config::load(file.path()).unwrap();

    assert_eq!(config.snapshot_dir, ".snapshots");
    assert_eq!(config.timestamp_format.as_str(), "%Y%m%d-%H%M%S");
    assert!(config.incremental);
    assert_eq!(config.parallel_volumes, 2);
    assert_eq!(config.parallel_targets, 3);
    assert_eq!(config.retention.min.0, std::time::Duration::from_secs(86_400));
    assert_eq!(config.retention.hourly, 24);
    assert_eq!(config.retention.daily, 7);
    assert_eq!(config.retention.weekly, 4);
    assert_eq!(config.retention.monthly, 12);
    assert_eq!(config.retention.yearly, 0);

    let home = &config.volumes[0];
    assert!(home.enabled);
    assert_eq!(home.prefix(), "home-");
    assert_eq!(
        home.snapshot_dir_for(&config),
        std::path::PathBuf::from("/home/.snapshots")
    );
}

#[test]
fn bad_timestamp_format_fails_at_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"timestamp_format = \"%Y%m%d\"\n").unwrap();
    assert!(config::load(file.path()).is_err());
}
