//! Snapshot name construction and parsing.

use chrono::NaiveDateTime;

use super::timefmt::TimestampFormat;

/// Parse `{prefix}{timestamp}[-N]` into its timestamp.
///
/// The `-N` suffix is the same-second collision discriminator; suffixed
/// names parse to the same timestamp and order after the bare name
/// lexicographically. Anything else that fails the format is not ours.
pub fn parse_snapshot_name(
    name: &str,
    prefix: &str,
    format: &TimestampFormat,
) -> Option<NaiveDateTime> {
    let tail = name.strip_prefix(prefix)?;
    if let Some(ts) = format.parse(tail) {
        return Some(ts);
    }
    let (stem, suffix) = tail.rsplit_once('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    format.parse(stem)
}

pub fn render_snapshot_name(prefix: &str, format: &TimestampFormat, ts: NaiveDateTime) -> String {
    format!("{prefix}{}", format.format(ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_names() {
        let fmt = TimestampFormat::default();
        let ts = parse_snapshot_name("home-20260101-123456", "home-", &fmt).unwrap();
        assert_eq!(fmt.format(ts), "20260101-123456");
        let suffixed = parse_snapshot_name("home-20260101-123456-2", "home-", &fmt).unwrap();
        assert_eq!(suffixed, ts);
    }

    #[test]
    fn rejects_foreign_names() {
        let fmt = TimestampFormat::default();
        assert!(parse_snapshot_name("other-20260101-123456", "home-", &fmt).is_none());
        assert!(parse_snapshot_name("home-manual-backup", "home-", &fmt).is_none());
        assert!(parse_snapshot_name("home-20260101-123456-x", "home-", &fmt).is_none());
    }

    #[test]
    fn render_joins_prefix_and_timestamp() {
        let fmt = TimestampFormat::default();
        let ts = fmt.parse("20260101-000000").unwrap();
        assert_eq!(
            render_snapshot_name("home-", &fmt, ts),
            "home-20260101-000000"
        );
    }
}
