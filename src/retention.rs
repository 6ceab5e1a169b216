//! Time-bucketed retention with chain protection.
//!
//! Buckets partition time into hours, days, ISO weeks, calendar months and
//! years in the system-local timezone. For each of the most recent `k`
//! non-empty intervals of a bucket the earliest snapshot is elected keeper
//! (earliest preserves parent chains). A snapshot elected by any bucket is
//! kept; chain protection then pulls in every ancestor a keeper depends on.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::config::RetentionConfig;
use crate::core::{Snapshot, chain};

/// Fully-typed retention policy, converted from the config form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub min_age: Duration,
    pub hourly: u32,
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

impl Policy {
    pub fn keep_nothing() -> Self {
        Self {
            min_age: Duration::ZERO,
            hourly: 0,
            daily: 0,
            weekly: 0,
            monthly: 0,
            yearly: 0,
        }
    }
}

impl From<&RetentionConfig> for Policy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            min_age: config.min.0,
            hourly: config.hourly,
            daily: config.daily,
            weekly: config.weekly,
            monthly: config.monthly,
            yearly: config.yearly,
        }
    }
}

/// Disjoint partition of the input: `keep ∪ prune = all`, `keep ∩ prune = ∅`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub keep: Vec<Snapshot>,
    pub prune: Vec<Snapshot>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Interval {
    Hour(i32, u32, u32, u32),
    Day(i32, u32, u32),
    /// ISO week (year may differ from the calendar year at boundaries).
    Week(i32, u32),
    Month(i32, u32),
    Year(i32),
}

fn interval_of(bucket: Bucket, ts: NaiveDateTime) -> Interval {
    match bucket {
        Bucket::Hourly => Interval::Hour(ts.year(), ts.month(), ts.day(), ts.hour()),
        Bucket::Daily => Interval::Day(ts.year(), ts.month(), ts.day()),
        Bucket::Weekly => {
            let week = ts.iso_week();
            Interval::Week(week.year(), week.week())
        }
        Bucket::Monthly => Interval::Month(ts.year(), ts.month()),
        Bucket::Yearly => Interval::Year(ts.year()),
    }
}

#[derive(Clone, Copy, Debug)]
enum Bucket {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Evaluate the policy over `snapshots` (any order) at instant `now`.
///
/// `chain_protect` additionally keeps every endpoint-local ancestor of a
/// keeper; destinations always run with it on, since evicting an ancestor
/// would break future incremental transfers.
pub fn evaluate(
    snapshots: &[Snapshot],
    now: NaiveDateTime,
    policy: &Policy,
    chain_protect: bool,
) -> Evaluation {
    let mut ordered: Vec<&Snapshot> = snapshots.iter().collect();
    ordered.sort();

    let min_age = chrono::Duration::from_std(policy.min_age).unwrap_or(chrono::Duration::MAX);
    let mut keep_names: HashSet<&str> = ordered
        .iter()
        .filter(|s| now.signed_duration_since(s.timestamp) < min_age)
        .map(|s| s.name.as_str())
        .collect();

    let buckets = [
        (Bucket::Hourly, policy.hourly),
        (Bucket::Daily, policy.daily),
        (Bucket::Weekly, policy.weekly),
        (Bucket::Monthly, policy.monthly),
        (Bucket::Yearly, policy.yearly),
    ];
    for (bucket, count) in buckets {
        if count == 0 {
            continue;
        }
        elect_keepers(&ordered, now, min_age, bucket, count, &mut keep_names);
    }

    if chain_protect {
        protect_chains(snapshots, &mut keep_names);
    }

    let mut evaluation = Evaluation::default();
    for snapshot in ordered {
        if keep_names.contains(snapshot.name.as_str()) {
            evaluation.keep.push(snapshot.clone());
        } else {
            evaluation.prune.push(snapshot.clone());
        }
    }
    evaluation
}

/// Earliest snapshot per interval, over the `count` most recent non-empty
/// intervals of this bucket.
fn elect_keepers<'a>(
    ordered: &[&'a Snapshot],
    now: NaiveDateTime,
    min_age: chrono::Duration,
    bucket: Bucket,
    count: u32,
    keep: &mut HashSet<&'a str>,
) {
    // Bucket election runs over snapshots past the age floor; younger ones
    // are already protected wholesale.
    let eligible: Vec<&'a Snapshot> = ordered
        .iter()
        .copied()
        .filter(|s| now.signed_duration_since(s.timestamp) >= min_age)
        .collect();

    let mut intervals: Vec<(Interval, &'a Snapshot)> = Vec::new();
    for snapshot in eligible {
        let interval = interval_of(bucket, snapshot.timestamp);
        match intervals.last_mut() {
            Some((last, _)) if *last == interval => {}
            _ => intervals.push((interval, snapshot)),
        }
    }
    // `ordered` is ascending, so the first snapshot seen per interval is the
    // earliest in it; the most recent `count` intervals are at the tail.
    let start = intervals.len().saturating_sub(count as usize);
    for (_, earliest) in &intervals[start..] {
        keep.insert(earliest.name.as_str());
    }
}

fn protect_chains<'a>(snapshots: &'a [Snapshot], keep: &mut HashSet<&'a str>) {
    let index = chain::index_by_replication_id(snapshots);
    let keepers: Vec<&Snapshot> = snapshots
        .iter()
        .filter(|s| keep.contains(s.name.as_str()))
        .collect();
    for keeper in keepers {
        for ancestor in chain::ancestors(keeper, &index) {
            keep.insert(ancestor.name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn snap(day: u32, hour: u32) -> Snapshot {
        let name = format!("home-202601{day:02}-{hour:02}0000");
        Snapshot::new(name.clone(), format!("/s/{name}"), at(day, hour))
    }

    fn policy(min: Duration, hourly: u32, daily: u32) -> Policy {
        Policy {
            min_age: min,
            hourly,
            daily,
            weekly: 0,
            monthly: 0,
            yearly: 0,
        }
    }

    /// 25 hourly snapshots, `{min=0, hourly=24, daily=7}` keeps all of them.
    #[test]
    fn hourly_and_daily_buckets_union() {
        let mut snapshots: Vec<Snapshot> = (0..24).map(|h| snap(1, h)).collect();
        snapshots.push(snap(2, 0));
        let now = at(2, 0);

        let full = evaluate(&snapshots, now, &policy(Duration::ZERO, 24, 7), false);
        assert_eq!(full.keep.len(), 25);
        assert!(full.prune.is_empty());

        let tight = evaluate(&snapshots, now, &policy(Duration::ZERO, 3, 1), false);
        let kept: Vec<&str> = tight.keep.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            kept,
            vec![
                "home-20260101-220000",
                "home-20260101-230000",
                "home-20260102-000000",
            ]
        );
        assert_eq!(tight.prune.len(), 22);
    }

    #[test]
    fn min_age_floor_protects_young_snapshots() {
        let snapshots: Vec<Snapshot> = (0..6).map(|h| snap(1, h)).collect();
        let now = at(1, 6);
        let result = evaluate(
            &snapshots,
            now,
            &policy(Duration::from_secs(3 * 3600), 0, 0),
            false,
        );
        // Hours 4 and 5 are younger than 3h (and hour 3 is exactly at the
        // floor, which does not protect).
        let kept: Vec<&str> = result.keep.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(kept, vec!["home-20260101-040000", "home-20260101-050000"]);
    }

    #[test]
    fn earliest_per_interval_is_the_keeper() {
        let mut snapshots = Vec::new();
        for minute in [0u32, 20, 40] {
            let name = format!("home-20260101-00{minute:02}00");
            snapshots.push(Snapshot::new(
                name.clone(),
                format!("/s/{name}"),
                NaiveDate::from_ymd_opt(2026, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, minute, 0)
                    .unwrap(),
            ));
        }
        let result = evaluate(&snapshots, at(1, 1), &policy(Duration::ZERO, 1, 0), false);
        let kept: Vec<&str> = result.keep.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(kept, vec!["home-20260101-000000"]);
    }

    #[test]
    fn partition_is_exact() {
        let snapshots: Vec<Snapshot> = (0..10).map(|h| snap(1, h)).collect();
        let result = evaluate(&snapshots, at(1, 10), &policy(Duration::ZERO, 4, 0), false);
        assert_eq!(result.keep.len() + result.prune.len(), snapshots.len());
        let keep: HashSet<_> = result.keep.iter().map(|s| &s.name).collect();
        assert!(result.prune.iter().all(|s| !keep.contains(&s.name)));
    }

    /// Monotonicity: a policy that keeps at least as much per bucket keeps a
    /// superset of snapshots.
    #[test]
    fn retention_is_monotone_in_bucket_counts() {
        let mut snapshots: Vec<Snapshot> = (0..24).map(|h| snap(1, h)).collect();
        snapshots.extend((0..24).map(|h| snap(2, h)));
        let now = at(2, 23);
        for (small, large) in [((2, 1), (4, 1)), ((3, 0), (3, 2)), ((0, 1), (5, 7))] {
            let p1 = policy(Duration::ZERO, small.0, small.1);
            let p2 = policy(Duration::ZERO, large.0, large.1);
            let k1: HashSet<String> = evaluate(&snapshots, now, &p1, false)
                .keep
                .into_iter()
                .map(|s| s.name)
                .collect();
            let k2: HashSet<String> = evaluate(&snapshots, now, &p2, false)
                .keep
                .into_iter()
                .map(|s| s.name)
                .collect();
            assert!(k1.is_subset(&k2), "{small:?} ⊑ {large:?} violated");
        }
    }

    /// Chain protection: ancestors of keepers survive even when their own
    /// bucket would evict them.
    #[test]
    fn chain_protection_keeps_ancestors() {
        let mut a = snap(1, 0);
        a.uuid = Some(Uuid::from_bytes([1; 16]));
        a.received_uuid = Some(Uuid::from_bytes([1; 16]));
        let mut b = snap(1, 12);
        b.uuid = Some(Uuid::from_bytes([2; 16]));
        b.received_uuid = Some(Uuid::from_bytes([2; 16]));
        b.parent_uuid = Some(Uuid::from_bytes([1; 16]));
        let mut c = snap(2, 0);
        c.uuid = Some(Uuid::from_bytes([3; 16]));
        c.received_uuid = Some(Uuid::from_bytes([3; 16]));
        c.parent_uuid = Some(Uuid::from_bytes([2; 16]));
        let snapshots = vec![a, b, c];
        let now = at(2, 1);

        let unprotected = evaluate(&snapshots, now, &policy(Duration::ZERO, 1, 0), false);
        assert_eq!(unprotected.keep.len(), 1);

        let protected = evaluate(&snapshots, now, &policy(Duration::ZERO, 1, 0), true);
        let kept: HashSet<&str> = protected.keep.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(kept.len(), 3, "whole ancestor chain must survive");

        // Property 2: every kept snapshot's ancestors are kept.
        let index = chain::index_by_replication_id(&snapshots);
        for snapshot in &protected.keep {
            for ancestor in chain::ancestors(snapshot, &index) {
                assert!(kept.contains(ancestor.name.as_str()));
            }
        }
    }

    #[test]
    fn weekly_buckets_use_iso_weeks() {
        // 2026-01-04 is a Sunday (ISO week 1), 2026-01-05 a Monday (week 2).
        let mut sunday = snap(4, 12);
        let mut monday = snap(5, 12);
        sunday.name = "home-20260104-120000".into();
        monday.name = "home-20260105-120000".into();
        let snapshots = vec![sunday, monday];
        let p = Policy {
            min_age: Duration::ZERO,
            hourly: 0,
            daily: 0,
            weekly: 1,
            monthly: 0,
            yearly: 0,
        };
        let result = evaluate(&snapshots, at(6, 0), &p, false);
        let kept: Vec<&str> = result.keep.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(kept, vec!["home-20260105-120000"]);
    }
}
