//! Retention evaluation: which snapshots to keep, delete and archive.

use super::bucket::bin_index;
use chrono::NaiveDateTime;
use common::KeepConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Timestamps of one namespace (local snapshots or one destination).
pub type TimestampSet = BTreeSet<NaiveDateTime>;

/// A retention tier: the oldest entity of each of the `amount` most recent
/// bins of width `interval` is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionRule {
    pub interval: Duration,
    pub amount: u32,
    pub archive: bool,
}

impl RetentionRule {
    pub fn new(interval: Duration, amount: u32) -> Self {
        Self {
            interval,
            amount,
            archive: false,
        }
    }

    pub fn archived(mut self) -> Self {
        self.archive = true;
        self
    }

    /// Select the oldest timestamp of every active bin.
    ///
    /// Active bins are the `amount` bins ending with the one containing `now`.
    /// Empty bins contribute nothing.
    pub fn select(
        &self,
        existing: &TimestampSet,
        now: NaiveDateTime,
        origin: NaiveDateTime,
    ) -> TimestampSet {
        let current = bin_index(now, origin, self.interval);
        let first = current.saturating_sub(i64::from(self.amount)).saturating_add(1);

        let mut oldest: BTreeMap<i64, NaiveDateTime> = BTreeMap::new();
        for &timestamp in existing {
            let bin = bin_index(timestamp, origin, self.interval);
            if bin < first || bin > current {
                continue;
            }
            oldest
                .entry(bin)
                .and_modify(|kept| *kept = (*kept).min(timestamp))
                .or_insert(timestamp);
        }
        oldest.into_values().collect()
    }
}

impl From<&KeepConfig> for RetentionRule {
    fn from(keep: &KeepConfig) -> Self {
        Self {
            interval: keep.interval,
            amount: keep.amount,
            archive: keep.backup,
        }
    }
}

impl fmt::Display for RetentionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} x {}{}",
            self.amount,
            humantime::format_duration(self.interval),
            if self.archive { " (archived)" } else { "" }
        )
    }
}

/// Outcome of evaluating the retention rules against an inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Snapshots at least one rule keeps.
    pub retain: TimestampSet,
    /// Existing snapshots no rule keeps.
    pub delete: TimestampSet,
    /// Retained snapshots selected by an archive rule.
    pub archive_candidates: TimestampSet,
    /// Per destination: candidates the destination does not hold yet.
    pub archive_needed: BTreeMap<String, TimestampSet>,
    /// Per destination: archives no archive rule selects any more.
    pub archive_prune: BTreeMap<String, TimestampSet>,
}

impl RetentionPlan {
    pub fn is_empty(&self) -> bool {
        self.retain.is_empty() && self.delete.is_empty()
    }

    /// Keep `timestamp` whatever the rules decided.
    ///
    /// Used for the snapshot created by the current run, which is only
    /// re-evaluated by the next run.
    pub fn protect(&mut self, timestamp: NaiveDateTime) -> bool {
        let was_deleted = self.delete.remove(&timestamp);
        if was_deleted {
            self.retain.insert(timestamp);
        }
        was_deleted
    }

    /// Work out what each destination is missing and what it holds in excess.
    ///
    /// A destination absent from `inventories` (e.g. unreachable) gets no
    /// entry. A destination with an empty inventory receives every candidate.
    pub fn schedule_archives(&mut self, inventories: &BTreeMap<String, TimestampSet>) {
        self.archive_needed.clear();
        self.archive_prune.clear();
        for (destination, archived) in inventories {
            let needed = self
                .archive_candidates
                .difference(archived)
                .copied()
                .collect();
            let excess = archived
                .difference(&self.archive_candidates)
                .copied()
                .collect();
            self.archive_needed.insert(destination.clone(), needed);
            self.archive_prune.insert(destination.clone(), excess);
        }
    }
}

/// Evaluates a fixed set of retention rules around a fixed origin.
#[derive(Debug, Clone)]
pub struct RetentionEvaluator {
    origin: NaiveDateTime,
    rules: Vec<RetentionRule>,
}

impl RetentionEvaluator {
    pub fn new(origin: NaiveDateTime, rules: Vec<RetentionRule>) -> Self {
        Self { origin, rules }
    }

    pub fn from_keeps<'a>(
        origin: NaiveDateTime,
        keeps: impl IntoIterator<Item = &'a KeepConfig>,
    ) -> Self {
        Self::new(origin, keeps.into_iter().map(RetentionRule::from).collect())
    }

    pub fn origin(&self) -> NaiveDateTime {
        self.origin
    }

    pub fn rules(&self) -> &[RetentionRule] {
        &self.rules
    }

    /// Compute the plan for `existing` as seen at `now`.
    ///
    /// The result only depends on the arguments. `archive_needed` and
    /// `archive_prune` stay empty until [`RetentionPlan::schedule_archives`].
    pub fn evaluate(&self, existing: &TimestampSet, now: NaiveDateTime) -> RetentionPlan {
        let mut plan = RetentionPlan::default();
        for rule in &self.rules {
            let selected = rule.select(existing, now, self.origin);
            if rule.archive {
                plan.archive_candidates.extend(selected.iter().copied());
            }
            plan.retain.extend(selected);
        }
        plan.delete = existing.difference(&plan.retain).copied().collect();
        plan
    }
}

/// Evaluate `rules` against `existing` without destinations.
pub fn evaluate(
    existing: &TimestampSet,
    now: NaiveDateTime,
    origin: NaiveDateTime,
    rules: &[RetentionRule],
) -> RetentionPlan {
    RetentionEvaluator::new(origin, rules.to_vec()).evaluate(existing, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(86400);

    fn dt(d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 5, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn set(items: &[NaiveDateTime]) -> TimestampSet {
        items.iter().copied().collect()
    }

    #[test]
    fn test_daily_keeps_oldest_of_last_three_bins() {
        let origin = dt(1, 0, 0);
        let at = |offset: TimeDelta| origin + offset;
        let existing = set(&[
            at(TimeDelta::zero()),
            at(TimeDelta::hours(6)),
            at(TimeDelta::hours(26)),
            at(TimeDelta::hours(49)),
            at(TimeDelta::days(3)),
        ]);
        let now = at(TimeDelta::days(3));

        let plan = evaluate(&existing, now, origin, &[RetentionRule::new(DAY, 3)]);

        assert_eq!(
            plan.retain,
            set(&[
                at(TimeDelta::hours(26)),
                at(TimeDelta::hours(49)),
                at(TimeDelta::days(3))
            ])
        );
        assert_eq!(plan.delete, set(&[origin, at(TimeDelta::hours(6))]));
        assert!(plan.archive_candidates.is_empty());
    }

    #[test]
    fn test_ten_minutely() {
        let origin = dt(5, 0, 0);
        let existing = set(&[
            dt(5, 16, 35),
            dt(5, 16, 45),
            dt(5, 16, 55),
            dt(5, 16, 57),
            dt(5, 17, 21),
            dt(5, 17, 25),
            dt(5, 17, 32),
        ]);
        let rules = [RetentionRule::new(MINUTE * 10, 3)];

        // At 16:57 the active bins are 16:30, 16:40 and 16:50.
        let earlier: TimestampSet = existing.range(..=dt(5, 16, 57)).copied().collect();
        let plan = evaluate(&earlier, dt(5, 16, 57), origin, &rules);
        assert_eq!(
            plan.retain,
            set(&[dt(5, 16, 35), dt(5, 16, 45), dt(5, 16, 55)])
        );
        assert_eq!(plan.delete, set(&[dt(5, 16, 57)]));

        // At 17:32 only the 17:20 and 17:30 bins hold anything.
        let plan = evaluate(&existing, dt(5, 17, 32), origin, &rules);
        assert_eq!(plan.retain, set(&[dt(5, 17, 21), dt(5, 17, 32)]));
        assert_eq!(plan.delete.len(), 5);
    }

    #[test]
    fn test_hourly_with_offset_origin() {
        let origin = dt(5, 0, 30);
        let existing = set(&[
            dt(5, 15, 0),
            dt(5, 16, 0),
            dt(5, 16, 20),
            dt(5, 17, 0),
        ]);
        let plan = evaluate(&existing, dt(5, 17, 0), origin, &[RetentionRule::new(HOUR, 3)]);

        // Bins start at half past: 14:30, 15:30 and 16:30.
        assert_eq!(plan.retain, set(&[dt(5, 15, 0), dt(5, 16, 0), dt(5, 17, 0)]));
        assert_eq!(plan.delete, set(&[dt(5, 16, 20)]));
    }

    #[test]
    fn test_daily_with_gaps() {
        let origin = dt(5, 3, 0);
        let existing = set(&[
            dt(1, 10, 0),
            dt(2, 10, 0),
            dt(4, 9, 0),
            dt(4, 10, 0),
            dt(5, 10, 0),
        ]);
        let plan = evaluate(&existing, dt(5, 10, 0), origin, &[RetentionRule::new(DAY, 3)]);

        // Active bins start on the 3rd, 4th and 5th at 03:00.
        assert_eq!(plan.retain, set(&[dt(4, 9, 0), dt(5, 10, 0)]));
        assert_eq!(plan.delete, set(&[dt(1, 10, 0), dt(2, 10, 0), dt(4, 10, 0)]));
    }

    #[test]
    fn test_too_few_snapshots_keeps_everything() {
        let origin = dt(1, 3, 0);
        let existing = set(&[dt(1, 0, 0), dt(5, 0, 0)]);
        let plan = evaluate(&existing, dt(5, 0, 0), origin, &[RetentionRule::new(DAY * 2, 3)]);

        assert_eq!(plan.retain, existing);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_mixed_rules_union() {
        let origin = dt(1, 3, 0);
        let existing: TimestampSet = (1..=4)
            .flat_map(|d| [0, 6, 12, 18].map(|h| dt(d, h, 0)))
            .collect();
        let now = dt(4, 18, 0);
        let rules = [RetentionRule::new(DAY, 3), RetentionRule::new(HOUR * 6, 4)];

        let plan = evaluate(&existing, now, origin, &rules);

        // Daily bins start at 03:00: the 2nd, 3rd and 4th hold 06:00 as oldest.
        // Six-hourly bins start at 03:00, 09:00, 15:00 and 21:00.
        assert_eq!(
            plan.retain,
            set(&[
                dt(2, 6, 0),
                dt(3, 6, 0),
                dt(4, 0, 0),
                dt(4, 6, 0),
                dt(4, 12, 0),
                dt(4, 18, 0),
            ])
        );
        assert_eq!(plan.retain.len() + plan.delete.len(), existing.len());
    }

    #[test]
    fn test_empty_inventory_gives_empty_plan() {
        let plan = evaluate(
            &TimestampSet::new(),
            dt(5, 0, 0),
            dt(1, 0, 0),
            &[RetentionRule::new(DAY, 3).archived()],
        );
        assert!(plan.is_empty());
        assert!(plan.archive_candidates.is_empty());
    }

    #[test]
    fn test_no_rules_deletes_everything() {
        let existing = set(&[dt(1, 0, 0), dt(2, 0, 0)]);
        let plan = evaluate(&existing, dt(2, 0, 0), dt(1, 0, 0), &[]);
        assert!(plan.retain.is_empty());
        assert_eq!(plan.delete, existing);
    }

    #[test]
    fn test_hour_and_archived_day() {
        let origin = dt(1, 0, 0);
        let existing = set(&[dt(1, 0, 0), dt(1, 1, 0), dt(1, 2, 0), dt(1, 3, 0)]);
        let rules = [
            RetentionRule::new(HOUR, 2),
            RetentionRule::new(DAY, 1).archived(),
        ];

        let mut plan = evaluate(&existing, dt(1, 3, 0), origin, &rules);
        assert_eq!(plan.retain, set(&[dt(1, 0, 0), dt(1, 2, 0), dt(1, 3, 0)]));
        assert_eq!(plan.delete, set(&[dt(1, 1, 0)]));
        assert_eq!(plan.archive_candidates, set(&[dt(1, 0, 0)]));

        let inventories = BTreeMap::from([("/mnt/bigdisk".to_string(), TimestampSet::new())]);
        plan.schedule_archives(&inventories);
        assert_eq!(plan.archive_needed["/mnt/bigdisk"], set(&[dt(1, 0, 0)]));
        assert!(plan.archive_prune["/mnt/bigdisk"].is_empty());
    }

    #[test]
    fn test_catch_up_new_destination() {
        let origin = dt(1, 0, 0);
        let existing = set(&[dt(1, 12, 0), dt(2, 12, 0), dt(3, 12, 0)]);
        let mut plan = evaluate(
            &existing,
            dt(3, 12, 0),
            origin,
            &[RetentionRule::new(DAY, 7).archived()],
        );

        let inventories = BTreeMap::from([
            ("old".to_string(), existing.clone()),
            ("new".to_string(), TimestampSet::new()),
        ]);
        plan.schedule_archives(&inventories);

        assert!(plan.archive_needed["old"].is_empty());
        assert_eq!(plan.archive_needed["new"], plan.archive_candidates);
    }

    #[test]
    fn test_prune_archives_no_longer_selected() {
        let origin = dt(1, 0, 0);
        let existing = set(&[dt(3, 12, 0), dt(4, 12, 0)]);
        let mut plan = evaluate(
            &existing,
            dt(4, 12, 0),
            origin,
            &[RetentionRule::new(DAY, 2).archived()],
        );
        let inventories = BTreeMap::from([(
            "repo".to_string(),
            set(&[dt(1, 12, 0), dt(3, 12, 0)]),
        )]);
        plan.schedule_archives(&inventories);

        assert_eq!(plan.archive_needed["repo"], set(&[dt(4, 12, 0)]));
        assert_eq!(plan.archive_prune["repo"], set(&[dt(1, 12, 0)]));
    }

    #[test]
    fn test_protect_moves_timestamp_to_retain() {
        let existing = set(&[dt(1, 0, 0), dt(1, 0, 30)]);
        let mut plan = evaluate(
            &existing,
            dt(1, 0, 30),
            dt(1, 0, 0),
            &[RetentionRule::new(HOUR, 1)],
        );
        assert!(plan.delete.contains(&dt(1, 0, 30)));

        assert!(plan.protect(dt(1, 0, 30)));
        assert_eq!(plan.retain, existing);
        assert!(plan.delete.is_empty());
        assert!(!plan.protect(dt(1, 0, 30)));
    }

    #[test]
    fn test_rule_display() {
        let rule = RetentionRule::new(DAY * 7, 52).archived();
        assert_eq!(rule.to_string(), "52 x 7days (archived)");
    }
}
