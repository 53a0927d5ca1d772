//! Gap detection and backfill planning.
//!
//! Each completed item covers the half-open interval
//! `[oldest_cursor, newest_cursor)`. Walking completed items from the most
//! recent window backwards, the first place where coverage stops short of the
//! next window's upper bound is a gap. The planner always closes the most
//! recent gap first, then keeps extending history backwards until it reaches
//! the retention horizon or the source runs dry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BackfillConfig;
use crate::types::{Cursor, QueueItem, QueueStatus};

#[derive(Clone, Copy, Debug)]
pub struct BackfillPolicy {
    /// Nothing older than this is fetched.
    pub retention_horizon: DateTime<Utc>,
    /// Re-anchor at `now` once the newest window finished this long ago.
    pub refresh_after: Option<chrono::Duration>,
}

impl BackfillPolicy {
    pub fn from_config(config: &BackfillConfig, now: DateTime<Utc>) -> Self {
        Self {
            retention_horizon: now - chrono::Duration::days(config.retention_days),
            refresh_after: config.refresh_after_secs.map(chrono::Duration::seconds),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowReason {
    /// First window for a unit with no history.
    Initial,
    /// The newest window went stale; pick up fresh activity.
    HeadRefresh,
    /// Coverage between two windows is missing.
    Gap,
    /// Extend history further into the past.
    Backfill,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackfillPlan {
    Fetch {
        /// Fetch backwards from here.
        newest: Cursor,
        /// Upper bound of the already-covered history below the window, when
        /// the window closes a gap. The gap is `[floor, newest)`.
        floor: Option<Cursor>,
        reason: WindowReason,
    },
    NoWork,
}

impl BackfillPlan {
    fn fetch(newest: Cursor, reason: WindowReason) -> Self {
        BackfillPlan::Fetch {
            newest,
            floor: None,
            reason,
        }
    }
}

/// Plan the next window for a unit given all of its queue items.
///
/// Only completed items contribute coverage. Items still in `error` when
/// planning runs are poisoned: nothing at or below the newest of their
/// anchors is planned again, while head refreshes and gaps above them are.
/// Callers are expected to skip units that still have pending or running
/// items.
pub fn plan_next_window(
    items: &[QueueItem],
    policy: &BackfillPolicy,
    now: DateTime<Utc>,
) -> BackfillPlan {
    let mut completed: Vec<&QueueItem> = items
        .iter()
        .filter(|item| {
            item.status == QueueStatus::Completed && item.oldest_cursor.is_some()
        })
        .collect();
    let poisoned = items
        .iter()
        .filter(|item| item.status == QueueStatus::Error)
        .max_by(|a, b| a.newest_cursor.cmp(&b.newest_cursor));

    if completed.is_empty() {
        return match poisoned {
            None => BackfillPlan::fetch(Cursor::at(now), WindowReason::Initial),
            Some(head) if is_stale(policy, Some(head.created_at), &head.newest_cursor, now) => {
                BackfillPlan::fetch(Cursor::at(now), WindowReason::HeadRefresh)
            }
            Some(_) => BackfillPlan::NoWork,
        };
    }

    completed.sort_by(|a, b| b.newest_cursor.cmp(&a.newest_cursor));

    let head = completed[0];
    if is_stale(policy, head.finished_at, &head.newest_cursor, now) {
        return BackfillPlan::fetch(Cursor::at(now), WindowReason::HeadRefresh);
    }

    let floor = poisoned.map(|item| &item.newest_cursor);
    let blocked = |cursor: &Cursor| {
        cursor.timestamp < policy.retention_horizon
            || floor.is_some_and(|floor| cursor <= floor)
    };

    // Lowest cursor reached by contiguous coverage from the head down.
    let mut covered_to = lower_bound(head);
    for next in &completed[1..] {
        if blocked(&covered_to) {
            return BackfillPlan::NoWork;
        }

        if covered_to > next.newest_cursor
            && !is_exhausted_at(&completed, &covered_to)
        {
            return BackfillPlan::Fetch {
                newest: covered_to,
                floor: Some(next.newest_cursor.clone()),
                reason: WindowReason::Gap,
            };
        }

        let next_low = lower_bound(next);
        if next_low < covered_to {
            covered_to = next_low;
        }
    }

    if blocked(&covered_to) || is_exhausted_at(&completed, &covered_to) {
        return BackfillPlan::NoWork;
    }

    BackfillPlan::fetch(covered_to, WindowReason::Backfill)
}

/// The newest window finished more than `refresh_after` ago and newer
/// activity may exist.
fn is_stale(
    policy: &BackfillPolicy,
    finished_at: Option<DateTime<Utc>>,
    newest: &Cursor,
    now: DateTime<Utc>,
) -> bool {
    let Some(refresh_after) = policy.refresh_after else {
        return false;
    };
    finished_at.is_none_or(|finished| finished <= now - refresh_after)
        && newest.timestamp < now
}

fn lower_bound(item: &QueueItem) -> Cursor {
    item.oldest_cursor
        .clone()
        .unwrap_or_else(|| item.newest_cursor.clone())
}

/// True when a window anchored at `cursor` already came back empty.
fn is_exhausted_at(completed: &[&QueueItem], cursor: &Cursor) -> bool {
    completed
        .iter()
        .any(|item| item.is_exhausted() && &item.newest_cursor == cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnitKey;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn completed(newest: i64, oldest: i64, finished: i64) -> QueueItem {
        let mut item = QueueItem::pending(
            UnitKey::new("guild", "channel"),
            Cursor::new(ts(newest), format!("n{newest}")),
            ts(finished),
        );
        item.status = QueueStatus::Completed;
        item.oldest_cursor = Some(Cursor::new(ts(oldest), format!("n{oldest}")));
        item.finished_at = Some(ts(finished));
        item
    }

    fn policy(horizon: i64) -> BackfillPolicy {
        BackfillPolicy {
            retention_horizon: ts(horizon),
            refresh_after: None,
        }
    }

    #[test]
    fn empty_history_anchors_at_now() {
        let now = ts(1_000);
        let plan = plan_next_window(&[], &policy(1_000 - 90), now);
        assert_eq!(
            plan,
            BackfillPlan::Fetch {
                newest: Cursor::at(now),
                floor: None,
                reason: WindowReason::Initial,
            }
        );
    }

    #[test]
    fn closes_most_recent_gap_first() {
        // [10,20) and [5,8): the gap [8,10) wins over backfilling below 5.
        let items = vec![completed(20, 10, 30), completed(8, 5, 30)];
        let plan = plan_next_window(&items, &policy(0), ts(30));

        let BackfillPlan::Fetch {
            newest,
            floor,
            reason,
        } = plan
        else {
            panic!("expected a fetch plan");
        };
        assert_eq!(reason, WindowReason::Gap);
        assert_eq!(newest.timestamp, ts(10));
        assert_eq!(floor.map(|c| c.timestamp), Some(ts(8)));
    }

    #[test]
    fn picks_upper_gap_when_several_exist() {
        let items = vec![
            completed(100, 90, 200),
            completed(80, 70, 200),
            completed(50, 40, 200),
        ];
        let plan = plan_next_window(&items, &policy(0), ts(200));
        assert!(matches!(
            plan,
            BackfillPlan::Fetch { ref newest, reason: WindowReason::Gap, .. }
                if newest.timestamp == ts(90)
        ));
    }

    #[test]
    fn overlapping_windows_are_not_gaps() {
        // A wide window swallowing a narrower one must not report the
        // narrower window's lower edge as a gap.
        let items = vec![
            completed(100, 10, 200),
            completed(60, 50, 200),
            completed(20, 5, 200),
        ];
        let plan = plan_next_window(&items, &policy(0), ts(200));
        assert!(matches!(
            plan,
            BackfillPlan::Fetch { ref newest, reason: WindowReason::Backfill, .. }
                if newest.timestamp == ts(5)
        ));
    }

    #[test]
    fn contiguous_history_extends_backwards() {
        let items = vec![completed(20, 10, 30), completed(10, 4, 30)];
        let plan = plan_next_window(&items, &policy(0), ts(30));
        assert!(matches!(
            plan,
            BackfillPlan::Fetch { ref newest, reason: WindowReason::Backfill, .. }
                if newest.timestamp == ts(4)
        ));
    }

    #[test]
    fn stops_once_coverage_precedes_retention_horizon() {
        let items = vec![completed(20, 10, 30)];
        assert_eq!(
            plan_next_window(&items, &policy(11), ts(30)),
            BackfillPlan::NoWork
        );
        assert_eq!(
            plan_next_window(&items, &policy(15), ts(30)),
            BackfillPlan::NoWork
        );
    }

    #[test]
    fn coverage_landing_on_horizon_still_backfills() {
        let items = vec![completed(20, 10, 30)];
        assert!(matches!(
            plan_next_window(&items, &policy(10), ts(30)),
            BackfillPlan::Fetch { ref newest, reason: WindowReason::Backfill, .. }
                if newest.timestamp == ts(10)
        ));
    }

    #[test]
    fn empty_batch_terminates_backfill() {
        let mut exhausted = completed(10, 10, 30);
        exhausted.oldest_cursor = Some(exhausted.newest_cursor.clone());
        let items = vec![completed(20, 10, 30), exhausted];
        assert_eq!(
            plan_next_window(&items, &policy(0), ts(30)),
            BackfillPlan::NoWork
        );
    }

    #[test]
    fn stale_head_refreshes_before_backfilling() {
        let items = vec![completed(20, 10, 30)];
        let refresh = BackfillPolicy {
            retention_horizon: ts(0),
            refresh_after: Some(chrono::Duration::seconds(60)),
        };

        let fresh = plan_next_window(&items, &refresh, ts(60));
        assert!(matches!(
            fresh,
            BackfillPlan::Fetch { reason: WindowReason::Backfill, .. }
        ));

        let stale = plan_next_window(&items, &refresh, ts(90));
        assert_eq!(
            stale,
            BackfillPlan::Fetch {
                newest: Cursor::at(ts(90)),
                floor: None,
                reason: WindowReason::HeadRefresh,
            }
        );
    }

    #[test]
    fn non_completed_items_contribute_no_coverage() {
        let mut running = completed(20, 10, 30);
        running.status = QueueStatus::Running;
        running.oldest_cursor = None;
        let plan = plan_next_window(&[running], &policy(0), ts(40));
        assert!(matches!(
            plan,
            BackfillPlan::Fetch { reason: WindowReason::Initial, .. }
        ));
    }

    fn poisoned(newest: i64, created: i64) -> QueueItem {
        let mut item = QueueItem::pending(
            UnitKey::new("guild", "channel"),
            Cursor::new(ts(newest), format!("n{newest}")),
            ts(created),
        );
        item.status = QueueStatus::Error;
        item.attempts = 3;
        item
    }

    #[test]
    fn poisoned_window_floors_backfill() {
        // Head covers [10,20); the window below it at n10 is poisoned.
        let items = vec![completed(20, 10, 30), poisoned(10, 30)];
        assert_eq!(
            plan_next_window(&items, &policy(0), ts(40)),
            BackfillPlan::NoWork
        );
    }

    #[test]
    fn poisoned_window_still_allows_head_refresh() {
        let items = vec![completed(20, 10, 30), poisoned(10, 30)];
        let refresh = BackfillPolicy {
            retention_horizon: ts(0),
            refresh_after: Some(chrono::Duration::seconds(60)),
        };
        assert_eq!(
            plan_next_window(&items, &refresh, ts(200)),
            BackfillPlan::Fetch {
                newest: Cursor::at(ts(200)),
                floor: None,
                reason: WindowReason::HeadRefresh,
            }
        );
    }

    #[test]
    fn gaps_above_poisoned_window_still_close() {
        // [90,100) and [70,80) with a poisoned window at n40: the gap
        // [80,90) lies above the floor.
        let items = vec![
            completed(100, 90, 200),
            completed(80, 70, 200),
            poisoned(40, 200),
        ];
        assert!(matches!(
            plan_next_window(&items, &policy(0), ts(200)),
            BackfillPlan::Fetch { ref newest, reason: WindowReason::Gap, .. }
                if newest.timestamp == ts(90)
        ));
        // Coverage below [70,80) continues down to the floor.
        let contiguous = vec![completed(100, 70, 200), poisoned(40, 200)];
        assert!(matches!(
            plan_next_window(&contiguous, &policy(0), ts(200)),
            BackfillPlan::Fetch { ref newest, reason: WindowReason::Backfill, .. }
                if newest.timestamp == ts(70)
        ));
    }

    #[test]
    fn poisoned_first_window_waits_for_refresh() {
        let items = vec![poisoned(100, 100)];
        assert_eq!(
            plan_next_window(&items, &policy(0), ts(120)),
            BackfillPlan::NoWork
        );

        let refresh = BackfillPolicy {
            retention_horizon: ts(0),
            refresh_after: Some(chrono::Duration::seconds(60)),
        };
        assert_eq!(
            plan_next_window(&items, &refresh, ts(120)),
            BackfillPlan::NoWork
        );
        assert!(matches!(
            plan_next_window(&items, &refresh, ts(160)),
            BackfillPlan::Fetch { reason: WindowReason::HeadRefresh, .. }
        ));
    }
}
