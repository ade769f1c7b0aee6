//! Re-arming rules for periodic runs.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a periodic run picks its next firing time after completing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodicPolicy {
    /// `next_run = completion + period`. Long runs push the schedule back.
    #[default]
    Drift,
    /// Stay on the grid `scheduled + k * period`, taking the first grid point
    /// after completion. Missed firings are skipped, not replayed.
    FixedGrid,
}

impl PeriodicPolicy {
    /// Next firing time of a run that was due at `scheduled` and finished at
    /// `completed`.
    pub fn next_run(
        self,
        scheduled: DateTime<Utc>,
        completed: DateTime<Utc>,
        period: Duration,
    ) -> DateTime<Utc> {
        let period_ns = i64::try_from(period.as_nanos()).unwrap_or(i64::MAX).max(1);
        match self {
            PeriodicPolicy::Drift => add_nanos(completed, period_ns),
            PeriodicPolicy::FixedGrid => {
                let behind = (completed - scheduled).num_nanoseconds().unwrap_or(i64::MAX);
                let periods = (behind.max(0) / period_ns).saturating_add(1);
                add_nanos(scheduled, period_ns.saturating_mul(periods))
            }
        }
    }
}

fn add_nanos(at: DateTime<Utc>, nanos: i64) -> DateTime<Utc> {
    at.checked_add_signed(TimeDelta::nanoseconds(nanos))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_drift_counts_from_completion() {
        let next = PeriodicPolicy::Drift.next_run(at(0), at(3), Duration::from_secs(10));
        assert_eq!(next, at(13));
    }

    #[test]
    fn test_fixed_grid_keeps_phase() {
        let period = Duration::from_secs(10);
        assert_eq!(PeriodicPolicy::FixedGrid.next_run(at(0), at(3), period), at(10));
        assert_eq!(PeriodicPolicy::FixedGrid.next_run(at(0), at(25), period), at(30));
        assert_eq!(PeriodicPolicy::FixedGrid.next_run(at(0), at(30), period), at(40));
    }

    #[test]
    fn test_huge_period_saturates() {
        let next = PeriodicPolicy::Drift.next_run(at(0), at(0), Duration::MAX);
        assert!(next > at(0));
    }

    #[test]
    fn test_policy_names() {
        let policy: PeriodicPolicy = serde_json::from_str("\"fixed_grid\"").unwrap();
        assert_eq!(policy, PeriodicPolicy::FixedGrid);
        assert_eq!(PeriodicPolicy::default(), PeriodicPolicy::Drift);
    }
}
