use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Local, Utc};

use crate::core::config::ScheduleTimezone;
use crate::core::store::{ScheduleType, Task};
use crate::scheduler::cron::CronSpec;

/// A task updated more than this long after its last run gets a hard reset
/// (in-memory and persisted run state cleared).
pub const HARD_RESET_GAP_SECS: i64 = 1800;
/// Between this and the hard threshold, the reset is in-memory only.
pub const SOFT_RESET_GAP_SECS: i64 = 60;

/// A compiled schedule specification.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Interval { every_secs: u64 },
    Cron(CronSpec),
}

impl ScheduleSpec {
    /// Compile a task's schedule config. Interval configs accept the legacy
    /// `interval` key alongside `interval_seconds`; cron configs accept the
    /// five named fields or a legacy single `cron` expression string.
    pub fn compile(schedule_type: ScheduleType, config: &serde_json::Value) -> Result<Self> {
        match schedule_type {
            ScheduleType::Interval => {
                let every = config
                    .get("interval_seconds")
                    .or_else(|| config.get("interval"))
                    .and_then(|v| v.as_i64())
                    .context("interval schedule needs interval_seconds")?;
                if every <= 0 {
                    bail!("interval_seconds must be positive, got {every}");
                }
                Ok(ScheduleSpec::Interval {
                    every_secs: every as u64,
                })
            }
            ScheduleType::Cron => {
                if let Some(expr) = config.get("cron").and_then(|v| v.as_str()) {
                    return Ok(ScheduleSpec::Cron(CronSpec::parse_expr(expr)?));
                }
                let field = |key: &str| -> String {
                    config
                        .get(key)
                        .and_then(|v| v.as_str())
                        .unwrap_or("*")
                        .to_string()
                };
                Ok(ScheduleSpec::Cron(CronSpec::new(
                    &field("minute"),
                    &field("hour"),
                    &field("day_of_month"),
                    &field("month_of_year"),
                    &field("day_of_week"),
                )?))
            }
        }
    }

    /// The due time implied by `last_run_at`. A task that never ran (or was
    /// reset) is due immediately.
    pub fn due_after(
        &self,
        last_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        tz: ScheduleTimezone,
    ) -> DateTime<Utc> {
        let Some(last) = last_run_at else {
            return now;
        };
        match self {
            ScheduleSpec::Interval { every_secs } => {
                last + Duration::seconds(*every_secs as i64)
            }
            ScheduleSpec::Cron(spec) => {
                let next = match tz {
                    ScheduleTimezone::Utc => spec.next_after(last),
                    ScheduleTimezone::Local => spec
                        .next_after(last.with_timezone(&Local))
                        .map(|t| t.with_timezone(&Utc)),
                };
                // Unsatisfiable schedules park far in the future instead of
                // busy-looping the dispatcher.
                next.unwrap_or(now + Duration::days(366))
            }
        }
    }

}

/// How a rebuild treats a task's recorded `last_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAction {
    /// Clear in memory and null out the stored run state (no-touch write).
    Hard,
    /// Treat as eligible without touching the store.
    Soft,
    /// Trust the recorded `last_run`.
    Keep,
}

/// The re-enable reset rule: a task whose `updated_at` moved well past its
/// `last_run` was mutated while idle (re-enabled, edited) and must become
/// eligible again instead of waiting out a stale `last_run`.
pub fn reset_action(task: &Task) -> ResetAction {
    let Some(last_run) = task.last_run else {
        // Never ran: already immediately eligible.
        return ResetAction::Keep;
    };
    let gap = (task.updated_at - last_run).num_seconds();
    if gap > HARD_RESET_GAP_SECS {
        ResetAction::Hard
    } else if gap > SOFT_RESET_GAP_SECS {
        ResetAction::Soft
    } else {
        ResetAction::Keep
    }
}

/// One live schedule slot: the task snapshot, its compiled spec, and the
/// cached due time consumed by the dispatch heap.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub task: Task,
    pub spec: ScheduleSpec,
    pub last_run_at: Option<DateTime<Utc>>,
    pub due_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn new(
        task: Task,
        spec: ScheduleSpec,
        last_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        tz: ScheduleTimezone,
    ) -> Self {
        let due_at = spec.due_after(last_run_at, now, tz);
        Self {
            task,
            spec,
            last_run_at,
            due_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }

    /// Advance after a successful fire. Basing the next due time on `now`
    /// rather than the theoretical slot gives single-fire catch-up: however
    /// many boundaries were missed, one fire realigns to the next future
    /// boundary.
    pub fn advance_after_fire(&mut self, now: DateTime<Utc>, tz: ScheduleTimezone) {
        self.last_run_at = Some(now);
        self.due_at = self.spec.due_after(self.last_run_at, now, tz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task_with_runs(
        last_run: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Task {
        Task {
            id: "t1".into(),
            name: "t1".into(),
            description: None,
            tags: vec![],
            plugin_name: "demo".into(),
            parameters: serde_json::json!({}),
            schedule_type: ScheduleType::Interval,
            schedule_config: serde_json::json!({"interval_seconds": 60}),
            enabled: true,
            priority: 5,
            max_retries: 3,
            timeout_seconds: None,
            last_run,
            next_run: None,
            created_at: updated_at,
            updated_at,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, h, m, s).unwrap()
    }

    #[test]
    fn compile_rejects_nonpositive_interval() {
        let bad = serde_json::json!({"interval_seconds": 0});
        assert!(ScheduleSpec::compile(ScheduleType::Interval, &bad).is_err());
    }

    #[test]
    fn compile_accepts_legacy_interval_key() {
        let legacy = serde_json::json!({"interval": 300});
        let spec = ScheduleSpec::compile(ScheduleType::Interval, &legacy).unwrap();
        assert!(matches!(spec, ScheduleSpec::Interval { every_secs: 300 }));
    }

    #[test]
    fn never_ran_is_due_immediately() {
        let spec = ScheduleSpec::Interval { every_secs: 3600 };
        let now = at(12, 0, 0);
        assert_eq!(spec.due_after(None, now, ScheduleTimezone::Utc), now);
    }

    #[test]
    fn interval_due_is_last_run_plus_period() {
        let spec = ScheduleSpec::Interval { every_secs: 600 };
        let due = spec.due_after(Some(at(12, 0, 0)), at(12, 1, 0), ScheduleTimezone::Utc);
        assert_eq!(due, at(12, 10, 0));
    }

    #[test]
    fn reset_tiers() {
        // Gap of two hours: hard reset.
        let task = task_with_runs(Some(at(8, 0, 0)), at(10, 0, 0));
        assert_eq!(reset_action(&task), ResetAction::Hard);
        // Gap of ten minutes: soft reset.
        let task = task_with_runs(Some(at(9, 50, 0)), at(10, 0, 0));
        assert_eq!(reset_action(&task), ResetAction::Soft);
        // Gap under a minute: keep.
        let task = task_with_runs(Some(at(9, 59, 30)), at(10, 0, 0));
        assert_eq!(reset_action(&task), ResetAction::Keep);
        // Steady-state task whose last run postdates its last edit: keep.
        let task = task_with_runs(Some(at(10, 0, 0)), at(8, 0, 0));
        assert_eq!(reset_action(&task), ResetAction::Keep);
        // Never ran: nothing to reset, already eligible.
        let task = task_with_runs(None, at(10, 0, 0));
        assert_eq!(reset_action(&task), ResetAction::Keep);
    }

    #[test]
    fn catch_up_fires_once_and_realigns() {
        let spec = ScheduleSpec::Interval { every_secs: 60 };
        // Last ran an hour ago: 59 slots missed.
        let mut entry = ScheduleEntry::new(
            task_with_runs(Some(at(11, 0, 0)), at(11, 0, 0)),
            spec,
            Some(at(11, 0, 0)),
            at(12, 0, 0),
            ScheduleTimezone::Utc,
        );
        assert!(entry.is_due(at(12, 0, 0)));
        entry.advance_after_fire(at(12, 0, 0), ScheduleTimezone::Utc);
        // One fire, then aligned one full period into the future.
        assert_eq!(entry.due_at, at(12, 1, 0));
        assert!(!entry.is_due(at(12, 0, 30)));
    }
}
