use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};

/// A compiled five-field cron expression (minute, hour, day-of-month,
/// month, day-of-week). Supports `*`, single values, lists, ranges, and
/// steps; day-of-week accepts 0-7 with both 0 and 7 meaning Sunday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSpec {
    pub fn new(
        minute: &str,
        hour: &str,
        day_of_month: &str,
        month_of_year: &str,
        day_of_week: &str,
    ) -> Result<Self> {
        Ok(Self {
            minutes: parse_field(minute, 0, 59)?,
            hours: parse_field(hour, 0, 23)?,
            days_of_month: parse_field(day_of_month, 1, 31)?,
            months: parse_field(month_of_year, 1, 12)?,
            days_of_week: parse_dow(day_of_week)?,
            dom_restricted: day_of_month != "*",
            dow_restricted: day_of_week != "*",
        })
    }

    /// Parse a whitespace-separated five-field expression.
    pub fn parse_expr(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            bail!("cron expression '{expression}' must have 5 fields");
        }
        Self::new(parts[0], parts[1], parts[2], parts[3], parts[4])
    }

    fn day_matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        let dom_ok = self.days_of_month.contains(&t.day());
        let dow_ok = self
            .days_of_week
            .contains(&t.weekday().num_days_from_sunday());
        // Standard cron: when both day fields are restricted, either match
        // selects the day; otherwise both must hold (the wildcard always does).
        if self.dom_restricted && self.dow_restricted {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }

    fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        self.months.contains(&t.month())
            && self.day_matches(t)
            && self.hours.contains(&t.hour())
            && self.minutes.contains(&t.minute())
    }

    /// The first boundary strictly after `after`, at minute resolution.
    /// Returns None when no boundary exists within four years (an
    /// unsatisfiable field combination such as Feb 30).
    pub fn next_after<Tz: TimeZone>(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut candidate = truncate_to_minute(after) + Duration::minutes(1);
        let horizon = candidate.clone() + Duration::days(4 * 366);
        while candidate < horizon {
            if !self.months.contains(&candidate.month()) || !self.day_matches(&candidate) {
                // Day does not qualify: jump to the next midnight.
                let offset = i64::from((23 - candidate.hour()) * 60 + (59 - candidate.minute()) + 1);
                candidate = truncate_to_minute(candidate) + Duration::minutes(offset);
                continue;
            }
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn truncate_to_minute<Tz: TimeZone>(t: DateTime<Tz>) -> DateTime<Tz> {
    let t = t.clone().with_second(0).unwrap_or(t);
    t.clone().with_nanosecond(0).unwrap_or(t)
}

/// Expand one cron field into its sorted value list.
fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    let mut values = Vec::new();
    for item in field.split(',') {
        let item = item.trim();
        if item.is_empty() {
            bail!("empty item in cron field '{field}'");
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| anyhow::anyhow!("bad step in '{item}'"))?;
                if step == 0 {
                    bail!("step of 0 in '{item}'");
                }
                (range, step)
            }
            None => (item, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, min, max)?, parse_value(hi, min, max)?)
        } else {
            let v = parse_value(range, min, max)?;
            (v, v)
        };
        if lo > hi {
            bail!("inverted range in '{item}'");
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_value(s: &str, min: u32, max: u32) -> Result<u32> {
    let v: u32 = s
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("'{s}' is not a cron value"))?;
    if v < min || v > max {
        bail!("cron value {v} outside {min}..={max}");
    }
    Ok(v)
}

/// Day-of-week with 7 normalized to 0 (Sunday).
fn parse_dow(field: &str) -> Result<Vec<u32>> {
    let mut values = parse_field(field, 0, 7)?;
    for v in values.iter_mut() {
        if *v == 7 {
            *v = 0;
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn hourly_boundary() {
        let spec = CronSpec::parse_expr("0 * * * *").unwrap();
        let next = spec.next_after(at(2026, 3, 10, 14, 25, 11)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 15, 0, 0));
    }

    #[test]
    fn boundary_is_strictly_after() {
        let spec = CronSpec::parse_expr("0 * * * *").unwrap();
        let next = spec.next_after(at(2026, 3, 10, 15, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 16, 0, 0));
    }

    #[test]
    fn steps_and_lists() {
        let spec = CronSpec::parse_expr("*/15 * * * *").unwrap();
        let next = spec.next_after(at(2026, 3, 10, 9, 2, 0)).unwrap();
        assert_eq!(next.minute(), 15);

        let spec = CronSpec::parse_expr("5,35 8-10 * * *").unwrap();
        let next = spec.next_after(at(2026, 3, 10, 8, 36, 0)).unwrap();
        assert_eq!((next.hour(), next.minute()), (9, 5));
    }

    #[test]
    fn daily_at_two() {
        let spec = CronSpec::parse_expr("0 2 * * *").unwrap();
        let next = spec.next_after(at(2026, 3, 10, 3, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 11, 2, 0, 0));
    }

    #[test]
    fn day_of_week_only() {
        // 2026-03-10 is a Tuesday; next Monday is the 16th.
        let spec = CronSpec::parse_expr("0 9 * * 1").unwrap();
        let next = spec.next_after(at(2026, 3, 10, 0, 0, 0)).unwrap();
        assert_eq!((next.month(), next.day(), next.hour()), (3, 16, 9));
    }

    #[test]
    fn seven_means_sunday() {
        let a = CronSpec::parse_expr("0 0 * * 0").unwrap();
        let b = CronSpec::parse_expr("0 0 * * 7").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn both_day_fields_are_a_union() {
        // The 15th of the month OR any Monday.
        let spec = CronSpec::parse_expr("0 0 15 * 1").unwrap();
        let next = spec.next_after(at(2026, 3, 10, 0, 0, 0)).unwrap();
        // 2026-03-16 is a Monday but the 15th (a Sunday) comes first.
        assert_eq!((next.day(), next.hour()), (15, 0));
    }

    #[test]
    fn unsatisfiable_returns_none() {
        let spec = CronSpec::parse_expr("0 0 30 2 *").unwrap();
        assert!(spec.next_after(at(2026, 1, 1, 0, 0, 0)).is_none());
    }

    #[test]
    fn rejects_malformed_fields() {
        assert!(CronSpec::parse_expr("bad").is_err());
        assert!(CronSpec::parse_expr("61 * * * *").is_err());
        assert!(CronSpec::parse_expr("*/0 * * * *").is_err());
        assert!(CronSpec::parse_expr("9-3 * * * *").is_err());
    }
}
