//! Five-field cron expressions: `MIN HOUR DOM MON DOW`.
//!
//! Each field accepts `*`, `N`, `A-B`, `*/S`, `A-B/S`, `N/S` and
//! comma-separated lists of those. Day-of-week runs 0-7 with both 0 and 7
//! meaning Sunday. When day-of-month and day-of-week are both restricted a
//! day matches if either does.

use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike};
use crate::error::{PipelineError, Result};

/// Give up looking for a match this far ahead (e.g. `0 0 30 2 *`).
const SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
  bits: u64,
  restricted: bool,
}

impl Field {
  fn parse(spec: &str, name: &str, min: u32, max: u32) -> Result<Self> {
    let bad = |why: &str| PipelineError::invalid(format!("cron {} field '{}': {}", name, spec, why));
    let mut bits = 0u64;
    for part in spec.split(',') {
      let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
          let step: u32 = step.parse().map_err(|_| bad("step is not a number"))?;
          if step == 0 {
            return Err(bad("step must be positive"));
          }
          (range, Some(step))
        }
        None => (part, None),
      };
      let (lo, hi) = if range == "*" {
        (min, max)
      } else if let Some((a, b)) = range.split_once('-') {
        let a: u32 = a.parse().map_err(|_| bad("range start is not a number"))?;
        let b: u32 = b.parse().map_err(|_| bad("range end is not a number"))?;
        (a, b)
      } else {
        let n: u32 = range.parse().map_err(|_| bad("not a number"))?;
        // `N/S` runs from N to the end of the field
        if step.is_some() { (n, max) } else { (n, n) }
      };
      if lo < min || hi > max || lo > hi {
        return Err(bad(&format!("values must lie in {}-{}", min, max)));
      }
      for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
        bits |= 1 << v;
      }
    }
    Ok(Self { bits, restricted: spec != "*" })
  }

  fn contains(&self, value: u32) -> bool {
    self.bits & (1 << value) != 0
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
  source: String,
  minutes: Field,
  hours: Field,
  days_of_month: Field,
  months: Field,
  days_of_week: Field,
}

impl CronExpr {
  pub fn parse(expression: &str) -> Result<Self> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    let [minute, hour, dom, month, dow] = parts[..] else {
      return Err(PipelineError::invalid(format!(
        "cron expression '{}' needs 5 fields (MIN HOUR DOM MON DOW)",
        expression
      )));
    };
    let mut days_of_week = Field::parse(dow, "day-of-week", 0, 7)?;
    if days_of_week.contains(7) {
      days_of_week.bits = (days_of_week.bits | 1) & !(1 << 7);
    }
    Ok(Self {
      source: parts.join(" "),
      minutes: Field::parse(minute, "minute", 0, 59)?,
      hours: Field::parse(hour, "hour", 0, 23)?,
      days_of_month: Field::parse(dom, "day-of-month", 1, 31)?,
      months: Field::parse(month, "month", 1, 12)?,
      days_of_week,
    })
  }

  fn day_matches(&self, date: NaiveDate) -> bool {
    let dom = self.days_of_month.contains(date.day());
    let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
    match (self.days_of_month.restricted, self.days_of_week.restricted) {
      (true, true) => dom || dow,
      (true, false) => dom,
      (false, true) => dow,
      (false, false) => true,
    }
  }

  pub fn matches(&self, at: NaiveDateTime) -> bool {
    self.months.contains(at.month())
      && self.day_matches(at.date())
      && self.hours.contains(at.hour())
      && self.minutes.contains(at.minute())
  }

  /// First matching wall-clock minute strictly after `after`.
  pub fn next_after_naive(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
    let start = after.with_second(0)?.with_nanosecond(0)? + TimeDelta::minutes(1);
    let horizon = start.year() + SEARCH_YEARS;
    let mut t = start;
    while t.year() <= horizon {
      if !self.months.contains(t.month()) {
        let (y, m) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
        t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
      } else if !self.day_matches(t.date()) {
        t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
      } else if !self.hours.contains(t.hour()) {
        t = t.with_minute(0)? + TimeDelta::hours(1);
      } else if !self.minutes.contains(t.minute()) {
        t += TimeDelta::minutes(1);
      } else {
        return Some(t);
      }
    }
    None
  }

  /// Next firing in `after`'s time zone. Wall-clock times skipped by a DST
  /// jump are passed over; repeated ones fire on their first occurrence.
  pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let tz = after.timezone();
    let mut naive = after.naive_local();
    loop {
      naive = self.next_after_naive(naive)?;
      if let Some(at) = tz.from_local_datetime(&naive).earliest() {
        if at > *after {
          return Some(at);
        }
      }
    }
  }
}

impl fmt::Display for CronExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

impl FromStr for CronExpr {
  type Err = PipelineError;

  fn from_str(s: &str) -> Result<Self> {
    Self::parse(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{FixedOffset, Utc};

  fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
  }

  fn next(expr: &str, after: &str) -> NaiveDateTime {
    CronExpr::parse(expr).unwrap().next_after_naive(at(after)).unwrap()
  }

  #[test]
  fn daily_and_hourly() {
    assert_eq!(next("0 0 * * *", "2024-02-05 00:00"), at("2024-02-06 00:00"));
    assert_eq!(next("0 2 * * *", "2024-02-05 01:59"), at("2024-02-05 02:00"));
    assert_eq!(next("0 * * * *", "2024-02-05 10:30"), at("2024-02-05 11:00"));
    assert_eq!(next("*/15 * * * *", "2024-02-05 10:02"), at("2024-02-05 10:15"));
    assert_eq!(next("30 23 * * *", "2024-12-31 23:30"), at("2025-01-01 23:30"));
  }

  #[test]
  fn ranges_lists_and_steps() {
    assert_eq!(next("0 8-10/2 * * *", "2024-02-05 08:00"), at("2024-02-05 10:00"));
    assert_eq!(next("5,35 * * * *", "2024-02-05 10:06"), at("2024-02-05 10:35"));
    assert_eq!(next("10/20 * * * *", "2024-02-05 10:31"), at("2024-02-05 10:50"));
  }

  #[test]
  fn weekdays_and_sunday_aliases() {
    // 2024-02-05 is a Monday
    assert_eq!(next("0 6 * * 1-5", "2024-02-09 07:00"), at("2024-02-12 06:00"));
    assert_eq!(next("0 6 * * 0", "2024-02-05 07:00"), at("2024-02-11 06:00"));
    assert_eq!(next("0 6 * * 7", "2024-02-05 07:00"), at("2024-02-11 06:00"));
  }

  #[test]
  fn restricted_day_fields_are_ored() {
    // the 15th, or any Monday
    assert_eq!(next("0 0 15 * 1", "2024-02-06 00:00"), at("2024-02-12 00:00"));
    assert_eq!(next("0 0 15 * 1", "2024-02-12 00:00"), at("2024-02-15 00:00"));
  }

  #[test]
  fn month_and_leap_day() {
    assert_eq!(next("0 0 1 */3 *", "2024-02-05 00:00"), at("2024-04-01 00:00"));
    assert_eq!(next("0 12 29 2 *", "2024-03-01 00:00"), at("2028-02-29 12:00"));
    assert!(CronExpr::parse("0 0 30 2 *").unwrap().next_after_naive(at("2024-01-01 00:00")).is_none());
  }

  #[test]
  fn rejects_malformed_expressions() {
    for bad in ["", "* * * *", "60 * * * *", "* 24 * * *", "* * 0 * *", "*/0 * * * *", "5-1 * * * *", "a * * * *"] {
      assert!(CronExpr::parse(bad).is_err(), "{} should be rejected", bad);
    }
    assert!("0 0 * * *".parse::<CronExpr>().is_ok());
  }

  #[test]
  fn next_after_keeps_the_offset() {
    let tz = FixedOffset::east_opt(7 * 3600).unwrap();
    let after = tz.with_ymd_and_hms(2024, 2, 5, 23, 10, 0).unwrap();
    let fire = CronExpr::parse("0 0 * * *").unwrap().next_after(&after).unwrap();
    assert_eq!(fire, tz.with_ymd_and_hms(2024, 2, 6, 0, 0, 0).unwrap());
    assert_eq!(fire.with_timezone(&Utc), Utc.with_ymd_and_hms(2024, 2, 5, 17, 0, 0).unwrap());
  }
}
