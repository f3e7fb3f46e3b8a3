//! Turns a task filter into the logical days it covers and the half-open
//! `[date@day_start, (date+1)@day_start)` window each of those days reads.
//!
//! Everything here is pure: "today" is passed in by the caller, and a value
//! that does not parse is an input error rather than a silent fallback.

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use crate::error::{PipelineError, Result};
use crate::models::{non_empty, TaskFilter};

static DAY_START_RE: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)$").expect("day start pattern compiles")
});

/// Clock time at which one logical day ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DayStart(NaiveTime);

impl DayStart {
  pub fn midnight() -> Self {
    DayStart(NaiveTime::default())
  }

  /// Parses `HH:MM`. Blank input means midnight.
  pub fn parse(value: &str) -> Result<Self> {
    let value = value.trim();
    if value.is_empty() {
      return Ok(Self::midnight());
    }
    let caps = DAY_START_RE
      .captures(value)
      .ok_or_else(|| PipelineError::invalid(format!("day start time '{}' is not HH:MM", value)))?;
    let hour: u32 = caps[1].parse().map_err(|_| PipelineError::invalid(format!("bad hour in '{}'", value)))?;
    let minute: u32 = caps[2].parse().map_err(|_| PipelineError::invalid(format!("bad minute in '{}'", value)))?;
    NaiveTime::from_hms_opt(hour, minute, 0)
      .map(DayStart)
      .ok_or_else(|| PipelineError::invalid(format!("day start time '{}' is out of range", value)))
  }

  pub fn time(&self) -> NaiveTime {
    self.0
  }
}

/// One logical day's `[start, end)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
  pub date: NaiveDate,
  pub start: NaiveDateTime,
  pub end: NaiveDateTime,
}

impl Window {
  /// Last whole second inside the window, for sources that filter with an
  /// inclusive upper bound.
  pub fn last_second(&self) -> NaiveDateTime {
    self.end - TimeDelta::seconds(1)
  }

  pub fn contains(&self, at: NaiveDateTime) -> bool {
    self.start <= at && at < self.end
  }
}

pub fn resolve_window(date: NaiveDate, day_start: DayStart) -> Window {
  let start = date.and_time(day_start.time());
  let end = date
    .checked_add_days(Days::new(1))
    .unwrap_or(NaiveDate::MAX)
    .and_time(day_start.time());
  Window { date, start, end }
}

/// Accepts `YYYY-MM-DD`, or a datetime whose date part is used
/// (`YYYY-MM-DDTHH:MM:SS` / `YYYY-MM-DD HH:MM:SS`).
pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
  let value = value.trim();
  if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
    return Ok(date);
  }
  for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
    if let Ok(at) = NaiveDateTime::parse_from_str(value, format) {
      return Ok(at.date());
    }
  }
  Err(PipelineError::invalid(format!("{} '{}' is not a valid date", field, value)))
}

/// Calendar days a filter covers, in order. A range produces every day in
/// `[range_start, range_end]`; otherwise exactly one day.
pub fn plan_days(filter: &TaskFilter, today: NaiveDate) -> Result<Vec<NaiveDate>> {
  if filter.is_range() {
    let start = parse_date("range_start", non_empty(&filter.range_start).unwrap_or_default())?;
    let end = parse_date("range_end", non_empty(&filter.range_end).unwrap_or_default())?;
    if end < start {
      return Err(PipelineError::invalid(format!(
        "range_end {} is before range_start {}", end, start
      )));
    }
    return Ok(start.iter_days().take_while(|d| *d <= end).collect());
  }

  let day = if let Some(date) = non_empty(&filter.date) {
    parse_date("date", date)?
  } else if let Some(start) = non_empty(&filter.range_start) {
    parse_date("range_start", start)?
  } else {
    today
  };
  Ok(vec![day])
}

/// The filter's own day start wins over the configured default.
pub fn effective_day_start(filter: &TaskFilter, default_day_start: &str) -> Result<DayStart> {
  match non_empty(&filter.day_start_time) {
    Some(value) => DayStart::parse(value),
    None => DayStart::parse(default_day_start),
  }
}

/// Up-front check used before a task or schedule is persisted: every date
/// must parse, a range must not be inverted and the day start must be HH:MM.
pub fn validate_filter(filter: &TaskFilter, today: NaiveDate) -> Result<()> {
  effective_day_start(filter, "")?;
  plan_days(filter, today)?;
  Ok(())
}

pub fn resolve_windows(filter: &TaskFilter, default_day_start: &str, today: NaiveDate) -> Result<Vec<Window>> {
  let day_start = effective_day_start(filter, default_day_start)?;
  Ok(plan_days(filter, today)?
    .into_iter()
    .map(|date| resolve_window(date, day_start))
    .collect())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
  }

  fn single(date: &str) -> TaskFilter {
    TaskFilter { date: Some(date.into()), ..Default::default() }
  }

  fn range(start: &str, end: &str) -> TaskFilter {
    TaskFilter { range_start: Some(start.into()), range_end: Some(end.into()), ..Default::default() }
  }

  #[test]
  fn midnight_window_spans_one_calendar_day() {
    let windows = resolve_windows(&single("2024-02-05"), "00:00", d(2030, 1, 1)).unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].start, at("2024-02-05 00:00:00"));
    assert_eq!(windows[0].end, at("2024-02-06 00:00:00"));
  }

  #[test]
  fn shifted_day_start_moves_both_bounds() {
    let windows = resolve_windows(&single("2024-02-05"), "02:00", d(2030, 1, 1)).unwrap();
    let w = windows[0];
    assert_eq!(w.start, at("2024-02-05 02:00:00"));
    assert_eq!(w.last_second(), at("2024-02-06 01:59:59"));
    assert!(w.contains(at("2024-02-06 01:59:59")));
    assert!(!w.contains(at("2024-02-06 02:00:00")));
    assert!(!w.contains(at("2024-02-05 01:59:59")));
  }

  #[test]
  fn every_window_is_exactly_one_day_long() {
    for start in ["00:00", "02:00", "23:59", "7:15"] {
      let day_start = DayStart::parse(start).unwrap();
      let mut date = d(2024, 1, 1);
      while date < d(2024, 12, 31) {
        let w = resolve_window(date, day_start);
        assert_eq!(w.end - w.start, TimeDelta::hours(24));
        assert_eq!(w.start.time(), day_start.time());
        date = date.succ_opt().unwrap();
      }
    }
  }

  #[test]
  fn filter_day_start_overrides_default() {
    let filter = TaskFilter { day_start_time: Some("06:00".into()), ..single("2024-02-05") };
    let w = resolve_windows(&filter, "02:00", d(2030, 1, 1)).unwrap()[0];
    assert_eq!(w.start, at("2024-02-05 06:00:00"));
  }

  #[test]
  fn resolving_twice_is_identical() {
    let filter = range("2024-02-28", "2024-03-01");
    let a = resolve_windows(&filter, "02:00", d(2030, 1, 1)).unwrap();
    let b = resolve_windows(&filter, "02:00", d(2030, 1, 1)).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 3);
    assert_eq!(a[1].date, d(2024, 2, 29));
  }

  #[test]
  fn range_yields_one_pass_per_day_inclusive() {
    let days = plan_days(&range("2024-02-05", "2024-02-07"), d(2030, 1, 1)).unwrap();
    assert_eq!(days, vec![d(2024, 2, 5), d(2024, 2, 6), d(2024, 2, 7)]);

    let same_day = plan_days(&range("2024-02-05", "2024-02-05"), d(2030, 1, 1)).unwrap();
    assert_eq!(same_day.len(), 1);

    let long = plan_days(&range("2023-12-30", "2024-01-30"), d(2030, 1, 1)).unwrap();
    assert_eq!(long.len() as i64, (d(2024, 1, 30) - d(2023, 12, 30)).num_days() + 1);
  }

  #[test]
  fn range_accepts_datetime_bounds() {
    let days = plan_days(&range("2024-02-05T08:00:00", "2024-02-06 17:30:00"), d(2030, 1, 1)).unwrap();
    assert_eq!(days, vec![d(2024, 2, 5), d(2024, 2, 6)]);
  }

  #[test]
  fn inverted_range_is_rejected() {
    let err = plan_days(&range("2024-02-07", "2024-02-05"), d(2030, 1, 1)).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
  }

  #[test]
  fn unparsable_dates_are_rejected_not_replaced() {
    assert!(plan_days(&single("05/02/2024"), d(2030, 1, 1)).is_err());
    assert!(plan_days(&range("2024-02-05", "soon"), d(2030, 1, 1)).is_err());
    assert!(plan_days(&single("2024-02-30"), d(2030, 1, 1)).is_err());
  }

  #[test]
  fn empty_filter_means_today() {
    let today = d(2026, 10, 19);
    assert_eq!(plan_days(&TaskFilter::default(), today).unwrap(), vec![today]);
    assert_eq!(plan_days(&single("  "), today).unwrap(), vec![today]);
  }

  #[test]
  fn lone_range_start_is_a_single_day() {
    let filter = TaskFilter { range_start: Some("2024-02-05".into()), ..Default::default() };
    assert_eq!(plan_days(&filter, d(2030, 1, 1)).unwrap(), vec![d(2024, 2, 5)]);
  }

  #[test]
  fn validation_matches_resolution() {
    let today = d(2030, 1, 1);
    assert!(validate_filter(&range("2024-02-05", "2024-02-07"), today).is_ok());
    assert!(validate_filter(&range("2024-02-07", "2024-02-05"), today).is_err());
    let bad_start = TaskFilter { day_start_time: Some("25:00".into()), ..single("2024-02-05") };
    assert!(validate_filter(&bad_start, today).is_err());
  }

  #[test]
  fn day_start_parsing() {
    assert_eq!(DayStart::parse("").unwrap(), DayStart::midnight());
    assert_eq!(DayStart::parse("02:00").unwrap().time(), NaiveTime::from_hms_opt(2, 0, 0).unwrap());
    assert!(DayStart::parse("24:00").is_err());
    assert!(DayStart::parse("02:60").is_err());
    assert!(DayStart::parse("120").is_err());
  }
}
