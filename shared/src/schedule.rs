//! Schedule specifications and next-fire computation
//!
//! Recurrence rules are explicit per-type structures discriminated by
//! [`ScheduleType`]; the free-form configuration object coming over the wire
//! is validated by enumerating the recognised fields for each type.
//!
//! All arithmetic runs on naive local wall-clock time with an injected "now",
//! which keeps the computation pure and directly testable. Conversion to
//! epoch seconds happens at the persistence boundary (`utils`).

use crate::model::ScheduleType;
use chrono::{Datelike, Days, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Unit for interval schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
}

/// A validated, typed schedule rule
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// Fire right away
    Immediate,
    /// Fire once at a fixed wall-clock instant
    OnceAt { datetime: NaiveDateTime },
    /// Fire every N seconds/minutes/hours, measured from each fire
    Interval { interval: i64, unit: IntervalUnit },
    /// Fire at the given wall-clock time every day
    Daily { time: NaiveTime },
    /// Fire at the given time on the given ISO weekdays (1 = Monday)
    Weekly { days: Vec<u32>, time: NaiveTime },
    /// Fire at the given time on the given days of month (-1 = last day)
    Monthly { dates: Vec<i32>, time: NaiveTime },
    /// Fire per a cron expression
    Cron {
        schedule: Box<cron::Schedule>,
        expression: String,
    },
}

#[derive(Debug, Deserialize)]
struct OnceAtConfig {
    datetime: String,
}

#[derive(Debug, Deserialize)]
struct IntervalConfig {
    #[serde(default = "default_interval")]
    interval: i64,
    #[serde(default)]
    unit: IntervalUnit,
}

fn default_interval() -> i64 {
    60
}

#[derive(Debug, Deserialize)]
struct DailyConfig {
    time: String,
}

#[derive(Debug, Deserialize)]
struct WeeklyConfig {
    days: Vec<u32>,
    time: String,
}

#[derive(Debug, Deserialize)]
struct MonthlyConfig {
    dates: Vec<i32>,
    time: String,
}

#[derive(Debug, Deserialize)]
struct CronConfig {
    cron_expression: String,
}

impl ScheduleSpec {
    /// Parse and validate a `(type, config)` pair from the wire or the store
    pub fn parse(
        schedule_type: ScheduleType,
        config: &serde_json::Value,
    ) -> Result<Self, String> {
        match schedule_type {
            ScheduleType::Immediate => Ok(ScheduleSpec::Immediate),
            ScheduleType::OnceAt => {
                let cfg: OnceAtConfig = from_config(config)?;
                let datetime =
                    NaiveDateTime::parse_from_str(&cfg.datetime, "%Y-%m-%d %H:%M:%S")
                        .map_err(|e| format!("Invalid datetime '{}': {}", cfg.datetime, e))?;
                Ok(ScheduleSpec::OnceAt { datetime })
            }
            ScheduleType::Interval => {
                let cfg: IntervalConfig = from_config(config)?;
                if cfg.interval < 1 {
                    return Err("interval must be a positive integer".to_string());
                }
                Ok(ScheduleSpec::Interval {
                    interval: cfg.interval,
                    unit: cfg.unit,
                })
            }
            ScheduleType::Daily => {
                let cfg: DailyConfig = from_config(config)?;
                Ok(ScheduleSpec::Daily {
                    time: parse_time(&cfg.time)?,
                })
            }
            ScheduleType::Weekly => {
                let cfg: WeeklyConfig = from_config(config)?;
                if cfg.days.is_empty() {
                    return Err("days must not be empty".to_string());
                }
                if !cfg.days.iter().all(|d| (1..=7).contains(d)) {
                    return Err("days must be a list of numbers between 1 and 7".to_string());
                }
                Ok(ScheduleSpec::Weekly {
                    days: cfg.days,
                    time: parse_time(&cfg.time)?,
                })
            }
            ScheduleType::Monthly => {
                let cfg: MonthlyConfig = from_config(config)?;
                if cfg.dates.is_empty() {
                    return Err("dates must not be empty".to_string());
                }
                if !cfg
                    .dates
                    .iter()
                    .all(|d| *d == -1 || (1..=31).contains(d))
                {
                    return Err(
                        "dates must be numbers between 1 and 31, or -1 for the last day"
                            .to_string(),
                    );
                }
                Ok(ScheduleSpec::Monthly {
                    dates: cfg.dates,
                    time: parse_time(&cfg.time)?,
                })
            }
            ScheduleType::Cron => {
                let cfg: CronConfig = from_config(config)?;
                if cfg.cron_expression.trim().is_empty() {
                    return Err("cron_expression must not be empty".to_string());
                }
                let normalized = normalize_cron(&cfg.cron_expression);
                let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
                    format!("Invalid cron expression '{}': {}", cfg.cron_expression, e)
                })?;
                Ok(ScheduleSpec::Cron {
                    schedule: Box::new(schedule),
                    expression: cfg.cron_expression,
                })
            }
        }
    }

    /// Which schedule type this spec corresponds to
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            ScheduleSpec::Immediate => ScheduleType::Immediate,
            ScheduleSpec::OnceAt { .. } => ScheduleType::OnceAt,
            ScheduleSpec::Interval { .. } => ScheduleType::Interval,
            ScheduleSpec::Daily { .. } => ScheduleType::Daily,
            ScheduleSpec::Weekly { .. } => ScheduleType::Weekly,
            ScheduleSpec::Monthly { .. } => ScheduleType::Monthly,
            ScheduleSpec::Cron { .. } => ScheduleType::Cron,
        }
    }

    /// One-shot schedules deactivate after firing
    pub fn fires_once(&self) -> bool {
        matches!(self, ScheduleSpec::Immediate | ScheduleSpec::OnceAt { .. })
    }

    /// Compute the next fire instant strictly relative to `now`
    ///
    /// `None` means the schedule never fires again (a `once-at` whose target
    /// has passed, or a cron expression with no future occurrence).
    pub fn next_fire(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            ScheduleSpec::Immediate => Some(now),
            ScheduleSpec::OnceAt { datetime } => {
                if *datetime > now {
                    Some(*datetime)
                } else {
                    None
                }
            }
            ScheduleSpec::Interval { interval, unit } => {
                let delta = match unit {
                    IntervalUnit::Seconds => Duration::seconds(*interval),
                    IntervalUnit::Minutes => Duration::minutes(*interval),
                    IntervalUnit::Hours => Duration::hours(*interval),
                };
                now.checked_add_signed(delta)
            }
            ScheduleSpec::Daily { time } => {
                let today = now.date().and_time(*time);
                if today > now {
                    Some(today)
                } else {
                    now.date().checked_add_days(Days::new(1)).map(|d| d.and_time(*time))
                }
            }
            ScheduleSpec::Weekly { days, time } => {
                // Scan the next two weeks; with a non-empty day set a match
                // always exists within 8 days.
                for offset in 0..14u64 {
                    let date = now.date().checked_add_days(Days::new(offset))?;
                    if days.contains(&date.weekday().number_from_monday()) {
                        let candidate = date.and_time(*time);
                        if candidate > now {
                            return Some(candidate);
                        }
                    }
                }
                None
            }
            ScheduleSpec::Monthly { dates, time } => {
                let this_month = now.date().with_day(1)?;
                let next_month = this_month.checked_add_months(Months::new(1))?;
                for month in [this_month, next_month] {
                    for &date in dates {
                        let day = if date == -1 {
                            last_day_of_month(month)
                        } else {
                            date as u32
                        };
                        // Days that do not exist in this month (e.g. 30 Feb)
                        // are skipped.
                        let Some(d) = NaiveDate::from_ymd_opt(month.year(), month.month(), day)
                        else {
                            continue;
                        };
                        let candidate = d.and_time(*time);
                        if candidate > now {
                            return Some(candidate);
                        }
                    }
                }
                None
            }
            ScheduleSpec::Cron { schedule, .. } => {
                let local_now = chrono::Local
                    .from_local_datetime(&now)
                    .earliest()?;
                schedule.after(&local_now).next().map(|dt| dt.naive_local())
            }
        }
    }
}

fn from_config<T: serde::de::DeserializeOwned>(config: &serde_json::Value) -> Result<T, String> {
    serde_json::from_value(config.clone()).map_err(|e| format!("Invalid schedule config: {}", e))
}

fn parse_time(time: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(time, "%H:%M:%S")
        .map_err(|e| format!("Invalid time '{}': {}", time, e))
}

/// Last calendar day of the month containing `date`
fn last_day_of_month(date: NaiveDate) -> u32 {
    let first = date.with_day(1).unwrap_or(date);
    first
        .checked_add_months(Months::new(1))
        .and_then(|d| d.checked_sub_days(Days::new(1)))
        .map(|d| d.day())
        .unwrap_or(28)
}

/// The cron library expects a seconds column; plain five-field expressions
/// are widened by pinning seconds to zero.
fn normalize_cron(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // 2025-06-15 is a Sunday.
    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_immediate_fires_now() {
        let spec = ScheduleSpec::parse(ScheduleType::Immediate, &json!({})).unwrap();
        assert_eq!(spec.next_fire(now()), Some(now()));
        assert!(spec.fires_once());
    }

    #[test]
    fn test_once_at_future_and_past() {
        let spec = ScheduleSpec::parse(
            ScheduleType::OnceAt,
            &json!({"datetime": "2025-06-20 08:00:00"}),
        )
        .unwrap();
        assert_eq!(spec.next_fire(now()), Some(at(2025, 6, 20, 8, 0, 0)));

        let past = ScheduleSpec::parse(
            ScheduleType::OnceAt,
            &json!({"datetime": "2025-01-01 00:00:00"}),
        )
        .unwrap();
        assert_eq!(past.next_fire(now()), None);
    }

    #[test]
    fn test_once_at_rejects_bad_datetime() {
        let err = ScheduleSpec::parse(
            ScheduleType::OnceAt,
            &json!({"datetime": "June 20th"}),
        )
        .unwrap_err();
        assert!(err.contains("Invalid datetime"));
    }

    #[test]
    fn test_interval_units() {
        let minutes = ScheduleSpec::parse(
            ScheduleType::Interval,
            &json!({"interval": 5, "unit": "minutes"}),
        )
        .unwrap();
        assert_eq!(minutes.next_fire(now()), Some(at(2025, 6, 15, 10, 35, 0)));

        let hours = ScheduleSpec::parse(
            ScheduleType::Interval,
            &json!({"interval": 2, "unit": "hours"}),
        )
        .unwrap();
        assert_eq!(hours.next_fire(now()), Some(at(2025, 6, 15, 12, 30, 0)));

        // Defaults: 60 seconds
        let default = ScheduleSpec::parse(ScheduleType::Interval, &json!({})).unwrap();
        assert_eq!(default.next_fire(now()), Some(at(2025, 6, 15, 10, 31, 0)));
    }

    #[test]
    fn test_interval_rejects_non_positive() {
        let err =
            ScheduleSpec::parse(ScheduleType::Interval, &json!({"interval": 0})).unwrap_err();
        assert!(err.contains("positive"));
    }

    #[test]
    fn test_daily_rolls_to_tomorrow_when_time_passed() {
        let spec =
            ScheduleSpec::parse(ScheduleType::Daily, &json!({"time": "09:00:00"})).unwrap();
        assert_eq!(spec.next_fire(now()), Some(at(2025, 6, 16, 9, 0, 0)));

        let later =
            ScheduleSpec::parse(ScheduleType::Daily, &json!({"time": "23:15:00"})).unwrap();
        assert_eq!(later.next_fire(now()), Some(at(2025, 6, 15, 23, 15, 0)));
    }

    #[test]
    fn test_weekly_picks_next_matching_day() {
        // Monday from a Sunday morning
        let spec = ScheduleSpec::parse(
            ScheduleType::Weekly,
            &json!({"days": [1], "time": "09:00:00"}),
        )
        .unwrap();
        assert_eq!(spec.next_fire(now()), Some(at(2025, 6, 16, 9, 0, 0)));

        // Same day, time still ahead
        let sunday = ScheduleSpec::parse(
            ScheduleType::Weekly,
            &json!({"days": [7], "time": "22:00:00"}),
        )
        .unwrap();
        assert_eq!(sunday.next_fire(now()), Some(at(2025, 6, 15, 22, 0, 0)));

        // Same day, time already passed: next week
        let next_week = ScheduleSpec::parse(
            ScheduleType::Weekly,
            &json!({"days": [7], "time": "08:00:00"}),
        )
        .unwrap();
        assert_eq!(next_week.next_fire(now()), Some(at(2025, 6, 22, 8, 0, 0)));
    }

    #[test]
    fn test_weekly_rejects_out_of_range_days() {
        let err = ScheduleSpec::parse(
            ScheduleType::Weekly,
            &json!({"days": [0, 8], "time": "09:00:00"}),
        )
        .unwrap_err();
        assert!(err.contains("between 1 and 7"));
    }

    #[test]
    fn test_monthly_this_and_next_month() {
        let spec = ScheduleSpec::parse(
            ScheduleType::Monthly,
            &json!({"dates": [20], "time": "06:00:00"}),
        )
        .unwrap();
        assert_eq!(spec.next_fire(now()), Some(at(2025, 6, 20, 6, 0, 0)));

        // The 1st has already passed in June, so July 1st is next
        let first = ScheduleSpec::parse(
            ScheduleType::Monthly,
            &json!({"dates": [1], "time": "06:00:00"}),
        )
        .unwrap();
        assert_eq!(first.next_fire(now()), Some(at(2025, 7, 1, 6, 0, 0)));
    }

    #[test]
    fn test_monthly_last_day_marker() {
        let spec = ScheduleSpec::parse(
            ScheduleType::Monthly,
            &json!({"dates": [-1], "time": "12:00:00"}),
        )
        .unwrap();
        assert_eq!(spec.next_fire(now()), Some(at(2025, 6, 30, 12, 0, 0)));
    }

    #[test]
    fn test_monthly_skips_invalid_dates() {
        // June has no 31st; the rule falls through to July 31st.
        let spec = ScheduleSpec::parse(
            ScheduleType::Monthly,
            &json!({"dates": [31], "time": "12:00:00"}),
        )
        .unwrap();
        assert_eq!(spec.next_fire(now()), Some(at(2025, 7, 31, 12, 0, 0)));
    }

    #[test]
    fn test_cron_five_field_expression() {
        let spec = ScheduleSpec::parse(
            ScheduleType::Cron,
            &json!({"cron_expression": "*/5 * * * *"}),
        )
        .unwrap();
        let next = spec
            .next_fire(at(2025, 6, 15, 10, 31, 0))
            .expect("cron schedule should have a next fire");
        assert_eq!(next, at(2025, 6, 15, 10, 35, 0));
    }

    #[test]
    fn test_cron_rejects_garbage() {
        let err = ScheduleSpec::parse(
            ScheduleType::Cron,
            &json!({"cron_expression": "every tuesday"}),
        )
        .unwrap_err();
        assert!(err.contains("Invalid cron expression"));
    }

    #[test]
    fn test_last_day_of_month_handles_february() {
        assert_eq!(
            last_day_of_month(NaiveDate::from_ymd_opt(2025, 2, 10).unwrap()),
            28
        );
        assert_eq!(
            last_day_of_month(NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()),
            29
        );
        assert_eq!(
            last_day_of_month(NaiveDate::from_ymd_opt(2025, 12, 1).unwrap()),
            31
        );
    }
}
