//! Cron expression handling shared by next-fire computation and live timers.
//!
//! Agents use standard five-field cron (`min hour dom month dow`, Sunday = 0
//! or 7). Both the `cron` crate and the job scheduler expect a leading
//! seconds field, and the `cron` crate numbers weekdays from Sunday = 1, so
//! five-field expressions are rewritten with a seconds field and named days.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

const DAY_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

pub fn normalize(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        rewrite_day_of_week(fields[4])
    )
}

fn day_name(value: &str) -> String {
    match value.parse::<usize>() {
        Ok(n) if n < DAY_NAMES.len() => DAY_NAMES[n].to_string(),
        _ => value.to_string(),
    }
}

fn rewrite_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let rewritten = match range.split_once('-') {
                Some(("0", "7")) => "SUN-SAT".to_string(),
                // `5-7` ends on Sunday, which sorts first once named.
                Some((start, "7")) if step.is_none() && start != "0" && start != "7" => {
                    format!("{}-SAT,SUN", day_name(start))
                }
                Some((start, end)) => format!("{}-{}", day_name(start), day_name(end)),
                None => day_name(range),
            };
            match step {
                Some(step) => format!("{}/{}", rewritten, step),
                None => rewritten,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&normalize(expr))
}

/// First fire strictly after `after`, or `None` for an unparseable or
/// exhausted schedule.
pub fn next_fire(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_schedule(expr).ok()?.after(&after).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn five_field_expressions_gain_seconds_and_day_names() {
        assert_eq!(normalize("0 9 * * 1-5"), "0 0 9 * * MON-FRI");
        assert_eq!(normalize("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize("0 0 * * 0,6"), "0 0 0 * * SUN,SAT");
        assert_eq!(normalize("0 0 * * 5-7"), "0 0 0 * * FRI-SAT,SUN");
    }

    #[test]
    fn six_field_expressions_pass_through() {
        assert_eq!(normalize("0  0/5 * * * *"), "0 0/5 * * * *");
    }

    #[test]
    fn weekday_schedule_skips_the_weekend() {
        // Saturday 2026-10-17 10:00 UTC
        let saturday = Utc.with_ymd_and_hms(2026, 10, 17, 10, 0, 0).unwrap();
        let next = next_fire("0 9 * * 1-5", saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.hour(), next.minute()), (9, 0));
    }

    #[test]
    fn invalid_expression_has_no_next_fire() {
        let now = Utc::now();
        assert!(next_fire("61 * * * *", now).is_none());
        assert!(parse_schedule("every tuesday").is_err());
    }
}
