//! Workshop build scheduling: working days, backward start-date walk and dispatch time.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Weekday};
use thiserror::Error;
use tracing::warn;

/// Units of work one carpenter covers in half a day.
pub const UNITS_PER_HALF_DAY: f64 = 4.0;

const MAX_EFFECTIVE_DAYS: i64 = 36_500;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("total quantity is missing or not a finite number")]
    InvalidTotal,
    #[error("carpenter count {0:?} must be a positive integer")]
    InvalidCarpenters(Option<i32>),
    #[error("working days {0} out of range")]
    OutOfRange(f64),
    #[error("no dispatch timestamp present")]
    MissingDispatch,
    #[error("unparsable dispatch timestamp `{0}`")]
    Parse(String),
}

pub fn try_working_days(
    total_quantity: Option<f64>,
    carpenters: Option<i32>,
) -> Result<f64, ScheduleError> {
    let total = total_quantity
        .filter(|t| t.is_finite())
        .ok_or(ScheduleError::InvalidTotal)?;
    let carpenters = carpenters
        .filter(|c| *c > 0)
        .ok_or(ScheduleError::InvalidCarpenters(carpenters))?;
    let half_days = ((total / UNITS_PER_HALF_DAY) / f64::from(carpenters)).ceil();
    Ok(half_days / 2.0)
}

/// Working days at half-day resolution; invalid input logs a warning and yields 0.
pub fn working_days(total_quantity: Option<f64>, carpenters: Option<i32>) -> f64 {
    match try_working_days(total_quantity, carpenters) {
        Ok(days) => days,
        Err(err) => {
            warn!(?total_quantity, ?carpenters, error = %err, "working days defaulted to 0");
            0.0
        }
    }
}

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Walk back from `reference` far enough to fit `working_days` of build.
///
/// Planned-finish mode counts the finish date itself as a build day, so zero working days with
/// weekends included lands the day after `reference`. Without weekends, only Monday to Friday
/// consume days and a non-positive count stays on `reference`.
pub fn start_build_date(
    working_days: f64,
    reference: NaiveDate,
    include_weekends: bool,
    planned_finish: bool,
) -> Result<NaiveDate, ScheduleError> {
    if !working_days.is_finite() {
        return Err(ScheduleError::OutOfRange(working_days));
    }
    let whole = working_days.ceil();
    if whole.abs() > MAX_EFFECTIVE_DAYS as f64 {
        return Err(ScheduleError::OutOfRange(working_days));
    }
    let mut effective = whole as i64;
    if planned_finish {
        effective -= 1;
    }

    if include_weekends {
        return reference
            .checked_sub_signed(Duration::days(effective))
            .ok_or(ScheduleError::OutOfRange(working_days));
    }

    let mut day = reference;
    while effective > 0 {
        day = day.pred_opt().ok_or(ScheduleError::OutOfRange(working_days))?;
        if is_weekday(day) {
            effective -= 1;
        }
    }
    Ok(day)
}

/// First non-blank of load, deliver, booking start, as wall-clock date and minute.
pub fn dispatch_datetime(
    load_starts_at: Option<&str>,
    deliver_starts_at: Option<&str>,
    starts_at: Option<&str>,
) -> Result<(NaiveDate, NaiveTime), ScheduleError> {
    let raw = [load_starts_at, deliver_starts_at, starts_at]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .ok_or(ScheduleError::MissingDispatch)?;
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| ScheduleError::Parse(raw.to_string()))?
        .naive_local();
    let time = NaiveTime::from_hms_opt(parsed.hour(), parsed.minute(), 0)
        .ok_or_else(|| ScheduleError::Parse(raw.to_string()))?;
    Ok((parsed.date(), time))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn working_days_rounds_up_to_half_days() {
        assert_eq!(working_days(Some(40.0), Some(2)), 2.5);
        assert_eq!(working_days(Some(0.0), Some(1)), 0.0);
        assert_eq!(working_days(Some(9.0), Some(1)), 1.5);
    }

    #[test]
    fn bad_inputs_default_to_zero() {
        assert_eq!(working_days(None, Some(2)), 0.0);
        assert_eq!(working_days(Some(f64::NAN), Some(2)), 0.0);
        assert_eq!(working_days(Some(12.0), Some(0)), 0.0);
        assert_eq!(
            try_working_days(Some(12.0), Some(-1)),
            Err(ScheduleError::InvalidCarpenters(Some(-1)))
        );
    }

    #[test]
    fn weekday_walk_skips_weekend() {
        let monday = date(2024, 1, 8);
        assert_eq!(
            start_build_date(3.0, monday, false, false).unwrap(),
            date(2024, 1, 3)
        );
        assert_eq!(
            start_build_date(2.5, monday, false, false).unwrap(),
            date(2024, 1, 3)
        );
    }

    #[test]
    fn weekends_subtract_calendar_days() {
        let monday = date(2024, 1, 8);
        assert_eq!(
            start_build_date(3.0, monday, true, false).unwrap(),
            date(2024, 1, 5)
        );
    }

    #[test]
    fn planned_finish_counts_the_finish_day() {
        let monday = date(2024, 1, 8);
        assert_eq!(
            start_build_date(1.0, monday, false, true).unwrap(),
            monday
        );
        assert_eq!(
            start_build_date(2.0, monday, false, true).unwrap(),
            date(2024, 1, 5)
        );
        assert_eq!(start_build_date(0.0, monday, false, true).unwrap(), monday);
    }

    #[test]
    fn planned_finish_with_nothing_to_build_rolls_forward_on_calendar_days() {
        let monday = date(2024, 1, 8);
        assert_eq!(
            start_build_date(0.0, monday, true, true).unwrap(),
            date(2024, 1, 9)
        );
        assert_eq!(start_build_date(0.0, monday, true, false).unwrap(), monday);
    }

    #[test]
    fn absurd_working_days_are_rejected() {
        let monday = date(2024, 1, 8);
        assert!(start_build_date(f64::INFINITY, monday, false, false).is_err());
        assert!(start_build_date(1.0e9, monday, true, false).is_err());
        assert!(start_build_date(-1.0e9, monday, true, false).is_err());
    }

    #[test]
    fn dispatch_uses_priority_and_truncates_to_minute() {
        let (d, t) = dispatch_datetime(
            Some("  "),
            Some("2024-02-01T07:45:31.250Z"),
            Some("2024-02-02T09:00:00.000Z"),
        )
        .unwrap();
        assert_eq!(d, date(2024, 2, 1));
        assert_eq!(t, NaiveTime::from_hms_opt(7, 45, 0).unwrap());
    }

    #[test]
    fn dispatch_errors_without_usable_timestamp() {
        assert_eq!(
            dispatch_datetime(None, None, None),
            Err(ScheduleError::MissingDispatch)
        );
        assert!(matches!(
            dispatch_datetime(None, None, Some("next tuesday")),
            Err(ScheduleError::Parse(_))
        ));
    }
}
