//! Calendar flooring for the `timeunit` operator.
//!
//! Units absent from the set take their epoch defaults: year 2012,
//! January, the first of the month, midnight. 2012 starts on a Sunday, so
//! `day` alone lands on the matching weekday of its first week.

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

const DEFAULT_YEAR: i32 = 2012;

/// Calendar unit, ordered from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Year,
    Quarter,
    Month,
    /// Sunday-based week of the year.
    Week,
    Date,
    Day,
    DayOfYear,
    Hours,
    Minutes,
    Seconds,
    Milliseconds,
}

/// Floor `millis` to `units` in `tz`, returning the epoch milliseconds of
/// the unit's start and of the next unit boundary.
pub fn floor(millis: i64, units: &[TimeUnit], tz: Tz) -> Option<(i64, i64)> {
    let smallest = units.iter().max()?;
    let local = DateTime::<Utc>::from_timestamp_millis(millis)?
        .with_timezone(&tz)
        .naive_local();
    let start = floor_local(&local, units)?;
    let end = advance(start, *smallest)?;
    Some((to_millis(start, tz)?, to_millis(end, tz)?))
}

fn floor_local(local: &NaiveDateTime, units: &[TimeUnit]) -> Option<NaiveDateTime> {
    let has = |unit: TimeUnit| units.contains(&unit);

    let year = if has(TimeUnit::Year) {
        local.year()
    } else {
        DEFAULT_YEAR
    };
    let month0 = if has(TimeUnit::Month) {
        local.month0()
    } else if has(TimeUnit::Quarter) {
        local.month0() / 3 * 3
    } else {
        0
    };

    let own_first = NaiveDate::from_ymd_opt(local.year(), 1, 1)?;
    let week = i64::from((local.ordinal0() + own_first.weekday().num_days_from_sunday()) / 7);
    let base_first = i64::from(
        NaiveDate::from_ymd_opt(year, 1, 1)?
            .weekday()
            .num_days_from_sunday(),
    );
    let weekday = i64::from(local.weekday().num_days_from_sunday());

    // one-based day offset from the first of `month0`; may leave the month
    let day = if has(TimeUnit::Week) && has(TimeUnit::Day) {
        1 + 7 * week - base_first + weekday
    } else if has(TimeUnit::Week) {
        1 + 7 * week - base_first
    } else if has(TimeUnit::Day) {
        1 + weekday
    } else if has(TimeUnit::Date) {
        i64::from(local.day())
    } else if has(TimeUnit::DayOfYear) {
        1 + i64::from(local.ordinal0())
    } else {
        1
    };
    let date = NaiveDate::from_ymd_opt(year, month0 + 1, 1)?
        .checked_add_signed(Duration::days(day - 1))?;

    let pick = |unit: TimeUnit, value: u32| if has(unit) { value } else { 0 };
    date.and_hms_milli_opt(
        pick(TimeUnit::Hours, local.hour()),
        pick(TimeUnit::Minutes, local.minute()),
        pick(TimeUnit::Seconds, local.second()),
        pick(TimeUnit::Milliseconds, (local.nanosecond() / 1_000_000).min(999)),
    )
}

fn advance(start: NaiveDateTime, unit: TimeUnit) -> Option<NaiveDateTime> {
    match unit {
        TimeUnit::Year => start.checked_add_months(Months::new(12)),
        TimeUnit::Quarter => start.checked_add_months(Months::new(3)),
        TimeUnit::Month => start.checked_add_months(Months::new(1)),
        TimeUnit::Week => start.checked_add_signed(Duration::days(7)),
        TimeUnit::Date | TimeUnit::Day | TimeUnit::DayOfYear => {
            start.checked_add_signed(Duration::days(1))
        }
        TimeUnit::Hours => start.checked_add_signed(Duration::hours(1)),
        TimeUnit::Minutes => start.checked_add_signed(Duration::minutes(1)),
        TimeUnit::Seconds => start.checked_add_signed(Duration::seconds(1)),
        TimeUnit::Milliseconds => start.checked_add_signed(Duration::milliseconds(1)),
    }
}

/// Local wall time to epoch milliseconds. Times skipped by a DST change
/// resolve to the first instant after the gap.
fn to_millis(local: NaiveDateTime, tz: Tz) -> Option<i64> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn year_month_floors_to_the_first() {
        let ts = utc(2024, 3, 15, 10) + 1_234;
        assert_eq!(
            floor(ts, &[TimeUnit::Year, TimeUnit::Month], Tz::UTC),
            Some((utc(2024, 3, 1, 0), utc(2024, 4, 1, 0)))
        );
        assert_eq!(
            floor(utc(2024, 8, 10, 0), &[TimeUnit::Year, TimeUnit::Quarter], Tz::UTC),
            Some((utc(2024, 7, 1, 0), utc(2024, 10, 1, 0)))
        );
    }

    #[test]
    fn missing_units_take_epoch_defaults() {
        let ts = utc(2024, 3, 15, 10);
        assert_eq!(
            floor(ts, &[TimeUnit::Month], Tz::UTC),
            Some((utc(2012, 3, 1, 0), utc(2012, 4, 1, 0)))
        );
        // 2024-03-15 is a Friday; so is 2012-01-06
        assert_eq!(
            floor(ts, &[TimeUnit::Day], Tz::UTC),
            Some((utc(2012, 1, 6, 0), utc(2012, 1, 7, 0)))
        );
        assert_eq!(
            floor(ts, &[TimeUnit::Hours], Tz::UTC),
            Some((utc(2012, 1, 1, 10), utc(2012, 1, 1, 11)))
        );
    }

    #[test]
    fn weeks_start_on_sunday() {
        // Friday 2021-01-01 belongs to the week of Sunday 2020-12-27
        assert_eq!(
            floor(utc(2021, 1, 1, 12), &[TimeUnit::Year, TimeUnit::Week], Tz::UTC),
            Some((utc(2020, 12, 27, 0), utc(2021, 1, 3, 0)))
        );
    }

    #[test]
    fn local_zone_shifts_the_floor() {
        // 2024-01-01T03:00Z is 22:00 on Dec 31 in New York
        let ny: Tz = "America/New_York".parse().unwrap();
        let (start, _) = floor(utc(2024, 1, 1, 3), &[TimeUnit::Year, TimeUnit::Month, TimeUnit::Date], ny)
            .unwrap();
        assert_eq!(start, utc(2023, 12, 31, 5));
    }

    #[test]
    fn no_units_is_none() {
        assert_eq!(floor(0, &[], Tz::UTC), None);
    }
}
