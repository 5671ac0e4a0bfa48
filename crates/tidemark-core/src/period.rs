//! Periodicity classes and upstream publish schedules.
//!
//! Sources covered by this engine publish once per period (end of business
//! day, Monday of each week, first day of a quarter, ...) rather than
//! continuously. [`Periodicity`] names the cadence; [`PublishSchedule`]
//! computes the next instant at which a source is expected to have new data,
//! which doubles as the cache expiration policy.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Cadence at which a series is updated upstream.
///
/// `Static` means "fetch once, never incrementally refresh" (classification
/// trees, code lists and the like).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Periodicity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
    Static,
}

impl Periodicity {
    /// Unit used for refresh-window arithmetic. Upstream queries are
    /// date-bounded, so sub-daily cadences refresh like daily series; the
    /// finer cadence only matters for cache expiry.
    pub fn window_unit(self) -> Periodicity {
        match self {
            Periodicity::Second | Periodicity::Minute | Periodicity::Hour => Periodicity::Day,
            other => other,
        }
    }

    /// Whether fetch spans carry discrete period arguments (year, quarter)
    /// instead of date bounds.
    pub fn discrete_periods(self) -> bool {
        matches!(self, Periodicity::Quarter | Periodicity::Year)
    }

    /// Single-letter code used in catalog files and logs. Mirrors the
    /// upstream convention (`m` minute vs `M` month are case-sensitive).
    pub fn code(self) -> &'static str {
        match self {
            Periodicity::Second => "S",
            Periodicity::Minute => "m",
            Periodicity::Hour => "H",
            Periodicity::Day => "D",
            Periodicity::Week => "W",
            Periodicity::Month => "M",
            Periodicity::Quarter => "Q",
            Periodicity::Year => "Y",
            Periodicity::Static => "static",
        }
    }
}

impl fmt::Display for Periodicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Periodicity::Second => "second",
            Periodicity::Minute => "minute",
            Periodicity::Hour => "hour",
            Periodicity::Day => "day",
            Periodicity::Week => "week",
            Periodicity::Month => "month",
            Periodicity::Quarter => "quarter",
            Periodicity::Year => "year",
            Periodicity::Static => "static",
        };
        f.write_str(name)
    }
}

impl FromStr for Periodicity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Single-letter codes first; `m`/`M` differ only by case.
        match s {
            "S" => return Ok(Periodicity::Second),
            "m" => return Ok(Periodicity::Minute),
            "H" => return Ok(Periodicity::Hour),
            "D" | "B" => return Ok(Periodicity::Day),
            "W" => return Ok(Periodicity::Week),
            "M" => return Ok(Periodicity::Month),
            "Q" => return Ok(Periodicity::Quarter),
            "Y" => return Ok(Periodicity::Year),
            _ => {}
        }
        match s.to_ascii_lowercase().as_str() {
            "second" => Ok(Periodicity::Second),
            "minute" => Ok(Periodicity::Minute),
            "hour" => Ok(Periodicity::Hour),
            "day" => Ok(Periodicity::Day),
            "week" => Ok(Periodicity::Week),
            "month" => Ok(Periodicity::Month),
            "quarter" => Ok(Periodicity::Quarter),
            "year" => Ok(Periodicity::Year),
            "static" => Ok(Periodicity::Static),
            other => Err(format!("unknown periodicity: {other}")),
        }
    }
}

/// When an upstream source is expected to publish the next batch of data.
///
/// Expiration is not a fixed TTL: a daily series published at 18:00 local
/// time is fresh all day and goes stale the moment the next business day's
/// 18:00 passes relative to when the entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSchedule {
    pub periodicity: Periodicity,
    pub publish_time: NaiveTime,
}

/// Default site publish time observed upstream.
pub const DEFAULT_PUBLISH_TIME: (u32, u32, u32) = (18, 0, 0);

impl PublishSchedule {
    pub fn new(periodicity: Periodicity, publish_time: NaiveTime) -> Self {
        Self {
            periodicity,
            publish_time,
        }
    }

    /// Schedule for a source refreshed each business day at the default
    /// publish time.
    pub fn daily() -> Self {
        let (h, m, s) = DEFAULT_PUBLISH_TIME;
        Self::new(
            Periodicity::Day,
            NaiveTime::from_hms_opt(h, m, s).expect("valid time"),
        )
    }

    /// Next instant strictly after `t` at which the source publishes.
    /// `None` for static sources, which never republish.
    pub fn next_publish_after(&self, t: NaiveDateTime) -> Option<NaiveDateTime> {
        let at = |d: NaiveDate| d.and_time(self.publish_time);
        match self.periodicity {
            Periodicity::Static => None,
            Periodicity::Second => Some(t + Duration::seconds(1)),
            Periodicity::Minute => Some(t + Duration::minutes(1)),
            Periodicity::Hour => Some(t + Duration::hours(1)),
            Periodicity::Day => Some(at(next_business_day(t.date()))),
            Periodicity::Week => Some(at(next_monday(t.date()))),
            Periodicity::Month => Some(at(add_months(month_start(t.date()), 1))),
            Periodicity::Quarter => Some(at(add_months(quarter_start(t.date()), 3))),
            Periodicity::Year => {
                Some(at(NaiveDate::from_ymd_opt(t.date().year() + 1, 1, 1).expect("valid date")))
            }
        }
    }
}

/// First calendar day of `d`'s month.
pub fn month_start(d: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(d.year(), d.month(), 1).expect("valid date")
}

/// Quarter ordinal of `d`, 1 through 4.
pub fn quarter_of(d: NaiveDate) -> u32 {
    (d.month() - 1) / 3 + 1
}

/// First calendar day of `d`'s quarter.
pub fn quarter_start(d: NaiveDate) -> NaiveDate {
    let month = (quarter_of(d) - 1) * 3 + 1;
    NaiveDate::from_ymd_opt(d.year(), month, 1).expect("valid date")
}

/// Last calendar day of the given quarter.
pub fn quarter_end(year: i32, quarter: u32) -> NaiveDate {
    let start = NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1).expect("valid date");
    add_months(start, 3) - Duration::days(1)
}

/// Shift `d` by `n` calendar months, clamping the day-of-month when the
/// target month is shorter.
pub fn add_months(d: NaiveDate, n: i32) -> NaiveDate {
    let total = d.year() * 12 + d.month0() as i32 + n;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let day = d.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid date");
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid date");
    (next - first).num_days() as u32
}

/// Monday of the week containing `d`.
pub fn monday_of(d: NaiveDate) -> NaiveDate {
    d - Duration::days(d.weekday().num_days_from_monday() as i64)
}

/// First Monday strictly after `d`.
pub fn next_monday(d: NaiveDate) -> NaiveDate {
    let mut next = d + Duration::days(1);
    while next.weekday() != Weekday::Mon {
        next += Duration::days(1);
    }
    next
}

/// Next business day strictly after `d`; Saturday and Sunday roll to Monday.
pub fn next_business_day(d: NaiveDate) -> NaiveDate {
    let mut next = d + Duration::days(1);
    while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
        next += Duration::days(1);
    }
    next
}

/// Number of period starts of `unit` crossed going from `from` to `to`.
/// Negative when `from` is ahead of `to`.
pub fn periods_between(unit: Periodicity, from: NaiveDate, to: NaiveDate) -> i64 {
    match unit.window_unit() {
        Periodicity::Week => {
            let anchor_from = monday_of(from);
            let anchor_to = monday_of(to);
            (anchor_to - anchor_from).num_days() / 7
        }
        Periodicity::Month => {
            (to.year() as i64 * 12 + to.month0() as i64)
                - (from.year() as i64 * 12 + from.month0() as i64)
        }
        Periodicity::Quarter => {
            (to.year() as i64 * 4 + quarter_of(to) as i64)
                - (from.year() as i64 * 4 + quarter_of(from) as i64)
        }
        Periodicity::Year => to.year() as i64 - from.year() as i64,
        // Day and anything treated like it.
        _ => (to - from).num_days(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn dt(y: i32, m: u32, day: u32, h: u32, min: u32) -> NaiveDateTime {
        d(y, m, day).and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn periodicity_round_trips_codes_and_names() {
        assert_eq!("m".parse::<Periodicity>().unwrap(), Periodicity::Minute);
        assert_eq!("M".parse::<Periodicity>().unwrap(), Periodicity::Month);
        assert_eq!("quarter".parse::<Periodicity>().unwrap(), Periodicity::Quarter);
        assert_eq!("Static".parse::<Periodicity>().unwrap(), Periodicity::Static);
        assert!("fortnight".parse::<Periodicity>().is_err());
        assert_eq!(Periodicity::Quarter.code(), "Q");
    }

    #[test]
    fn business_day_rolls_over_weekends() {
        // 2023-08-18 is a Friday.
        assert_eq!(next_business_day(d(2023, 8, 18)), d(2023, 8, 21));
        assert_eq!(next_business_day(d(2023, 8, 19)), d(2023, 8, 21));
        assert_eq!(next_business_day(d(2023, 8, 16)), d(2023, 8, 17));
    }

    #[test]
    fn monday_anchoring() {
        // 2023-08-15 is a Tuesday.
        assert_eq!(monday_of(d(2023, 8, 15)), d(2023, 8, 14));
        assert_eq!(monday_of(d(2023, 8, 14)), d(2023, 8, 14));
        assert_eq!(next_monday(d(2023, 8, 14)), d(2023, 8, 21));
    }

    #[test]
    fn month_math_clamps_short_months() {
        assert_eq!(add_months(d(2023, 1, 31), 1), d(2023, 2, 28));
        assert_eq!(add_months(d(2023, 12, 15), 1), d(2024, 1, 15));
        assert_eq!(add_months(d(2023, 3, 1), -3), d(2022, 12, 1));
        assert_eq!(quarter_start(d(2023, 8, 15)), d(2023, 7, 1));
        assert_eq!(quarter_end(2023, 1), d(2023, 3, 31));
        assert_eq!(quarter_end(2023, 4), d(2023, 12, 31));
    }

    #[test]
    fn next_publish_daily_snaps_to_publish_time() {
        let sched = PublishSchedule::daily();
        // Written Wednesday morning: stale after Thursday 18:00.
        assert_eq!(
            sched.next_publish_after(dt(2023, 8, 16, 9, 30)),
            Some(dt(2023, 8, 17, 18, 0))
        );
        // Written Friday evening: stale after Monday 18:00.
        assert_eq!(
            sched.next_publish_after(dt(2023, 8, 18, 20, 0)),
            Some(dt(2023, 8, 21, 18, 0))
        );
    }

    #[test]
    fn next_publish_week_month_quarter() {
        let t = dt(2023, 8, 15, 10, 0);
        let time = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
        let week = PublishSchedule::new(Periodicity::Week, time);
        assert_eq!(week.next_publish_after(t), Some(dt(2023, 8, 21, 18, 0)));
        let month = PublishSchedule::new(Periodicity::Month, time);
        assert_eq!(month.next_publish_after(t), Some(dt(2023, 9, 1, 18, 0)));
        let quarter = PublishSchedule::new(Periodicity::Quarter, time);
        assert_eq!(quarter.next_publish_after(t), Some(dt(2023, 10, 1, 18, 0)));
        let year = PublishSchedule::new(Periodicity::Year, time);
        assert_eq!(year.next_publish_after(t), Some(dt(2024, 1, 1, 18, 0)));
        let stat = PublishSchedule::new(Periodicity::Static, time);
        assert_eq!(stat.next_publish_after(t), None);
    }

    #[test]
    fn next_publish_is_strictly_after_input() {
        let time = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
        for p in [
            Periodicity::Second,
            Periodicity::Minute,
            Periodicity::Hour,
            Periodicity::Day,
            Periodicity::Week,
            Periodicity::Month,
            Periodicity::Quarter,
            Periodicity::Year,
        ] {
            let sched = PublishSchedule::new(p, time);
            let t = dt(2023, 1, 1, 18, 0);
            let next = sched.next_publish_after(t).unwrap();
            assert!(next > t, "{p} produced {next} not after {t}");
        }
    }

    #[test]
    fn periods_between_counts_boundary_crossings() {
        assert_eq!(periods_between(Periodicity::Day, d(2023, 8, 14), d(2023, 8, 15)), 1);
        assert_eq!(periods_between(Periodicity::Quarter, d(2023, 6, 30), d(2023, 8, 15)), 1);
        assert_eq!(periods_between(Periodicity::Quarter, d(2022, 6, 30), d(2023, 8, 15)), 5);
        assert_eq!(periods_between(Periodicity::Month, d(2023, 6, 20), d(2023, 7, 10)), 1);
        assert_eq!(periods_between(Periodicity::Month, d(2023, 5, 31), d(2023, 7, 10)), 2);
        // Tue -> following Mon crosses one week boundary.
        assert_eq!(periods_between(Periodicity::Week, d(2023, 8, 15), d(2023, 8, 21)), 1);
        assert_eq!(periods_between(Periodicity::Day, d(2023, 8, 15), d(2023, 8, 15)), 0);
        assert_eq!(periods_between(Periodicity::Day, d(2023, 8, 16), d(2023, 8, 15)), -1);
    }
}
