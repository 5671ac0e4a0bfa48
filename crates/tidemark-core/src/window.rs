//! Refresh-window calculation.
//!
//! Given a series' periodicity and the high-water mark already persisted,
//! compute the `[start, end]` range worth requesting from the fetch
//! collaborator. The window is recomputed from durable storage state on
//! every cycle, so a crash simply re-derives identical work on the next run.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::period::{
    add_months, monday_of, month_start, periods_between, quarter_of, quarter_start, Periodicity,
};

/// Per-series refresh parameters, derived from the catalog and storage
/// state each cycle; never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSpec {
    pub series_id: String,
    pub periodicity: Periodicity,
    /// Fallback lower bound when no local data exists.
    pub default_start: NaiveDate,
    /// Trailing periods re-fetched to absorb late upstream corrections.
    pub lookback_periods: u32,
}

/// A refresh window, before splitting into collaborator-sized spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchWindow {
    /// Static series with no local data: fetch everything, once.
    Full,
    /// Incremental range, inclusive on both ends.
    Range {
        start: NaiveDate,
        end: NaiveDate,
        periodicity: Periodicity,
    },
}

/// One collaborator-sized query. Quarter and Year series are queried with
/// discrete period arguments upstream, not date ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchSpan {
    Full,
    Dates { start: NaiveDate, end: NaiveDate },
    Quarter { year: i32, quarter: u32 },
    Year { year: i32 },
}

impl std::fmt::Display for FetchSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchSpan::Full => f.write_str("full"),
            FetchSpan::Dates { start, end } => {
                write!(f, "{}..{}", start.format("%Y%m%d"), end.format("%Y%m%d"))
            }
            FetchSpan::Quarter { year, quarter } => write!(f, "{year}q{quarter}"),
            FetchSpan::Year { year } => write!(f, "{year}"),
        }
    }
}

/// Gap beyond which data is presumed immutable and lookback widening is
/// skipped: re-fetching would be wasted work.
const HISTORICAL_GAP_PERIODS: i64 = 2;

/// Compute the next refresh window for `spec`, or `None` when the series
/// needs no refresh.
///
/// The Week and Month branches reproduce observed upstream publishing
/// quirks (Monday-anchored weekly tables rewritten in place; month tables
/// that correct only the trailing month). The thresholds are observed
/// upstream behavior, not tuning knobs.
pub fn refresh_window(
    spec: &SeriesSpec,
    last_mark: Option<NaiveDate>,
    now: NaiveDate,
    end_override: Option<NaiveDate>,
) -> Option<FetchWindow> {
    if spec.periodicity == Periodicity::Static {
        return match last_mark {
            None => Some(FetchWindow::Full),
            Some(_) => None,
        };
    }

    let unit = spec.periodicity.window_unit();
    let end = end_override.unwrap_or(now);
    let candidate = match last_mark {
        None => spec.default_start,
        Some(mark) => {
            let crossed = periods_between(unit, mark, now);
            match unit {
                // Weekly tables are rewritten in place upstream; rewind one
                // week instead of advancing.
                Periodicity::Week => mark - Duration::days(7),
                Periodicity::Month => month_candidate(mark, crossed, spec.lookback_periods),
                _ => {
                    let advanced = advance_one(unit, mark);
                    if (1..=HISTORICAL_GAP_PERIODS).contains(&crossed) {
                        step_back(unit, advanced, spec.lookback_periods)
                    } else {
                        // Gap of zero: nothing new upstream yet. Gap beyond
                        // the historical threshold: rows are final.
                        advanced
                    }
                }
            }
        }
    };
    // Widening never reaches before the series' own epoch.
    let start = candidate.max(spec.default_start);
    if start > end {
        return None;
    }
    Some(FetchWindow::Range {
        start,
        end,
        periodicity: unit,
    })
}

/// Month series only widen when the gap from now exceeds one month;
/// within a month they rewind exactly one unit. Past the historical
/// threshold they advance like everything else.
fn month_candidate(mark: NaiveDate, crossed: i64, lookback: u32) -> NaiveDate {
    if crossed > HISTORICAL_GAP_PERIODS {
        advance_one(Periodicity::Month, mark)
    } else if crossed > 1 {
        step_back(
            Periodicity::Month,
            advance_one(Periodicity::Month, mark),
            lookback,
        )
    } else {
        add_months(mark, -1)
    }
}

/// Mark advanced by one minimal unit of the periodicity: the first date
/// that could hold data newer than the mark.
fn advance_one(unit: Periodicity, mark: NaiveDate) -> NaiveDate {
    match unit {
        Periodicity::Month => add_months(month_start(mark), 1),
        Periodicity::Quarter => add_months(quarter_start(mark), 3),
        Periodicity::Year => NaiveDate::from_ymd_opt(mark.year() + 1, 1, 1).expect("valid date"),
        Periodicity::Week => mark + Duration::days(7),
        _ => mark + Duration::days(1),
    }
}

/// Widen a window start backward by `n` periods.
fn step_back(unit: Periodicity, start: NaiveDate, n: u32) -> NaiveDate {
    let n = n as i32;
    match unit {
        Periodicity::Month => add_months(start, -n),
        Periodicity::Quarter => add_months(start, -3 * n),
        Periodicity::Year => {
            NaiveDate::from_ymd_opt(start.year() - n, 1, 1).expect("valid date")
        }
        Periodicity::Week => start - Duration::days(7 * n as i64),
        _ => start - Duration::days(n as i64),
    }
}

impl FetchWindow {
    /// Split the window into collaborator-sized spans, one query each.
    /// Daily (and sub-daily) series take a single continuous range; Week
    /// and Month are split per period with date bounds; Quarter and Year
    /// are emitted as discrete period arguments.
    pub fn spans(&self) -> Vec<FetchSpan> {
        match self {
            FetchWindow::Full => vec![FetchSpan::Full],
            FetchWindow::Range {
                start,
                end,
                periodicity,
            } => match periodicity.window_unit() {
                Periodicity::Week => weekly_spans(*start, *end),
                Periodicity::Month => monthly_spans(*start, *end),
                Periodicity::Quarter => quarterly_spans(*start, *end),
                Periodicity::Year => (start.year()..=end.year())
                    .map(|year| FetchSpan::Year { year })
                    .collect(),
                _ => vec![FetchSpan::Dates {
                    start: *start,
                    end: *end,
                }],
            },
        }
    }
}

fn weekly_spans(start: NaiveDate, end: NaiveDate) -> Vec<FetchSpan> {
    let mut spans = Vec::new();
    let mut anchor = monday_of(start);
    while anchor <= end {
        let week_end = anchor + Duration::days(6);
        spans.push(FetchSpan::Dates {
            start: anchor.max(start),
            end: week_end.min(end),
        });
        anchor += Duration::days(7);
    }
    spans
}

fn monthly_spans(start: NaiveDate, end: NaiveDate) -> Vec<FetchSpan> {
    let mut spans = Vec::new();
    let mut anchor = month_start(start);
    while anchor <= end {
        let next = add_months(anchor, 1);
        spans.push(FetchSpan::Dates {
            start: anchor.max(start),
            end: (next - Duration::days(1)).min(end),
        });
        anchor = next;
    }
    spans
}

fn quarterly_spans(start: NaiveDate, end: NaiveDate) -> Vec<FetchSpan> {
    let mut spans = Vec::new();
    let mut year = start.year();
    let mut quarter = quarter_of(start);
    loop {
        let q_start = NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1).expect("valid date");
        if q_start > end {
            break;
        }
        // The last span's quarter may extend past `end`; upstream accepts
        // only whole (year, quarter) arguments.
        spans.push(FetchSpan::Quarter { year, quarter });
        if quarter == 4 {
            year += 1;
            quarter = 1;
        } else {
            quarter += 1;
        }
    }
    spans
}
