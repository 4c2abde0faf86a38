use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::BTreeMap;

/// Milliseconds to minutes, rounded to two decimals.
pub fn ms_to_minutes(ms: u64) -> f64 {
    (ms as f64 / 600.0).round() / 100.0
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Average minutes per active weekday and per active weekend day.
///
/// `daily_ms` only holds days with at least one play, so inactive days never
/// enter either denominator. A bucket with no active day averages to 0.
pub fn weekday_weekend_averages(daily_ms: &BTreeMap<NaiveDate, u64>) -> (f64, f64) {
    let (mut weekday_ms, mut weekday_days) = (0u64, 0u64);
    let (mut weekend_ms, mut weekend_days) = (0u64, 0u64);
    for (date, ms) in daily_ms {
        if is_weekend(*date) {
            weekend_ms += ms;
            weekend_days += 1;
        } else {
            weekday_ms += ms;
            weekday_days += 1;
        }
    }
    let average = |ms: u64, days: u64| {
        if days == 0 {
            0.0
        } else {
            ms_to_minutes(ms / days)
        }
    };
    (
        average(weekday_ms, weekday_days),
        average(weekend_ms, weekend_days),
    )
}

/// Hour with the most plays; the earliest hour wins a tie. None without plays.
pub fn top_hour(hourly: &[u32; 24]) -> Option<u8> {
    let mut best: Option<(usize, u32)> = None;
    for (hour, count) in hourly.iter().enumerate() {
        if *count > 0 && best.map_or(true, |(_, top)| *count > top) {
            best = Some((hour, *count));
        }
    }
    best.map(|(hour, _)| hour as u8)
}
