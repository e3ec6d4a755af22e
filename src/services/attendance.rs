//! Attendance journal helpers: month window, weekday rows and minute totals.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// First day of the month named by `YYYY-MM`; missing or malformed input
/// falls back to the month containing `today`.
pub fn parse_month(raw: Option<&str>, today: NaiveDate) -> NaiveDate {
    raw.and_then(|value| NaiveDate::parse_from_str(&format!("{}-01", value.trim()), "%Y-%m-%d").ok())
        .unwrap_or_else(|| month_start(today))
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// `[first, next_first)` for the month starting at `first`.
pub fn month_bounds(first: NaiveDate) -> (NaiveDate, NaiveDate) {
    let first = month_start(first);
    // Day 28 exists in every month; four days later is always next month.
    let next = month_start(first.with_day(28).unwrap_or(first) + Duration::days(4));
    (first, next)
}

/// Monday to Friday dates of the month, in order.
pub fn weekday_dates(first: NaiveDate) -> Vec<NaiveDate> {
    let (start, end) = month_bounds(first);
    start
        .iter_days()
        .take_while(|d| *d < end)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .collect()
}

pub fn total_minutes(attended_days: i64, lesson_minutes: i64) -> i64 {
    attended_days * lesson_minutes
}

/// "1 h 20 min", "2 h" or "40 min".
pub fn format_minutes(total: i64) -> String {
    let hours = total / 60;
    let minutes = total % 60;
    match (hours, minutes) {
        (0, m) => format!("{m} min"),
        (h, 0) => format!("{h} h"),
        (h, m) => format!("{h} h {m} min"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn month_parameter_falls_back_to_current_month() {
        let today = date(2024, 3, 17);
        assert_eq!(parse_month(Some("2024-01"), today), date(2024, 1, 1));
        assert_eq!(parse_month(Some("2024-13"), today), date(2024, 3, 1));
        assert_eq!(parse_month(Some("garbage"), today), date(2024, 3, 1));
        assert_eq!(parse_month(None, today), date(2024, 3, 1));
    }

    #[test]
    fn bounds_cover_the_whole_month() {
        assert_eq!(month_bounds(date(2024, 2, 1)), (date(2024, 2, 1), date(2024, 3, 1)));
        assert_eq!(month_bounds(date(2023, 12, 1)), (date(2023, 12, 1), date(2024, 1, 1)));
        assert_eq!(month_bounds(date(2024, 1, 31)), (date(2024, 1, 1), date(2024, 2, 1)));
    }

    #[test]
    fn journal_rows_skip_weekends() {
        // February 2024 has 29 days, 21 of them weekdays.
        let days = weekday_dates(date(2024, 2, 1));
        assert_eq!(days.len(), 21);
        assert_eq!(days.first(), Some(&date(2024, 2, 1)));
        assert_eq!(days.last(), Some(&date(2024, 2, 29)));
        assert!(days.iter().all(|d| d.weekday().num_days_from_monday() < 5));
    }

    #[test]
    fn minute_labels() {
        assert_eq!(format_minutes(0), "0 min");
        assert_eq!(format_minutes(40), "40 min");
        assert_eq!(format_minutes(120), "2 h");
        assert_eq!(format_minutes(total_minutes(2, 40)), "1 h 20 min");
    }
}
