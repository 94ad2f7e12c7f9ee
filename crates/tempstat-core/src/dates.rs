//! Calendar date parsing and formatting for the query interface.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month};

use crate::error::{Error, Result};

const ISO_DATE: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Parse a `MM-DD-YYYY` date (month and day may be one or two digits).
///
/// ```
/// use tempstat_core::parse_query_date;
/// use time::macros::date;
///
/// assert_eq!(parse_query_date("7-1-2024")?, date!(2024-07-01));
/// assert_eq!(parse_query_date("07-01-2024")?, date!(2024-07-01));
/// assert!(parse_query_date("2024-07-01").is_err());
/// assert!(parse_query_date("02-30-2024").is_err());
/// # Ok::<(), tempstat_core::Error>(())
/// ```
pub fn parse_query_date(input: &str) -> Result<Date> {
    let format_err = || Error::InvalidDateFormat(input.to_string());

    let parts: Vec<&str> = input.split('-').collect();
    let [month, day, year] = parts.as_slice() else {
        return Err(format_err());
    };

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(month)
        || !all_digits(day)
        || !all_digits(year)
        || month.len() > 2
        || day.len() > 2
        || year.len() != 4
    {
        return Err(format_err());
    }

    let month: u8 = month.parse().map_err(|_| format_err())?;
    let day: u8 = day.parse().map_err(|_| format_err())?;
    let year: i32 = year.parse().map_err(|_| format_err())?;

    let month = Month::try_from(month).map_err(|_| Error::InvalidDate(input.to_string()))?;
    Date::from_calendar_date(year, month, day).map_err(|_| Error::InvalidDate(input.to_string()))
}

/// Format a date as `YYYY-MM-DD`.
pub fn format_iso_date(date: Date) -> String {
    date.format(ISO_DATE).unwrap_or_else(|_| date.to_string())
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_iso_date(input: &str) -> Result<Date> {
    Date::parse(input, ISO_DATE).map_err(|_| Error::InvalidDate(input.to_string()))
}
