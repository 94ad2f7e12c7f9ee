//! Day bucketing in a device's local timezone.
//!
//! A reading belongs to the device-local calendar day it was taken on. That day
//! is identified by its bucket key: the UTC instant at which the local day
//! starts. Because the local day start is converted back to UTC, the key often
//! falls on a different UTC calendar date than the reading itself:
//!
//! ```
//! use tempstat_core::{DayBucket, DeviceTimezone};
//! use time::macros::{date, datetime};
//!
//! let tz = DeviceTimezone::parse("America/New_York")?;
//! let bucket = DayBucket::for_instant(datetime!(2024-07-01 02:00 UTC), &tz)?;
//!
//! assert_eq!(bucket.local_date, date!(2024-06-30));
//! assert_eq!(bucket.start, datetime!(2024-06-30 04:00 UTC));
//! # Ok::<(), tempstat_core::Error>(())
//! ```
//!
//! # DST
//!
//! Day boundaries are computed independently in local time for each day, so a
//! bucket spans 23, 24 or 25 hours around transitions. When local midnight is
//! skipped by a spring-forward gap the day starts at the first valid local
//! minute after the gap. When midnight occurs twice the earlier instant wins.

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeDelta, TimeZone, Utc};
use time::{Date, Month, OffsetDateTime};

use crate::error::{Error, Result};
use crate::timezone::DeviceTimezone;

/// One device-local calendar day expressed as a half-open UTC range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DayBucket {
    /// The local calendar date.
    pub local_date: Date,
    /// UTC instant of the local day start. This is the bucket key.
    pub start: OffsetDateTime,
    /// UTC instant of the next local day start (exclusive).
    pub end: OffsetDateTime,
}

impl DayBucket {
    /// Bucket containing `instant` in the given timezone.
    pub fn for_instant(instant: OffsetDateTime, tz: &DeviceTimezone) -> Result<Self> {
        let date = local_naive_date(instant, tz)?;
        Self::for_naive_date(date, tz)
    }

    /// Bucket for a local calendar date.
    pub fn for_local_date(date: Date, tz: &DeviceTimezone) -> Result<Self> {
        Self::for_naive_date(to_naive(date)?, tz)
    }

    fn for_naive_date(date: NaiveDate, tz: &DeviceTimezone) -> Result<Self> {
        let next = date
            .succ_opt()
            .ok_or_else(|| Error::TimestampOutOfRange(date.to_string()))?;

        Ok(Self {
            local_date: from_naive(date)?,
            start: to_offset(local_day_start(date, tz)?)?,
            end: to_offset(local_day_start(next, tz)?)?,
        })
    }

    /// The bucket key (UTC instant of the local day start).
    pub fn key(&self) -> OffsetDateTime {
        self.start
    }

    /// Whether `instant` falls inside `[start, end)`.
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Real elapsed length of the local day.
    pub fn length(&self) -> time::Duration {
        self.end - self.start
    }
}

/// Local calendar date of `instant` in the given timezone.
pub fn local_date(instant: OffsetDateTime, tz: &DeviceTimezone) -> Result<Date> {
    from_naive(local_naive_date(instant, tz)?)
}

fn local_naive_date(instant: OffsetDateTime, tz: &DeviceTimezone) -> Result<NaiveDate> {
    Ok(to_chrono(instant)?.with_timezone(&tz.tz()).date_naive())
}

/// First valid local instant of `date`, in UTC.
fn local_day_start(date: NaiveDate, tz: &DeviceTimezone) -> Result<DateTime<Utc>> {
    let zone = tz.tz();
    let mut candidate = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| Error::TimestampOutOfRange(date.to_string()))?;

    // Transitions fall on whole minutes, so stepping by one finds the gap end.
    while candidate.date() == date {
        match zone.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Ok(earliest.with_timezone(&Utc)),
            LocalResult::None => candidate += TimeDelta::minutes(1),
        }
    }

    Err(Error::NoLocalDayStart {
        date: date.to_string(),
        timezone: tz.name().to_string(),
    })
}

fn to_chrono(instant: OffsetDateTime) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(instant.unix_timestamp(), instant.nanosecond())
        .ok_or_else(|| Error::TimestampOutOfRange(instant.to_string()))
}

fn to_offset(instant: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(instant.timestamp())
        .map_err(|_| Error::TimestampOutOfRange(instant.to_rfc3339()))
}

fn to_naive(date: Date) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(date.year(), u8::from(date.month()) as u32, date.day() as u32)
        .ok_or_else(|| Error::InvalidDate(date.to_string()))
}

fn from_naive(date: NaiveDate) -> Result<Date> {
    let month = Month::try_from(date.month() as u8)
        .map_err(|_| Error::InvalidDate(date.to_string()))?;
    Date::from_calendar_date(date.year(), month, date.day() as u8)
        .map_err(|_| Error::InvalidDate(date.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn tz(name: &str) -> DeviceTimezone {
        DeviceTimezone::parse(name).unwrap()
    }

    #[test]
    fn test_evening_reading_buckets_to_previous_local_day() {
        let bucket =
            DayBucket::for_instant(datetime!(2024-07-01 02:00 UTC), &tz("America/New_York"))
                .unwrap();

        assert_eq!(bucket.local_date, date!(2024-06-30));
        assert_eq!(bucket.start, datetime!(2024-06-30 04:00 UTC));
        assert_eq!(bucket.end, datetime!(2024-07-01 04:00 UTC));
        assert_eq!(bucket.key(), bucket.start);
        assert_eq!(bucket.length(), time::Duration::hours(24));
    }

    #[test]
    fn test_east_of_utc_bucket_starts_on_previous_utc_date() {
        let bucket =
            DayBucket::for_instant(datetime!(2024-07-01 20:00 UTC), &tz("Asia/Tokyo")).unwrap();

        assert_eq!(bucket.local_date, date!(2024-07-02));
        assert_eq!(bucket.start, datetime!(2024-07-01 15:00 UTC));
    }

    #[test]
    fn test_utc_device() {
        let bucket =
            DayBucket::for_instant(datetime!(2024-01-01 12:34:56 UTC), &DeviceTimezone::utc())
                .unwrap();

        assert_eq!(bucket.start, datetime!(2024-01-01 00:00 UTC));
        assert_eq!(bucket.end, datetime!(2024-01-02 00:00 UTC));
    }

    #[test]
    fn test_spring_forward_day_is_23_hours() {
        let ny = tz("America/New_York");

        // Local midnight on 2024-03-10 is still EST (-05:00).
        let at_midnight = DayBucket::for_instant(datetime!(2024-03-10 05:00 UTC), &ny).unwrap();
        // 23:30 EDT the same local day.
        let late_evening = DayBucket::for_instant(datetime!(2024-03-11 03:30 UTC), &ny).unwrap();

        assert_eq!(at_midnight, late_evening);
        assert_eq!(at_midnight.start, datetime!(2024-03-10 05:00 UTC));
        assert_eq!(at_midnight.end, datetime!(2024-03-11 04:00 UTC));
        assert_eq!(at_midnight.length(), time::Duration::hours(23));
    }

    #[test]
    fn test_fall_back_day_is_25_hours() {
        let bucket =
            DayBucket::for_local_date(date!(2024-11-03), &tz("America/New_York")).unwrap();

        assert_eq!(bucket.start, datetime!(2024-11-03 04:00 UTC));
        assert_eq!(bucket.end, datetime!(2024-11-04 05:00 UTC));
        assert_eq!(bucket.length(), time::Duration::hours(25));
    }

    #[test]
    fn test_skipped_midnight_starts_after_gap() {
        // Chile springs forward at local midnight: 2024-09-08 00:00 does not exist.
        let santiago = tz("America/Santiago");

        let bucket = DayBucket::for_instant(datetime!(2024-09-08 04:30 UTC), &santiago).unwrap();
        assert_eq!(bucket.local_date, date!(2024-09-08));
        assert_eq!(bucket.start, datetime!(2024-09-08 04:00 UTC));

        // The previous day ends exactly where this one starts.
        let previous =
            DayBucket::for_instant(datetime!(2024-09-08 03:59:59 UTC), &santiago).unwrap();
        assert_eq!(previous.local_date, date!(2024-09-07));
        assert_eq!(previous.end, bucket.start);
    }

    #[test]
    fn test_repeated_midnight_uses_earliest_instant() {
        // Cuba falls back from 01:00 to 00:00, so midnight on 2024-11-03 happens twice.
        let havana = tz("America/Havana");

        let first_pass = DayBucket::for_instant(datetime!(2024-11-03 04:10 UTC), &havana).unwrap();
        let second_pass =
            DayBucket::for_instant(datetime!(2024-11-03 05:10 UTC), &havana).unwrap();

        assert_eq!(first_pass, second_pass);
        assert_eq!(first_pass.start, datetime!(2024-11-03 04:00 UTC));
    }

    #[test]
    fn test_for_local_date_matches_for_instant() {
        let ny = tz("America/New_York");
        let by_date = DayBucket::for_local_date(date!(2024-06-30), &ny).unwrap();
        let by_instant = DayBucket::for_instant(datetime!(2024-06-30 16:00 UTC), &ny).unwrap();
        assert_eq!(by_date, by_instant);
    }

    #[test]
    fn test_contains_is_half_open() {
        let bucket =
            DayBucket::for_local_date(date!(2024-06-30), &tz("America/New_York")).unwrap();

        assert!(bucket.contains(bucket.start));
        assert!(bucket.contains(bucket.end - time::Duration::seconds(1)));
        assert!(!bucket.contains(bucket.end));
        assert!(!bucket.contains(bucket.start - time::Duration::seconds(1)));
    }

    #[test]
    fn test_consecutive_buckets_tile_without_gaps() {
        let berlin = tz("Europe/Berlin");
        let mut day = date!(2024-03-28);
        let mut previous = DayBucket::for_local_date(day, &berlin).unwrap();

        for _ in 0..10 {
            day = day.next_day().unwrap();
            let bucket = DayBucket::for_local_date(day, &berlin).unwrap();
            assert_eq!(previous.end, bucket.start);
            previous = bucket;
        }
    }

    #[test]
    fn test_local_date() {
        let d = local_date(datetime!(2024-07-01 02:00 UTC), &tz("America/Los_Angeles")).unwrap();
        assert_eq!(d, date!(2024-06-30));
    }
}
