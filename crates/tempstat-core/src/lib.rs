//! Domain core for tempstat: temperature readings and per-device daily statistics.
//!
//! This crate has no I/O. It provides:
//!
//! - The reading message exchanged between the ingestion endpoint and the
//!   aggregation consumer
//! - Device timezones and the day-bucket resolver that maps a reading instant
//!   to the UTC start of the device-local day
//! - The incremental updater for daily high/low/mean aggregates
//! - Validation for temperatures, coordinates and query dates
//!
//! # Example
//!
//! ```
//! use tempstat_core::{DayBucket, DeviceTimezone, next_aggregate};
//! use time::macros::datetime;
//!
//! let tz = DeviceTimezone::parse("Europe/Berlin")?;
//! let bucket = DayBucket::for_instant(datetime!(2024-07-01 23:30 UTC), &tz)?;
//! assert_eq!(bucket.start, datetime!(2024-07-01 22:00 UTC));
//!
//! let change = next_aggregate(None, 21.5, 0);
//! assert_eq!(change.aggregate().avg, 21.5);
//! # Ok::<(), tempstat_core::Error>(())
//! ```

pub mod aggregate;
pub mod bucket;
pub mod dates;
pub mod error;
pub mod timezone;
pub mod types;

pub use aggregate::{DailyAggregate, StatsChange, next_aggregate};
pub use bucket::{DayBucket, local_date};
pub use dates::{format_iso_date, parse_iso_date, parse_query_date};
pub use error::{Error, Result};
pub use timezone::{DeviceTimezone, FixedLocator, TimezoneLocator};
pub use types::{
    Coordinates, MAX_TEMPERATURE, MIN_TEMPERATURE, ReadingMessage, validate_temperature,
};
