//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use tempstat_core::{Coordinates, DailyAggregate, DeviceTimezone};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// An enrolled device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDevice {
    /// Device identifier (UUID v4).
    pub id: String,
    /// Manufacturer serial number, unique across devices.
    pub serial: String,
    pub latitude: f64,
    pub longitude: f64,
    /// IANA timezone derived from the coordinates at enrollment.
    #[serde(rename = "timeZone")]
    pub timezone: String,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
}

impl StoredDevice {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    /// Parse the stored timezone name.
    pub fn timezone(&self) -> tempstat_core::Result<DeviceTimezone> {
        DeviceTimezone::parse(&self.timezone)
    }
}

/// A device about to be enrolled.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub id: String,
    pub serial: String,
    pub coordinates: Coordinates,
    pub timezone: DeviceTimezone,
    pub enrolled_at: OffsetDateTime,
}

/// A reading stored in the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    /// Database row ID.
    pub id: i64,
    pub device_id: String,
    pub temperature: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// The aggregate row for one device and one local day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDailyStat {
    /// Database row ID.
    pub id: i64,
    pub device_id: String,
    /// UTC instant of the device-local day start.
    #[serde(with = "time::serde::rfc3339")]
    pub bucket_start: OffsetDateTime,
    /// Device-local calendar date of the bucket.
    #[serde(with = "iso_date")]
    pub local_date: Date,
    pub high_temp: f64,
    pub low_temp: f64,
    pub avg_temp: f64,
    /// Number of readings folded into this aggregate.
    pub reading_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl StoredDailyStat {
    pub fn aggregate(&self) -> DailyAggregate {
        DailyAggregate {
            high: self.high_temp,
            low: self.low_temp,
            avg: self.avg_temp,
            count: self.reading_count,
        }
    }
}

/// How a bucket's aggregate was written while recording a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatWrite {
    /// First reading of the bucket; a new row was created.
    Inserted,
    /// The existing row was updated incrementally.
    Updated,
    /// The stored count disagreed with the reading log; the row was rebuilt from the log.
    Rebuilt,
}

/// Result of recording one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReading {
    pub reading: StoredReading,
    pub stat: StoredDailyStat,
    pub write: StatWrite,
}

/// Result of reconciling one bucket against the reading log.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The stored aggregate already matched the log.
    Consistent(StoredDailyStat),
    /// The aggregate was rewritten from the log.
    Repaired {
        before: Option<DailyAggregate>,
        after: StoredDailyStat,
    },
    /// An aggregate exists but the log has no readings for the bucket. The row is kept.
    Orphaned(StoredDailyStat),
    /// No readings and no aggregate exist for the bucket.
    Empty,
}
