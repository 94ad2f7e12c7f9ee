//! Main store implementation.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use tempstat_core::{DailyAggregate, DayBucket, format_iso_date, next_aggregate, parse_iso_date};

use crate::error::{Error, Result};
use crate::models::{
    NewDevice, Reconciliation, RecordedReading, StatWrite, StoredDailyStat, StoredDevice,
    StoredReading,
};
use crate::queries::ReadingQuery;
use crate::schema;

/// Tolerance used when comparing a stored aggregate with one recomputed from the log.
const AGGREGATE_TOLERANCE: f64 = 1e-6;

/// SQLite-based store for devices, readings and daily statistics.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

// Device operations
impl Store {
    /// Enroll a batch of devices atomically.
    ///
    /// Fails with [`Error::DuplicateSerial`] listing every serial that is
    /// already enrolled or repeated within the batch; nothing is written then.
    pub fn insert_devices(&mut self, devices: &[NewDevice]) -> Result<Vec<StoredDevice>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for device in devices {
            let taken = !seen.insert(device.serial.as_str()) || serial_exists(&tx, &device.serial)?;
            if taken && !duplicates.contains(&device.serial) {
                duplicates.push(device.serial.clone());
            }
        }
        if !duplicates.is_empty() {
            return Err(Error::DuplicateSerial(duplicates));
        }

        let mut stored = Vec::with_capacity(devices.len());
        for device in devices {
            tx.execute(
                "INSERT INTO devices (id, serial, latitude, longitude, timezone, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    device.id,
                    device.serial,
                    device.coordinates.latitude,
                    device.coordinates.longitude,
                    device.timezone.name(),
                    to_millis(device.enrolled_at),
                ],
            )?;

            stored.push(StoredDevice {
                id: device.id.clone(),
                serial: device.serial.clone(),
                latitude: device.coordinates.latitude,
                longitude: device.coordinates.longitude,
                timezone: device.timezone.name().to_string(),
                enrolled_at: truncate_to_millis(device.enrolled_at)?,
            });
        }

        tx.commit()?;
        info!("Enrolled {} device(s)", stored.len());
        Ok(stored)
    }

    /// Serials from `serials` that are already enrolled.
    pub fn existing_serials(&self, serials: &[String]) -> Result<Vec<String>> {
        let mut existing = Vec::new();
        for serial in serials {
            if serial_exists(&self.conn, serial)? && !existing.contains(serial) {
                existing.push(serial.clone());
            }
        }
        Ok(existing)
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        fetch_device(&self.conn, device_id)
    }

    /// List all devices ordered by enrollment time.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, serial, latitude, longitude, timezone, enrolled_at
             FROM devices ORDER BY enrolled_at, serial",
        )?;

        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(devices)
    }

    pub fn count_devices(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

// Reading operations
impl Store {
    /// Append a reading to the log without touching daily statistics.
    pub fn insert_reading(
        &self,
        device_id: &str,
        temperature: f64,
        recorded_at: OffsetDateTime,
    ) -> Result<StoredReading> {
        if fetch_device(&self.conn, device_id)?.is_none() {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }
        append_reading(&self.conn, device_id, temperature, recorded_at)
    }

    /// Count a device's readings in `[start, end)`.
    pub fn count_readings_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<u64> {
        count_between(&self.conn, device_id, start, end)
    }

    /// Query readings with filters.
    pub fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<StoredReading>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let readings = stmt
            .query_map(params_refs.as_slice(), reading_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    /// Count readings for a device, or across all devices.
    pub fn count_readings(&self, device_id: Option<&str>) -> Result<u64> {
        let count: i64 = match device_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE device_id = ?",
                [id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }
}

// Daily statistics operations
impl Store {
    /// Aggregate for the bucket starting at `bucket_start`.
    pub fn get_daily_stat(
        &self,
        device_id: &str,
        bucket_start: OffsetDateTime,
    ) -> Result<Option<StoredDailyStat>> {
        fetch_daily_stat(&self.conn, device_id, bucket_start)
    }

    pub fn insert_daily_stat(
        &self,
        device_id: &str,
        bucket: &DayBucket,
        aggregate: &DailyAggregate,
    ) -> Result<StoredDailyStat> {
        insert_stat(&self.conn, device_id, bucket, aggregate)?;
        load_daily_stat(&self.conn, device_id, bucket.start)
    }

    pub fn update_daily_stat(
        &self,
        device_id: &str,
        bucket: &DayBucket,
        aggregate: &DailyAggregate,
    ) -> Result<StoredDailyStat> {
        update_stat(&self.conn, device_id, bucket, aggregate)?;
        load_daily_stat(&self.conn, device_id, bucket.start)
    }

    /// Most recent daily aggregates for a device, newest first.
    pub fn list_daily_stats(
        &self,
        device_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<StoredDailyStat>> {
        let mut sql = String::from(
            "SELECT id, device_id, bucket_start_ms, local_date, high_temp, low_temp, avg_temp,
                    reading_count, updated_at
             FROM daily_stats WHERE device_id = ? ORDER BY bucket_start_ms DESC",
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let stats = stmt
            .query_map([device_id], daily_stat_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(stats)
    }
}

// Aggregation
impl Store {
    /// Append a reading and fold it into its day bucket in one transaction.
    ///
    /// The prior count comes from the reading log, not from the stored
    /// aggregate. When the two disagree the aggregate is rebuilt from the log
    /// instead of being updated incrementally.
    pub fn record_reading(
        &mut self,
        device_id: &str,
        temperature: f64,
        recorded_at: OffsetDateTime,
        bucket: &DayBucket,
    ) -> Result<RecordedReading> {
        tempstat_core::validate_temperature(temperature)?;
        if !bucket.contains(recorded_at) {
            return Err(Error::InvalidTimestamp(format!(
                "{} is outside the bucket for {}",
                recorded_at,
                format_iso_date(bucket.local_date)
            )));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if fetch_device(&tx, device_id)?.is_none() {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }

        let reading = append_reading(&tx, device_id, temperature, recorded_at)?;
        let prior = count_between(&tx, device_id, bucket.start, bucket.end)?.saturating_sub(1);
        let existing = fetch_daily_stat(&tx, device_id, bucket.start)?;

        let write = match &existing {
            Some(stat) if stat.reading_count == prior => {
                let change = next_aggregate(Some(&stat.aggregate()), temperature, prior);
                update_stat(&tx, device_id, bucket, change.aggregate())?;
                StatWrite::Updated
            }
            None if prior == 0 => {
                let change = next_aggregate(None, temperature, 0);
                insert_stat(&tx, device_id, bucket, change.aggregate())?;
                StatWrite::Inserted
            }
            _ => {
                let rebuilt = aggregate_from_log(&tx, device_id, bucket)?
                    .unwrap_or_else(|| DailyAggregate::first(temperature));
                warn!(
                    device_id,
                    local_date = %format_iso_date(bucket.local_date),
                    stored_count = existing.as_ref().map(|s| s.reading_count),
                    log_count = prior,
                    "Daily aggregate out of step with reading log, rebuilding"
                );
                if existing.is_some() {
                    update_stat(&tx, device_id, bucket, &rebuilt)?;
                } else {
                    insert_stat(&tx, device_id, bucket, &rebuilt)?;
                }
                StatWrite::Rebuilt
            }
        };

        let stat = load_daily_stat(&tx, device_id, bucket.start)?;
        tx.commit()?;

        debug!(
            device_id,
            local_date = %format_iso_date(bucket.local_date),
            count = stat.reading_count,
            ?write,
            "Recorded reading"
        );

        Ok(RecordedReading {
            reading,
            stat,
            write,
        })
    }

    /// Recompute a bucket's aggregate from the reading log and repair it if it drifted.
    ///
    /// Aggregate rows are never deleted. A row whose readings are missing from
    /// the log is reported as [`Reconciliation::Orphaned`] and left unchanged.
    pub fn reconcile_daily_stat(
        &mut self,
        device_id: &str,
        bucket: &DayBucket,
    ) -> Result<Reconciliation> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = fetch_daily_stat(&tx, device_id, bucket.start)?;
        let from_log = aggregate_from_log(&tx, device_id, bucket)?;

        let outcome = match (existing, from_log) {
            (None, None) => Reconciliation::Empty,
            (Some(stat), Some(log)) if stat.aggregate().approx_eq(&log, AGGREGATE_TOLERANCE) => {
                Reconciliation::Consistent(stat)
            }
            (Some(stat), None) => {
                warn!(
                    device_id,
                    local_date = %format_iso_date(bucket.local_date),
                    "Daily aggregate has no readings in the log"
                );
                Reconciliation::Orphaned(stat)
            }
            (existing, Some(log)) => {
                if existing.is_some() {
                    update_stat(&tx, device_id, bucket, &log)?;
                } else {
                    insert_stat(&tx, device_id, bucket, &log)?;
                }
                Reconciliation::Repaired {
                    before: existing.map(|s| s.aggregate()),
                    after: load_daily_stat(&tx, device_id, bucket.start)?,
                }
            }
        };

        tx.commit()?;

        if matches!(outcome, Reconciliation::Repaired { .. }) {
            info!(
                device_id,
                local_date = %format_iso_date(bucket.local_date),
                "Reconciled daily aggregate"
            );
        }

        Ok(outcome)
    }
}

/// Unix milliseconds for an instant.
pub(crate) fn to_millis(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|_| Error::InvalidTimestamp(ms.to_string()))
}

fn truncate_to_millis(time: OffsetDateTime) -> Result<OffsetDateTime> {
    from_millis(to_millis(time))
}

fn millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let ms: i64 = row.get(idx)?;
    from_millis(ms)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Date> {
    let text: String = row.get(idx)?;
    parse_iso_date(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        id: row.get(0)?,
        serial: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        timezone: row.get(4)?,
        enrolled_at: millis_column(row, 5)?,
    })
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<StoredReading> {
    Ok(StoredReading {
        id: row.get(0)?,
        device_id: row.get(1)?,
        temperature: row.get(2)?,
        recorded_at: millis_column(row, 3)?,
    })
}

fn daily_stat_from_row(row: &Row<'_>) -> rusqlite::Result<StoredDailyStat> {
    let count: i64 = row.get(7)?;
    Ok(StoredDailyStat {
        id: row.get(0)?,
        device_id: row.get(1)?,
        bucket_start: millis_column(row, 2)?,
        local_date: date_column(row, 3)?,
        high_temp: row.get(4)?,
        low_temp: row.get(5)?,
        avg_temp: row.get(6)?,
        reading_count: count.max(0) as u64,
        updated_at: millis_column(row, 8)?,
    })
}

fn serial_exists(conn: &Connection, serial: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM devices WHERE serial = ?",
        [serial],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn fetch_device(conn: &Connection, device_id: &str) -> Result<Option<StoredDevice>> {
    let device = conn
        .query_row(
            "SELECT id, serial, latitude, longitude, timezone, enrolled_at
             FROM devices WHERE id = ?",
            [device_id],
            device_from_row,
        )
        .optional()?;
    Ok(device)
}

fn append_reading(
    conn: &Connection,
    device_id: &str,
    temperature: f64,
    recorded_at: OffsetDateTime,
) -> Result<StoredReading> {
    conn.execute(
        "INSERT INTO readings (device_id, temperature, recorded_at_ms) VALUES (?1, ?2, ?3)",
        rusqlite::params![device_id, temperature, to_millis(recorded_at)],
    )?;

    Ok(StoredReading {
        id: conn.last_insert_rowid(),
        device_id: device_id.to_string(),
        temperature,
        recorded_at: truncate_to_millis(recorded_at)?,
    })
}

fn count_between(
    conn: &Connection,
    device_id: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM readings
         WHERE device_id = ?1 AND recorded_at_ms >= ?2 AND recorded_at_ms < ?3",
        rusqlite::params![device_id, to_millis(start), to_millis(end)],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Aggregate over every logged reading in the bucket.
fn aggregate_from_log(
    conn: &Connection,
    device_id: &str,
    bucket: &DayBucket,
) -> Result<Option<DailyAggregate>> {
    let (count, high, low, avg): (i64, Option<f64>, Option<f64>, Option<f64>) = conn.query_row(
        "SELECT COUNT(*), MAX(temperature), MIN(temperature), AVG(temperature) FROM readings
         WHERE device_id = ?1 AND recorded_at_ms >= ?2 AND recorded_at_ms < ?3",
        rusqlite::params![device_id, to_millis(bucket.start), to_millis(bucket.end)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    Ok(match (high, low, avg) {
        (Some(high), Some(low), Some(avg)) if count > 0 => Some(DailyAggregate {
            high,
            low,
            avg,
            count: count as u64,
        }),
        _ => None,
    })
}

fn fetch_daily_stat(
    conn: &Connection,
    device_id: &str,
    bucket_start: OffsetDateTime,
) -> Result<Option<StoredDailyStat>> {
    let stat = conn
        .query_row(
            "SELECT id, device_id, bucket_start_ms, local_date, high_temp, low_temp, avg_temp,
                    reading_count, updated_at
             FROM daily_stats WHERE device_id = ?1 AND bucket_start_ms = ?2",
            rusqlite::params![device_id, to_millis(bucket_start)],
            daily_stat_from_row,
        )
        .optional()?;
    Ok(stat)
}

fn load_daily_stat(
    conn: &Connection,
    device_id: &str,
    bucket_start: OffsetDateTime,
) -> Result<StoredDailyStat> {
    fetch_daily_stat(conn, device_id, bucket_start)?
        .ok_or(Error::Database(rusqlite::Error::QueryReturnedNoRows))
}

fn insert_stat(
    conn: &Connection,
    device_id: &str,
    bucket: &DayBucket,
    aggregate: &DailyAggregate,
) -> Result<()> {
    conn.execute(
        "INSERT INTO daily_stats (device_id, bucket_start_ms, local_date, high_temp, low_temp,
                                  avg_temp, reading_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            device_id,
            to_millis(bucket.start),
            format_iso_date(bucket.local_date),
            aggregate.high,
            aggregate.low,
            aggregate.avg,
            aggregate.count as i64,
            to_millis(OffsetDateTime::now_utc()),
        ],
    )?;
    Ok(())
}

fn update_stat(
    conn: &Connection,
    device_id: &str,
    bucket: &DayBucket,
    aggregate: &DailyAggregate,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE daily_stats SET high_temp = ?3, low_temp = ?4, avg_temp = ?5,
                reading_count = ?6, updated_at = ?7
         WHERE device_id = ?1 AND bucket_start_ms = ?2",
        rusqlite::params![
            device_id,
            to_millis(bucket.start),
            aggregate.high,
            aggregate.low,
            aggregate.avg,
            aggregate.count as i64,
            to_millis(OffsetDateTime::now_utc()),
        ],
    )?;

    if changed == 0 {
        return Err(Error::Database(rusqlite::Error::QueryReturnedNoRows));
    }
    Ok(())
}
