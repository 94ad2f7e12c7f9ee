//! SQLite persistence for tempstat.
//!
//! Three tables back the service: enrolled devices, an append-only reading
//! log and one aggregate row per device and device-local day.
//!
//! # Example
//!
//! ```
//! use tempstat_core::{Coordinates, DayBucket, DeviceTimezone};
//! use tempstat_store::{NewDevice, Store};
//! use time::macros::datetime;
//!
//! let mut store = Store::open_in_memory()?;
//! let tz = DeviceTimezone::parse("Asia/Tokyo")?;
//! store.insert_devices(&[NewDevice {
//!     id: "dev-1".into(),
//!     serial: "SN-1".into(),
//!     coordinates: Coordinates::new(35.68, 139.69),
//!     timezone: tz,
//!     enrolled_at: datetime!(2024-07-01 00:00 UTC),
//! }])?;
//!
//! let at = datetime!(2024-07-01 16:00 UTC);
//! let bucket = DayBucket::for_instant(at, &tz)?;
//! let recorded = store.record_reading("dev-1", 26.0, at, &bucket)?;
//! assert_eq!(recorded.stat.reading_count, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{
    NewDevice, Reconciliation, RecordedReading, StatWrite, StoredDailyStat, StoredDevice,
    StoredReading,
};
pub use queries::ReadingQuery;
pub use store::Store;

// Re-exported so callers can inspect database error codes.
pub use rusqlite;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/tempstat/data.db`
/// - macOS: `~/Library/Application Support/tempstat/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\tempstat\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("tempstat")
        .join("data.db")
}
