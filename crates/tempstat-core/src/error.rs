//! Error types for tempstat-core.

use thiserror::Error;

/// Errors raised by the domain layer.
///
/// This enum is marked `#[non_exhaustive]` so new validation failures can be
/// added without breaking downstream matches.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The IANA timezone identifier is not in the rule database.
    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    /// Latitude or longitude outside the valid range.
    #[error("Invalid coordinates: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    /// Temperature is not a finite value inside the plausible range.
    #[error("Temperature {0} is outside the plausible range")]
    TemperatureOutOfRange(f64),

    /// A query date did not match `MM-DD-YYYY`.
    #[error("Invalid date format. Use MM-DD-YYYY")]
    InvalidDateFormat(String),

    /// A query date matched the format but is not a calendar date.
    #[error("Invalid date: {0}")]
    InvalidDate(String),

    /// No valid local instant exists on the given day.
    #[error("No valid local start of day for {date} in {timezone}")]
    NoLocalDayStart { date: String, timezone: String },

    /// An instant could not be represented.
    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(String),
}

/// Result type alias using tempstat-core's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
