//! Core types shared by the store and the service.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// Lowest temperature a reading may report (absolute zero, in °C).
pub const MIN_TEMPERATURE: f64 = -273.15;

/// Highest temperature a reading may report. Devices do not operate above this.
pub const MAX_TEMPERATURE: f64 = 2000.0;

/// Check that a temperature is finite and physically plausible.
///
/// ```
/// use tempstat_core::validate_temperature;
///
/// assert!(validate_temperature(21.5).is_ok());
/// assert!(validate_temperature(-300.0).is_err());
/// assert!(validate_temperature(f64::NAN).is_err());
/// ```
pub fn validate_temperature(value: f64) -> Result<f64> {
    if value.is_finite() && (MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&value) {
        Ok(value)
    } else {
        Err(Error::TemperatureOutOfRange(value))
    }
}

/// Geographic position of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Coordinates {
    /// Latitude in degrees, -90 to 90.
    pub latitude: f64,
    /// Longitude in degrees, -180 to 180.
    pub longitude: f64,
}

impl Coordinates {
    /// Create coordinates without validating them.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Validate the latitude and longitude ranges.
    pub fn validate(&self) -> Result<()> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let long_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && long_ok {
            Ok(())
        } else {
            Err(Error::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }
}

/// A temperature reading as it travels through the queue.
///
/// On the wire this is `{"deviceId": "...", "temperature": 21.5, "timestamp": "<RFC 3339>"}`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ReadingMessage {
    /// Enrolled device that produced the reading.
    pub device_id: String,
    /// Temperature value.
    pub temperature: f64,
    /// When the reading was accepted.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
}

impl ReadingMessage {
    /// Create a message stamped with the given instant.
    pub fn new(device_id: impl Into<String>, temperature: f64, timestamp: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            temperature,
            timestamp,
        }
    }
}

#[cfg(feature = "serde")]
impl ReadingMessage {
    /// Encode as a JSON payload.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a JSON payload.
    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}
