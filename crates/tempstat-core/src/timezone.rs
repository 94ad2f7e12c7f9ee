//! Device timezones.
//!
//! A device's zone is located once at enrollment from its coordinates and stored
//! by IANA name. Everything downstream parses that name back into a
//! [`DeviceTimezone`], which carries the full rule set (DST included) rather
//! than a fixed offset.

use std::fmt;
use std::str::FromStr;

use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::types::Coordinates;

/// An IANA timezone resolved against the bundled rule database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTimezone {
    tz: Tz,
}

impl DeviceTimezone {
    /// Parse an IANA identifier such as `America/New_York`.
    ///
    /// Unknown identifiers are an error; there is no fallback zone.
    pub fn parse(name: &str) -> Result<Self> {
        Tz::from_str(name.trim())
            .map(|tz| Self { tz })
            .map_err(|_| Error::UnknownTimezone(name.to_string()))
    }

    /// UTC.
    pub fn utc() -> Self {
        Self { tz: Tz::UTC }
    }

    /// The canonical IANA name.
    pub fn name(&self) -> &'static str {
        self.tz.name()
    }

    pub(crate) fn tz(&self) -> Tz {
        self.tz
    }
}

impl FromStr for DeviceTimezone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceTimezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Looks up the IANA zone covering a geographic position.
pub trait TimezoneLocator: Send + Sync {
    /// Return the zone name for the coordinates, or `None` if no zone covers them.
    fn locate(&self, coordinates: &Coordinates) -> Option<String>;
}

/// A locator that answers the same zone for every position.
#[derive(Debug, Clone)]
pub struct FixedLocator {
    zone: String,
}

impl FixedLocator {
    pub fn new(zone: impl Into<String>) -> Self {
        Self { zone: zone.into() }
    }
}

impl TimezoneLocator for FixedLocator {
    fn locate(&self, _coordinates: &Coordinates) -> Option<String> {
        Some(self.zone.clone())
    }
}
