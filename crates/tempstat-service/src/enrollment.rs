//! Device enrollment.
//!
//! A device's timezone is derived once from its coordinates when it is
//! enrolled and never changes afterwards. Positions outside every zone
//! polygon (open ocean, for instance) fall back to UTC.

use serde::Deserialize;
use tempstat_core::{Coordinates, DeviceTimezone, TimezoneLocator};
use tempstat_store::{NewDevice, Store, StoredDevice};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One device to enroll.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrollmentRequest {
    pub serial: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl EnrollmentRequest {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// Enrollment body: a single device or a list of devices.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EnrollmentBody {
    Many(Vec<EnrollmentRequest>),
    One(EnrollmentRequest),
}

impl EnrollmentBody {
    pub fn is_batch(&self) -> bool {
        matches!(self, EnrollmentBody::Many(_))
    }

    pub fn into_requests(self) -> Vec<EnrollmentRequest> {
        match self {
            EnrollmentBody::Many(requests) => requests,
            EnrollmentBody::One(request) => vec![request],
        }
    }
}

/// Enrollment errors.
#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("At least one device is required")]
    Empty,

    #[error("{0}")]
    Invalid(String),

    #[error("Devices with the following serial numbers already exist: {}", .0.join(", "))]
    DuplicateSerial(Vec<String>),

    #[error(transparent)]
    Store(tempstat_store::Error),
}

impl From<tempstat_store::Error> for EnrollmentError {
    fn from(e: tempstat_store::Error) -> Self {
        match e {
            tempstat_store::Error::DuplicateSerial(serials) => {
                EnrollmentError::DuplicateSerial(serials)
            }
            other => EnrollmentError::Store(other),
        }
    }
}

/// Timezone lookup backed by the zone polygons bundled with `tzf-rs`.
pub struct TzfLocator {
    finder: tzf_rs::DefaultFinder,
}

impl TzfLocator {
    /// Load the bundled zone data. This takes a moment; create one per process.
    pub fn new() -> Self {
        Self {
            finder: tzf_rs::DefaultFinder::new(),
        }
    }
}

impl Default for TzfLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TimezoneLocator for TzfLocator {
    fn locate(&self, coordinates: &Coordinates) -> Option<String> {
        let name = self
            .finder
            .get_tz_name(coordinates.longitude, coordinates.latitude);
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

/// Timezone for a position, falling back to UTC when none can be resolved.
pub fn resolve_timezone(locator: &dyn TimezoneLocator, coordinates: &Coordinates) -> DeviceTimezone {
    match locator.locate(coordinates) {
        Some(name) => DeviceTimezone::parse(&name).unwrap_or_else(|e| {
            warn!("Located zone is not usable ({}), using UTC", e);
            DeviceTimezone::utc()
        }),
        None => {
            debug!(
                "No timezone covers ({}, {}), using UTC",
                coordinates.latitude, coordinates.longitude
            );
            DeviceTimezone::utc()
        }
    }
}

/// Check a batch before touching the store.
pub fn validate_requests(requests: &[EnrollmentRequest]) -> Result<(), EnrollmentError> {
    if requests.is_empty() {
        return Err(EnrollmentError::Empty);
    }

    let mut seen = std::collections::HashSet::new();
    let mut repeated = Vec::new();

    for (i, request) in requests.iter().enumerate() {
        if request.serial.trim().is_empty() {
            return Err(EnrollmentError::Invalid(format!(
                "devices[{}].serial: serial cannot be empty",
                i
            )));
        }
        if let Err(e) = request.coordinates().validate() {
            return Err(EnrollmentError::Invalid(format!("devices[{}]: {}", i, e)));
        }
        if !seen.insert(request.serial.as_str()) && !repeated.contains(&request.serial) {
            repeated.push(request.serial.clone());
        }
    }

    if repeated.is_empty() {
        Ok(())
    } else {
        Err(EnrollmentError::DuplicateSerial(repeated))
    }
}

/// Validate and enroll a batch of devices in one transaction.
pub fn enroll(
    store: &mut Store,
    locator: &dyn TimezoneLocator,
    requests: &[EnrollmentRequest],
    now: OffsetDateTime,
) -> Result<Vec<StoredDevice>, EnrollmentError> {
    validate_requests(requests)?;

    let serials: Vec<String> = requests.iter().map(|r| r.serial.clone()).collect();
    let existing = store.existing_serials(&serials)?;
    if !existing.is_empty() {
        return Err(EnrollmentError::DuplicateSerial(existing));
    }

    let devices: Vec<NewDevice> = requests
        .iter()
        .map(|request| {
            let coordinates = request.coordinates();
            NewDevice {
                id: Uuid::new_v4().to_string(),
                serial: request.serial.clone(),
                coordinates,
                timezone: resolve_timezone(locator, &coordinates),
                enrolled_at: now,
            }
        })
        .collect();

    let enrolled = store.insert_devices(&devices)?;
    for device in &enrolled {
        info!(
            device_id = %device.id,
            serial = %device.serial,
            timezone = %device.timezone,
            "Enrolled device"
        );
    }

    Ok(enrolled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempstat_core::FixedLocator;
    use time::macros::datetime;

    struct NoZone;

    impl TimezoneLocator for NoZone {
        fn locate(&self, _coordinates: &Coordinates) -> Option<String> {
            None
        }
    }

    fn request(serial: &str) -> EnrollmentRequest {
        EnrollmentRequest {
            serial: serial.to_string(),
            latitude: 40.7128,
            longitude: -74.006,
        }
    }

    #[test]
    fn test_body_single_or_many() {
        let one: EnrollmentBody =
            serde_json::from_str(r#"{"serial":"A1","latitude":1.0,"longitude":2.0}"#).unwrap();
        assert!(!one.is_batch());
        assert_eq!(one.into_requests().len(), 1);

        let many: EnrollmentBody = serde_json::from_str(
            r#"[{"serial":"A1","latitude":1,"longitude":2},{"serial":"A2","latitude":3,"longitude":4}]"#,
        )
        .unwrap();
        assert!(many.is_batch());
        assert_eq!(many.into_requests()[1].serial, "A2");

        assert!(serde_json::from_str::<EnrollmentBody>(r#"{"serial":"A1"}"#).is_err());
    }

    #[test]
    fn test_validate_requests() {
        assert!(matches!(validate_requests(&[]), Err(EnrollmentError::Empty)));
        assert!(matches!(
            validate_requests(&[request("  ")]),
            Err(EnrollmentError::Invalid(_))
        ));

        let mut bad = request("A1");
        bad.latitude = 91.0;
        assert!(matches!(
            validate_requests(&[bad]),
            Err(EnrollmentError::Invalid(_))
        ));

        match validate_requests(&[request("A1"), request("A2"), request("A1")]) {
            Err(EnrollmentError::DuplicateSerial(serials)) => assert_eq!(serials, vec!["A1"]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_enroll_assigns_id_and_timezone() {
        let mut store = Store::open_in_memory().unwrap();
        let locator = FixedLocator::new("America/New_York");
        let now = datetime!(2024-07-01 12:00 UTC);

        let devices = enroll(&mut store, &locator, &[request("SN-1"), request("SN-2")], now).unwrap();

        assert_eq!(devices.len(), 2);
        for device in &devices {
            assert!(Uuid::parse_str(&device.id).is_ok());
            assert_eq!(device.timezone, "America/New_York");
            assert_eq!(device.enrolled_at, now);
        }
        assert_ne!(devices[0].id, devices[1].id);
        assert_eq!(store.count_devices().unwrap(), 2);
    }

    #[test]
    fn test_enroll_rejects_existing_serials() {
        let mut store = Store::open_in_memory().unwrap();
        let locator = FixedLocator::new("UTC");
        let now = OffsetDateTime::now_utc();
        enroll(&mut store, &locator, &[request("SN-1"), request("SN-2")], now).unwrap();

        let err = enroll(
            &mut store,
            &locator,
            &[request("SN-2"), request("SN-3"), request("SN-1")],
            now,
        )
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Devices with the following serial numbers already exist: SN-2, SN-1"
        );
        assert_eq!(store.count_devices().unwrap(), 2);
    }

    #[test]
    fn test_resolve_timezone_falls_back_to_utc() {
        let coordinates = Coordinates::new(0.0, -140.0);
        assert_eq!(resolve_timezone(&NoZone, &coordinates).name(), "UTC");
        assert_eq!(
            resolve_timezone(&FixedLocator::new("Not/AZone"), &coordinates).name(),
            "UTC"
        );
        assert_eq!(
            resolve_timezone(&FixedLocator::new("Asia/Tokyo"), &coordinates).name(),
            "Asia/Tokyo"
        );
    }

    #[test]
    fn test_tzf_locator_known_cities() {
        let locator = TzfLocator::new();
        assert_eq!(
            locator.locate(&Coordinates::new(40.7128, -74.006)).as_deref(),
            Some("America/New_York")
        );
        assert_eq!(
            locator.locate(&Coordinates::new(35.6762, 139.6503)).as_deref(),
            Some("Asia/Tokyo")
        );
    }
}
