//! Data models.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// One GPS sample accepted into the tracker
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    /// Latitude in WGS84 decimal degrees
    pub latitude: f64,
    /// Longitude in WGS84 decimal degrees
    pub longitude: f64,
    /// Altitude in meters
    pub altitude: Option<f64>,
    /// Horizontal accuracy in meters
    pub accuracy: Option<f64>,
    /// Speed in km/h, device-reported or derived from the previous fix
    pub speed: Option<f64>,
    /// Heading in degrees (0-360)
    pub heading: Option<f64>,
    /// Fix time as reported by the device
    pub timestamp: DateTime<Utc>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
            speed: None,
            heading: None,
            timestamp,
        }
    }

    /// Both coordinates finite and within WGS84 bounds
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One element of the `locations` array in an upload batch.
///
/// Everything is optional on the wire; validation happens in the pipeline.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RawFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: Option<String>,
}

impl RawFix {
    /// Convert into a fix, resolving the timestamp leniently against `now`.
    ///
    /// Returns `None` when either coordinate is missing.
    pub fn into_fix(self, now: DateTime<Utc>) -> Option<LocationFix> {
        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);

        Some(LocationFix {
            latitude: self.latitude?,
            longitude: self.longitude?,
            altitude: self.altitude,
            accuracy: self.accuracy,
            speed: self.speed,
            heading: self.heading,
            timestamp,
        })
    }
}

/// Upload batch body: `{device_id, locations: [...]}`
///
/// Both fields are optional so that a missing field can be reported as a
/// validation error instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct UploadBatch {
    pub device_id: Option<String>,
    pub locations: Option<Vec<RawFix>>,
}

/// Parse an ISO-8601 timestamp, with or without offset.
///
/// Timestamps without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Response body for a processed upload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub processed_count: usize,
    #[serde(serialize_with = "serialize_iso8601")]
    pub timestamp: DateTime<Utc>,
}

/// Latest location of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationResponse {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    #[serde(serialize_with = "serialize_iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl LocationResponse {
    pub fn new(device_id: &str, fix: &LocationFix) -> Self {
        Self {
            device_id: device_id.to_string(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.altitude,
            accuracy: fix.accuracy,
            speed: fix.speed,
            heading: fix.heading,
            timestamp: fix.timestamp,
        }
    }
}

/// One point of a history response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    #[serde(serialize_with = "serialize_iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl From<&LocationFix> for HistoryPoint {
    fn from(fix: &LocationFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.altitude,
            speed: fix.speed,
            timestamp: fix.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryResponse {
    pub device_id: String,
    pub history: Vec<HistoryPoint>,
    pub total_points: usize,
}

/// Compact track export
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackResponse {
    pub device_id: String,
    pub track: String,
    pub total_points: usize,
}

fn serialize_iso8601<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}
