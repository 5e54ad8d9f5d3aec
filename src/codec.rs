//! Compact track encoding
//!
//! A track is projected to `{lat, lng, time}` triples (coordinates rounded to
//! 1e-6 degree, whole epoch seconds), written as compact JSON, gzipped and
//! base64 encoded. Altitude, accuracy, speed and heading are dropped.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::LocationFix;

const COORDINATE_SCALE: f64 = 1e6;

/// Encoded track; the empty string is the empty-track sentinel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompactTrack(String);

impl CompactTrack {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for CompactTrack {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CompactTrack {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One decoded track point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lng: f64,
    /// Seconds from Unix epoch
    pub time: i64,
}

impl From<&LocationFix> for TrackPoint {
    fn from(fix: &LocationFix) -> Self {
        Self {
            lat: round_coordinate(fix.latitude),
            lng: round_coordinate(fix.longitude),
            time: fix.timestamp.timestamp(),
        }
    }
}

#[derive(Error, Debug)]
pub(crate) enum CodecError {
    #[error("invalid base64")]
    Transport(#[from] base64::DecodeError),

    #[error("invalid gzip stream")]
    Compression(#[from] std::io::Error),

    #[error("invalid track structure")]
    Structure(#[from] serde_json::Error),
}

fn round_coordinate(value: f64) -> f64 {
    (value * COORDINATE_SCALE).round() / COORDINATE_SCALE
}

/// Encode fixes into a compact track.
pub fn encode(fixes: &[LocationFix]) -> CompactTrack {
    let points: Vec<TrackPoint> = fixes.iter().map(TrackPoint::from).collect();
    encode_points(&points)
}

/// Encode already projected points.
pub fn encode_points(points: &[TrackPoint]) -> CompactTrack {
    if points.is_empty() {
        return CompactTrack::default();
    }
    match try_encode(points) {
        Ok(track) => track,
        // Writing into a Vec cannot fail and the points always serialize
        Err(e) => unreachable!("in-memory track encoding failed: {}", e),
    }
}

fn try_encode(points: &[TrackPoint]) -> Result<CompactTrack, CodecError> {
    let json = serde_json::to_vec(points)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(CompactTrack(BASE64.encode(compressed)))
}

/// Decode a compact track.
///
/// Any malformed input yields an empty track; use [`try_decode`] internally
/// when an empty track must be told apart from a corrupt one.
pub fn decode(track: &CompactTrack) -> Vec<TrackPoint> {
    match try_decode(track) {
        Ok(points) => points,
        Err(e) => {
            debug!("Discarding undecodable track: {}", e);
            Vec::new()
        }
    }
}

pub(crate) fn try_decode(track: &CompactTrack) -> Result<Vec<TrackPoint>, CodecError> {
    if track.is_empty() {
        return Ok(Vec::new());
    }
    let compressed = BASE64.decode(track.as_str())?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
