//! Core domain model for skytrack: snapshot points, per-slot readings and stored trajectories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "skytrack-core";

/// Number of balloon slots stored for every hour unless configured otherwise.
pub const DEFAULT_BALLOON_SLOTS: usize = 1000;

/// Lookback used to seed an empty store.
pub const DEFAULT_BACKFILL_HOURS: u32 = 24;

/// One point pulled out of an upstream snapshot, in order of appearance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidatePoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
}

impl CandidatePoint {
    /// Builds a point from a numeric array. Needs at least lat and lon; a third
    /// element becomes the altitude and anything beyond it is ignored.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        match values {
            [lat, lon, rest @ ..] => Some(Self {
                lat: *lat,
                lon: *lon,
                alt: rest.first().copied(),
            }),
            _ => None,
        }
    }
}

/// Reconciled reading for a single slot. All fields are `None` when the hour had
/// no usable data for that slot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SlotReading {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
}

impl SlotReading {
    pub fn absent() -> Self {
        Self::default()
    }
}

impl From<CandidatePoint> for SlotReading {
    fn from(point: CandidatePoint) -> Self {
        Self {
            lat: Some(point.lat),
            lon: Some(point.lon),
            alt: point.alt,
        }
    }
}

/// Persisted row: one slot at one hour.
///
/// The index is positional within the upstream snapshot, so it is an
/// approximate identity. If the feed reorders its points between hours, the
/// same index will follow a different physical balloon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalloonRecord {
    pub balloon_index: u32,
    pub timestamp: DateTime<Utc>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
}

impl BalloonRecord {
    pub fn from_reading(balloon_index: u32, timestamp: DateTime<Utc>, reading: SlotReading) -> Self {
        Self {
            balloon_index,
            timestamp,
            lat: reading.lat,
            lon: reading.lon,
            alt: reading.alt,
        }
    }

    /// Rows for one hour: reading `i` becomes balloon index `i`.
    pub fn hour(timestamp: DateTime<Utc>, readings: &[SlotReading]) -> Vec<Self> {
        readings
            .iter()
            .enumerate()
            .map(|(index, reading)| Self::from_reading(index as u32, timestamp, *reading))
            .collect()
    }
}

/// Single timestamped entry of a balloon trajectory as returned to readers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub timestamp: DateTime<Utc>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
}

impl From<BalloonRecord> for TrajectoryPoint {
    fn from(record: BalloonRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            lat: record.lat,
            lon: record.lon,
            alt: record.alt,
        }
    }
}

/// Full stored history of one slot, ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub balloon_index: u32,
    pub trajectory: Vec<TrajectoryPoint>,
}
