//! Snapshot source contract + point extraction and slot reconciliation.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use skytrack_core::{CandidatePoint, SlotReading};
use skytrack_storage::{FeedClient, FetchError};
use thiserror::Error;
use tracing::trace;

pub const CRATE_NAME: &str = "skytrack-feed";

/// Anything that can hand back the raw snapshot text for an hour offset.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, hour_offset: u32) -> Result<String, FetchError>;
}

#[async_trait]
impl SnapshotSource for FeedClient {
    async fn fetch_snapshot(&self, hour_offset: u32) -> Result<String, FetchError> {
        self.fetch(hour_offset).await
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("not a numeric array: {0}")]
    Malformed(String),
    #[error("array has {0} elements, need at least 2")]
    TooShort(usize),
}

// Loose on purpose: anything bracketed that looks numeric with two or three
// comma-separated members is a candidate. Validation happens in `parse_candidate`.
const CANDIDATE_PATTERN: &str = r"\[\s*[-+0-9.eE]+(?:\s*,\s*[-+0-9.eE]+){1,2}\s*\]";

fn candidate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CANDIDATE_PATTERN).expect("candidate pattern is valid"))
}

/// Finds bracketed 2-or-3 member numeric-looking substrings in order of appearance.
pub fn scan_candidates(raw: &str) -> impl Iterator<Item = &str> {
    candidate_regex().find_iter(raw).map(|m| m.as_str())
}

/// Strict parse of one candidate substring as a JSON numeric array.
pub fn parse_candidate(candidate: &str) -> Result<CandidatePoint, ParseError> {
    let values: Vec<f64> = serde_json::from_str(candidate)
        .map_err(|_| ParseError::Malformed(candidate.to_string()))?;
    CandidatePoint::from_values(&values).ok_or(ParseError::TooShort(values.len()))
}

/// Scans `raw` and keeps every candidate that parses. Bad entries are dropped,
/// so extraction as a whole never fails.
pub fn extract_points(raw: &str) -> Vec<CandidatePoint> {
    scan_candidates(raw)
        .filter_map(|candidate| match parse_candidate(candidate) {
            Ok(point) => Some(point),
            Err(err) => {
                trace!(%err, "dropping candidate");
                None
            }
        })
        .collect()
}

/// Maps candidates onto exactly `slots` readings by position. Extra candidates
/// are dropped; missing slots are all-absent.
pub fn reconcile(candidates: &[CandidatePoint], slots: usize) -> Vec<SlotReading> {
    let mut readings: Vec<SlotReading> = candidates
        .iter()
        .take(slots)
        .copied()
        .map(SlotReading::from)
        .collect();
    readings.resize(slots, SlotReading::absent());
    readings
}
