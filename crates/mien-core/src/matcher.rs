//! Matching an unknown descriptor against a store snapshot.

use crate::error::EngineError;
use crate::store::Snapshot;
use crate::types::{similarity_score, Descriptor, MatchCandidate};
use serde::{Serialize, Serializer};

/// A record the matcher could not compare against the unknown descriptor.
///
/// Serializes `error` as its display message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRecord {
    pub identity: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: EngineError,
}

fn serialize_display<S>(error: &EngineError, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(error)
}

/// Ranked candidates within the threshold, plus per-record diagnostics.
///
/// An empty `candidates` list is the normal "no match" outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub candidates: Vec<MatchCandidate>,
    pub skipped: Vec<SkippedRecord>,
}

impl MatchOutcome {
    /// Closest candidate, if any passed the threshold.
    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }

    pub fn is_match(&self) -> bool {
        !self.candidates.is_empty()
    }
}

/// Strategy for comparing an unknown descriptor against enrolled faces.
///
/// Contract, independent of how the search is done: every returned candidate has
/// `distance <= threshold`; candidates are ordered by ascending distance, then by
/// identity; records that cannot be compared are reported in `skipped` and never
/// abort the pass.
pub trait Matcher: Send + Sync {
    fn identify(&self, unknown: &Descriptor, snapshot: &Snapshot, threshold: f32) -> MatchOutcome;
}

/// Exhaustive Euclidean scan over every enrolled record.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearScanMatcher;

impl Matcher for LinearScanMatcher {
    fn identify(&self, unknown: &Descriptor, snapshot: &Snapshot, threshold: f32) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();

        for record in snapshot.iter() {
            let distance = match unknown.distance(&record.descriptor) {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(identity = %record.identity, error = %err, "skipping record");
                    outcome.skipped.push(SkippedRecord {
                        identity: record.identity.clone(),
                        error: err,
                    });
                    continue;
                }
            };

            if distance <= threshold {
                outcome.candidates.push(MatchCandidate {
                    identity: record.identity.clone(),
                    distance,
                    similarity: similarity_score(distance),
                });
            }
        }

        outcome.candidates.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.identity.cmp(&b.identity))
        });

        tracing::debug!(
            scanned = snapshot.len(),
            matched = outcome.candidates.len(),
            skipped = outcome.skipped.len(),
            threshold,
            "linear scan complete"
        );

        outcome
    }
}
