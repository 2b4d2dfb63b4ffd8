//! mien-core: face enrollment store and matching engine.
//!
//! Consumes descriptors computed by an external embedding provider, keeps one
//! descriptor per identity, and ranks enrolled identities by Euclidean distance.

pub mod backend;
pub mod error;
pub mod extractor;
pub mod matcher;
pub mod registry;
pub mod store;
pub mod types;

pub use backend::{EnrollmentBackend, MemoryBackend, SqliteBackend};
pub use error::EngineError;
pub use extractor::{extract_first, first_face, CommandExtractor, Extractor};
pub use matcher::{LinearScanMatcher, MatchOutcome, Matcher, SkippedRecord};
pub use registry::FaceRegistry;
pub use store::{EnrollmentStore, Snapshot};
pub use types::{similarity_score, Descriptor, EnrollmentRecord, MatchCandidate};

/// Descriptor length of dlib-style 128-d face embeddings.
pub const DEFAULT_DIMENSION: usize = 128;

/// Conventional maximum Euclidean distance for a same-person decision with
/// 128-d dlib-style embeddings. Tune per provider.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
