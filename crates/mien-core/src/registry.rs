use crate::error::EngineError;
use crate::extractor::{extract_first, Extractor};
use crate::matcher::{LinearScanMatcher, MatchOutcome, Matcher};
use crate::store::EnrollmentStore;
use crate::types::{Descriptor, EnrollmentRecord};

/// Enroll / remove / identify over one store and one matching strategy.
///
/// Shareable across threads (`Arc<FaceRegistry>`): writes serialize inside the
/// store, identification works on a snapshot and never blocks a writer.
pub struct FaceRegistry {
    store: EnrollmentStore,
    matcher: Box<dyn Matcher>,
}

impl FaceRegistry {
    pub fn new(store: EnrollmentStore, matcher: Box<dyn Matcher>) -> Self {
        Self { store, matcher }
    }

    /// Registry using the exhaustive [`LinearScanMatcher`].
    pub fn with_linear_scan(store: EnrollmentStore) -> Self {
        Self::new(store, Box::new(LinearScanMatcher))
    }

    pub fn enroll(&self, identity: &str, descriptor: Descriptor) -> Result<(), EngineError> {
        match self.store.insert(identity, descriptor) {
            Ok(()) => {
                tracing::info!(identity, enrolled = self.store.len(), "identity enrolled");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(identity, error = %err, "enrollment rejected");
                Err(err)
            }
        }
    }

    pub fn remove(&self, identity: &str) -> Result<(), EngineError> {
        self.store.delete(identity)?;
        tracing::info!(identity, enrolled = self.store.len(), "identity removed");
        Ok(())
    }

    /// Rank enrolled identities within `threshold` of `unknown`. Never fails:
    /// an empty candidate list means no match.
    pub fn identify(&self, unknown: &Descriptor, threshold: f32) -> MatchOutcome {
        let snapshot = self.store.snapshot();
        let outcome = self.matcher.identify(unknown, &snapshot, threshold);

        match outcome.best() {
            Some(best) => tracing::info!(
                candidates = outcome.candidates.len(),
                best = %best.identity,
                distance = best.distance,
                threshold,
                "face identified"
            ),
            None => tracing::info!(enrolled = snapshot.len(), threshold, "no match"),
        }
        outcome
    }

    /// Extract the first face from `image` and enroll it.
    pub fn enroll_image(
        &self,
        identity: &str,
        extractor: &dyn Extractor,
        image: &[u8],
    ) -> Result<(), EngineError> {
        let descriptor = extract_first(extractor, image)?;
        self.enroll(identity, descriptor)
    }

    /// Extract the first face from `image` and identify it.
    pub fn identify_image(
        &self,
        extractor: &dyn Extractor,
        image: &[u8],
        threshold: f32,
    ) -> Result<MatchOutcome, EngineError> {
        let descriptor = extract_first(extractor, image)?;
        Ok(self.identify(&descriptor, threshold))
    }

    pub fn list_all(&self) -> Vec<EnrollmentRecord> {
        self.store.list_all()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.store.dimension()
    }
}
