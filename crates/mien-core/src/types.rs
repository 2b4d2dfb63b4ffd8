use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Face descriptor: a fixed-length vector produced by the extraction provider
/// (128-dimensional for dlib-style embeddings).
///
/// Immutable once built. Clones share the same backing buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    values: Arc<[f32]>,
}

impl Descriptor {
    /// Build a descriptor, rejecting empty vectors and non-finite values.
    pub fn new(values: Vec<f32>) -> Result<Self, EngineError> {
        if values.is_empty() {
            return Err(EngineError::InvalidDescriptor("descriptor is empty".into()));
        }
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(EngineError::InvalidDescriptor(format!(
                "non-finite value at index {pos}"
            )));
        }
        Ok(Self {
            values: values.into(),
        })
    }

    /// Build a descriptor and check it against the system dimension in one step.
    pub fn with_dimension(values: Vec<f32>, dimension: usize) -> Result<Self, EngineError> {
        let descriptor = Self::new(values)?;
        descriptor.ensure_dimension(dimension)?;
        Ok(descriptor)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn ensure_dimension(&self, expected: usize) -> Result<(), EngineError> {
        if self.dimension() != expected {
            return Err(EngineError::DimensionMismatch {
                expected,
                actual: self.dimension(),
            });
        }
        Ok(())
    }

    /// Euclidean distance to another descriptor.
    ///
    /// Never truncates: descriptors of different length are a `DimensionMismatch`.
    pub fn distance(&self, other: &Descriptor) -> Result<f32, EngineError> {
        if self.dimension() != other.dimension() {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension(),
                actual: other.dimension(),
            });
        }

        // Accumulate in f64: squares of large finite f32 components overflow f32.
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
            .sum::<f64>();
        Ok(sum.sqrt() as f32)
    }
}

/// Display similarity for a distance: `max(0, 1 - distance) * 100`, within [0, 100].
///
/// Reporting only; the match decision uses the raw distance.
pub fn similarity_score(distance: f32) -> f32 {
    ((1.0 - distance).max(0.0) * 100.0).clamp(0.0, 100.0)
}

/// An enrolled identity and its descriptor.
#[derive(Debug, Clone)]
pub struct EnrollmentRecord {
    pub identity: String,
    pub descriptor: Descriptor,
    pub enrolled_at: DateTime<Utc>,
}

impl EnrollmentRecord {
    pub fn new(identity: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            identity: identity.into(),
            descriptor,
            enrolled_at: Utc::now(),
        }
    }
}

/// One identity that passed the match threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub identity: String,
    pub distance: f32,
    /// Percentage in [0, 100], see [`similarity_score`].
    pub similarity: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = desc(&[0.25, -1.5, 3.0, 0.0]);
        assert_eq!(a.distance(&a).unwrap(), 0.0);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = desc(&[0.1, 0.7, -0.3]);
        let b = desc(&[-0.4, 0.2, 0.9]);
        assert_eq!(a.distance(&b).unwrap(), b.distance(&a).unwrap());
    }

    #[test]
    fn test_distance_euclidean() {
        let a = desc(&[0.0, 0.0]);
        let b = desc(&[3.0, 4.0]);
        assert!((a.distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_large_opposite_components_stays_finite() {
        let a = desc(&[1.0e20, 0.0]);
        let b = desc(&[-1.0e20, 0.0]);
        let d = a.distance(&b).unwrap();
        assert!(d.is_finite(), "distance overflowed: {d}");
        assert!((d - 2.0e20).abs() / 2.0e20 < 1e-6);
        assert_eq!(d, b.distance(&a).unwrap());
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = desc(&[1.0, 0.0]);
        let b = desc(&[1.0, 0.0, 0.0]);
        assert_eq!(
            a.distance(&b),
            Err(EngineError::DimensionMismatch { expected: 2, actual: 3 })
        );
    }

    #[test]
    fn test_rejects_empty_and_non_finite() {
        assert!(matches!(
            Descriptor::new(vec![]),
            Err(EngineError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            Descriptor::new(vec![0.0, f32::NAN]),
            Err(EngineError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            Descriptor::new(vec![f32::INFINITY]),
            Err(EngineError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_with_dimension() {
        assert!(Descriptor::with_dimension(vec![0.0; 128], 128).is_ok());
        assert_eq!(
            Descriptor::with_dimension(vec![0.0; 64], 128),
            Err(EngineError::DimensionMismatch { expected: 128, actual: 64 })
        );
    }

    #[test]
    fn test_similarity_score_clamped() {
        assert_eq!(similarity_score(0.0), 100.0);
        assert!((similarity_score(0.25) - 75.0).abs() < 1e-4);
        assert_eq!(similarity_score(1.0), 0.0);
        assert_eq!(similarity_score(1.7), 0.0);
    }
}
