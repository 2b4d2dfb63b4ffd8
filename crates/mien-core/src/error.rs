use thiserror::Error;

/// Errors raised by the enrollment store, the matcher and the extraction boundary.
///
/// "No match" is not an error: [`crate::MatchOutcome`] carries an empty candidate list instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("descriptor dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("identity already enrolled: {0}; remove it before enrolling again")]
    DuplicateIdentity(String),
    #[error("identity not enrolled: {0}")]
    NotFound(String),
    #[error("no face detected in the image; retry with a clearer image")]
    NoFaceDetected,
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("identity must not be empty")]
    InvalidIdentity,
    #[error("storage: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl EngineError {
    /// True for errors caused by what the caller sent rather than by the system.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::DimensionMismatch { .. }
                | EngineError::DuplicateIdentity(_)
                | EngineError::NotFound(_)
                | EngineError::NoFaceDetected
                | EngineError::InvalidDescriptor(_)
                | EngineError::InvalidIdentity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_messages() {
        assert_eq!(
            EngineError::DuplicateIdentity("alice".into()).to_string(),
            "identity already enrolled: alice; remove it before enrolling again"
        );
        assert_eq!(
            EngineError::NoFaceDetected.to_string(),
            "no face detected in the image; retry with a clearer image"
        );
    }

    #[test]
    fn test_caller_errors() {
        assert!(EngineError::NotFound("bob".into()).is_caller_error());
        assert!(!EngineError::Storage("disk full".into()).is_caller_error());
        assert!(!EngineError::ExtractionFailure("crashed".into()).is_caller_error());
    }
}
