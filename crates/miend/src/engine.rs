use mien_core::{extract_first, Descriptor, EngineError, Extractor};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Extractions allowed to run at once, stuck ones included.
pub const MAX_CONCURRENT_EXTRACTIONS: usize = 4;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("embedding provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

/// Clone-safe handle to the embedding provider.
///
/// Each request runs on tokio's blocking pool and holds one of
/// [`MAX_CONCURRENT_EXTRACTIONS`] permits until the provider returns, so a
/// provider that hangs occupies only its own slot.
#[derive(Clone)]
pub struct ExtractorHandle {
    extractor: Arc<dyn Extractor>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ExtractorHandle {
    /// Extract the first face in `image`.
    ///
    /// Waits at most the configured timeout. The caller stops waiting then;
    /// bounding the provider run itself is up to the extractor (see
    /// `CommandExtractor::with_timeout`).
    pub async fn extract(&self, image: Vec<u8>) -> Result<Descriptor, WorkerError> {
        let request = async {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|e| WorkerError::Worker(e.to_string()))?;
            let extractor = Arc::clone(&self.extractor);

            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let started = Instant::now();
                let result = extract_first(extractor.as_ref(), &image);
                tracing::debug!(
                    bytes = image.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "extraction finished"
                );
                result
            })
            .await
            .map_err(|e| WorkerError::Worker(e.to_string()))?
            .map_err(WorkerError::from)
        };

        match tokio::time::timeout(self.timeout, request).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "extraction timed out");
                Err(WorkerError::Timeout(self.timeout))
            }
        }
    }
}

/// Wrap `extractor` for use from async handlers.
pub fn spawn_extractor(extractor: Box<dyn Extractor>, timeout: Duration) -> ExtractorHandle {
    tracing::info!(
        max_concurrent = MAX_CONCURRENT_EXTRACTIONS,
        timeout = ?timeout,
        "extractor ready"
    );
    ExtractorHandle {
        extractor: Arc::from(extractor),
        permits: Arc::new(Semaphore::new(MAX_CONCURRENT_EXTRACTIONS)),
        timeout,
    }
}
