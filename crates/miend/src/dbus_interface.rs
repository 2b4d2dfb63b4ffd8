use crate::engine::{ExtractorHandle, WorkerError};
use mien_core::{Descriptor, EngineError, EnrollmentRecord, FaceRegistry, MatchOutcome};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the Mien enrollment daemon.
///
/// Bus name: org.mien.Registry1
/// Object path: /org/mien/Registry1
pub struct RegistryService {
    registry: Arc<FaceRegistry>,
    extractor: ExtractorHandle,
    default_threshold: f32,
    extractor_program: String,
}

impl RegistryService {
    pub fn new(
        registry: Arc<FaceRegistry>,
        extractor: ExtractorHandle,
        default_threshold: f32,
        extractor_program: String,
    ) -> Self {
        Self {
            registry,
            extractor,
            default_threshold,
            extractor_program,
        }
    }

    /// Run a store write on the blocking pool. Writes hit SQLite under the
    /// store's writer lock and must not stall the executor.
    async fn write<F>(&self, op: F) -> zbus::fdo::Result<()>
    where
        F: FnOnce(&FaceRegistry) -> Result<(), EngineError> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || op(&registry))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("store write task failed: {e}")))?
            .map_err(|e| engine_to_fdo(&e))
    }

    async fn extract(&self, image: Vec<u8>) -> zbus::fdo::Result<Descriptor> {
        self.extractor.extract(image).await.map_err(|e| match e {
            WorkerError::Engine(err) => engine_to_fdo(&err),
            other => zbus::fdo::Error::Failed(other.to_string()),
        })
    }
}

#[interface(name = "org.mien.Registry1")]
impl RegistryService {
    /// Enroll a precomputed descriptor under `identity`.
    async fn enroll(&self, identity: &str, descriptor: Vec<f64>) -> zbus::fdo::Result<()> {
        tracing::info!(identity, dimension = descriptor.len(), "enroll requested");
        let descriptor = descriptor_from_wire(descriptor).map_err(|e| engine_to_fdo(&e))?;
        let identity = identity.to_owned();
        self.write(move |registry| registry.enroll(&identity, descriptor)).await
    }

    /// Extract the first face in `image` and enroll it under `identity`.
    async fn enroll_image(&self, identity: &str, image: Vec<u8>) -> zbus::fdo::Result<()> {
        tracing::info!(identity, bytes = image.len(), "enroll_image requested");
        if identity.trim().is_empty() {
            return Err(engine_to_fdo(&EngineError::InvalidIdentity));
        }
        let descriptor = self.extract(image).await?;
        let identity = identity.to_owned();
        self.write(move |registry| registry.enroll(&identity, descriptor)).await
    }

    /// Remove the enrollment for `identity`.
    async fn remove(&self, identity: &str) -> zbus::fdo::Result<()> {
        tracing::info!(identity, "remove requested");
        let identity = identity.to_owned();
        self.write(move |registry| registry.remove(&identity)).await
    }

    /// Rank enrolled identities against a precomputed descriptor.
    ///
    /// A negative `threshold` selects the configured default. Returns JSON.
    async fn identify(&self, descriptor: Vec<f64>, threshold: f64) -> zbus::fdo::Result<String> {
        let descriptor = descriptor_from_wire(descriptor).map_err(|e| engine_to_fdo(&e))?;
        let threshold = resolve_threshold(threshold, self.default_threshold);
        let outcome = self.registry.identify(&descriptor, threshold);
        outcome_json(&outcome, threshold)
    }

    /// Extract the first face in `image` and rank enrolled identities against it.
    async fn identify_image(&self, image: Vec<u8>, threshold: f64) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "identify_image requested");
        let descriptor = self.extract(image).await?;
        let threshold = resolve_threshold(threshold, self.default_threshold);
        let outcome = self.registry.identify(&descriptor, threshold);
        outcome_json(&outcome, threshold)
    }

    /// List every enrollment as JSON.
    async fn list_all(&self) -> zbus::fdo::Result<String> {
        let summaries: Vec<EnrollmentSummary> = self
            .registry
            .list_all()
            .iter()
            .map(EnrollmentSummary::from)
            .collect();
        serde_json::to_string(&summaries).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrolled": self.registry.len(),
            "dimension": self.registry.dimension(),
            "match_threshold": self.default_threshold,
            "extractor": self.extractor_program,
        })
        .to_string())
    }
}

/// Wire form of an enrollment; the descriptor itself never leaves the daemon.
#[derive(Debug, Serialize)]
struct EnrollmentSummary {
    identity: String,
    dimension: usize,
    enrolled_at: String,
}

impl From<&EnrollmentRecord> for EnrollmentSummary {
    fn from(record: &EnrollmentRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            dimension: record.descriptor.dimension(),
            enrolled_at: record.enrolled_at.to_rfc3339(),
        }
    }
}

fn descriptor_from_wire(values: Vec<f64>) -> Result<Descriptor, EngineError> {
    Descriptor::new(values.into_iter().map(|v| v as f32).collect())
}

fn resolve_threshold(requested: f64, default: f32) -> f32 {
    if requested.is_finite() && requested >= 0.0 {
        requested as f32
    } else {
        default
    }
}

fn outcome_json(outcome: &MatchOutcome, threshold: f32) -> zbus::fdo::Result<String> {
    let mut value =
        serde_json::to_value(outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    value["threshold"] = serde_json::json!(threshold);
    Ok(value.to_string())
}

/// Caller mistakes become `InvalidArgs`; everything else is `Failed`.
fn engine_to_fdo(err: &EngineError) -> zbus::fdo::Error {
    if err.is_caller_error() {
        zbus::fdo::Error::InvalidArgs(err.to_string())
    } else {
        zbus::fdo::Error::Failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_extractor;
    use mien_core::{
        EnrollmentBackend, EnrollmentStore, Extractor, LinearScanMatcher, Matcher, MemoryBackend,
        Snapshot,
    };
    use std::time::Duration;

    /// Memory backend whose saves take a while, like a busy disk.
    struct SlowBackend {
        inner: MemoryBackend,
        delay: Duration,
    }

    impl EnrollmentBackend for SlowBackend {
        fn load_all(&mut self) -> Result<Vec<EnrollmentRecord>, EngineError> {
            self.inner.load_all()
        }

        fn save(&mut self, record: &EnrollmentRecord) -> Result<(), EngineError> {
            std::thread::sleep(self.delay);
            self.inner.save(record)
        }

        fn delete(&mut self, identity: &str) -> Result<bool, EngineError> {
            self.inner.delete(identity)
        }
    }

    struct OneFace;

    impl Extractor for OneFace {
        fn extract(&self, _image: &[u8]) -> Result<Vec<Descriptor>, EngineError> {
            Ok(vec![Descriptor::new(vec![0.5, 0.5])?])
        }
    }

    fn service(backend: Box<dyn EnrollmentBackend>) -> RegistryService {
        let store = EnrollmentStore::open(backend, 2).unwrap();
        RegistryService::new(
            Arc::new(FaceRegistry::with_linear_scan(store)),
            spawn_extractor(Box::new(OneFace), Duration::from_secs(5)),
            0.6,
            "one-face".into(),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_write_does_not_block_executor() {
        let service = service(Box::new(SlowBackend {
            inner: MemoryBackend::new(),
            delay: Duration::from_millis(400),
        }));

        let enroll = service.enroll("alice", vec![0.5, 0.5]);
        tokio::pin!(enroll);
        tokio::select! {
            biased;
            _ = &mut enroll => panic!("write finished before the executor could run a timer"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        enroll.await.unwrap();
        assert_eq!(service.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_identify_remove_round() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mien_core::SqliteBackend::open(&dir.path().join("enrollments.db")).unwrap();
        let service = service(Box::new(backend));

        service.enroll_image("alice", b"image".to_vec()).await.unwrap();
        assert!(matches!(
            service.enroll("alice", vec![0.5, 0.5]).await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));

        let json: serde_json::Value =
            serde_json::from_str(&service.identify(vec![0.5, 0.5], -1.0).await.unwrap()).unwrap();
        assert_eq!(json["candidates"][0]["identity"], "alice");
        assert_eq!(json["threshold"], 0.6f32 as f64);

        service.remove("alice").await.unwrap();
        assert!(matches!(
            service.remove("alice").await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_resolve_threshold() {
        assert_eq!(resolve_threshold(0.4, 0.6), 0.4);
        assert_eq!(resolve_threshold(0.0, 0.6), 0.0);
        assert_eq!(resolve_threshold(-1.0, 0.6), 0.6);
        assert_eq!(resolve_threshold(f64::NAN, 0.6), 0.6);
    }

    #[test]
    fn test_descriptor_from_wire() {
        assert_eq!(
            descriptor_from_wire(vec![0.5, 0.25]).unwrap().values(),
            &[0.5f32, 0.25]
        );
        assert!(descriptor_from_wire(vec![]).is_err());
        assert!(descriptor_from_wire(vec![1.0e300]).is_err());
    }

    #[test]
    fn test_outcome_json() {
        let snapshot: Snapshot = vec![EnrollmentRecord::new(
            "alice",
            Descriptor::new(vec![0.0, 0.0]).unwrap(),
        )]
        .into_iter()
        .collect();
        let unknown = Descriptor::new(vec![0.0, 0.0]).unwrap();
        let outcome = LinearScanMatcher.identify(&unknown, &snapshot, 0.5);

        let json: serde_json::Value =
            serde_json::from_str(&outcome_json(&outcome, 0.5).unwrap()).unwrap();
        assert_eq!(json["candidates"][0]["identity"], "alice");
        assert_eq!(json["candidates"][0]["similarity"], 100.0);
        assert_eq!(json["threshold"], 0.5);
        assert!(json["skipped"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            engine_to_fdo(&EngineError::DuplicateIdentity("bob".into())),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            engine_to_fdo(&EngineError::NoFaceDetected),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            engine_to_fdo(&EngineError::Storage("disk full".into())),
            zbus::fdo::Error::Failed(_)
        ));
    }

    #[test]
    fn test_summary_omits_descriptor() {
        let record = EnrollmentRecord::new("carol", Descriptor::new(vec![1.0; 4]).unwrap());
        let json = serde_json::to_value(EnrollmentSummary::from(&record)).unwrap();
        assert_eq!(json["identity"], "carol");
        assert_eq!(json["dimension"], 4);
        assert!(json.get("descriptor").is_none());
    }
}
