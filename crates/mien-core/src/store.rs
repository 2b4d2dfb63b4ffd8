//! Enrollment store: identity → descriptor, with copy-on-read snapshots.
//!
//! Writers (insert/delete) are serialized by the mutex that owns the backend.
//! The current records live behind an `Arc`; a write builds a new map and swaps
//! the `Arc`, so a snapshot taken earlier never observes it.

use crate::backend::EnrollmentBackend;
use crate::error::EngineError;
use crate::types::{Descriptor, EnrollmentRecord};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

type RecordMap = BTreeMap<String, EnrollmentRecord>;

/// Immutable point-in-time view of the store, iterated in identity order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Arc<RecordMap>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&EnrollmentRecord> {
        self.records.get(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnrollmentRecord> {
        self.records.values()
    }

    /// Owned copy of every record, for administrative listing.
    pub fn to_vec(&self) -> Vec<EnrollmentRecord> {
        self.records.values().cloned().collect()
    }
}

impl FromIterator<EnrollmentRecord> for Snapshot {
    fn from_iter<I: IntoIterator<Item = EnrollmentRecord>>(iter: I) -> Self {
        let records = iter
            .into_iter()
            .map(|r| (r.identity.clone(), r))
            .collect::<RecordMap>();
        Self {
            records: Arc::new(records),
        }
    }
}

/// Holds one descriptor per identity, backed by an [`EnrollmentBackend`].
pub struct EnrollmentStore {
    dimension: usize,
    writer: Mutex<Box<dyn EnrollmentBackend>>,
    current: RwLock<Arc<RecordMap>>,
}

impl EnrollmentStore {
    /// Load every persisted record from `backend`.
    ///
    /// Records of the wrong dimension are kept so they show up in listings;
    /// the matcher skips them one by one.
    pub fn open(
        mut backend: Box<dyn EnrollmentBackend>,
        dimension: usize,
    ) -> Result<Self, EngineError> {
        if dimension == 0 {
            return Err(EngineError::InvalidDescriptor(
                "descriptor dimension must be non-zero".into(),
            ));
        }

        let mut records = RecordMap::new();
        for record in backend.load_all()? {
            if record.descriptor.dimension() != dimension {
                tracing::warn!(
                    identity = %record.identity,
                    expected = dimension,
                    actual = record.descriptor.dimension(),
                    "stored descriptor has unexpected dimension"
                );
            }
            records.insert(record.identity.clone(), record);
        }

        tracing::info!(records = records.len(), dimension, "enrollment store loaded");

        Ok(Self {
            dimension,
            writer: Mutex::new(backend),
            current: RwLock::new(Arc::new(records)),
        })
    }

    /// Descriptor length every new enrollment must have.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Add a record. Rejects duplicates; re-enrollment is delete then insert.
    pub fn insert(&self, identity: &str, descriptor: Descriptor) -> Result<(), EngineError> {
        let identity = validate_identity(identity)?;
        descriptor.ensure_dimension(self.dimension)?;

        let mut backend = self.lock_writer();
        let current = self.current();
        if current.contains_key(identity) {
            return Err(EngineError::DuplicateIdentity(identity.to_string()));
        }

        let record = EnrollmentRecord::new(identity, descriptor);
        backend.save(&record)?;

        let mut next = (*current).clone();
        next.insert(record.identity.clone(), record);
        self.publish(next);
        Ok(())
    }

    /// Remove a record. Deleting an absent identity is `NotFound`, every time.
    pub fn delete(&self, identity: &str) -> Result<(), EngineError> {
        let mut backend = self.lock_writer();
        let current = self.current();
        if !current.contains_key(identity) {
            return Err(EngineError::NotFound(identity.to_string()));
        }

        if !backend.delete(identity)? {
            tracing::warn!(identity, "record missing from backend during delete");
        }

        let mut next = (*current).clone();
        next.remove(identity);
        self.publish(next);
        Ok(())
    }

    /// Point-in-time view for one matching pass.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            records: self.current(),
        }
    }

    /// Every record, in identity order, as of the call.
    pub fn list_all(&self) -> Vec<EnrollmentRecord> {
        self.snapshot().to_vec()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Arc<RecordMap> {
        let guard = self.current.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    fn publish(&self, next: RecordMap) {
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(next);
    }

    fn lock_writer(&self) -> MutexGuard<'_, Box<dyn EnrollmentBackend>> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn validate_identity(identity: &str) -> Result<&str, EngineError> {
    if identity.trim().is_empty() {
        return Err(EngineError::InvalidIdentity);
    }
    Ok(identity)
}
