//! Persistence backends for the enrollment store.
//!
//! The store owns exactly one backend and only touches it while holding its
//! writer lock, so implementations need `Send` but not `Sync`.

use crate::error::EngineError;
use crate::types::{Descriptor, EnrollmentRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS enrollments (
    identity    TEXT PRIMARY KEY NOT NULL,
    dimension   INTEGER NOT NULL,
    descriptor  BLOB NOT NULL,
    enrolled_at TEXT NOT NULL
);
";

/// Backing storage for enrollment records.
pub trait EnrollmentBackend: Send {
    /// Load every persisted record.
    fn load_all(&mut self) -> Result<Vec<EnrollmentRecord>, EngineError>;

    /// Persist a new record. The store has already checked for duplicates.
    fn save(&mut self, record: &EnrollmentRecord) -> Result<(), EngineError>;

    /// Remove a record. Returns false if nothing was stored under `identity`.
    fn delete(&mut self, identity: &str) -> Result<bool, EngineError>;
}

/// Volatile backend. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: BTreeMap<String, EnrollmentRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnrollmentBackend for MemoryBackend {
    fn load_all(&mut self) -> Result<Vec<EnrollmentRecord>, EngineError> {
        Ok(self.records.values().cloned().collect())
    }

    fn save(&mut self, record: &EnrollmentRecord) -> Result<(), EngineError> {
        self.records.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    fn delete(&mut self, identity: &str) -> Result<bool, EngineError> {
        Ok(self.records.remove(identity).is_some())
    }
}

/// SQLite backend. Descriptors are stored as little-endian f32 blobs.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open or create the database at `path`, including parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::info!(path = %path.display(), "opened enrollment database");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

impl EnrollmentBackend for SqliteBackend {
    fn load_all(&mut self) -> Result<Vec<EnrollmentRecord>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT identity, dimension, descriptor, enrolled_at FROM enrollments ORDER BY identity",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (identity, dimension, blob, enrolled_at) = row?;
            let dimension = usize::try_from(dimension).map_err(|_| {
                EngineError::Storage(format!("negative dimension for {identity}"))
            })?;
            let descriptor = Descriptor::new(decode_descriptor_blob(&blob, dimension)?)?;
            let enrolled_at = DateTime::parse_from_rfc3339(&enrolled_at)
                .map_err(|e| EngineError::Storage(format!("bad timestamp for {identity}: {e}")))?
                .with_timezone(&Utc);
            records.push(EnrollmentRecord {
                identity,
                descriptor,
                enrolled_at,
            });
        }
        Ok(records)
    }

    fn save(&mut self, record: &EnrollmentRecord) -> Result<(), EngineError> {
        let dimension = i64::try_from(record.descriptor.dimension())
            .map_err(|_| EngineError::Storage("descriptor dimension overflow".into()))?;
        self.conn.execute(
            "INSERT INTO enrollments (identity, dimension, descriptor, enrolled_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.identity,
                dimension,
                encode_descriptor_blob(record.descriptor.values()),
                record.enrolled_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete(&mut self, identity: &str) -> Result<bool, EngineError> {
        let deleted = self
            .conn
            .execute("DELETE FROM enrollments WHERE identity = ?1", params![identity])?;
        Ok(deleted > 0)
    }
}

/// Encode descriptor values as a fixed-length little-endian blob (`4 * D` bytes).
pub fn encode_descriptor_blob(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a blob written by [`encode_descriptor_blob`]. Bit-exact inverse.
pub fn decode_descriptor_blob(blob: &[u8], dimension: usize) -> Result<Vec<f32>, EngineError> {
    let expected_len = dimension
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| EngineError::Storage("descriptor blob length overflow".into()))?;
    if blob.len() != expected_len {
        return Err(EngineError::Storage(format!(
            "invalid descriptor byte length: expected {expected_len}, got {}",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
