//! Persistent storage using sled
//!
//! The store itself is in-memory; this module persists periodic snapshots so
//! a restarted node rejoins with what it already knew instead of pulling the
//! whole network state again. Expired entries are dropped at load time.

use haven_store_core::store::{SnapshotEntry, StoreSnapshot};
use rand::RngCore;
use sled::Db;
use std::path::Path;
use thiserror::Error;

const SEED_KEY: &[u8] = b"keypair_seed";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Storage backend for havenstored
pub struct Storage {
    db: Db,
    /// Entry tree: data_id -> SnapshotEntry
    entries: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let entries = db.open_tree("entries")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            entries,
            metadata,
        })
    }

    /// Our signing keypair seed. Created on first start, stable afterwards,
    /// so a restarted node keeps its peer identity.
    pub fn keypair_seed(&self) -> Result<[u8; 32], StorageError> {
        if let Some(bytes) = self.metadata.get(SEED_KEY)? {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes[..32]);
            return Ok(seed);
        }
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        self.metadata.insert(SEED_KEY, seed.to_vec())?;
        Ok(seed)
    }

    /// Replace the persisted snapshot with the given one.
    pub fn save_snapshot(&self, snapshot: &StoreSnapshot) -> Result<(), StorageError> {
        self.entries.clear()?;
        for entry in &snapshot.entries {
            let data_id = match entry.request.data_id() {
                Ok(id) => id,
                // An entry we could not re-derive an id for is unrecoverable
                // anyway; skip it rather than poison the snapshot
                Err(_) => continue,
            };
            let value = postcard::to_allocvec(entry)?;
            self.entries.insert(data_id.0, value)?;
        }
        Ok(())
    }

    /// Load the persisted snapshot. Undecodable entries (from an older,
    /// incompatible build) are skipped.
    pub fn load_snapshot(&self) -> Result<StoreSnapshot, StorageError> {
        let mut entries = Vec::new();
        for item in self.entries.iter() {
            let (_, bytes) = item?;
            match postcard::from_bytes::<SnapshotEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable snapshot entry");
                }
            }
        }
        Ok(StoreSnapshot { entries })
    }

    /// Number of persisted entries
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
