//! Storage for writes that the security mode did not allow to execute.
//!
//! Suppressed inserts and updates are kept per run so that an authorized
//! user can replay them later.

use crate::model::{Entity, RunId};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use time::OffsetDateTime;

const CF_PENDING_INSERTS: &str = "pending_inserts";
const CF_PENDING_UPDATES: &str = "pending_updates";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_NEXT_SEQUENCE: &[u8] = b"next_sequence";

const STORAGE_FORMAT_VERSION: u32 = 1;

/// A write held back for later authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub run_id: RunId,
    /// `true` for inserts, `false` for updates.
    pub insert: bool,
    pub entity: Entity,
    /// Unix timestamp (seconds) of when the change was queued.
    pub queued_at: i64,
}

impl PendingChange {
    pub fn new(run_id: RunId, insert: bool, entity: Entity) -> Self {
        Self {
            run_id,
            insert,
            entity,
            queued_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

/// Queue of suppressed writes, keyed by run.
pub trait PendingChangeCache: Send + Sync {
    fn insert(&self, entities: &[Entity], run_id: RunId, insert: bool) -> Result<()>;

    fn get_inserts(&self, run_id: RunId) -> Result<Vec<PendingChange>>;

    fn get_updates(&self, run_id: RunId) -> Result<Vec<PendingChange>>;

    /// Drop everything queued by `run_id`; returns the number of removed changes.
    fn clear_run(&self, run_id: RunId) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct MemoryPendingCache {
    changes: Mutex<Vec<PendingChange>>,
}

impl MemoryPendingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.changes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.lock().is_empty()
    }

    fn select(&self, run_id: RunId, insert: bool) -> Vec<PendingChange> {
        self.changes
            .lock()
            .iter()
            .filter(|change| change.run_id == run_id && change.insert == insert)
            .cloned()
            .collect()
    }
}

impl PendingChangeCache for MemoryPendingCache {
    fn insert(&self, entities: &[Entity], run_id: RunId, insert: bool) -> Result<()> {
        let mut changes = self.changes.lock();
        changes.extend(
            entities
                .iter()
                .map(|entity| PendingChange::new(run_id, insert, entity.clone())),
        );
        Ok(())
    }

    fn get_inserts(&self, run_id: RunId) -> Result<Vec<PendingChange>> {
        Ok(self.select(run_id, true))
    }

    fn get_updates(&self, run_id: RunId) -> Result<Vec<PendingChange>> {
        Ok(self.select(run_id, false))
    }

    fn clear_run(&self, run_id: RunId) -> Result<usize> {
        let mut changes = self.changes.lock();
        let before = changes.len();
        changes.retain(|change| change.run_id != run_id);
        Ok(before - changes.len())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// RocksDB backed cache. Keys are the run id followed by a big-endian
/// sequence number so that changes of one run iterate in queue order.
pub struct PersistentPendingCache {
    db: DB,
    sequence: Mutex<u64>,
}

impl PersistentPendingCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = open_db(path)?;
        validate_or_init_manifest(&db)?;
        let next = load_metadata::<u64>(&db, KEY_NEXT_SEQUENCE)?.unwrap_or(0);
        Ok(Self {
            db,
            sequence: Mutex::new(next),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn cf_name(insert: bool) -> &'static str {
        if insert {
            CF_PENDING_INSERTS
        } else {
            CF_PENDING_UPDATES
        }
    }

    fn scan(&self, run_id: RunId, insert: bool) -> Result<Vec<PendingChange>> {
        let cf_name = Self::cf_name(insert);
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow!("missing column family {cf_name}"))?;
        let prefix = run_id.as_bytes();
        let mut changes = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            changes.push(bincode::deserialize(&value)?);
        }
        Ok(changes)
    }

    fn run_keys(&self, cf_name: &str, run_id: RunId) -> Result<Vec<Vec<u8>>> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow!("missing column family {cf_name}"))?;
        let prefix = run_id.as_bytes();
        let mut keys = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

impl PendingChangeCache for PersistentPendingCache {
    fn insert(&self, entities: &[Entity], run_id: RunId, insert: bool) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let cf_name = Self::cf_name(insert);
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow!("missing column family {cf_name}"))?;
        let metadata_cf = self
            .db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| anyhow!("missing metadata column family"))?;

        let mut sequence = self.sequence.lock();
        let mut next = *sequence;
        let mut batch = WriteBatch::default();
        for entity in entities {
            let change = PendingChange::new(run_id, insert, entity.clone());
            batch.put_cf(cf, encode_key(run_id, next), bincode::serialize(&change)?);
            next += 1;
        }
        batch.put_cf(metadata_cf, KEY_NEXT_SEQUENCE, bincode::serialize(&next)?);
        self.db.write(batch)?;
        *sequence = next;
        Ok(())
    }

    fn get_inserts(&self, run_id: RunId) -> Result<Vec<PendingChange>> {
        self.scan(run_id, true)
    }

    fn get_updates(&self, run_id: RunId) -> Result<Vec<PendingChange>> {
        self.scan(run_id, false)
    }

    fn clear_run(&self, run_id: RunId) -> Result<usize> {
        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for cf_name in [CF_PENDING_INSERTS, CF_PENDING_UPDATES] {
            let keys = self.run_keys(cf_name, run_id)?;
            let cf = self
                .db
                .cf_handle(cf_name)
                .ok_or_else(|| anyhow!("missing column family {cf_name}"))?;
            removed += keys.len();
            for key in keys {
                batch.delete_cf(cf, key);
            }
        }
        if removed > 0 {
            self.db.write(batch)?;
        }
        Ok(removed)
    }
}

fn encode_key(run_id: RunId, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + 8);
    key.extend_from_slice(run_id.as_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn open_db(path: impl AsRef<Path>) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_PENDING_INSERTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_PENDING_UPDATES, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "pending cache format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    match db.get_cf(metadata_cf, key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}
