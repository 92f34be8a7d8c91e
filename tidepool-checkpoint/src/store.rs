#![forbid(unsafe_code)]

//! Persistent home of the latest checkpoint record: a single-table redb
//! database holding one key. Saves are full-record transactional puts, so a
//! concurrent reader observes either the prior record or the new one, never
//! a torn write. Compaction rewrites the backing file to reclaim free pages.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use tidepool_core::{Error, Result};
use tracing::{debug, info, warn};

use crate::codec::{decode_checkpoint, encode_checkpoint, CheckpointRecord};

const CHECKPOINTS: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("checkpoints");
const RECORD_KEY: &str = "current";

/// Passes the compactor makes toward the advisory target before giving up.
const MAX_COMPACTION_PASSES: u32 = 4;

fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Io(std::io::Error::other(e.to_string()))
}

/// Durable KV store for the checkpoint record. Opened exclusively; writers
/// are serialized internally.
#[derive(Debug)]
pub struct CheckpointStore {
    db: Mutex<Option<Database>>,
    path: PathBuf,
}

impl CheckpointStore {
    /// Open (or create) the database at `path`. An existing file that is not
    /// a valid database fails with `CheckpointCorrupt`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let db = Database::create(&path).map_err(|e| {
            if existed {
                Error::corrupt(format!("{}: {e}", path.display()))
            } else {
                db_err(e)
            }
        })?;
        info!(path = %path.display(), existed, "checkpoint store opened");
        Ok(Self {
            db: Mutex::new(Some(db)),
            path,
        })
    }

    /// Durably write a full checkpoint record, replacing the previous one.
    pub fn save(&self, record: &CheckpointRecord) -> Result<()> {
        let bytes = encode_checkpoint(record);
        let g = self.db.lock();
        let db = g.as_ref().ok_or_else(|| Error::lifecycle("store closed"))?;
        let txn = db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(CHECKPOINTS).map_err(db_err)?;
            table
                .insert(RECORD_KEY, bytes.as_slice())
                .map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        debug!(bytes = bytes.len(), "checkpoint saved");
        Ok(())
    }

    /// Read the latest record. `CheckpointNotFound` when the database holds
    /// none; `CheckpointCorrupt` when the stored bytes do not parse.
    pub fn load(&self) -> Result<CheckpointRecord> {
        let g = self.db.lock();
        let db = g.as_ref().ok_or_else(|| Error::lifecycle("store closed"))?;
        let txn = db.begin_read().map_err(db_err)?;
        let table = match txn.open_table(CHECKPOINTS) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Err(Error::CheckpointNotFound),
            Err(e) => return Err(db_err(e)),
        };
        let value = table.get(RECORD_KEY).map_err(db_err)?;
        match value {
            Some(guard) => decode_checkpoint(guard.value()),
            None => Err(Error::CheckpointNotFound),
        }
    }

    /// Rewrite the backing file to reclaim free pages. `target_size_bytes`
    /// is advisory: passes repeat while the file still exceeds it and the
    /// database reports progress. Acknowledged saves are never lost.
    pub fn compact(&self, target_size_bytes: Option<u64>) -> Result<()> {
        let mut g = self.db.lock();
        let db = g.as_mut().ok_or_else(|| Error::lifecycle("store closed"))?;
        let before = file_size(&self.path);
        for pass in 0..MAX_COMPACTION_PASSES {
            let progressed = db.compact().map_err(db_err)?;
            let size = file_size(&self.path);
            debug!(pass, size, "compaction pass");
            if !progressed {
                break;
            }
            match target_size_bytes {
                Some(target) if size > target => continue,
                _ => break,
            }
        }
        let after = file_size(&self.path);
        if let Some(target) = target_size_bytes {
            if after > target {
                warn!(after, target, "compaction left file above advisory target");
            }
        }
        info!(before, after, "compaction finished");
        Ok(())
    }

    /// Current size of the backing file in bytes.
    pub fn size_bytes(&self) -> u64 {
        file_size(&self.path)
    }

    /// Release file locks and descriptors. Further operations fail with a
    /// lifecycle error.
    pub fn close(&self) {
        let mut g = self.db.lock();
        if g.take().is_some() {
            info!(path = %self.path.display(), "checkpoint store closed");
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
