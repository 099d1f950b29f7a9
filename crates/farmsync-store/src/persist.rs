//! Snapshot persistence with file locking
//!
//! The store is persisted as one JSON document. Saves write a temp file in
//! the same directory and rename it over the target while holding an
//! exclusive lock on a sibling `.lock` file, so a crash never leaves a
//! partially written store behind.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use farmsync_schema::SyncableRecord;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::mutation::PendingMutation;
use crate::state::{MutationKey, RecordKey, StoreState};
use crate::{Error, Result};

const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: String,
    tables: Vec<TableFile>,
    checkpoints: Vec<Checkpoint>,
    mutations: Vec<PendingMutation>,
    next_generation: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    entity: String,
    records: Vec<SyncableRecord>,
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Load a store snapshot under a shared lock.
pub(crate) fn load(path: &Path) -> Result<StoreState> {
    let lock = open_lock(path)?;
    FileExt::lock_shared(&lock).map_err(|_| Error::LockFailed {
        path: path.to_path_buf(),
    })?;

    let mut content = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .map_err(|e| Error::io(path, e))?;

    let file: StoreFile = serde_json::from_str(&content).map_err(|e| Error::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if file.version != FORMAT_VERSION {
        return Err(Error::Corrupt {
            path: path.to_path_buf(),
            message: format!("unsupported format version {}", file.version),
        });
    }

    let mut state = StoreState::default();
    state.next_generation = file.next_generation;
    for table in file.tables {
        let rows = state.tables.entry(table.entity).or_default();
        for record in table.records {
            rows.insert(
                RecordKey {
                    tenant: record.tenant_id.clone(),
                    id: record.id,
                },
                record,
            );
        }
    }
    for cp in file.checkpoints {
        state
            .checkpoints
            .insert((cp.tenant.clone(), cp.entity.clone()), cp);
    }
    for mutation in file.mutations {
        state.mutations.insert(
            MutationKey {
                entity: mutation.entity.clone(),
                tenant: mutation.tenant.clone(),
                id: mutation.record_id,
            },
            mutation,
        );
    }
    Ok(state)
}

/// Serialise the store into the on-disk document.
pub(crate) fn encode(state: &StoreState) -> Result<Vec<u8>> {
    let mut tables: Vec<TableFile> = state
        .tables
        .iter()
        .map(|(entity, rows)| TableFile {
            entity: entity.clone(),
            records: rows.values().cloned().collect(),
        })
        .collect();
    tables.sort_by(|a, b| a.entity.cmp(&b.entity));

    let file = StoreFile {
        version: FORMAT_VERSION.to_string(),
        tables,
        checkpoints: state.checkpoints.values().cloned().collect(),
        mutations: state.mutations.values().cloned().collect(),
        next_generation: state.next_generation,
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

/// Write an encoded store atomically under an exclusive lock.
///
/// Blocking; async callers run it on the blocking pool.
pub(crate) fn write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let lock = open_lock(path)?;
    lock.lock_exclusive().map_err(|_| Error::LockFailed {
        path: path.to_path_buf(),
    })?;

    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    let mut temp = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| Error::io(&temp_path, e))?;
    let written = temp
        .write_all(content)
        .and_then(|_| temp.sync_all())
        .map_err(|e| Error::io(&temp_path, e))
        .and_then(|_| fs::rename(&temp_path, path).map_err(|e| Error::io(path, e)));
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written?;

    // Lock released when `lock` is dropped
    Ok(())
}

fn open_lock(path: &Path) -> Result<File> {
    let lock_path = lock_path(path);
    if let Some(parent) = lock_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| Error::io(&lock_path, e))
}
