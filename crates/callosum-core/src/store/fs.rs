//! Atomic file I/O for the small JSON state documents.
//!
//! The lock table and context record are rewritten on every mutation, so a
//! crash mid-write must never leave a torn document: writes go to a temp
//! file in the same directory, the data is fsynced, the temp file is
//! renamed over the target, and the parent directory is fsynced. A reader
//! at any instant sees either the old complete document or the new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StoreError;

/// Upper bound on any single state document read. State documents hold
/// tens of entries; anything near this size is corruption.
pub(crate) const MAX_STATE_DOC_BYTES: u64 = 16 * 1024 * 1024;

/// Atomically replaces `path` with the JSON serialization of `value`.
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode { source })?;

    let tmp_path = path.with_extension("tmp");
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = File::create(&tmp_path).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.sync_all().map_err(io_err)?;
    drop(tmp);

    fs::rename(&tmp_path, path).map_err(io_err)?;

    // Persist the rename itself; without this a crash can roll the
    // directory entry back to the old document.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Reads a JSON state document, yielding the default for a missing file.
pub(crate) fn read_json_or_default<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        },
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        },
    };

    let size = file
        .metadata()
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    if size > MAX_STATE_DOC_BYTES {
        return Err(StoreError::Oversized {
            path: path.to_path_buf(),
            size,
            max: MAX_STATE_DOC_BYTES,
        });
    }

    serde_json::from_reader(file).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })
}
