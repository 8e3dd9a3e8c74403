//! File-per-key backend.
//!
//! Each key maps to one file whose name is the URL-safe base64 encoding of
//! the key. Writes go to a temp file in the same directory which is then
//! renamed over the target, so a reader never sees a partial record.

use super::backend::{StatusBackend, StoreResult};
use crate::errors::StoreError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Backend storing each key in its own file under a directory.
#[derive(Debug)]
pub struct FilesystemBackend {
    dir: PathBuf,
    set_lock: Mutex<()>,
}

impl FilesystemBackend {
    /// Opens (and creates if needed) a backend rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            set_lock: Mutex::new(()),
        })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        let bytes = match fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn write(&self, key: &str, value: &Value) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, value)?;
        tmp.flush()?;
        tmp.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_set(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        match self.read(key)? {
            None => Ok(BTreeSet::new()),
            Some(value) => serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn update_set<F>(&self, key: &str, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let _guard = self.set_lock.lock();
        let mut set = self.read_set(key)?;
        if change(&mut set) {
            self.write(key, &serde_json::to_value(&set)?)?;
        }
        Ok(())
    }
}

impl StatusBackend for FilesystemBackend {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.read(key)
    }

    fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        self.write(key, value)
    }

    fn del(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        self.update_set(key, |set| set.insert(member.to_string()))
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        self.update_set(key, |set| set.remove(member))
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.read_set(key)?.into_iter().collect())
    }

    fn reset(&self) -> StoreResult<()> {
        let _guard = self.set_lock.lock();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
