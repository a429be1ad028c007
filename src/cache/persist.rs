//! Cache snapshot persistence.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::cache::lease_cache::CacheEntry;
use crate::cache::CacheError;
use crate::config::PersistConfig;

const SNAPSHOT_FILE: &str = "vault-proxy-cache.json";

/// JSON snapshot of the cache on local disk.
#[derive(Debug, Clone)]
pub struct Persistence {
    path: PathBuf,
    keep_after_import: bool,
    exit_on_err: bool,
}

impl Persistence {
    pub fn from_config(config: &PersistConfig) -> Self {
        Self {
            path: config.path.join(SNAPSHOT_FILE),
            keep_after_import: config.keep_after_import,
            exit_on_err: config.exit_on_err,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep_after_import(&self) -> bool {
        self.keep_after_import
    }

    pub fn exit_on_err(&self) -> bool {
        self.exit_on_err
    }

    /// Entries from the snapshot, or nothing if no snapshot exists.
    pub fn load(&self) -> Result<Vec<CacheEntry>, CacheError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        let reader = BufReader::new(file);
        let entries: Vec<CacheEntry> = serde_json::from_reader(reader)?;
        Ok(entries)
    }

    /// Replace the snapshot atomically.
    pub fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let temp = self.path.with_extension("json.tmp");
        {
            let file = File::create(&temp).map_err(|e| self.io_error(e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, entries)?;
            writer.flush().map_err(|e| self.io_error(e))?;
        }
        fs::rename(&temp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> CacheError {
        CacheError::Persist {
            path: self.path.clone(),
            source,
        }
    }
}
