//! Durable sync watermark.
//!
//! The watermark is the `lastSyncDate` boundary: remote changes modified
//! at or before it are assumed already pulled.

use crate::error::{EngineResult, SyncError};
use crate::value::Timestamp;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Storage for the single `lastSyncDate` value.
pub trait WatermarkStore: Send + Sync {
    /// Loads the stored watermark, `None` if never synced.
    fn load(&self) -> EngineResult<Option<Timestamp>>;

    /// Stores the watermark.
    fn save(&self, watermark: Timestamp) -> EngineResult<()>;
}

/// Watermark held in memory.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    value: RwLock<Option<Timestamp>>,
}

impl MemoryWatermarkStore {
    /// Creates a store with no watermark.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `watermark`.
    pub fn with_value(watermark: Timestamp) -> Self {
        Self {
            value: RwLock::new(Some(watermark)),
        }
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn load(&self) -> EngineResult<Option<Timestamp>> {
        Ok(*self.value.read())
    }

    fn save(&self, watermark: Timestamp) -> EngineResult<()> {
        *self.value.write() = Some(watermark);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatermarkFile {
    last_sync_date: Timestamp,
}

/// Watermark persisted as `{"lastSyncDate": "<RFC 3339>"}`.
///
/// Saves write a sibling temporary file and rename it over the target so
/// readers never observe a partial write.
#[derive(Debug)]
pub struct JsonFileWatermarkStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileWatermarkStore {
    /// Creates a store backed by `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl WatermarkStore for JsonFileWatermarkStore {
    fn load(&self) -> EngineResult<Option<Timestamp>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: WatermarkFile = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Watermark(format!("{}: {e}", self.path.display())))?;
        Ok(Some(file.last_sync_date))
    }

    fn save(&self, watermark: Timestamp) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        let json = serde_json::to_vec(&WatermarkFile {
            last_sync_date: watermark,
        })?;

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
