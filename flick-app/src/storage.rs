use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use thiserror::Error;

/// Stored documents are expected to be tiny.
///
/// This prevents pathological reads if a file is corrupted or replaced.
pub const MAX_DOCUMENT_BYTES: u64 = 64 * 1024;

const MAX_WRITE_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata read failed: {0}")]
    Metadata(io::Error),
    #[error("document too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("parse failed: {0}")]
    Parse(serde_json::Error),
    #[error("serialize failed: {0}")]
    Serialize(serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(io::Error),
    #[error("rename failed: {0}")]
    Rename(io::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

/// Raw document persistence for a single named record.
pub trait RecordStorage: Send + Sync {
    /// Returns `Ok(None)` when nothing has been stored yet.
    fn read(&self) -> Result<Option<String>, StoreError>;
    fn write(&self, document: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordStorage for FileStorage {
    fn read(&self) -> Result<Option<String>, StoreError> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Metadata(err)),
        };
        if meta.len() > MAX_DOCUMENT_BYTES {
            return Err(StoreError::TooLarge {
                size: meta.len(),
                max: MAX_DOCUMENT_BYTES,
            });
        }

        fs::read_to_string(&self.path)
            .map(Some)
            .map_err(StoreError::Read)
    }

    fn write(&self, document: &str) -> Result<(), StoreError> {
        let mut last_err = None;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match write_atomically(&self.path, document) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        break;
                    }
                    let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
            }
        }

        Err(last_err.unwrap_or(StoreError::Poisoned))
    }
}

fn write_atomically(path: &Path, document: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, document.as_bytes()).map_err(StoreError::WriteTmp)?;
    fs::rename(&tmp, path).map_err(StoreError::Rename)
}

/// Volatile storage for tests and the simulator.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    document: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(Some(document.into())),
        }
    }
}

impl RecordStorage for MemoryStorage {
    fn read(&self) -> Result<Option<String>, StoreError> {
        self.document
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| StoreError::Poisoned)
    }

    fn write(&self, document: &str) -> Result<(), StoreError> {
        let mut guard = self.document.lock().map_err(|_| StoreError::Poisoned)?;
        *guard = Some(document.to_owned());
        Ok(())
    }
}
