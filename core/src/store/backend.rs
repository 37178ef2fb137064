// Persistence abstraction for the message log
//
// Every backend stores the full ordered message sequence as one snapshot.

use crate::message::Message;
use crate::CourierError;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Full-snapshot storage for the message log
pub trait Persistence: Send + Sync {
    /// Load the last saved snapshot. `Ok(None)` means nothing was ever saved.
    fn load(&self) -> Result<Option<Vec<Message>>, CourierError>;
    /// Replace the stored snapshot with `messages`
    fn save(&self, messages: &[Message]) -> Result<(), CourierError>;
    fn flush(&self) -> Result<(), CourierError> {
        Ok(())
    }
}

/// In-memory snapshot, shared between clones. Useful for tests and ephemeral stores.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    snapshot: Arc<RwLock<Option<Vec<Message>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<Option<Vec<Message>>, CourierError> {
        Ok(self.snapshot.read().clone())
    }

    fn save(&self, messages: &[Message]) -> Result<(), CourierError> {
        *self.snapshot.write() = Some(messages.to_vec());
        Ok(())
    }
}

/// JSON file snapshot, replaced atomically on every save
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for FilePersistence {
    fn load(&self) -> Result<Option<Vec<Message>>, CourierError> {
        read_json(&self.path)
    }

    fn save(&self, messages: &[Message]) -> Result<(), CourierError> {
        write_json_atomic(&self.path, &messages)
    }
}

const SNAPSHOT_KEY: &[u8] = b"messages";

/// Sled-backed snapshot stored under a single key
pub struct SledPersistence {
    db: sled::Db,
}

impl SledPersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CourierError> {
        let db = sled::open(path).map_err(|e| CourierError::PersistenceFailure(e.to_string()))?;
        Ok(Self { db })
    }
}

impl Persistence for SledPersistence {
    fn load(&self) -> Result<Option<Vec<Message>>, CourierError> {
        let value = self
            .db
            .get(SNAPSHOT_KEY)
            .map_err(|e| CourierError::PersistenceFailure(e.to_string()))?;

        match value {
            Some(bytes) => {
                let messages = serde_json::from_slice(&bytes)
                    .map_err(|e| CourierError::PersistenceFailure(e.to_string()))?;
                Ok(Some(messages))
            }
            None => Ok(None),
        }
    }

    fn save(&self, messages: &[Message]) -> Result<(), CourierError> {
        let value = serde_json::to_vec(messages)
            .map_err(|e| CourierError::PersistenceFailure(e.to_string()))?;
        self.db
            .insert(SNAPSHOT_KEY, value)
            .map_err(|e| CourierError::PersistenceFailure(e.to_string()))?;
        self.flush()
    }

    fn flush(&self) -> Result<(), CourierError> {
        self.db
            .flush()
            .map_err(|e| CourierError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }
}

/// Read a JSON document, treating a missing file as `None`
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CourierError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CourierError::PersistenceFailure(format!(
                "{}: {}",
                path.display(),
                e
            )))
        }
    };

    let value = serde_json::from_slice(&bytes).map_err(|e| {
        CourierError::PersistenceFailure(format!("{}: {}", path.display(), e))
    })?;
    Ok(Some(value))
}

/// Serialize `value` next to `path` and rename it into place.
///
/// A crash mid-write leaves the previous file intact.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CourierError> {
    let fail = |e: std::io::Error| {
        CourierError::PersistenceFailure(format!("{}: {}", path.display(), e))
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(fail)?;
    }

    let bytes = serde_json::to_vec(value)
        .map_err(|e| CourierError::PersistenceFailure(e.to_string()))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let written = write_synced(&tmp_path, &bytes).and_then(|()| std::fs::rename(&tmp_path, path));
    if let Err(e) = written {
        // the temp file may not exist; the write error is the one to report
        let _ = std::fs::remove_file(&tmp_path);
        return Err(fail(e));
    }
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
