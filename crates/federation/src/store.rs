//! Persistent storage for save artifacts.
//!
//! A store hands out a [`SaveSink`] per label; the artifact is appended to it
//! sequentially and becomes visible to [`SaveStore::open`] only once the sink
//! is finished. Saving again under an existing label replaces it.

use crate::error::StoreError;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Sequential byte sink for one save artifact.
pub trait SaveSink: Send {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Make the artifact durable and visible under its label.
    fn finish(self: Box<Self>) -> Result<(), StoreError>;
}

impl SaveSink for Vec<u8> {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Label-addressed save storage.
pub trait SaveStore: Send + Sync {
    fn create(&self, label: &str) -> Result<Box<dyn SaveSink>, StoreError>;

    /// Read back a finished artifact. `None` if nothing was saved under `label`.
    fn open(&self, label: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Keeps artifacts in memory. Clones share the same saves.
#[derive(Debug, Clone, Default)]
pub struct MemorySaveStore {
    saves: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySaveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Result<Vec<String>, StoreError> {
        let saves = self.saves.lock().map_err(|_| StoreError::Poisoned)?;
        let mut labels: Vec<String> = saves.keys().cloned().collect();
        labels.sort();
        Ok(labels)
    }

    /// Replace the stored bytes of `label`.
    pub fn put(&self, label: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.saves
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(label.to_string(), bytes);
        Ok(())
    }
}

struct MemorySink {
    label: String,
    buffer: Vec<u8>,
    saves: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl SaveSink for MemorySink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), StoreError> {
        let MemorySink {
            label,
            buffer,
            saves,
        } = *self;
        saves
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(label, buffer);
        Ok(())
    }
}

impl SaveStore for MemorySaveStore {
    fn create(&self, label: &str) -> Result<Box<dyn SaveSink>, StoreError> {
        Ok(Box::new(MemorySink {
            label: label.to_string(),
            buffer: Vec::new(),
            saves: Arc::clone(&self.saves),
        }))
    }

    fn open(&self, label: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let saves = self.saves.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(saves.get(label).cloned())
    }
}

/// One file per label in a directory. File names are the hex BLAKE3 hash of
/// the label, so any label is a valid name.
#[derive(Debug, Clone)]
pub struct FileSaveStore {
    directory: PathBuf,
}

impl FileSaveStore {
    pub fn new(directory: impl AsRef<Path>) -> Result<Self, StoreError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        info!(directory = %directory.display(), "Using file save store");
        Ok(Self { directory })
    }

    pub fn path_for(&self, label: &str) -> PathBuf {
        let name = hex::encode(blake3::hash(label.as_bytes()).as_bytes());
        self.directory.join(format!("{name}.ohlasave"))
    }
}

/// Writes to `<digest>.partial` and renames it into place on `finish`.
/// Dropping the sink before that succeeds removes the partial file.
struct FileSink {
    writer: Option<BufWriter<File>>,
    partial: PathBuf,
    target: PathBuf,
}

impl SaveSink for FileSink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(bytes)?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), StoreError> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&self.partial, &self.target)?;
            debug!(path = %self.target.display(), "Save file written");
        }
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // Close the file before unlinking it.
        self.writer.take();
        match fs::remove_file(&self.partial) {
            Ok(()) => debug!(path = %self.partial.display(), "Removed unfinished save file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.partial.display(), error = %e, "Could not remove unfinished save file"),
        }
    }
}

impl SaveStore for FileSaveStore {
    fn create(&self, label: &str) -> Result<Box<dyn SaveSink>, StoreError> {
        let target = self.path_for(label);
        let partial = target.with_extension("partial");
        let file = File::create(&partial)?;
        Ok(Box::new(FileSink {
            writer: Some(BufWriter::new(file)),
            partial,
            target,
        }))
    }

    fn open(&self, label: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(label)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSaveStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::{SaveSink, SaveStore};
    use crate::error::StoreError;
    use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};
    use tracing::{debug, info};

    /// Saves as rows of one SQLite table, in WAL mode.
    #[derive(Debug, Clone)]
    pub struct SqliteSaveStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteSaveStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let path = path.as_ref();
            info!(path = %path.display(), "Opening sqlite save store");

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS saves (
                    label TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL,
                    data BLOB NOT NULL
                );",
            )?;

            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }
    }

    struct SqliteSink {
        label: String,
        buffer: Vec<u8>,
        conn: Arc<Mutex<Connection>>,
    }

    impl SaveSink for SqliteSink {
        fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
            self.buffer.extend_from_slice(bytes);
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), StoreError> {
            let created_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or_default();
            let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
            conn.execute(
                "INSERT OR REPLACE INTO saves (label, created_at, data) VALUES (?1, ?2, ?3)",
                params![self.label, created_at, self.buffer],
            )?;
            debug!(label = %self.label, bytes = self.buffer.len(), "Save row written");
            Ok(())
        }
    }

    impl SaveStore for SqliteSaveStore {
        fn create(&self, label: &str) -> Result<Box<dyn SaveSink>, StoreError> {
            Ok(Box::new(SqliteSink {
                label: label.to_string(),
                buffer: Vec::new(),
                conn: Arc::clone(&self.conn),
            }))
        }

        fn open(&self, label: &str) -> Result<Option<Vec<u8>>, StoreError> {
            let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
            let data = conn
                .query_row(
                    "SELECT data FROM saves WHERE label = ?1",
                    params![label],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(data)
        }
    }
}
