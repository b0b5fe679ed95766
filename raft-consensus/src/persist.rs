//! Durable state: what the engine saves and where it goes.
//!
//! The engine decides what to persist ([`PersistentState`]) and when (before
//! any reply that depends on it). A [`Persister`] only stores and returns an
//! opaque blob.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::PersistError;
use crate::log::{Log, LogEntry, Term};
use crate::topology::PeerId;

/// The state that must survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
    pub log: Vec<LogEntry>,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Log::new().entries().to_vec(),
        }
    }
}

impl PersistentState {
    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        let state: Self = bincode::deserialize(bytes)?;
        if Log::from_entries(state.log.clone()).is_none() {
            return Err(PersistError::Corrupt(
                "persisted log does not start with the sentinel entry".to_string(),
            ));
        }
        Ok(state)
    }

    /// Reads the state from `persister`, falling back to the initial state
    /// when nothing was saved yet.
    pub fn load_from(persister: &dyn Persister) -> Result<Self, PersistError> {
        match persister.load()? {
            Some(bytes) if !bytes.is_empty() => Self::decode(&bytes),
            _ => Ok(Self::default()),
        }
    }
}

/// Byte-blob store for [`PersistentState`].
///
/// `save` must be durable when it returns: callers release RPC replies and
/// submission acknowledgments right after.
pub trait Persister: Send + Sync {
    fn save(&self, state: &[u8]) -> Result<(), PersistError>;

    fn load(&self) -> Result<Option<Vec<u8>>, PersistError>;

    /// Size in bytes of the last saved blob.
    fn state_size(&self) -> Result<usize, PersistError> {
        Ok(self.load()?.map_or(0, |bytes| bytes.len()))
    }
}

/// In-memory persister.
///
/// Clones share the same blob. Use [`MemoryPersister::duplicate`] to model a
/// crash: the restarted node gets an independent copy that the old instance
/// can no longer write to.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duplicate(&self) -> Self {
        let copy = self.blob.lock().unwrap().clone();
        Self {
            blob: Arc::new(Mutex::new(copy)),
        }
    }
}

impl Persister for MemoryPersister {
    fn save(&self, state: &[u8]) -> Result<(), PersistError> {
        *self.blob.lock().unwrap() = Some(state.to_vec());
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.blob.lock().unwrap().clone())
    }
}

/// File-backed persister storing the blob as `raft-state.bin` in a directory.
///
/// Writes go to a temporary file which is synced and then renamed over the
/// previous state, so a crash mid-write leaves the last complete blob.
#[derive(Debug, Clone)]
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft-state.bin")
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join("raft-state.tmp")
    }
}

impl Persister for FilePersister {
    fn save(&self, state: &[u8]) -> Result<(), PersistError> {
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(state)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>, PersistError> {
        match fs::read(self.state_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
