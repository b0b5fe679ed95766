//! In-memory key-value state machine fed by the apply stream.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::command::CommandPayload;
use crate::log::LogIndex;
use crate::state::ApplyMsg;

/// The application each demo node replicates.
///
/// Entries must arrive exactly once and in index order; anything else means
/// the delivery stream is broken and is rejected without touching the data.
#[derive(Default)]
pub struct KvStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    data: BTreeMap<String, String>,
    applied_index: LogIndex,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed entry and returns the command it carried.
    pub fn apply(&self, msg: &ApplyMsg) -> Result<CommandPayload> {
        let mut inner = self.inner.lock().unwrap();
        let expected = inner.applied_index + 1;
        if msg.index != expected {
            bail!(
                "out-of-order apply: got index {}, expected {expected}",
                msg.index
            );
        }
        let command = CommandPayload::decode(&msg.command)?;
        match &command {
            CommandPayload::Put { key, value } => {
                inner.data.insert(key.clone(), value.clone());
            }
            CommandPayload::Delete { key } => {
                inner.data.remove(key);
            }
        }
        inner.applied_index = msg.index;
        Ok(command)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().data.get(key).cloned()
    }

    pub fn applied_index(&self) -> LogIndex {
        self.inner.lock().unwrap().applied_index
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().data.clone()
    }
}
