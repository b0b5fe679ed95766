use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Key/value operations that travel through the replicated log as opaque
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    Put { key: String, value: String },
    Delete { key: String },
}

impl CommandPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn key(&self) -> &str {
        match self {
            CommandPayload::Put { key, .. } | CommandPayload::Delete { key } => key,
        }
    }
}
