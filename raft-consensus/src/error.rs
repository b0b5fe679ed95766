//! Error types shared across the engine.
//!
//! The taxonomy mirrors how failures are handled: stale terms and log
//! inconsistencies are never errors (they are encoded in RPC replies),
//! transport failures are an "unknown outcome" retried on the next tick, and
//! persistence failures stop the node.

use std::io;

use thiserror::Error;

use crate::topology::PeerId;

/// Errors surfaced by the consensus engine to its callers.
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node does not believe it is the leader. Try another node,
    /// starting with `leader_hint` if one is known.
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<PeerId> },

    /// The node was shut down, either explicitly or after a fatal
    /// persistence failure.
    #[error("raft node has been shut down")]
    Shutdown,

    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failures of the durable state store.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("corrupt persisted state: {0}")]
    Corrupt(String),
}

/// A call that produced no reply.
///
/// None of these variants is a negative acknowledgment: the request may or
/// may not have been processed by the destination.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("message dropped in transit")]
    Dropped,

    #[error("call timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("remote handler failed: {0}")]
    Remote(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
