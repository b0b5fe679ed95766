//! Raft consensus for a fixed set of servers.
//!
//! Each server holds a replicated log of opaque commands. The engine elects a
//! leader, replicates the leader's log to the others, decides when an entry
//! is committed, and hands committed entries to the application in log
//! order, exactly once per running instance.
//!
//! # Architecture
//!
//! - **State machine**: [`state::RaftState`] implements the protocol rules as
//!   synchronous methods with no I/O
//! - **Node handle**: [`Raft`] owns the state behind one lock, persists it
//!   before any dependent reply leaves, and answers peer RPCs
//! - **Background tasks**: the `runtime` module drives elections, replication and
//!   application on Tokio
//! - **Transports**: [`network`] simulates a lossy in-process network for
//!   tests; [`tcp`] carries JSON lines between real processes
//!
//! Durable state goes through a [`Persister`]; the engine never assumes
//! where bytes end up.
//!
//! # Modules
//!
//! - [`log`], [`protocol`], [`topology`], [`config`]: data types
//! - [`persist`]: durable state codec and stores
//! - [`election`]: randomized election timeout
//! - [`command`], [`store`], [`console`]: the key/value demo application

pub mod command;
pub mod config;
pub mod console;
pub mod election;
pub mod error;
pub mod log;
pub mod network;
pub mod node;
pub mod persist;
pub mod protocol;
mod runtime;
pub mod state;
pub mod store;
pub mod tcp;
pub mod topology;
pub mod transport;

pub use config::RaftConfig;
pub use error::{PersistError, RaftError, TransportError};
pub use log::{LogEntry, LogIndex, Term};
pub use node::{NodeStatus, Raft, Ticket};
pub use persist::{FilePersister, MemoryPersister, PersistentState, Persister};
pub use state::{ApplyMsg, RoleKind};
pub use topology::{PeerId, Topology};
pub use transport::{RpcHandler, Transport};
