//! The public handle of a running Raft server.
//!
//! A [`Raft`] wraps the [`RaftState`] in a single mutex. Every read or
//! change of consensus state goes through `Raft::with_state`, which also
//! persists dirty state before the lock is released, so no reply or
//! acknowledgment can leave the node ahead of its durable state.
//!
//! Network calls never run under the lock. Background tasks in
//! `runtime` take the lock briefly to build a request, release it
//! for the call, then take it again to process the reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info};

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::log::{LogIndex, Term};
use crate::persist::{PersistentState, Persister};
use crate::protocol::{RpcRequest, RpcResponse};
use crate::runtime;
use crate::state::{ApplyMsg, RaftState, RoleKind};
use crate::topology::{PeerId, Topology};
use crate::transport::{RpcHandler, Transport};

/// Where an accepted command was placed in the log.
///
/// The command is only committed once an [`ApplyMsg`] with the same index
/// and term is delivered. Leadership may be lost before then, in which case
/// the entry can be overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub index: LogIndex,
    pub term: Term,
}

/// Snapshot of a node's consensus state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: PeerId,
    pub role: RoleKind,
    pub term: Term,
    pub leader_id: Option<PeerId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

/// Cloneable handle to one Raft server and its background tasks.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

struct Inner {
    id: PeerId,
    config: RaftConfig,
    state: Mutex<RaftState>,
    persister: Arc<dyn Persister>,
    transport: Arc<dyn Transport>,
    replicate: Notify,
    apply: Notify,
    killed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Raft {
    /// Restores state from `persister` and starts the background tasks.
    ///
    /// Must be called from within a Tokio runtime. Committed entries are
    /// delivered in index order on the returned receiver; dropping it stops
    /// the apply loop but not the node.
    pub fn spawn(
        topology: Topology,
        config: RaftConfig,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ApplyMsg>), RaftError> {
        config.validate()?;
        let persisted = PersistentState::load_from(persister.as_ref())?;
        let id = topology.me();
        info!(
            node = id,
            term = persisted.current_term,
            voted_for = ?persisted.voted_for,
            log_len = persisted.log.len() - 1,
            "starting raft node"
        );
        let state = RaftState::new(topology, persisted, &config, Instant::now())?;
        let (shutdown, _) = watch::channel(false);
        let raft = Self {
            inner: Arc::new(Inner {
                id,
                config,
                state: Mutex::new(state),
                persister,
                transport,
                replicate: Notify::new(),
                apply: Notify::new(),
                killed: AtomicBool::new(false),
                shutdown,
            }),
        };

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        runtime::start(&raft, apply_tx);
        Ok((raft, apply_rx))
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    /// Appends `command` to the log if this node is the leader.
    ///
    /// Returns immediately without waiting for commitment. On a non-leader
    /// nothing changes and [`RaftError::NotLeader`] carries the last known
    /// leader.
    pub fn submit(&self, command: impl Into<Vec<u8>>) -> Result<Ticket, RaftError> {
        let command = command.into();
        let (index, term) = self
            .with_state(|state| state.submit(command))?
            .map_err(|leader_hint| RaftError::NotLeader { leader_hint })?;
        debug!(node = self.id(), index, term, "accepted command");
        self.inner.replicate.notify_one();
        Ok(Ticket { index, term })
    }

    /// Current term and whether this node believes it is the leader.
    /// A stopped node never reports itself as leader.
    pub fn get_state(&self) -> (Term, bool) {
        let state = self.inner.state.lock().unwrap();
        (state.current_term(), state.is_leader() && !self.is_shutdown())
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.inner.state.lock().unwrap();
        NodeStatus {
            id: self.id(),
            role: state.role_kind(),
            term: state.current_term(),
            leader_id: state.leader_id(),
            commit_index: state.commit_index(),
            last_applied: state.last_applied(),
            last_log_index: state.log().last_index(),
        }
    }

    /// Stops all background activity. Later RPCs and submissions fail with
    /// [`RaftError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.killed.swap(true, Ordering::SeqCst) {
            info!(node = self.id(), "shutting down");
        }
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn config(&self) -> &RaftConfig {
        &self.inner.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn replicate_signal(&self) -> &Notify {
        &self.inner.replicate
    }

    pub(crate) fn apply_signal(&self) -> &Notify {
        &self.inner.apply
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Runs `f` under the state lock and persists any change it made before
    /// releasing the lock.
    ///
    /// A failed save is fatal: the node shuts down and the caller gets the
    /// error instead of `f`'s result, so nothing that depended on the lost
    /// change can be sent out.
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut RaftState) -> T) -> Result<T, RaftError> {
        let mut state = self.inner.state.lock().unwrap();
        // Checked under the lock: a failed save stops the node before the
        // lock is released, so no later section sees the unsaved state.
        if self.is_shutdown() {
            return Err(RaftError::Shutdown);
        }
        let role_before = state.role_kind();
        let term_before = state.current_term();
        let commit_before = state.commit_index();

        let out = f(&mut state);

        if state.take_dirty() {
            if let Err(err) = self.save(&state) {
                error!(node = self.id(), error = %err, "failed to persist raft state, stopping node");
                self.shutdown();
                drop(state);
                return Err(err);
            }
        }

        let role = state.role_kind();
        if role != role_before {
            info!(
                node = self.id(),
                term = state.current_term(),
                from = %role_before,
                to = %role,
                "role changed"
            );
            if role == RoleKind::Leader {
                self.inner.replicate.notify_one();
            }
        } else if state.current_term() != term_before {
            debug!(node = self.id(), term = state.current_term(), "term advanced");
        }
        if state.commit_index() > commit_before {
            debug!(node = self.id(), commit_index = state.commit_index(), "commit index advanced");
            self.inner.apply.notify_one();
        }
        Ok(out)
    }

    fn save(&self, state: &RaftState) -> Result<(), RaftError> {
        let blob = state.persistent_state().encode()?;
        self.inner.persister.save(&blob)?;
        Ok(())
    }
}

impl RpcHandler for Raft {
    fn handle(&self, request: RpcRequest) -> Result<RpcResponse, RaftError> {
        let now = Instant::now();
        match request {
            RpcRequest::RequestVote(args) => {
                let reply = self.with_state(|state| state.handle_request_vote(&args, now))?;
                if reply.vote_granted {
                    debug!(node = self.id(), term = reply.term, candidate = args.candidate_id, "granted vote");
                }
                Ok(RpcResponse::RequestVote(reply))
            }
            RpcRequest::AppendEntries(args) => {
                let reply = self.with_state(|state| state.handle_append_entries(args, now))?;
                Ok(RpcResponse::AppendEntries(reply))
            }
        }
    }
}
