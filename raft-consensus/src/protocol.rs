//! RPC messages exchanged between peers.
//!
//! These are the only way one server observes or influences another. Both
//! request/reply pairs are plain data so any transport can carry them; the
//! TCP transport sends them as JSON.

use serde::{Deserialize, Serialize};

use crate::log::{LogEntry, LogIndex, Term};
use crate::topology::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: PeerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// The voter's current term, after any update caused by the request.
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: PeerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    /// Empty for a pure heartbeat.
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// Reply to AppendEntries.
///
/// On a consistency failure, `conflict_index`/`conflict_term` let the leader
/// skip a whole run of mismatched entries instead of backing off one index
/// per round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    pub conflict_index: LogIndex,
    /// Term of the follower's entry at `prev_log_index`, or `None` when the
    /// follower's log is too short to contain it.
    pub conflict_term: Option<Term>,
}

impl AppendEntriesReply {
    pub(crate) fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            conflict_index: 0,
            conflict_term: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum RpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

impl RpcRequest {
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::RequestVote(_) => "RequestVote",
            RpcRequest::AppendEntries(_) => "AppendEntries",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum RpcResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}
