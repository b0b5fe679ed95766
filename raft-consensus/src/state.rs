//! The consensus state machine.
//!
//! [`RaftState`] holds every persistent and volatile field of a server and
//! implements the election and replication rules as plain synchronous
//! methods. It does no I/O and never sleeps: the async layer in
//! [`crate::node`] and `runtime` owns it behind a single lock,
//! persists it when [`RaftState::take_dirty`] says so, and moves messages
//! between peers.
//!
//! Leader-only bookkeeping lives inside [`Role::Leader`], so it cannot be
//! read or written in any other role.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::RaftConfig;
use crate::election::ElectionTimer;
use crate::error::PersistError;
use crate::log::{Log, LogEntry, LogIndex, Term};
use crate::persist::PersistentState;
use crate::protocol::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::topology::{PeerId, Topology};

/// Replication progress of one follower, as seen by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next log index to send.
    pub next_index: LogIndex,
    /// Highest index known to be replicated on the follower.
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate {
        term: Term,
        votes: BTreeSet<PeerId>,
    },
    Leader {
        progress: BTreeMap<PeerId, Progress>,
    },
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Follower => RoleKind::Follower,
            Role::Candidate { .. } => RoleKind::Candidate,
            Role::Leader { .. } => RoleKind::Leader,
        }
    }
}

/// Role without its attached data, for status reporting and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// A committed entry handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: LogIndex,
    pub term: Term,
    pub command: Vec<u8>,
}

pub struct RaftState {
    topology: Topology,

    current_term: Term,
    voted_for: Option<PeerId>,
    log: Log,

    commit_index: LogIndex,
    last_applied: LogIndex,
    role: Role,
    leader_id: Option<PeerId>,
    timer: ElectionTimer,
    max_entries_per_append: usize,

    // Set whenever current_term, voted_for or log change.
    dirty: bool,
}

impl RaftState {
    pub fn new(
        topology: Topology,
        persisted: PersistentState,
        config: &RaftConfig,
        now: Instant,
    ) -> Result<Self, PersistError> {
        let log = Log::from_entries(persisted.log).ok_or_else(|| {
            PersistError::Corrupt("log does not start with the sentinel entry".to_string())
        })?;
        let seed = config
            .rng_seed
            .map(|seed| seed.wrapping_add(topology.me()));
        Ok(Self {
            timer: ElectionTimer::new(
                config.election_timeout_min,
                config.election_timeout_max,
                seed,
                now,
            ),
            topology,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower,
            leader_id: None,
            max_entries_per_append: config.max_entries_per_append,
            dirty: false,
        })
    }

    pub fn id(&self) -> PeerId {
        self.topology.me()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<PeerId> {
        self.voted_for
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn role_kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.leader_id
    }

    pub fn election_deadline(&self) -> Instant {
        self.timer.deadline()
    }

    pub fn reset_election_timer(&mut self, now: Instant) {
        self.timer.reset(now);
    }

    pub fn progress(&self, peer: PeerId) -> Option<Progress> {
        match &self.role {
            Role::Leader { progress } => progress.get(&peer).copied(),
            _ => None,
        }
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.entries().to_vec(),
        }
    }

    /// Returns whether persistent fields changed since the last call, and
    /// clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Adopts `term` if it is newer than ours, stepping down to follower.
    /// A deposed leader restarts its election timer. Returns true if the
    /// term changed.
    fn observe_term(&mut self, term: Term) -> bool {
        if term <= self.current_term {
            return false;
        }
        if self.is_leader() {
            self.timer.reset(Instant::now());
        }
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        self.leader_id = None;
        self.dirty = true;
        true
    }

    // -- election --

    /// True when a follower or candidate has gone a full timeout without
    /// qualifying contact.
    pub fn election_due(&self, now: Instant) -> bool {
        !self.is_leader() && self.timer.is_expired(now)
    }

    /// Becomes a candidate for the next term and returns the RequestVote
    /// arguments to broadcast. A single-node cluster wins immediately.
    pub fn start_election(&mut self, now: Instant) -> RequestVoteArgs {
        self.current_term += 1;
        self.voted_for = Some(self.id());
        self.leader_id = None;
        self.dirty = true;
        self.role = Role::Candidate {
            term: self.current_term,
            votes: BTreeSet::from([self.id()]),
        };
        self.timer.reset(now);
        self.maybe_win_election();
        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs, now: Instant) -> RequestVoteReply {
        if args.term < self.current_term {
            return RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            };
        }
        self.observe_term(args.term);

        let can_vote = self
            .voted_for
            .map_or(true, |candidate| candidate == args.candidate_id);
        let up_to_date = self
            .log
            .is_up_to_date(args.last_log_index, args.last_log_term);
        let vote_granted = can_vote && up_to_date;
        if vote_granted {
            if self.voted_for != Some(args.candidate_id) {
                self.voted_for = Some(args.candidate_id);
                self.dirty = true;
            }
            self.timer.reset(now);
        }
        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Counts a vote reply for the election started in `election_term`.
    /// Returns true if this reply made us leader.
    pub fn handle_vote_reply(
        &mut self,
        from: PeerId,
        election_term: Term,
        reply: &RequestVoteReply,
    ) -> bool {
        if self.observe_term(reply.term) {
            return false;
        }
        if !reply.vote_granted || self.current_term != election_term {
            return false;
        }
        match &mut self.role {
            Role::Candidate { term, votes } if *term == election_term => {
                votes.insert(from);
            }
            _ => return false,
        }
        self.maybe_win_election()
    }

    fn maybe_win_election(&mut self) -> bool {
        let won = match &self.role {
            Role::Candidate { votes, .. } => votes.len() >= self.topology.quorum(),
            _ => false,
        };
        if won {
            self.become_leader();
        }
        won
    }

    fn become_leader(&mut self) {
        let next_index = self.log.len();
        let progress = self
            .topology
            .others()
            .map(|peer| {
                (
                    peer,
                    Progress {
                        next_index,
                        match_index: 0,
                    },
                )
            })
            .collect();
        self.role = Role::Leader { progress };
        self.leader_id = Some(self.id());
    }

    // -- replication --

    pub fn handle_append_entries(
        &mut self,
        args: AppendEntriesArgs,
        now: Instant,
    ) -> AppendEntriesReply {
        if args.term < self.current_term {
            return AppendEntriesReply::rejected(self.current_term);
        }
        self.observe_term(args.term);
        if !matches!(self.role, Role::Follower) {
            self.role = Role::Follower;
        }
        self.leader_id = Some(args.leader_id);
        self.timer.reset(now);

        if !self.log.matches(args.prev_log_index, args.prev_log_term) {
            let (conflict_index, conflict_term) = if args.prev_log_index > self.log.last_index() {
                (self.log.len(), None)
            } else {
                (
                    self.log.first_index_of_term_at(args.prev_log_index),
                    self.log.term_at(args.prev_log_index),
                )
            };
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_index,
                conflict_term,
            };
        }

        let last_new_index = args.prev_log_index + args.entries.len() as LogIndex;
        if self.log.reconcile(args.prev_log_index, args.entries) {
            self.dirty = true;
        }
        if args.leader_commit > self.commit_index {
            let commit = args.leader_commit.min(last_new_index);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }
        AppendEntriesReply {
            term: self.current_term,
            success: true,
            conflict_index: 0,
            conflict_term: None,
        }
    }

    /// Builds the next AppendEntries request for `peer`, or `None` if we are
    /// not the leader.
    pub fn append_entries_for(&self, peer: PeerId) -> Option<AppendEntriesArgs> {
        let Role::Leader { progress } = &self.role else {
            return None;
        };
        let next_index = progress.get(&peer)?.next_index.clamp(1, self.log.len());
        let prev_log_index = next_index - 1;
        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next_index, self.max_entries_per_append),
            leader_commit: self.commit_index,
        })
    }

    /// One request per follower for this replication tick.
    pub fn replication_round(&self) -> Vec<(PeerId, AppendEntriesArgs)> {
        self.topology
            .others()
            .filter_map(|peer| self.append_entries_for(peer).map(|args| (peer, args)))
            .collect()
    }

    /// Processes a follower's reply to `sent`. Returns true if the commit
    /// index advanced.
    pub fn handle_append_reply(
        &mut self,
        peer: PeerId,
        sent: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) -> bool {
        if self.observe_term(reply.term) || self.current_term != sent.term {
            return false;
        }
        let last_index = self.log.last_index();
        let leader_next = |term: Term| self.log.last_index_of_term(term).map(|index| index + 1);
        let backoff = match reply.conflict_term {
            Some(term) => leader_next(term).unwrap_or(reply.conflict_index),
            None => reply.conflict_index,
        };
        let Role::Leader { progress } = &mut self.role else {
            return false;
        };
        let Some(follower) = progress.get_mut(&peer) else {
            return false;
        };
        if reply.success {
            let replicated = sent.prev_log_index + sent.entries.len() as LogIndex;
            follower.match_index = follower.match_index.max(replicated);
            follower.next_index = follower.match_index + 1;
            self.advance_commit()
        } else {
            follower.next_index = backoff.clamp(follower.match_index + 1, last_index + 1);
            false
        }
    }

    /// Moves the commit index to the highest index replicated on a quorum
    /// whose entry belongs to the current term. Entries from earlier terms
    /// are only committed indirectly, by committing a later entry.
    fn advance_commit(&mut self) -> bool {
        let Role::Leader { progress } = &self.role else {
            return false;
        };
        let quorum = self.topology.quorum();
        let mut index = self.log.last_index();
        while index > self.commit_index {
            if self.log.term_at(index) != Some(self.current_term) {
                break;
            }
            let replicas = 1 + progress
                .values()
                .filter(|follower| follower.match_index >= index)
                .count();
            if replicas >= quorum {
                self.commit_index = index;
                return true;
            }
            index -= 1;
        }
        false
    }

    // -- application surface --

    /// Appends a command if we are the leader. On failure returns the
    /// leader we last heard from.
    pub fn submit(&mut self, command: Vec<u8>) -> Result<(LogIndex, Term), Option<PeerId>> {
        if !self.is_leader() {
            return Err(self.leader_id);
        }
        let index = self.log.append(LogEntry::new(self.current_term, command));
        self.dirty = true;
        self.advance_commit();
        Ok((index, self.current_term))
    }

    /// Takes every committed entry not yet handed to the application, in
    /// index order, and marks it applied.
    pub fn take_committed(&mut self) -> Vec<ApplyMsg> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let batch: Vec<ApplyMsg> = self
            .log
            .slice(self.last_applied + 1, self.commit_index)
            .into_iter()
            .map(|(index, entry)| ApplyMsg {
                index,
                term: entry.term,
                command: entry.command,
            })
            .collect();
        if let Some(last) = batch.last() {
            self.last_applied = last.index;
        }
        batch
    }
}
