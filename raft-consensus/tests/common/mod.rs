//! Shared harness for cluster tests over the simulated network.
//!
//! Every node instance gets its own apply collector. Collectors check that
//! each instance sees indexes 1, 2, 3, ... in order and that no two
//! instances ever apply different commands at the same index; violations
//! are reported by the next call to [`TestCluster::n_committed`].

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use raft_consensus::network::Network;
use raft_consensus::{
    ApplyMsg, LogIndex, MemoryPersister, NodeStatus, PeerId, Raft, RaftConfig, Term, Topology,
};

/// Upper bound of the election timeout used by every test cluster.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(450);

#[derive(Default)]
struct ApplyChecker {
    committed: HashMap<LogIndex, Vec<u8>>,
    errors: Vec<String>,
}

struct Slot {
    raft: Option<Raft>,
    persister: MemoryPersister,
    applied: Arc<Mutex<Vec<ApplyMsg>>>,
}

pub struct TestCluster {
    pub network: Network,
    config: RaftConfig,
    members: Vec<PeerId>,
    slots: BTreeMap<PeerId, Slot>,
    checker: Arc<Mutex<ApplyChecker>>,
}

impl TestCluster {
    /// Starts `n` connected nodes with ids 1..=n.
    pub fn start(n: u64, seed: u64) -> Result<Self> {
        let members: Vec<PeerId> = (1..=n).collect();
        let mut cluster = Self {
            network: Network::with_seed(seed),
            config: RaftConfig::default().with_seed(seed),
            slots: members
                .iter()
                .map(|&id| {
                    (
                        id,
                        Slot {
                            raft: None,
                            persister: MemoryPersister::new(),
                            applied: Arc::default(),
                        },
                    )
                })
                .collect(),
            members,
            checker: Arc::default(),
        };
        for id in cluster.members.clone() {
            cluster.start_node(id)?;
        }
        Ok(cluster)
    }

    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    pub fn raft(&self, id: PeerId) -> Option<&Raft> {
        self.slots.get(&id).and_then(|slot| slot.raft.as_ref())
    }

    pub fn status(&self, id: PeerId) -> Option<NodeStatus> {
        self.raft(id).map(Raft::status)
    }

    pub fn persister(&self, id: PeerId) -> &MemoryPersister {
        &self.slots[&id].persister
    }

    /// Starts a fresh instance of `id` from its persisted state.
    pub fn start_node(&mut self, id: PeerId) -> Result<()> {
        self.crash(id);
        let topology = Topology::new(id, self.members.clone())?;
        let slot = self.slots.get_mut(&id).expect("unknown node");
        let (raft, mut apply_rx) = Raft::spawn(
            topology,
            self.config.clone(),
            Arc::new(slot.persister.clone()),
            self.network.transport(id),
        )?;
        self.network.register(id, Arc::new(raft.clone()));

        let applied: Arc<Mutex<Vec<ApplyMsg>>> = Arc::default();
        slot.applied = Arc::clone(&applied);
        slot.raft = Some(raft);

        let checker = Arc::clone(&self.checker);
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                let mut log = applied.lock().unwrap();
                let mut checker = checker.lock().unwrap();
                let expected = log.len() as LogIndex + 1;
                if msg.index != expected {
                    checker.errors.push(format!(
                        "node {id} applied index {} but expected {expected}",
                        msg.index
                    ));
                }
                match checker.committed.get(&msg.index) {
                    Some(existing) if *existing != msg.command => {
                        let error = format!(
                            "node {id} applied {:?} at index {} where another node applied {:?}",
                            msg.command, msg.index, existing
                        );
                        checker.errors.push(error);
                    }
                    Some(_) => {}
                    None => {
                        checker.committed.insert(msg.index, msg.command.clone());
                    }
                }
                log.push(msg);
            }
        });
        Ok(())
    }

    /// Stops `id` and detaches its persister, so nothing the dead instance
    /// still has in flight can reach the state a restart will load.
    pub fn crash(&mut self, id: PeerId) {
        let slot = self.slots.get_mut(&id).expect("unknown node");
        if let Some(raft) = slot.raft.take() {
            raft.shutdown();
            self.network.remove(id);
            slot.persister = slot.persister.duplicate();
        }
    }

    pub fn disconnect(&self, id: PeerId) {
        self.network.disconnect(id);
    }

    pub fn connect(&self, id: PeerId) {
        self.network.connect(id);
    }

    fn live_connected(&self) -> impl Iterator<Item = (PeerId, &Raft)> + '_ {
        self.slots.iter().filter_map(|(id, slot)| {
            let raft = slot.raft.as_ref()?;
            self.network.is_connected(*id).then_some((*id, raft))
        })
    }

    /// Waits until exactly one connected node believes it is leader and
    /// returns it. Fails immediately if two nodes lead in the same term.
    pub async fn check_one_leader(&self) -> Result<PeerId> {
        let deadline = Instant::now() + ELECTION_TIMEOUT * 10;
        while Instant::now() < deadline {
            let mut by_term: BTreeMap<Term, Vec<PeerId>> = BTreeMap::new();
            for (id, raft) in self.live_connected() {
                let (term, is_leader) = raft.get_state();
                if is_leader {
                    by_term.entry(term).or_default().push(id);
                }
            }
            if let Some((term, leaders)) = by_term.iter().find(|(_, leaders)| leaders.len() > 1) {
                bail!("term {term} has {} leaders: {leaders:?}", leaders.len());
            }
            let leaders: Vec<PeerId> = by_term.into_values().flatten().collect();
            if let &[leader] = leaders.as_slice() {
                return Ok(leader);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        bail!("expected exactly one leader")
    }

    /// Fails if any connected node claims leadership.
    pub fn check_no_leader(&self) -> Result<()> {
        for (id, raft) in self.live_connected() {
            if raft.get_state().1 {
                bail!("node {id} is leader, but none was expected");
            }
        }
        Ok(())
    }

    /// Returns the term shared by every connected node.
    pub fn check_terms(&self) -> Result<Term> {
        let terms: Vec<Term> = self
            .live_connected()
            .map(|(_, raft)| raft.get_state().0)
            .collect();
        match terms.split_first() {
            Some((first, rest)) if rest.iter().all(|term| term == first) => Ok(*first),
            Some(_) => bail!("nodes disagree on term: {terms:?}"),
            None => bail!("no connected nodes"),
        }
    }

    /// How many live nodes have applied `index`, and the command there.
    pub fn n_committed(&self, index: LogIndex) -> Result<(usize, Option<Vec<u8>>)> {
        {
            let checker = self.checker.lock().unwrap();
            if let Some(error) = checker.errors.first() {
                bail!("apply check failed: {error}");
            }
        }
        let mut count = 0;
        let mut command: Option<Vec<u8>> = None;
        for (id, slot) in &self.slots {
            if slot.raft.is_none() {
                continue;
            }
            let applied = slot.applied.lock().unwrap();
            let Some(msg) = applied.get(index as usize - 1) else {
                continue;
            };
            match &command {
                Some(existing) if *existing != msg.command => {
                    bail!("node {id} committed {:?} at index {index}, others {existing:?}", msg.command)
                }
                _ => command = Some(msg.command.clone()),
            }
            count += 1;
        }
        Ok((count, command))
    }

    /// Waits until at least `n` live nodes have applied `index`.
    pub async fn wait_applied(&self, index: LogIndex, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let (count, command) = self.n_committed(index)?;
            if count >= n {
                if let Some(command) = command {
                    return Ok(command);
                }
            }
            if Instant::now() >= deadline {
                bail!("only {count} nodes applied index {index}, wanted {n}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submits `command` until some leader gets it committed on at least
    /// `expected` nodes, and returns its index. Without `retry`, a single
    /// accepted submission that fails to commit is an error.
    pub async fn one(&self, command: &[u8], expected: usize, retry: bool) -> Result<LogIndex> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut start = 0;
        while Instant::now() < deadline {
            let mut accepted = None;
            for offset in 0..self.members.len() {
                let id = self.members[(start + offset) % self.members.len()];
                if !self.network.is_connected(id) {
                    continue;
                }
                if let Some(ticket) = self.raft(id).and_then(|raft| raft.submit(command).ok()) {
                    accepted = Some(ticket.index);
                    break;
                }
            }
            start = (start + 1) % self.members.len();

            let Some(index) = accepted else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };
            let commit_deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < commit_deadline {
                let (count, applied) = self.n_committed(index)?;
                if count >= expected && applied.as_deref() == Some(command) {
                    return Ok(index);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if !retry {
                bail!("{command:?} accepted at index {index} but never committed");
            }
        }
        bail!("{command:?} failed to reach agreement on {expected} nodes")
    }

    pub fn rpc_count(&self) -> u64 {
        self.network.rpc_count()
    }

    pub fn shutdown(mut self) {
        for id in self.members.clone() {
            self.crash(id);
        }
    }
}
