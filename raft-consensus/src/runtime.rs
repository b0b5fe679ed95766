//! Background tasks driving a Raft node.
//!
//! Each node runs three long-lived Tokio tasks:
//!
//! - **election timer**: sleeps until the election deadline, then starts an
//!   election if no leader or candidate contact reset it in the meantime
//! - **replication ticker**: while leader, sends AppendEntries to every
//!   follower each heartbeat interval, or sooner when new entries arrive
//! - **apply loop**: hands newly committed entries to the application in
//!   index order
//!
//! Every outgoing RPC runs in its own short-lived task so a slow or dead
//! peer never delays the others. All tasks exit once the node shuts down.

use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::node::Raft;
use crate::protocol::{AppendEntriesArgs, RequestVoteArgs, RpcRequest, RpcResponse};
use crate::state::ApplyMsg;
use crate::topology::PeerId;

pub(crate) fn start(raft: &Raft, apply_tx: mpsc::UnboundedSender<ApplyMsg>) {
    tokio::spawn(election_loop(raft.clone()));
    tokio::spawn(replication_loop(raft.clone()));
    tokio::spawn(apply_loop(raft.clone(), apply_tx));
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // An error means the node was dropped, which also counts as stopped.
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

async fn election_loop(raft: Raft) {
    let mut shutdown = raft.shutdown_signal();
    loop {
        // A leader keeps pushing its own deadline forward so this loop does
        // not spin. Stepping down restarts the timer in the state itself.
        let Ok(deadline) = raft.with_state(|state| {
            if state.is_leader() {
                state.reset_election_timer(std::time::Instant::now());
            }
            state.election_deadline()
        }) else {
            break;
        };
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = time::sleep_until(time::Instant::from_std(deadline)) => {}
        }

        // The deadline may have moved while we slept; only a deadline that
        // is still in the past starts an election.
        let now = std::time::Instant::now();
        let started = raft.with_state(|state| {
            if state.election_due(now) {
                Some((state.start_election(now), state.topology().others().collect::<Vec<_>>()))
            } else {
                None
            }
        });
        match started {
            Ok(Some((args, peers))) => {
                info!(node = raft.id(), term = args.term, "election timeout, starting election");
                for peer in peers {
                    tokio::spawn(request_vote(raft.clone(), peer, args.clone()));
                }
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }
    debug!(node = raft.id(), "election loop stopped");
}

async fn request_vote(raft: Raft, peer: PeerId, args: RequestVoteArgs) {
    let response = raft
        .transport()
        .call(peer, RpcRequest::RequestVote(args.clone()))
        .await;
    match response {
        Ok(RpcResponse::RequestVote(reply)) => {
            let _ = raft.with_state(|state| state.handle_vote_reply(peer, args.term, &reply));
        }
        Ok(other) => {
            warn!(node = raft.id(), peer, response = ?other, "unexpected reply to RequestVote");
        }
        Err(err) => {
            debug!(node = raft.id(), peer, term = args.term, error = %err, "RequestVote failed");
        }
    }
}

async fn replication_loop(raft: Raft) {
    let mut shutdown = raft.shutdown_signal();
    let mut ticker = time::interval(raft.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
            _ = raft.replicate_signal().notified() => {}
        }

        let Ok(round) = raft.with_state(|state| state.replication_round()) else {
            break;
        };
        for (peer, args) in round {
            tokio::spawn(append_entries(raft.clone(), peer, args));
        }
    }
    debug!(node = raft.id(), "replication loop stopped");
}

async fn append_entries(raft: Raft, peer: PeerId, args: AppendEntriesArgs) {
    let response = raft
        .transport()
        .call(peer, RpcRequest::AppendEntries(args.clone()))
        .await;
    match response {
        Ok(RpcResponse::AppendEntries(reply)) => {
            // A consistency rejection only moves next_index back; the retry
            // goes out with the next tick.
            let _ = raft.with_state(|state| state.handle_append_reply(peer, &args, &reply));
        }
        Ok(other) => {
            warn!(node = raft.id(), peer, response = ?other, "unexpected reply to AppendEntries");
        }
        Err(err) => {
            debug!(node = raft.id(), peer, term = args.term, error = %err, "AppendEntries failed");
        }
    }
}

async fn apply_loop(raft: Raft, apply_tx: mpsc::UnboundedSender<ApplyMsg>) {
    let mut shutdown = raft.shutdown_signal();
    let mut ticker = time::interval(raft.config().apply_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
            _ = raft.apply_signal().notified() => {}
        }

        let Ok(batch) = raft.with_state(|state| state.take_committed()) else {
            break;
        };
        for msg in batch {
            debug!(node = raft.id(), index = msg.index, term = msg.term, "applying entry");
            if apply_tx.send(msg).is_err() {
                debug!(node = raft.id(), "apply receiver dropped");
                return;
            }
        }
    }
    debug!(node = raft.id(), "apply loop stopped");
}
