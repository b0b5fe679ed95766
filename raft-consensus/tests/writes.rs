//! Log replication and commitment over the simulated network.

mod common;

use std::time::Duration;

use anyhow::{ensure, Result};
use common::{TestCluster, ELECTION_TIMEOUT};
use raft_consensus::RaftError;

fn cmd(n: u32) -> Vec<u8> {
    format!("cmd-{n}").into_bytes()
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_agreement() -> Result<()> {
    let cluster = TestCluster::start(3, 11)?;
    cluster.check_one_leader().await?;

    for expected in 1..=3u64 {
        let (count, _) = cluster.n_committed(expected)?;
        ensure!(count == 0, "index {expected} committed before submission");

        let index = cluster.one(&cmd(expected as u32), 3, false).await?;
        ensure!(index == expected, "got index {index}, expected {expected}");
    }

    for id in cluster.members() {
        let status = cluster.status(*id).expect("running");
        ensure!(status.commit_index >= 3, "node {id} commit index {}", status.commit_index);
        ensure!(status.last_applied <= status.commit_index);
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_on_follower_is_rejected_with_hint() -> Result<()> {
    let cluster = TestCluster::start(3, 12)?;
    let leader = cluster.check_one_leader().await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    for id in cluster.members().iter().copied().filter(|id| *id != leader) {
        let follower = cluster.raft(id).expect("running");
        let before = follower.status();
        match follower.submit(b"nope".to_vec()) {
            Err(RaftError::NotLeader { leader_hint }) => {
                ensure!(leader_hint == Some(leader), "node {id} hinted {leader_hint:?}");
            }
            other => anyhow::bail!("follower {id} accepted a command: {other:?}"),
        }
        ensure!(follower.status().last_log_index == before.last_log_index);
    }

    let ticket = cluster.raft(leader).expect("running").submit(b"yes".to_vec())?;
    ensure!(ticket.index == 1);
    ensure!(cluster.wait_applied(1, 3, Duration::from_secs(2)).await? == b"yes".to_vec());

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn agreement_despite_follower_disconnect() -> Result<()> {
    let cluster = TestCluster::start(3, 13)?;
    cluster.one(&cmd(101), 3, false).await?;

    let leader = cluster.check_one_leader().await?;
    let follower = leader % 3 + 1;
    cluster.disconnect(follower);

    // The remaining two still form a quorum.
    cluster.one(&cmd(102), 2, false).await?;
    cluster.one(&cmd(103), 2, false).await?;
    tokio::time::sleep(ELECTION_TIMEOUT).await;
    cluster.one(&cmd(104), 2, false).await?;
    cluster.one(&cmd(105), 2, false).await?;

    cluster.connect(follower);
    let index = cluster.one(&cmd(106), 3, true).await?;
    ensure!(index >= 6, "got index {index}");
    for earlier in 1..=5 {
        cluster.wait_applied(earlier, 3, Duration::from_secs(2)).await?;
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn no_agreement_without_quorum() -> Result<()> {
    let cluster = TestCluster::start(5, 14)?;
    cluster.one(&cmd(10), 5, false).await?;

    let leader = cluster.check_one_leader().await?;
    let followers: Vec<u64> = cluster
        .members()
        .iter()
        .copied()
        .filter(|id| *id != leader)
        .collect();
    for id in &followers[..3] {
        cluster.disconnect(*id);
    }

    let ticket = cluster.raft(leader).expect("running").submit(cmd(20))?;
    ensure!(ticket.index == 2, "got index {}", ticket.index);

    tokio::time::sleep(ELECTION_TIMEOUT * 4).await;
    let (count, _) = cluster.n_committed(2)?;
    ensure!(count == 0, "{count} nodes committed without a quorum");

    for id in &followers[..3] {
        cluster.connect(*id);
    }

    // The disconnected majority may have elected a new leader whose log
    // does not contain index 2, so that entry may be overwritten.
    let index = cluster.one(&cmd(30), 5, true).await?;
    ensure!(index >= 2, "got index {index}");
    let (count, _) = cluster.n_committed(2)?;
    ensure!(count == 5, "index 2 applied on {count} nodes");

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_leader_entries_are_replaced() -> Result<()> {
    let cluster = TestCluster::start(3, 15)?;
    cluster.one(&cmd(101), 3, true).await?;

    // The old leader accepts entries it can never commit.
    let leader1 = cluster.check_one_leader().await?;
    cluster.disconnect(leader1);
    let old = cluster.raft(leader1).expect("running");
    for n in [102, 103, 104] {
        old.submit(cmd(n))?;
    }

    // The other two elect a new leader and commit a different entry at index 2.
    cluster.one(&cmd(103), 2, true).await?;

    let leader2 = cluster.check_one_leader().await?;
    cluster.disconnect(leader2);

    // Old leader comes back; with the remaining follower it must learn the
    // committed entry and drop its divergent suffix.
    cluster.connect(leader1);
    cluster.one(&cmd(104), 2, true).await?;

    cluster.connect(leader2);
    cluster.one(&cmd(105), 3, true).await?;

    let status = cluster.status(leader1).expect("running");
    let (_, at_two) = cluster.n_committed(2)?;
    ensure!(at_two == Some(cmd(103)), "index 2 holds {at_two:?}");
    ensure!(status.last_log_index == 4, "old leader log ends at {}", status.last_log_index);

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_backs_up_over_long_divergent_logs() -> Result<()> {
    let cluster = TestCluster::start(5, 16)?;
    cluster.one(&cmd(0), 5, true).await?;

    // Leader and one follower are cut off and collect entries that will
    // never commit.
    let leader1 = cluster.check_one_leader().await?;
    let partner = leader1 % 5 + 1;
    let others: Vec<u64> = cluster
        .members()
        .iter()
        .copied()
        .filter(|id| *id != leader1 && *id != partner)
        .collect();
    for id in &others {
        cluster.disconnect(*id);
    }
    let old = cluster.raft(leader1).expect("running");
    for n in 0..30 {
        old.submit(cmd(1000 + n))?;
    }
    tokio::time::sleep(ELECTION_TIMEOUT).await;

    cluster.disconnect(leader1);
    cluster.disconnect(partner);
    for id in &others {
        cluster.connect(*id);
    }

    // The other three commit a long run of their own.
    for n in 0..30 {
        cluster.one(&cmd(2000 + n), 3, true).await?;
    }

    // Bring everyone back; everyone converges on the majority's history.
    for id in cluster.members().to_vec() {
        cluster.connect(id);
    }
    let last = cluster.one(&cmd(3000), 5, true).await?;
    ensure!(last >= 32, "final entry at index {last}");
    let (count, at_two) = cluster.n_committed(2)?;
    ensure!(count == 5 && at_two == Some(cmd(2000)), "index 2: {count} nodes, {at_two:?}");

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_submissions_commit_in_one_order() -> Result<()> {
    let cluster = TestCluster::start(3, 17)?;
    let leader = cluster.check_one_leader().await?;
    let raft = cluster.raft(leader).expect("running").clone();

    let mut tasks = Vec::new();
    for n in 0..5 {
        let raft = raft.clone();
        tasks.push(tokio::spawn(async move { raft.submit(cmd(n)) }));
    }
    let mut indexes = Vec::new();
    for task in tasks {
        let ticket = task.await??;
        indexes.push(ticket.index);
    }
    indexes.sort_unstable();
    ensure!(indexes == vec![1, 2, 3, 4, 5], "tickets {indexes:?}");

    for index in 1..=5 {
        cluster.wait_applied(index, 3, Duration::from_secs(2)).await?;
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn agreement_on_unreliable_network() -> Result<()> {
    let cluster = TestCluster::start(5, 18)?;
    cluster.network.set_reliable(false);

    for n in 0..20 {
        cluster.one(&cmd(n), 1, true).await?;
    }

    cluster.network.set_reliable(true);
    cluster.one(&cmd(100), 5, true).await?;

    cluster.shutdown();
    Ok(())
}
