//! Runs one member of a replicated key/value cluster over TCP.
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 --data-dir ./data \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminals 2 and 3: same, with --id 2 / --listen 127.0.0.1:7102 and so on
//! ```
//!
//! Type `HELP` at the prompt for the console commands. Logs go to stderr and
//! honor `RUST_LOG`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueHint};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use raft_consensus::command::CommandPayload;
use raft_consensus::console::{ConsoleCommand, HELP};
use raft_consensus::store::KvStore;
use raft_consensus::tcp::{self, TcpTransport};
use raft_consensus::{
    FilePersister, MemoryPersister, Persister, Raft, RaftConfig, RaftError, RpcHandler, Topology,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a Raft key/value node")]
struct Args {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: u64,

    /// Address to accept peer RPCs on, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Directory for durable Raft state. Without it state lives in memory
    /// and is lost on exit.
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    /// Lower bound of the randomized election timeout, in milliseconds
    #[arg(long, default_value_t = 300)]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout, in milliseconds
    #[arg(long, default_value_t = 450)]
    election_timeout_max_ms: u64,

    /// Leader heartbeat interval, in milliseconds
    #[arg(long, default_value_t = 100)]
    heartbeat_ms: u64,

    /// Per-call timeout for peer RPCs, in milliseconds
    #[arg(long, default_value_t = 500)]
    rpc_timeout_ms: u64,

    /// Seed for the election timeout randomizer
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            rng_seed: self.seed,
            ..RaftConfig::default()
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let mut peers = parse_peers(&args.peer)?;
    if peers.get(&args.id).map(String::as_str) != Some(args.listen.as_str()) {
        bail!(
            "self id {} must map to listen addr {} via --peer entries",
            args.id,
            args.listen
        );
    }
    let topology = Topology::new(args.id, peers.keys().copied().collect())?;
    peers.remove(&args.id);

    let persister: Arc<dyn Persister> = match &args.data_dir {
        Some(dir) => {
            let dir = dir.join(format!("node-{}", args.id));
            info!(dir = %dir.display(), "using file persister");
            Arc::new(FilePersister::new(dir)?)
        }
        None => {
            warn!("no --data-dir given, raft state will not survive a restart");
            Arc::new(MemoryPersister::new())
        }
    };
    let transport = Arc::new(TcpTransport::new(
        peers,
        Duration::from_millis(args.rpc_timeout_ms),
    ));

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let (raft, mut apply_rx) = Raft::spawn(topology, args.raft_config(), persister, transport)?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handler: Arc<dyn RpcHandler> = Arc::new(raft.clone());
    let server = tokio::spawn(tcp::serve(listener, handler, async move {
        let _ = stop_rx.await;
    }));

    let store = Arc::new(KvStore::new());
    let applier = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                match store.apply(&msg) {
                    Ok(command) => {
                        info!(index = msg.index, term = msg.term, key = command.key(), "applied")
                    }
                    Err(err) => error!(index = msg.index, error = ?err, "failed to apply entry"),
                }
            }
        })
    };

    println!("Node {} ready. {HELP}", args.id);
    let result = run_console(&raft, &store).await;

    raft.shutdown();
    let _ = stop_tx.send(());
    if let Err(err) = server.await? {
        warn!(error = ?err, "rpc server exited with error");
    }
    applier.abort();
    result
}

async fn run_console(raft: &Raft, store: &KvStore) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("error: {err}");
                continue;
            }
        };
        match command {
            ConsoleCommand::Put { key, value } => {
                submit(raft, CommandPayload::Put { key, value })?;
            }
            ConsoleCommand::Delete { key } => {
                submit(raft, CommandPayload::Delete { key })?;
            }
            ConsoleCommand::Get { key } => match store.get(&key) {
                Some(value) => println!("{key} = {value}"),
                None => println!("{key} not found"),
            },
            ConsoleCommand::Status => {
                let status = raft.status();
                println!(
                    "node {} | {} | term {} | leader {} | commit {} | applied {} | log {} | keys {}",
                    status.id,
                    status.role,
                    status.term,
                    status
                        .leader_id
                        .map_or_else(|| "unknown".to_string(), |id| id.to_string()),
                    status.commit_index,
                    store.applied_index(),
                    status.last_log_index,
                    store.snapshot().len(),
                );
            }
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Exit => return Ok(()),
        }
    }
}

fn submit(raft: &Raft, command: CommandPayload) -> Result<()> {
    match raft.submit(command.encode()?) {
        Ok(ticket) => println!(
            "accepted at index {} (term {}); it applies once committed",
            ticket.index, ticket.term
        ),
        Err(RaftError::NotLeader {
            leader_hint: Some(leader),
        }) => println!("not the leader, try node {leader}"),
        Err(RaftError::NotLeader { leader_hint: None }) => {
            println!("not the leader, and no leader is known yet")
        }
        Err(err) => return Err(err).context("submit failed"),
    }
    Ok(())
}

fn parse_peers(entries: &[String]) -> Result<HashMap<u64, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            bail!("invalid peer entry '{entry}', expected id=addr");
        };
        let id: u64 = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        if peers.insert(id, addr.to_string()).is_some() {
            bail!("peer id {id} listed more than once");
        }
    }
    if peers.is_empty() {
        bail!("at least one --peer entry is required (include self)");
    }
    Ok(peers)
}
