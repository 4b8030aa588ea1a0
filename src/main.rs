use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use raftnode::client::Client;
use raftnode::client_api;
use raftnode::config::{parse_peer, Config};
use raftnode::file_storage::FileStorage;
use raftnode::kv::{KvCommand, KvQuery, KvStore};
use raftnode::server::Server;
use raftnode::types::{ClientResponse, NodeId};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Replicated key-value store on Raft over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node that is part of the initial cluster.
    Serve(NodeArgs),
    /// Run a new node and ask the cluster to add it.
    Join(NodeArgs),
    /// Print the current leader.
    Leader(ClientArgs),
    Get {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
    },
    Set {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
        value: String,
    },
    Delete {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
    },
    /// Ask the cluster to remove a node.
    Leave {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long = "peer-id")]
        peer_id: u64,
    },
}

#[derive(Args)]
struct NodeArgs {
    /// This node's numeric ID (must be unique in the cluster).
    #[arg(long)]
    id: u64,

    /// UDP address to listen on for peers and clients.
    #[arg(long)]
    addr: SocketAddr,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(NodeId, SocketAddr)>,

    /// Directory for persistent state (metadata.json, log.jsonl, snapshot.json).
    #[arg(long)]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 2000)]
    tick_ms: u64,

    #[arg(long, default_value_t = 500)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,

    /// Serve the HTTP key-value API on this address.
    #[arg(long)]
    http: Option<SocketAddr>,
}

#[derive(Args)]
struct ClientArgs {
    /// A cluster node to contact. Repeat for each node.
    #[arg(long = "node", required = true)]
    nodes: Vec<SocketAddr>,

    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,
}

impl ClientArgs {
    fn client(&self) -> Client<KvStore> {
        Client::new(self.nodes.clone()).with_timeout(Duration::from_millis(self.timeout_ms))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args, false),
        Command::Join(args) => serve(args, true),
        Command::Leader(client) => {
            match client.client().leader()? {
                Some((id, addr)) => println!("{id} {addr}"),
                None => println!("no leader"),
            }
            Ok(())
        }
        Command::Get { client, key } => print(client.client().query(KvQuery::Get { key })?),
        Command::Set { client, key, value } => print(client.client().command(KvCommand::Set { key, value })?),
        Command::Delete { client, key } => print(client.client().command(KvCommand::Delete { key })?),
        Command::Leave { client, peer_id } => print(client.client().leave(NodeId::from(peer_id))?),
    }
}

fn serve(args: NodeArgs, join: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::new(NodeId::from(args.id), args.addr, args.data_dir);
    config.peers = args.peers.into_iter().collect();
    config.tick = Duration::from_millis(args.tick_ms);
    config.heartbeat_interval = Duration::from_millis(args.heartbeat_ms);
    config.queue_capacity = args.queue_capacity;
    config.http_addr = args.http;
    config.join = join;

    let storage = FileStorage::open(&config.data_dir)?;
    let server = Server::start(config.clone(), KvStore::new(), storage)?;
    if let Some(addr) = config.http_addr {
        client_api::start(addr, server.handle())?;
    }
    server.run()?;
    Ok(())
}

fn print<R: std::fmt::Debug>(response: Option<ClientResponse<R>>) -> Result<(), Box<dyn std::error::Error>> {
    match response {
        Some(ClientResponse::Output { output }) => println!("{output:?}"),
        Some(ClientResponse::Membership { cluster }) => {
            for (id, addr) in cluster {
                println!("{id} {addr}");
            }
        }
        Some(other) => println!("{other:?}"),
        None => return Err("no answer from the cluster".into()),
    }
    Ok(())
}
