use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::server::ServerError;
use crate::types::{Cluster, NodeId};

pub const DEFAULT_TICK: Duration = Duration::from_secs(2);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(500);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Everything a server needs to start.
#[derive(Clone, Debug)]
pub struct Config {
    pub id: NodeId,
    /// UDP address to listen on for peers and clients.
    pub addr: SocketAddr,
    /// Other members, or the members to ask when joining.
    pub peers: Cluster,
    /// Directory for persistent state (metadata.json, log.jsonl, snapshot.json).
    pub data_dir: PathBuf,
    /// Election timeouts are drawn from [2×tick, 5×tick).
    pub tick: Duration,
    pub heartbeat_interval: Duration,
    pub queue_capacity: usize,
    pub http_addr: Option<SocketAddr>,
    /// Start outside the cluster and ask `peers` to be added.
    pub join: bool,
}

impl Config {
    pub fn new(id: NodeId, addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            id,
            addr,
            peers: Cluster::new(),
            data_dir,
            tick: DEFAULT_TICK,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            http_addr: None,
            join: false,
        }
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.id.get() == 0 {
            return Err(ServerError::Config("node id must be non-zero".into()));
        }
        if let Some(peer) = self.peers.keys().find(|peer| peer.get() == 0) {
            return Err(ServerError::Config(format!("invalid peer id: {peer}")));
        }
        if self.tick.is_zero() {
            return Err(ServerError::Config("tick must be positive".into()));
        }
        // Heartbeats must arrive well inside the shortest election timeout.
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.tick * 2 {
            return Err(ServerError::Config(format!(
                "heartbeat interval {:?} must be positive and below twice the tick {:?}",
                self.heartbeat_interval, self.tick
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ServerError::Config("queue capacity must be positive".into()));
        }
        if self.join && self.peers.is_empty() {
            return Err(ServerError::Config("joining needs at least one peer".into()));
        }
        Ok(())
    }

    /// Initial membership: the configured peers plus this node reachable at
    /// `local_addr`. A joining node leaves itself out until the cluster has
    /// added it, so it never campaigns on its own.
    pub fn bootstrap_cluster(&self, local_addr: SocketAddr) -> Cluster {
        let mut cluster = self.peers.clone();
        if self.join {
            cluster.remove(&self.id);
        } else {
            cluster.insert(self.id, local_addr);
        }
        cluster
    }
}

/// Parse a `--peer` argument of the form `ID=ADDR`.
pub fn parse_peer(raw: &str) -> Result<(NodeId, SocketAddr), String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("peer must be ID=ADDR, got: {raw}"))?;
    let id: u64 = id
        .parse()
        .map_err(|_| format!("invalid peer id: {id}"))?;
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| format!("invalid peer addr '{addr}': {e}"))?;
    Ok((NodeId::from(id), addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(NodeId::from(1), "127.0.0.1:7001".parse().unwrap(), PathBuf::from("data"))
    }

    #[test]
    fn defaults_are_valid() {
        let config = config();

        assert_eq!(config.tick, Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.queue_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_id() {
        let mut config = config();
        config.id = NodeId::from(0);

        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn rejects_slow_heartbeat() {
        let mut config = config();
        config.heartbeat_interval = config.tick * 2;

        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn rejects_empty_queue() {
        let mut config = config();
        config.queue_capacity = 0;

        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn bootstrap_includes_self_unless_joining() {
        let mut config = config();
        let (peer, addr) = parse_peer("2=127.0.0.1:7002").unwrap();
        config.peers.insert(peer, addr);
        let local: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        let cluster = config.bootstrap_cluster(local);
        assert_eq!(cluster.get(&NodeId::from(1)), Some(&local));
        assert_eq!(cluster.len(), 2);

        config.join = true;
        let cluster = config.bootstrap_cluster(local);
        assert!(!cluster.contains_key(&NodeId::from(1)));
        assert_eq!(cluster.len(), 1);
    }

    #[test]
    fn parse_peer_rejects_malformed_input() {
        assert_eq!(
            parse_peer("3=10.0.0.3:7000").unwrap(),
            (NodeId::from(3), "10.0.0.3:7000".parse().unwrap())
        );
        assert!(parse_peer("3").is_err());
        assert!(parse_peer("x=10.0.0.3:7000").is_err());
        assert!(parse_peer("3=nowhere").is_err());
    }
}
