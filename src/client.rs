use std::io;
use std::marker::PhantomData;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec::{self, CodecError, MAX_DATAGRAM};
use crate::runtime::StateMachine;
use crate::transport::{ephemeral_socket, is_timeout};
use crate::types::{ClientRequest, ClientResponse, NodeId, Packet};

/// How long a client waits for an answer. There is no retry.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("no nodes to contact")]
    NoNodes,
}

/// UDP client for a cluster. Every call is a single attempt bounded by the
/// timeout; `Ok(None)` means nobody answered in time.
pub struct Client<S: StateMachine> {
    nodes: Vec<SocketAddr>,
    timeout: Duration,
    _machine: PhantomData<fn() -> S>,
}

impl<S: StateMachine> Client<S> {
    pub fn new(nodes: Vec<SocketAddr>) -> Self {
        Self {
            nodes,
            timeout: DEFAULT_TIMEOUT,
            _machine: PhantomData,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask every known node who leads and take the first answer that names
    /// a leader.
    pub fn leader(&self) -> Result<Option<(NodeId, SocketAddr)>, ClientError> {
        let first = *self.nodes.first().ok_or(ClientError::NoNodes)?;
        let socket = ephemeral_socket(first)?;
        let bytes = Self::encode(ClientRequest::Leader)?;
        for addr in &self.nodes {
            if let Err(err) = socket.send_to(&bytes, addr) {
                debug!(%addr, error = %err, "leader query not sent");
            }
        }

        let deadline = Instant::now() + self.timeout;
        while let Some(response) = self.receive(&socket, deadline)? {
            if let ClientResponse::Leader {
                leader_id: Some(id),
                leader_addr: Some(addr),
            } = response
            {
                return Ok(Some((id, addr)));
            }
        }
        Ok(None)
    }

    pub fn command(&self, command: S::Command) -> Result<Option<ClientResponse<S::Output>>, ClientError> {
        self.request(ClientRequest::Command { command })
    }

    pub fn query(&self, query: S::Query) -> Result<Option<ClientResponse<S::Output>>, ClientError> {
        self.request(ClientRequest::Query { query })
    }

    /// Ask the leader to add `peer_id` at `peer_address` to the cluster.
    pub fn join(
        &self,
        peer_id: NodeId,
        peer_address: SocketAddr,
    ) -> Result<Option<ClientResponse<S::Output>>, ClientError> {
        self.request(ClientRequest::Join {
            peer_id,
            peer_address,
        })
    }

    /// Ask the leader to remove `peer_id` from the cluster.
    pub fn leave(&self, peer_id: NodeId) -> Result<Option<ClientResponse<S::Output>>, ClientError> {
        self.request(ClientRequest::Leave { peer_id })
    }

    /// Find the leader, then send it `request`.
    fn request(
        &self,
        request: ClientRequest<S::Command, S::Query>,
    ) -> Result<Option<ClientResponse<S::Output>>, ClientError> {
        let Some((leader, addr)) = self.leader()? else {
            debug!("no leader found");
            return Ok(None);
        };
        debug!(%leader, %addr, kind = request.kind(), "sending request");

        let socket = ephemeral_socket(addr)?;
        socket.send_to(&Self::encode(request)?, addr)?;
        self.receive(&socket, Instant::now() + self.timeout)
    }

    fn encode(request: ClientRequest<S::Command, S::Query>) -> Result<Vec<u8>, CodecError> {
        codec::encode(&Packet::<S::Command, S::Query>::Client { request })
    }

    /// Wait for the next decodable response until `deadline`.
    fn receive(
        &self,
        socket: &UdpSocket,
        deadline: Instant,
    ) -> Result<Option<ClientResponse<S::Output>>, ClientError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            socket.set_read_timeout(Some(deadline - now))?;
            match socket.recv_from(&mut buf) {
                Ok((len, src)) => match codec::decode(&buf[..len]) {
                    Ok(response) => return Ok(Some(response)),
                    Err(err) => warn!(%src, error = %err, "dropping malformed response"),
                },
                Err(err) if is_timeout(&err) => return Ok(None),
                // A node that is down; others may still answer.
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvCommand, KvQuery, KvResult, KvStore};
    use std::thread;

    /// A fake node answering every datagram with `answer`.
    fn fake_node(answer: ClientResponse<KvResult>, replies: usize) -> (SocketAddr, thread::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            for _ in 0..replies {
                let Ok((len, src)) = socket.recv_from(&mut buf) else {
                    return;
                };
                let _: Packet<KvCommand, KvQuery> = codec::decode(&buf[..len]).unwrap();
                socket.send_to(&codec::encode(&answer).unwrap(), src).unwrap();
            }
        });
        (addr, handle)
    }

    #[test]
    fn leader_of_silent_cluster_is_none() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client: Client<KvStore> = Client::new(vec![silent.local_addr().unwrap()])
            .with_timeout(Duration::from_millis(100));

        assert_eq!(client.leader().unwrap(), None);
    }

    #[test]
    fn client_without_nodes_fails() {
        let client: Client<KvStore> = Client::new(Vec::new());

        assert!(matches!(client.leader(), Err(ClientError::NoNodes)));
    }

    #[test]
    fn leader_skips_answers_without_a_leader() {
        let (unknown, first) = fake_node(
            ClientResponse::Leader {
                leader_id: None,
                leader_addr: None,
            },
            1,
        );
        let leader_addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let (known, second) = fake_node(
            ClientResponse::Leader {
                leader_id: Some(NodeId::from(1)),
                leader_addr: Some(leader_addr),
            },
            1,
        );
        let client: Client<KvStore> = Client::new(vec![unknown, known]);

        assert_eq!(client.leader().unwrap(), Some((NodeId::from(1), leader_addr)));
        first.join().unwrap();
        second.join().unwrap();
    }

    #[test]
    fn command_goes_to_discovered_leader() {
        // The fake node claims to lead, then answers the command itself.
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = socket.local_addr().unwrap();
        let server = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let mut seen = Vec::new();
            for _ in 0..2 {
                let (len, src) = socket.recv_from(&mut buf).unwrap();
                let packet: Packet<KvCommand, KvQuery> = codec::decode(&buf[..len]).unwrap();
                let Packet::Client { request } = packet else {
                    panic!("expected client packet");
                };
                let answer: ClientResponse<KvResult> = match request {
                    ClientRequest::Leader => ClientResponse::Leader {
                        leader_id: Some(NodeId::from(1)),
                        leader_addr: Some(addr),
                    },
                    _ => ClientResponse::Output {
                        output: KvResult::Ok,
                    },
                };
                seen.push(request.kind());
                socket.send_to(&codec::encode(&answer).unwrap(), src).unwrap();
            }
            seen
        });
        let client: Client<KvStore> = Client::new(vec![addr]);

        let response = client
            .command(KvCommand::Set {
                key: "a".to_string(),
                value: "1".to_string(),
            })
            .unwrap();

        assert_eq!(
            response,
            Some(ClientResponse::Output {
                output: KvResult::Ok
            })
        );
        assert_eq!(server.join().unwrap(), vec!["leader", "command"]);
    }
}
