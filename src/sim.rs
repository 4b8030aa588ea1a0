//! Deterministic in-process cluster for multi-node scenarios.
//!
//! Every node owns a manual clock, so elections happen only when a test lets a
//! node's clock run past its deadline. Messages are encoded into datagrams as
//! the UDP transport would, travel through one FIFO queue, and are dropped to
//! or from isolated nodes. Storage outlives crashes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::action::Action;
use crate::codec;
use crate::kv::{KvCommand, KvQuery, KvResult, KvStore};
use crate::node::Node;
use crate::runtime::{Event, ReplyTo};
use crate::storage::MemoryStorage;
use crate::timer::manual::{ManualClock, ManualTimer};
use crate::types::{ClientRequest, ClientResponse, Cluster, NodeId, Packet, Term};

const TIMEOUT: Duration = Duration::from_millis(100);
const MAX_STEPS: usize = 1_000_000;

type SimNode = Node<KvStore, MemoryStorage<KvCommand>>;

fn addr_of(id: NodeId) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7000 + id.get() as u16))
}

fn cluster_of(ids: &[u64]) -> Cluster {
    ids.iter()
        .map(|&id| (NodeId::from(id), addr_of(NodeId::from(id))))
        .collect()
}

struct Host {
    clock: ManualClock,
    storage: MemoryStorage<KvCommand>,
    bootstrap: Cluster,
    node: Option<SimNode>,
}

impl Host {
    fn boot(id: NodeId, bootstrap: Cluster) -> Self {
        let mut host = Host {
            clock: ManualClock::new(),
            storage: MemoryStorage::new(),
            bootstrap,
            node: None,
        };
        host.start(id);
        host
    }

    fn start(&mut self, id: NodeId) {
        let node = Node::new(
            id,
            self.bootstrap.clone(),
            KvStore::new(),
            self.storage.clone(),
            Box::new(ManualTimer::new(self.clock.clone(), TIMEOUT)),
        )
        .unwrap();
        self.node = Some(node);
    }
}

type SimPacket = Packet<KvCommand, KvQuery>;

enum Delivery {
    Peer { to: NodeId, datagram: Vec<u8> },
    Client { to: SocketAddr, datagram: Vec<u8> },
}

/// Encode as one datagram. Panics if the packet would not fit.
fn datagram(packet: &SimPacket) -> Vec<u8> {
    match codec::encode(packet) {
        Ok(bytes) => bytes,
        Err(err) => panic!("{err}"),
    }
}

pub(crate) struct Sim {
    hosts: BTreeMap<NodeId, Host>,
    in_flight: VecDeque<Delivery>,
    isolated: BTreeSet<NodeId>,
    /// Every leader ever observed, by term.
    leaders: BTreeMap<Term, NodeId>,
}

impl Sim {
    pub(crate) fn new(size: u64) -> Self {
        let ids: Vec<u64> = (1..=size).collect();
        let hosts = ids
            .iter()
            .map(|&id| {
                let id = NodeId::from(id);
                (id, Host::boot(id, cluster_of(&ids)))
            })
            .collect();
        Self {
            hosts,
            in_flight: VecDeque::new(),
            isolated: BTreeSet::new(),
            leaders: BTreeMap::new(),
        }
    }

    /// Start a node outside the cluster that knows only `seeds`.
    pub(crate) fn add(&mut self, id: u64, seeds: &[u64]) {
        let id = NodeId::from(id);
        self.hosts.insert(id, Host::boot(id, cluster_of(seeds)));
    }

    pub(crate) fn node(&self, id: u64) -> &SimNode {
        self.hosts[&NodeId::from(id)]
            .node
            .as_ref()
            .expect("node is down")
    }

    fn live(&self) -> impl Iterator<Item = &SimNode> {
        self.hosts
            .values()
            .filter_map(|host| host.node.as_ref())
            .filter(|node| !node.is_stopped())
    }

    pub(crate) fn leader(&self) -> Option<NodeId> {
        self.live()
            .filter(|node| node.is_leader())
            .max_by_key(|node| node.current_term())
            .map(|node| node.id())
    }

    pub(crate) fn crash(&mut self, id: u64) {
        self.host(id).node = None;
    }

    pub(crate) fn restart(&mut self, id: u64) {
        self.host(id).start(NodeId::from(id));
    }

    pub(crate) fn isolate(&mut self, id: u64) {
        self.isolated.insert(NodeId::from(id));
    }

    pub(crate) fn heal(&mut self, id: u64) {
        self.isolated.remove(&NodeId::from(id));
    }

    /// Let one node's election timer expire, then settle the network.
    pub(crate) fn timeout(&mut self, id: u64) {
        self.host(id).clock.advance(TIMEOUT);
        self.dispatch(NodeId::from(id), Event::Tick);
        self.run();
    }

    /// One replication round from whoever leads, then settle.
    pub(crate) fn heartbeat(&mut self) {
        let ids: Vec<NodeId> = self.hosts.keys().copied().collect();
        for id in ids {
            self.dispatch(id, Event::BroadcastHeartbeat);
        }
        self.run();
    }

    pub(crate) fn request(
        &mut self,
        id: u64,
        request: ClientRequest<KvCommand, KvQuery>,
    ) -> oneshot::Receiver<ClientResponse<KvResult>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            NodeId::from(id),
            Event::Client {
                request,
                reply_to: ReplyTo::Channel(tx),
            },
        );
        self.run();
        rx
    }

    /// Submit a command and run two rounds: one to replicate, one to spread
    /// the new commit index.
    pub(crate) fn command(&mut self, id: u64, command: KvCommand) -> oneshot::Receiver<ClientResponse<KvResult>> {
        let rx = self.request(id, ClientRequest::Command { command });
        self.heartbeat();
        self.heartbeat();
        rx
    }

    pub(crate) fn leave(&mut self, id: u64) {
        self.dispatch(NodeId::from(id), Event::Leave);
        self.run();
    }

    fn host(&mut self, id: u64) -> &mut Host {
        self.hosts.get_mut(&NodeId::from(id)).expect("unknown node")
    }

    fn run(&mut self) {
        let mut steps = 0;
        while let Some(delivery) = self.in_flight.pop_front() {
            steps += 1;
            assert!(steps < MAX_STEPS, "network never settled");
            let (target, bytes) = match delivery {
                Delivery::Peer { to, datagram } => (Some(to), datagram),
                Delivery::Client { to, datagram } => {
                    (self.hosts.keys().copied().find(|&id| addr_of(id) == to), datagram)
                }
            };
            let Some(id) = target.filter(|id| !self.isolated.contains(id)) else {
                continue;
            };
            let event = match codec::decode::<SimPacket>(&bytes).unwrap() {
                Packet::Peer { from, message } => Event::Message { from, message },
                Packet::Client { request } => Event::Client {
                    request,
                    reply_to: ReplyTo::Discard,
                },
            };
            self.dispatch(id, event);
        }
    }

    fn dispatch(&mut self, id: NodeId, event: Event<KvStore>) {
        let Some(node) = self.hosts.get_mut(&id).and_then(|host| host.node.as_mut()) else {
            return;
        };
        let actions = node.dispatch(event).unwrap();

        if node.is_leader() {
            let term = node.current_term();
            let previous = self.leaders.insert(term, id);
            assert!(
                previous.map_or(true, |leader| leader == id),
                "two leaders in {term}: {previous:?} and {id}"
            );
        }

        let cut_off = self.isolated.contains(&id);
        for action in actions {
            match action {
                Action::Send { to, message } if !cut_off && !self.isolated.contains(&to) => {
                    let datagram = datagram(&Packet::Peer { from: id, message });
                    self.in_flight.push_back(Delivery::Peer { to, datagram });
                }
                Action::Forward { to, request } if !cut_off => {
                    let datagram = datagram(&Packet::Client { request });
                    self.in_flight.push_back(Delivery::Client { to, datagram });
                }
                Action::Reply {
                    to: ReplyTo::Channel(tx),
                    response,
                } => {
                    let _ = tx.send(response);
                }
                _ => {}
            }
        }
    }

    /// Two logs holding an entry with the same index and term agree on every
    /// entry up to it, and no committed entry differs between nodes.
    pub(crate) fn check_logs(&self) {
        let nodes: Vec<&SimNode> = self.hosts.values().filter_map(|host| host.node.as_ref()).collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let (a, b) = (a.log(), b.log());
                let first = a.first_index().max(b.first_index());
                let last = a.last_index().min(b.last_index());
                let committed = a.commit_index().min(b.commit_index());

                let mut index = last;
                let mut matched = false;
                while index >= first && index.get() > 0 {
                    let (x, y) = (a.entry_at(index), b.entry_at(index));
                    if !matched && x.map(|e| e.term) == y.map(|e| e.term) {
                        matched = true;
                    }
                    if matched || index <= committed {
                        assert_eq!(x, y, "logs diverge at {index}");
                    }
                    match index.prev() {
                        Some(prev) => index = prev,
                        None => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MAX_LOG_ENTRIES;
    use crate::types::LogIndex;

    fn set(key: &str, value: &str) -> KvCommand {
        KvCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn output(value: Option<&str>) -> ClientResponse<KvResult> {
        ClientResponse::Output {
            output: KvResult::Value(value.map(str::to_string)),
        }
    }

    #[test]
    fn election_safety_across_partitions() {
        let mut sim = Sim::new(5);

        sim.timeout(1);
        assert_eq!(sim.leader(), Some(NodeId::from(1)));

        // The old leader keeps believing it leads while cut off.
        sim.isolate(1);
        sim.timeout(2);
        assert!(sim.node(1).is_leader());
        assert!(sim.node(2).is_leader());
        assert_eq!(sim.node(2).current_term(), Term::from(2));

        sim.heal(1);
        sim.heartbeat();
        assert!(!sim.node(1).is_leader());
        assert_eq!(sim.node(1).current_term(), Term::from(2));
        assert_eq!(sim.leader(), Some(NodeId::from(2)));
        sim.check_logs();
    }

    #[test]
    fn committed_entry_survives_leader_crash() {
        let mut sim = Sim::new(3);
        sim.timeout(1);

        let mut rx = sim.command(1, set("x", "1"));
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientResponse::Output {
                output: KvResult::Ok
            }
        );
        let committed = sim.node(1).log().commit_index();
        assert_eq!(committed, LogIndex::from(2));

        sim.crash(1);
        sim.timeout(2);
        assert_eq!(sim.leader(), Some(NodeId::from(2)));
        sim.heartbeat();

        let entry = sim.node(2).log().entry_at(committed).unwrap();
        assert_eq!(entry.term, Term::from(1));
        assert_eq!(sim.node(2).state_machine().get("x"), Some("1"));

        sim.command(2, set("y", "2"));
        let last = sim.node(2).log().last_index();
        assert_eq!(sim.node(2).log().entry_at(last).unwrap().term, Term::from(2));
        assert_eq!(sim.node(3).state_machine().get("y"), Some("2"));

        // The crashed leader comes back as a follower and catches up.
        sim.restart(1);
        for _ in 0..3 {
            sim.heartbeat();
        }
        assert!(!sim.node(1).is_leader());
        assert_eq!(sim.node(1).state_machine().get("y"), Some("2"));
        sim.check_logs();
    }

    #[test]
    fn node_with_higher_term_deposes_stale_leader() {
        let mut sim = Sim::new(3);
        sim.timeout(1);

        sim.isolate(3);
        for _ in 0..4 {
            sim.timeout(3);
        }
        assert_eq!(sim.node(3).current_term(), Term::from(5));
        assert!(!sim.node(3).is_leader());

        sim.heal(3);
        sim.heartbeat();
        assert_eq!(sim.node(3).current_term(), Term::from(5));
        assert!(!sim.node(1).is_leader());
        assert_eq!(sim.node(1).current_term(), Term::from(5));

        sim.timeout(1);
        assert_eq!(sim.leader(), Some(NodeId::from(1)));
        assert_eq!(sim.node(1).current_term(), Term::from(6));
        sim.check_logs();
    }

    #[test]
    fn isolated_leader_cannot_commit() {
        let mut sim = Sim::new(3);
        sim.timeout(1);

        sim.isolate(1);
        let mut rx = sim.command(1, set("lost", "1"));
        assert!(rx.try_recv().is_err());

        sim.timeout(2);
        sim.command(2, set("kept", "1"));
        sim.heal(1);
        for _ in 0..3 {
            sim.heartbeat();
        }

        // The uncommitted entry was overwritten and its client told to retry.
        assert!(matches!(rx.try_recv(), Ok(ClientResponse::NotLeader { .. })));
        assert_eq!(sim.node(1).state_machine().get("lost"), None);
        assert_eq!(sim.node(1).state_machine().get("kept"), Some("1"));
        sim.check_logs();
    }

    #[test]
    fn joined_node_catches_up_from_snapshot() {
        let mut sim = Sim::new(3);
        sim.timeout(1);

        let count = MAX_LOG_ENTRIES + 10;
        for i in 0..count {
            sim.command(1, set(&format!("k{i}"), &i.to_string()));
        }
        assert!(sim.node(1).log().last_included_index() > LogIndex::default());

        sim.add(4, &[1, 2, 3]);
        let mut rx = sim.request(
            1,
            ClientRequest::Join {
                peer_id: NodeId::from(4),
                peer_address: addr_of(NodeId::from(4)),
            },
        );
        for _ in 0..10 {
            sim.heartbeat();
        }

        let Ok(ClientResponse::Membership { cluster }) = rx.try_recv() else {
            panic!("join was not confirmed");
        };
        assert!(cluster.contains_key(&NodeId::from(4)));
        assert_eq!(sim.node(4).cluster(), &cluster);
        assert_eq!(sim.node(4).state_machine().len(), count);
        assert_eq!(sim.node(4).state_machine().get("k0"), Some("0"));

        let mut rx = sim.request(
            1,
            ClientRequest::Query {
                query: KvQuery::Get { key: "k7".into() },
            },
        );
        assert_eq!(rx.try_recv().unwrap(), output(Some("7")));
        sim.check_logs();
    }

    #[test]
    fn joined_node_catches_up_on_large_values() {
        let mut sim = Sim::new(3);
        sim.timeout(1);

        let value = "v".repeat(1000);
        let count = MAX_LOG_ENTRIES + 10;
        for i in 0..count {
            sim.command(1, set(&format!("k{i}"), &value));
        }
        assert!(sim.node(1).log().last_included_index() > LogIndex::default());

        sim.add(4, &[1, 2, 3]);
        let _rx = sim.request(
            1,
            ClientRequest::Join {
                peer_id: NodeId::from(4),
                peer_address: addr_of(NodeId::from(4)),
            },
        );
        for _ in 0..10 {
            sim.heartbeat();
        }

        let joined = sim.node(4);
        assert!(joined.cluster().contains_key(&NodeId::from(4)));
        assert_eq!(joined.state_machine().len(), count);
        assert_eq!(joined.state_machine().get("k0"), Some(value.as_str()));
        sim.check_logs();
    }

    #[test]
    fn leader_leaves_and_remaining_members_carry_on() {
        let mut sim = Sim::new(3);
        sim.timeout(1);
        sim.command(1, set("a", "1"));

        sim.leave(1);
        sim.heartbeat();
        assert!(sim.node(1).is_stopped());
        let remaining = cluster_of(&[2, 3]);
        assert_eq!(sim.node(2).cluster(), &remaining);
        assert_eq!(sim.node(3).cluster(), &remaining);

        sim.timeout(2);
        assert_eq!(sim.leader(), Some(NodeId::from(2)));
        sim.command(2, set("b", "2"));
        assert_eq!(sim.node(3).state_machine().get("b"), Some("2"));
        sim.check_logs();
    }

    #[test]
    fn follower_leave_reaches_the_leader() {
        let mut sim = Sim::new(3);
        sim.timeout(1);
        sim.heartbeat();

        sim.leave(3);
        sim.heartbeat();
        sim.heartbeat();

        assert!(sim.node(3).is_stopped());
        assert_eq!(sim.node(1).cluster(), &cluster_of(&[1, 2]));
        assert_eq!(sim.node(2).cluster(), &cluster_of(&[1, 2]));
    }
}
