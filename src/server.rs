use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::client::{Client, ClientError};
use crate::config::Config;
use crate::error::Error;
use crate::node::Node;
use crate::runtime::{Event, ReplyTo, StateMachine};
use crate::storage::{Persistence, StorageError};
use crate::timer::RandomTimer;
use crate::transport::{self, Outbound, Transmitter, TransportError, POLL_INTERVAL};
use crate::types::{ClientRequest, ClientResponse, NodeId};
use crate::worker::{self, sleep_unless};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("engine: {0}")]
    Engine(Error),
    #[error("client: {0}")]
    Client(#[from] ClientError),
    #[error("config: {0}")]
    Config(String),
    #[error("join: {0}")]
    Join(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        match err {
            Error::Storage(err) => ServerError::Storage(err),
            other => ServerError::Engine(other),
        }
    }
}

/// Why a request could not be queued.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("event queue is full")]
    Full,
    #[error("server has stopped")]
    Closed,
}

/// A running Raft node: one dispatch loop fed by a bounded event queue, with
/// ticks, heartbeats and UDP traffic produced by supervised worker threads.
pub struct Server<S: StateMachine, P: Persistence<S::Command>> {
    node: Node<S, P>,
    config: Config,
    socket: UdpSocket,
    local_addr: SocketAddr,
    events: Receiver<Event<S>>,
    events_tx: SyncSender<Event<S>>,
    transmitter: Transmitter<S>,
    outbound: Receiver<Outbound>,
    shutdown: Arc<AtomicBool>,
}

impl<S, P> Server<S, P>
where
    S: StateMachine + 'static,
    P: Persistence<S::Command>,
{
    /// Bind the UDP socket and restore the node from `persistence`.
    pub fn start(config: Config, state_machine: S, persistence: P) -> Result<Self, ServerError> {
        config.validate()?;

        let socket = UdpSocket::bind(config.addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        let node = Node::new(
            config.id,
            config.bootstrap_cluster(local_addr),
            state_machine,
            persistence,
            Box::new(RandomTimer::new(config.tick)),
        )?;

        let (events_tx, events) = mpsc::sync_channel(config.queue_capacity);
        let (outbound_tx, outbound) = mpsc::channel();
        let transmitter = Transmitter::new(config.id, events_tx.clone(), outbound_tx);

        info!(node = %config.id, addr = %local_addr, members = node.cluster().len(), "listening");

        Ok(Self {
            node,
            config,
            socket,
            local_addr,
            events,
            events_tx,
            transmitter,
            outbound,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node(&self) -> &Node<S, P> {
        &self.node
    }

    /// A handle for submitting requests from other threads.
    pub fn handle(&self) -> ServerHandle<S> {
        ServerHandle::new(self.events_tx.clone())
    }

    /// Run until the node leaves the cluster or a write to stable storage
    /// fails. Workers are stopped and joined before returning.
    pub fn run(self) -> Result<(), ServerError> {
        let Server {
            mut node,
            config,
            socket,
            local_addr,
            events,
            events_tx,
            transmitter,
            outbound,
            shutdown,
        } = self;

        let workers = spawn_workers(&config, socket, local_addr, &events_tx, outbound, &shutdown)?;
        drop(events_tx);

        let result = dispatch_loop(&mut node, &events, &transmitter, config.tick);

        shutdown.store(true, Ordering::Relaxed);
        // Unblock a receiver waiting on a full queue.
        drop(events);
        drop(transmitter);
        for handle in workers {
            if handle.join().is_err() {
                error!(node = %config.id, "worker panicked");
            }
        }
        info!(node = %config.id, "stopped");
        result
    }
}

fn spawn_workers<S: StateMachine + 'static>(
    config: &Config,
    socket: UdpSocket,
    local_addr: SocketAddr,
    events: &SyncSender<Event<S>>,
    outbound: Receiver<Outbound>,
    shutdown: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>, ServerError> {
    let mut workers = Vec::new();

    let (tx, flag, tick) = (events.clone(), Arc::clone(shutdown), config.tick);
    workers.push(worker::spawn("tick", Arc::clone(shutdown), move || {
        periodic(&tx, &flag, tick, || Event::Tick)
    })?);

    let (tx, flag, interval) = (events.clone(), Arc::clone(shutdown), config.heartbeat_interval);
    workers.push(worker::spawn("heartbeat", Arc::clone(shutdown), move || {
        periodic(&tx, &flag, interval, || Event::BroadcastHeartbeat)
    })?);

    let (tx, flag) = (events.clone(), Arc::clone(shutdown));
    workers.push(worker::spawn("receiver", Arc::clone(shutdown), move || {
        transport::receiver_loop(&socket, &tx, &flag)
    })?);

    let sender = transport::ephemeral_socket(local_addr)?;
    let flag = Arc::clone(shutdown);
    workers.push(worker::spawn("sender", Arc::clone(shutdown), move || {
        transport::sender_loop(&sender, &outbound, &flag)
    })?);

    if config.join {
        let seeds: Vec<SocketAddr> = config.peers.values().copied().collect();
        let (id, flag) = (config.id, Arc::clone(shutdown));
        workers.push(worker::spawn("join", Arc::clone(shutdown), move || {
            join_once::<S>(&seeds, id, local_addr, &flag)
        })?);
    }

    Ok(workers)
}

/// Feed `make()` into the queue every `interval`. Periodic events are
/// dropped when the queue is full; the next one will do.
fn periodic<S: StateMachine>(
    events: &SyncSender<Event<S>>,
    shutdown: &AtomicBool,
    interval: Duration,
    make: impl Fn() -> Event<S>,
) -> Result<(), TransportError> {
    loop {
        sleep_unless(shutdown, interval);
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        match events.try_send(make()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!(event = event.kind(), "event queue full, dropping"),
            Err(TrySendError::Disconnected(_)) => return Ok(()),
        }
    }
}

/// Ask the cluster to add this node. An error makes the supervisor retry.
fn join_once<S: StateMachine>(
    seeds: &[SocketAddr],
    id: NodeId,
    addr: SocketAddr,
    shutdown: &AtomicBool,
) -> Result<(), ServerError> {
    if shutdown.load(Ordering::Relaxed) {
        return Ok(());
    }
    match Client::<S>::new(seeds.to_vec()).join(id, addr)? {
        Some(ClientResponse::Membership { cluster }) if cluster.contains_key(&id) => {
            info!(node = %id, members = cluster.len(), "joined cluster");
            Ok(())
        }
        Some(other) => Err(ServerError::Join(format!("unexpected answer: {other:?}"))),
        None => Err(ServerError::Join("no answer from the cluster".into())),
    }
}

/// Process events one at a time until the node shuts down. Persistence
/// failures end the loop; anything else is logged and the loop carries on.
fn dispatch_loop<S, P>(
    node: &mut Node<S, P>,
    events: &Receiver<Event<S>>,
    transmitter: &Transmitter<S>,
    tick: Duration,
) -> Result<(), ServerError>
where
    S: StateMachine,
    P: Persistence<S::Command>,
{
    while let Ok(event) = events.recv() {
        let actions = match node.dispatch(event) {
            Ok(actions) => actions,
            Err(Error::Storage(err)) => {
                error!(node = %node.id(), error = %err, "persistence failed");
                return Err(err.into());
            }
            Err(err) => {
                warn!(node = %node.id(), error = %err, "event failed");
                continue;
            }
        };

        let mut stop = false;
        for action in actions {
            let result = match action {
                Action::Send { to, message } => transmitter.send_message(node.cluster(), to, message),
                Action::Reply { to, response } => transmitter.reply(to, response),
                Action::Forward { to, request } => transmitter.forward(to, request),
                Action::Shutdown => {
                    stop = true;
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!(node = %node.id(), error = %err, "action failed");
            }
        }

        let ticks_left = node
            .seconds_until_timeout()
            .map(|left| left.as_secs_f64() / tick.as_secs_f64());
        debug!(
            node = %node.id(),
            role = node.role().name(),
            term = %node.current_term(),
            members = node.cluster().len(),
            commit = %node.log().commit_index(),
            ticks_left = ?ticks_left,
            "status"
        );

        if stop {
            info!(node = %node.id(), "left the cluster");
            return Ok(());
        }
    }
    Ok(())
}

/// Cloneable handle to a server's event queue.
pub struct ServerHandle<S: StateMachine> {
    events: SyncSender<Event<S>>,
}

impl<S: StateMachine> Clone for ServerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<S: StateMachine> ServerHandle<S> {
    pub(crate) fn new(events: SyncSender<Event<S>>) -> Self {
        Self { events }
    }

    /// Queue a request, waiting for room. The response arrives on the
    /// returned channel, or the channel closes if the server stops first.
    pub fn submit(
        &self,
        request: ClientRequest<S::Command, S::Query>,
    ) -> Result<oneshot::Receiver<ClientResponse<S::Output>>, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Client {
                request,
                reply_to: ReplyTo::Channel(tx),
            })
            .map_err(|_| SubmitError::Closed)?;
        Ok(rx)
    }

    /// Queue a request without waiting; fails when the queue is full.
    pub fn try_submit(
        &self,
        request: ClientRequest<S::Command, S::Query>,
    ) -> Result<oneshot::Receiver<ClientResponse<S::Output>>, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .try_send(Event::Client {
                request,
                reply_to: ReplyTo::Channel(tx),
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => SubmitError::Full,
                TrySendError::Disconnected(_) => SubmitError::Closed,
            })?;
        Ok(rx)
    }

    /// Ask the node to leave the cluster and shut down.
    pub fn leave(&self) -> Result<(), SubmitError> {
        self.events.send(Event::Leave).map_err(|_| SubmitError::Closed)
    }
}
