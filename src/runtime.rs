use std::fmt::Debug;
use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::{ClientRequest, ClientResponse, Message, NodeId};

/// Application state replicated by the log. Identical command sequences must
/// produce identical state on every node.
pub trait StateMachine {
    type Command: Clone + Debug + Serialize + DeserializeOwned + Send + 'static;
    type Query: Debug + Serialize + DeserializeOwned + Send + 'static;
    type Output: Clone + Debug + Serialize + DeserializeOwned + Send + 'static;

    /// Apply a committed command. Must be deterministic.
    fn apply(&mut self, command: Self::Command) -> Self::Output;

    /// Answer a read-only query from the current state.
    fn query(&self, query: &Self::Query) -> Self::Output;

    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the whole state with a snapshot produced by `snapshot`.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// Where the answer to a client request goes.
pub enum ReplyTo<R> {
    /// A UDP client; the response is sent as a bare datagram.
    Addr(SocketAddr),
    /// An in-process caller such as the HTTP front-end.
    Channel(oneshot::Sender<ClientResponse<R>>),
    /// Nobody is waiting.
    Discard,
}

impl<R> Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyTo::Addr(addr) => write!(f, "Addr({addr})"),
            ReplyTo::Channel(_) => f.write_str("Channel"),
            ReplyTo::Discard => f.write_str("Discard"),
        }
    }
}

/// Everything the dispatch loop reacts to. Events are processed one at a time.
pub enum Event<S: StateMachine> {
    /// Periodic election-timer check.
    Tick,
    /// Periodic trigger for the leader's replication round.
    BroadcastHeartbeat,
    Message {
        from: NodeId,
        message: Message<S::Command>,
    },
    Client {
        request: ClientRequest<S::Command, S::Query>,
        reply_to: ReplyTo<S::Output>,
    },
    /// Leave the cluster and shut down.
    Leave,
}

impl<S: StateMachine> Event<S> {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Tick => "tick",
            Event::BroadcastHeartbeat => "broadcast_heartbeat",
            Event::Message { message, .. } => message.kind(),
            Event::Client { request, .. } => request.kind(),
            Event::Leave => "leave",
        }
    }
}

impl<S: StateMachine> Debug for Event<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Message { from, message } => f
                .debug_struct("Message")
                .field("from", from)
                .field("message", message)
                .finish(),
            Event::Client { request, reply_to } => f
                .debug_struct("Client")
                .field("request", request)
                .field("reply_to", reply_to)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}
