use std::net::SocketAddr;

use crate::runtime::{ReplyTo, StateMachine};
use crate::types::{ClientRequest, ClientResponse, Message, NodeId};

/// Side effects the node asks the server loop to perform once the event that
/// produced them has been persisted.
pub enum Action<S: StateMachine> {
    /// Send a message to a cluster member (possibly this node).
    Send {
        to: NodeId,
        message: Message<S::Command>,
    },
    /// Answer a client request.
    Reply {
        to: ReplyTo<S::Output>,
        response: ClientResponse<S::Output>,
    },
    /// Hand a client request to another node, used by a follower leaving.
    Forward {
        to: SocketAddr,
        request: ClientRequest<S::Command, S::Query>,
    },
    /// Stop the dispatch loop.
    Shutdown,
}

impl<S: StateMachine> std::fmt::Debug for Action<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Send { to, message } => f
                .debug_struct("Send")
                .field("to", to)
                .field("message", message)
                .finish(),
            Action::Reply { to, response } => f
                .debug_struct("Reply")
                .field("to", to)
                .field("response", response)
                .finish(),
            Action::Forward { to, request } => f
                .debug_struct("Forward")
                .field("to", to)
                .field("request", request)
                .finish(),
            Action::Shutdown => f.write_str("Shutdown"),
        }
    }
}
