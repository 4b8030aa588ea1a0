use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::{self, CodecError, MAX_DATAGRAM};
use crate::runtime::{Event, ReplyTo, StateMachine};
use crate::types::{ClientRequest, ClientResponse, Cluster, Message, NodeId, Packet};

/// How long blocking socket and channel reads wait before checking shutdown.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("sender worker has stopped")]
    Closed,
}

/// An encoded datagram waiting for the sender worker.
pub struct Outbound {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Outbound half of the UDP transport, used by the dispatch loop.
///
/// Messages are JSON datagrams: `Packet`s towards nodes, bare
/// `ClientResponse`s towards clients. Delivery is fire-and-forget; Raft
/// tolerates loss, duplication and reordering, and retries on its own
/// schedule.
pub struct Transmitter<S: StateMachine> {
    local_id: NodeId,
    loopback: SyncSender<Event<S>>,
    outbound: mpsc::Sender<Outbound>,
}

impl<S: StateMachine> Transmitter<S> {
    pub fn new(local_id: NodeId, loopback: SyncSender<Event<S>>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            local_id,
            loopback,
            outbound,
        }
    }

    /// Send a message to a cluster member. Messages to self go straight back
    /// into the event queue; unknown members are dropped.
    pub fn send_message(
        &self,
        cluster: &Cluster,
        to: NodeId,
        message: Message<S::Command>,
    ) -> Result<(), TransportError> {
        if to == self.local_id {
            let event = Event::Message {
                from: self.local_id,
                message,
            };
            if let Err(TrySendError::Full(_)) = self.loopback.try_send(event) {
                warn!(node = %self.local_id, "event queue full, dropping loopback message");
            }
            return Ok(());
        }

        let Some(&addr) = cluster.get(&to) else {
            warn!(node = %self.local_id, peer = %to, kind = message.kind(), "no address for peer, dropping message");
            return Ok(());
        };
        let packet: Packet<S::Command, S::Query> = Packet::Peer {
            from: self.local_id,
            message,
        };
        self.enqueue(addr, &packet)
    }

    /// Deliver a client response.
    pub fn reply(&self, to: ReplyTo<S::Output>, response: ClientResponse<S::Output>) -> Result<(), TransportError> {
        match to {
            ReplyTo::Addr(addr) => self.enqueue(addr, &response),
            ReplyTo::Channel(tx) => {
                // The caller may have given up waiting.
                let _ = tx.send(response);
                Ok(())
            }
            ReplyTo::Discard => Ok(()),
        }
    }

    /// Send a client request to another node as if this node were a client.
    pub fn forward(
        &self,
        to: SocketAddr,
        request: ClientRequest<S::Command, S::Query>,
    ) -> Result<(), TransportError> {
        let packet: Packet<S::Command, S::Query> = Packet::Client { request };
        self.enqueue(to, &packet)
    }

    fn enqueue<T: Serialize>(&self, to: SocketAddr, value: &T) -> Result<(), TransportError> {
        let bytes = codec::encode(value)?;
        self.outbound
            .send(Outbound { to, bytes })
            .map_err(|_| TransportError::Closed)
    }
}

/// Receive datagrams on `socket` and turn them into events until shutdown.
/// The socket needs a read timeout so the shutdown flag is observed.
/// Malformed datagrams are logged and dropped.
pub fn receiver_loop<S: StateMachine>(
    socket: &UdpSocket,
    events: &SyncSender<Event<S>>,
    shutdown: &AtomicBool,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if is_timeout(&err) => continue,
            // ICMP errors from earlier sends surface here on some platforms.
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(err) => return Err(err.into()),
        };

        let event = match codec::decode::<Packet<S::Command, S::Query>>(&buf[..len]) {
            Ok(Packet::Peer { from, message }) => Event::Message { from, message },
            Ok(Packet::Client { request }) => Event::Client {
                request,
                reply_to: ReplyTo::Addr(src),
            },
            Err(err) => {
                warn!(%src, len, error = %err, "dropping malformed datagram");
                continue;
            }
        };
        // Network events are never dropped by the queue; wait for room.
        if events.send(event).is_err() {
            debug!("event queue closed, receiver exiting");
            return Ok(());
        }
    }
    Ok(())
}

/// Send queued datagrams from `socket` until shutdown. Datagrams queued
/// before shutdown are still flushed.
pub fn sender_loop(
    socket: &UdpSocket,
    outbound: &mpsc::Receiver<Outbound>,
    shutdown: &AtomicBool,
) -> Result<(), TransportError> {
    loop {
        match outbound.recv_timeout(POLL_INTERVAL) {
            Ok(Outbound { to, bytes }) => {
                if let Err(err) = socket.send_to(&bytes, to) {
                    warn!(%to, error = %err, "send failed");
                }
            }
            Err(RecvTimeoutError::Timeout) if shutdown.load(Ordering::Relaxed) => return Ok(()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// An unbound socket for outgoing datagrams, in the address family of `like`.
pub fn ephemeral_socket(like: SocketAddr) -> io::Result<UdpSocket> {
    let any: SocketAddr = if like.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    UdpSocket::bind(any)
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
