//! Send primitive consumed by the engine.
//!
//! The engine never owns a socket. Callers implement [`Transport`] over
//! whatever unreliable datagram service they have and feed received
//! datagrams back through [`Endpoint`](crate::endpoint::Endpoint).

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Destination of an outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target<P> {
    /// A single peer.
    Peer(P),
    /// Every reachable peer.
    Broadcast,
}

impl<P> Target<P> {
    /// Return the peer for unicast targets.
    #[must_use]
    pub const fn peer(&self) -> Option<&P> {
        match self {
            Self::Peer(peer) => Some(peer),
            Self::Broadcast => None,
        }
    }
}

impl<P: fmt::Display> fmt::Display for Target<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(peer) => write!(f, "{peer}"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Errors reported by a [`Transport`] when a datagram cannot be queued.
///
/// The engine treats every variant as packet loss.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is not reachable.
    #[error("peer unreachable")]
    Unreachable,
    /// The transport cannot accept more datagrams right now.
    #[error("transport queue full")]
    Full,
    /// The transport was shut down.
    #[error("transport closed")]
    Closed,
    /// An I/O error raised by the underlying socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-blocking, unreliable datagram sender.
///
/// Implementations must not block: queue the datagram or fail. Delivery is
/// never assumed; lost datagrams are recovered by retransmission.
pub trait Transport<P>: Send + Sync + 'static {
    /// Hand `datagram` to the network for `target`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the datagram could not be queued.
    fn send(&self, target: &Target<P>, datagram: Bytes) -> Result<(), TransportError>;
}

impl<P, T: Transport<P> + ?Sized> Transport<P> for std::sync::Arc<T> {
    fn send(&self, target: &Target<P>, datagram: Bytes) -> Result<(), TransportError> {
        (**self).send(target, datagram)
    }
}
