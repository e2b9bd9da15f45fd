//! Demultiplexer joining the transport's receive path to the engine.
//!
//! Every datagram received from the network is handed to
//! [`Endpoint::handle_datagram`]. Fragments are queued on the inbox, acks are
//! routed to the outbox, and anything without a known marker is handed back
//! so the caller can pass it to another protocol.

use std::{fmt::Debug, hash::Hash};

use bincode::error::DecodeError;
use bytes::Bytes;
use log::warn;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    fragment::{ConfigError, Datagram, FragmentationConfig, ReassembledMessage, decode_datagram},
    inbox::{InboundFragment, Inbox, InboxError, InboxHandle},
    metrics,
    outbox::Outbox,
    transport::Transport,
};

/// What happened to a received datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A fragment was queued for reassembly.
    Fragment,
    /// An acknowledgment was processed. `routed` is `false` when no live
    /// message matched.
    Ack {
        /// Whether the ack reached an in-flight message.
        routed: bool,
    },
    /// The datagram does not belong to this protocol.
    Passthrough(Bytes),
}

/// Errors raised while handling a received datagram.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The datagram carried a known marker but could not be decoded.
    #[error("malformed datagram: {0}")]
    Malformed(#[from] DecodeError),
    /// The inbox could not accept the fragment.
    #[error(transparent)]
    Inbox(#[from] InboxError),
}

/// Both halves of the engine behind one receive entry point.
pub struct Endpoint<P, T> {
    outbox: Outbox<P, T>,
    inbox: InboxHandle<P>,
}

impl<P: Eq + Hash, T> Debug for Endpoint<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}

impl<P, T> Clone for Endpoint<P, T> {
    fn clone(&self) -> Self {
        Self {
            outbox: self.outbox.clone(),
            inbox: self.inbox.clone(),
        }
    }
}

impl<P, T> Endpoint<P, T>
where
    P: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Transport<P>,
{
    /// Join an existing outbox and inbox.
    #[must_use]
    pub fn new(outbox: Outbox<P, T>, inbox: InboxHandle<P>) -> Self { Self { outbox, inbox } }

    /// Build an outbox and spawn an inbox sharing `transport`.
    ///
    /// Returns the endpoint and the receiver of reassembled messages.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` fails validation.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(
        transport: T,
        config: FragmentationConfig,
    ) -> Result<(Self, mpsc::Receiver<ReassembledMessage<P>>), ConfigError>
    where
        T: Clone,
    {
        let outbox = Outbox::new(transport.clone(), config)?;
        let (inbox, handle, delivered) = Inbox::new(transport, config)?;
        inbox.spawn();
        Ok((Self::new(outbox, handle), delivered))
    }

    /// The sending half.
    #[must_use]
    pub const fn outbox(&self) -> &Outbox<P, T> { &self.outbox }

    /// The receiving half.
    #[must_use]
    pub const fn inbox(&self) -> &InboxHandle<P> { &self.inbox }

    /// Stop both halves.
    pub fn shutdown(&self) {
        self.outbox.shutdown();
        self.inbox.shutdown();
    }

    /// Route one received datagram.
    ///
    /// Never waits: a saturated inbox drops the fragment, which the sender
    /// recovers from by retransmission.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Malformed`] for datagrams that carry a
    /// fragment or ack marker but fail to decode, and
    /// [`EndpointError::Inbox`] when the fragment could not be queued.
    pub fn handle_datagram(&self, from: P, datagram: Bytes) -> Result<Inbound, EndpointError> {
        let decoded = match decode_datagram(&datagram) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("dropping malformed datagram: from={from:?}, error={err}");
                metrics::inc_fragment_malformed();
                return Err(err.into());
            }
        };
        match decoded {
            None => Ok(Inbound::Passthrough(datagram)),
            Some(Datagram::Ack(ack)) => Ok(Inbound::Ack {
                routed: self.outbox.handle_ack(&from, ack),
            }),
            Some(Datagram::Fragment { header, payload }) => {
                let payload = datagram.slice_ref(payload);
                self.inbox.try_submit(InboundFragment {
                    sender: from,
                    header,
                    payload,
                })?;
                Ok(Inbound::Fragment)
            }
        }
    }
}
