//! Receiver actor owning the [`DefragmenterPool`].
//!
//! The actor is the pool's only writer. It polls a shutdown token, two
//! timers, and the queue of inbound fragments, in that order, using a biased
//! `tokio::select!` loop. The short timer releases coalesced
//! acknowledgments; the periodic sweep expires idle buffers. Acks go straight to the transport;
//! reassembled messages are delivered on a channel.

use std::{fmt::Debug, hash::Hash, time::Duration};

use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    fragment::{
        AckMessage,
        ConfigError,
        DefragmenterPool,
        FragmentHeader,
        FragmentationConfig,
        ReassembledMessage,
        encode_ack_payload,
    },
    metrics::{self, Direction},
    transport::{Target, Transport},
};

/// Default capacity of the inbound fragment queue.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// One decoded fragment awaiting reassembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFragment<P> {
    /// Peer the datagram arrived from.
    pub sender: P,
    /// Decoded fragment header.
    pub header: FragmentHeader,
    /// Fragment payload.
    pub payload: Bytes,
}

/// Errors returned when submitting fragments to a stopped or saturated inbox.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InboxError {
    /// The actor has stopped.
    #[error("inbox closed")]
    Closed,
    /// The inbound queue is full; the fragment is dropped as if lost.
    #[error("inbox queue full")]
    Full,
}

/// Cloneable handle feeding fragments to an [`Inbox`].
#[derive(Debug)]
pub struct InboxHandle<P> {
    tx: mpsc::Sender<InboundFragment<P>>,
    shutdown: CancellationToken,
}

impl<P> Clone for InboxHandle<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<P> InboxHandle<P> {
    /// Queue a fragment, waiting for space.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Closed`] if the actor has stopped.
    pub async fn submit(&self, fragment: InboundFragment<P>) -> Result<(), InboxError> {
        self.tx.send(fragment).await.map_err(|_| InboxError::Closed)
    }

    /// Queue a fragment without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Full`] when the queue is saturated and
    /// [`InboxError::Closed`] if the actor has stopped.
    pub fn try_submit(&self, fragment: InboundFragment<P>) -> Result<(), InboxError> {
        self.tx.try_send(fragment).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => InboxError::Full,
            mpsc::error::TrySendError::Closed(_) => InboxError::Closed,
        })
    }

    /// Stop the actor. Buffered partial messages are discarded.
    pub fn shutdown(&self) { self.shutdown.cancel(); }

    /// Get a clone of the shutdown token used by the actor.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }
}

/// Actor reassembling fragments from every sender.
pub struct Inbox<P, T> {
    pool: DefragmenterPool<P>,
    transport: T,
    rx: mpsc::Receiver<InboundFragment<P>>,
    deliveries: mpsc::Sender<ReassembledMessage<P>>,
    shutdown: CancellationToken,
}

impl<P, T> Inbox<P, T>
where
    P: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Transport<P>,
{
    /// Create an actor with the default queue capacity.
    ///
    /// Returns the actor, a handle for submitting fragments, and the receiver
    /// of reassembled messages.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` fails validation.
    pub fn new(
        transport: T,
        config: FragmentationConfig,
    ) -> Result<(Self, InboxHandle<P>, mpsc::Receiver<ReassembledMessage<P>>), ConfigError> {
        Self::with_capacity(transport, config, DEFAULT_INBOX_CAPACITY)
    }

    /// Create an actor whose fragment and delivery queues hold `capacity`
    /// items.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` fails validation.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(
        transport: T,
        config: FragmentationConfig,
        capacity: usize,
    ) -> Result<(Self, InboxHandle<P>, mpsc::Receiver<ReassembledMessage<P>>), ConfigError> {
        let pool = DefragmenterPool::new(config)?;
        let (tx, rx) = mpsc::channel(capacity);
        let (deliveries, delivered) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let actor = Self {
            pool,
            transport,
            rx,
            deliveries,
            shutdown: shutdown.clone(),
        };
        Ok((actor, InboxHandle { tx, shutdown }, delivered))
    }

    /// Run the actor on a new tokio task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> { tokio::spawn(self.run()) }

    /// Drive the actor until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        let config = *self.pool.config();
        let mut sweep = time::interval(config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ack_flush = time::interval(config.ack_interval.max(Duration::from_millis(1)));
        ack_flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                // Timers come before the queue so sustained inbound load
                // cannot starve them.
                _ = ack_flush.tick() => {
                    let acks = self.pool.flush_acks_at(now());
                    for (sender, ack) in acks {
                        self.send_ack(&sender, ack);
                    }
                }
                _ = sweep.tick() => self.on_sweep(),
                fragment = self.rx.recv() => {
                    let Some(fragment) = fragment else { break };
                    self.on_fragment(fragment).await;
                }
            }
        }
        info!(
            "inbox stopped: discarded {} partial messages",
            self.pool.buffered_len()
        );
    }

    async fn on_fragment(&mut self, fragment: InboundFragment<P>) {
        let InboundFragment {
            sender,
            header,
            payload,
        } = fragment;
        // Malformed and refused fragments are logged and counted by the pool.
        let Ok(processed) = self.pool.process_at(&sender, header, &payload, now()) else {
            return;
        };
        if let Some(ack) = processed.ack {
            self.send_ack(&sender, ack);
        }
        if let Some(message) = processed.delivered
            && self.deliveries.send(message).await.is_err()
        {
            warn!("delivery receiver dropped: sender={sender:?}");
        }
    }

    fn on_sweep(&mut self) {
        let sweep = self.pool.sweep_at(now());
        if !sweep.expired.is_empty() {
            debug!("sweep expired {} partial messages", sweep.expired.len());
        }
        for (sender, ack) in sweep.acks {
            self.send_ack(&sender, ack);
        }
    }

    fn send_ack(&self, sender: &P, ack: AckMessage) {
        let datagram = match encode_ack_payload(ack) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                warn!("failed to encode ack: message_id={}, error={err}", ack.message_id());
                return;
            }
        };
        metrics::inc_acks(Direction::Outbound);
        if let Err(err) = self
            .transport
            .send(&Target::Peer(sender.clone()), datagram)
        {
            warn!(
                "ack send failed: peer={sender:?}, message_id={}, error={err}",
                ack.message_id()
            );
        }
    }
}

fn now() -> std::time::Instant { time::Instant::now().into_std() }
