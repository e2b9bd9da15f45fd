//! Sender service driving one [`FragmenterContext`] per outbound message.
//!
//! [`Outbox::send`] splits a message, registers an acknowledgment route for
//! it, and spawns a task that owns the context. The task reacts to three
//! event sources using a biased `tokio::select!` loop: cancellation first,
//! then acknowledgments, then the retransmission deadline. Acks decoded by
//! the [`Endpoint`](crate::endpoint::Endpoint) reach the task through
//! [`Outbox::handle_ack`], which looks the route up in a sharded
//! [`DashMap`] so unrelated messages never contend on a single lock.

use std::{
    fmt::Debug,
    hash::Hash,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use leaky_bucket::RateLimiter;
use log::{debug, warn};
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    fragment::{
        AckMessage,
        AckOutcome,
        ConfigError,
        DeliveryError,
        DeliveryReport,
        FragmentationConfig,
        FragmentationError,
        FragmenterContext,
        MessageId,
        TimerOutcome,
    },
    metrics::{self, Direction, Outcome},
    transport::{Target, Transport},
};

/// Pending acknowledgments buffered per message before newer ones are
/// dropped. Acks are cumulative, so dropping one under pressure loses
/// nothing a later ack will not repeat.
const ACK_QUEUE_CAPACITY: usize = 8;

/// Targets whose observed ack delay is remembered. The least recently
/// updated target is forgotten first.
const EXPECTED_DELAY_TARGETS: usize = 1024;

type RouteKey<P> = (Target<P>, MessageId);
type DeliveryResult = Result<DeliveryReport, DeliveryError>;

struct OutboxInner<P, T> {
    transport: T,
    config: FragmentationConfig,
    next_message_id: AtomicU32,
    routes: DashMap<RouteKey<P>, mpsc::Sender<AckMessage>>,
    expected_delays: DashMap<Target<P>, (Duration, Instant)>,
    limiter: Option<RateLimiter>,
    shutdown: CancellationToken,
}

/// Handle to an in-flight outbound message.
///
/// The outcome resolves exactly once: with a [`DeliveryReport`] when every
/// fragment is acknowledged, or with a [`DeliveryError`] on failure,
/// cancellation, or shutdown.
#[derive(Debug)]
pub struct DeliveryHandle {
    message_id: MessageId,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryHandle {
    /// Identifier carried by the message's fragments.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Abandon delivery. The outcome resolves with
    /// [`DeliveryError::Cancelled`] unless it already resolved.
    pub fn cancel(&self) { self.cancel.cancel(); }

    /// Token cancelling this delivery, for wiring into caller shutdown logic.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken { self.cancel.clone() }

    /// Wait for the terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns the [`DeliveryError`] that ended delivery.
    /// [`DeliveryError::Aborted`] is reported if the driver task vanished
    /// without an outcome, for example because the runtime shut down.
    pub async fn outcome(self) -> Result<DeliveryReport, DeliveryError> {
        let message_id = self.message_id;
        self.outcome
            .await
            .unwrap_or(Err(DeliveryError::Aborted { message_id }))
    }
}

/// Reliable sender for oversized messages.
///
/// Cloning is cheap; clones share routes, identifiers, and pacing.
pub struct Outbox<P, T> {
    inner: Arc<OutboxInner<P, T>>,
}

impl<P, T> Clone for Outbox<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Eq + Hash, T> Debug for Outbox<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.routes.len())
            .finish_non_exhaustive()
    }
}

impl<P, T> Outbox<P, T>
where
    P: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Transport<P>,
{
    /// Create an outbox that sends through `transport`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` fails validation.
    pub fn new(transport: T, config: FragmentationConfig) -> Result<Self, ConfigError> {
        Self::with_pacing(transport, config, None)
    }

    /// Create an outbox that additionally limits fragment transmissions to
    /// `fragments_per_second` across all messages.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` fails validation.
    pub fn with_pacing(
        transport: T,
        config: FragmentationConfig,
        fragments_per_second: Option<NonZeroUsize>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = fragments_per_second.map(|rate| {
            RateLimiter::builder()
                .initial(rate.get())
                .refill(rate.get())
                .interval(Duration::from_secs(1))
                .max(rate.get())
                .build()
        });
        Ok(Self {
            inner: Arc::new(OutboxInner {
                transport,
                config,
                next_message_id: AtomicU32::new(0),
                routes: DashMap::new(),
                expected_delays: DashMap::new(),
                limiter,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Configuration the outbox applies to new messages.
    #[must_use]
    pub fn config(&self) -> &FragmentationConfig { &self.inner.config }

    /// Number of messages awaiting acknowledgment.
    #[must_use]
    pub fn in_flight(&self) -> usize { self.inner.routes.len() }

    /// Token that aborts every delivery when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.inner.shutdown.clone() }

    /// Abort every in-flight delivery with [`DeliveryError::Aborted`].
    pub fn shutdown(&self) { self.inner.shutdown.cancel(); }

    /// Send `message` to `target` and start its driver task.
    ///
    /// Transmission starts immediately. The returned handle resolves once
    /// the message is fully acknowledged or delivery ends otherwise. When an
    /// earlier message to the same target was delivered, its mean ack delay
    /// seeds the new message's retransmission timeout.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError`] when the message cannot be fragmented.
    /// Nothing is transmitted in that case.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn send(
        &self,
        target: Target<P>,
        message: impl Into<Bytes>,
    ) -> Result<DeliveryHandle, FragmentationError> {
        let message_id = self.allocate_id(&target);
        let mut context = FragmenterContext::new(
            message_id,
            target.clone(),
            message,
            &self.inner.config,
            now(),
        )?;
        if let Some(delay) = self
            .inner
            .expected_delays
            .get(&target)
            .map(|entry| entry.value().0)
        {
            context = context.with_expected_delay(delay);
        }

        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);
        self.inner.routes.insert((target.clone(), message_id), ack_tx);

        let cancel = self.inner.shutdown.child_token();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        debug!(
            "sending message: target={target:?}, message_id={message_id}, fragments={}",
            context.fragment_count()
        );
        let span = tracing::debug_span!("delivery", message_id = message_id.get());
        tokio::spawn(
            drive(
                Arc::clone(&self.inner),
                context,
                ack_rx,
                cancel.clone(),
                outcome_tx,
            )
            .instrument(span),
        );

        Ok(DeliveryHandle {
            message_id,
            cancel,
            outcome: outcome_rx,
        })
    }

    /// Route an acknowledgment received from `from` to its message.
    ///
    /// A unicast message to `from` takes precedence over a broadcast message
    /// with the same identifier. Returns `false` when no live message
    /// matches; such acks are ignored.
    pub fn handle_ack(&self, from: &P, ack: AckMessage) -> bool {
        metrics::inc_acks(Direction::Inbound);
        let message_id = ack.message_id();
        let route = self
            .inner
            .routes
            .get(&(Target::Peer(from.clone()), message_id))
            .or_else(|| self.inner.routes.get(&(Target::Broadcast, message_id)))
            .map(|entry| entry.value().clone());
        let Some(route) = route else {
            debug!("ignoring ack for unknown message: from={from:?}, message_id={message_id}");
            return false;
        };
        if route.try_send(ack).is_err() {
            debug!("ack queue full or closed: from={from:?}, message_id={message_id}");
        }
        true
    }

    fn allocate_id(&self, target: &Target<P>) -> MessageId {
        loop {
            let id = MessageId::new(self.inner.next_message_id.fetch_add(1, Ordering::Relaxed));
            // Skip identifiers still in use after the counter wraps.
            if !self.inner.routes.contains_key(&(target.clone(), id)) {
                return id;
            }
        }
    }
}

/// Current time on the tokio clock, so paused-clock tests control it.
fn now() -> std::time::Instant { time::Instant::now().into_std() }

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Record the ack delay last observed for `target`, forgetting the least
/// recently updated target once `cap` targets are known.
fn remember_delay<P: Clone + Eq + Hash>(
    delays: &DashMap<Target<P>, (Duration, Instant)>,
    target: Target<P>,
    delay: Duration,
    at: Instant,
    cap: usize,
) {
    if delays.len() >= cap && !delays.contains_key(&target) {
        let oldest = delays
            .iter()
            .min_by_key(|entry| entry.value().1)
            .map(|entry| entry.key().clone());
        if let Some(oldest) = oldest {
            delays.remove(&oldest);
        }
    }
    delays.insert(target, (delay, at));
}

/// Hand the due fragments to the transport. Waiting for the pacing limiter
/// is abandoned as soon as `cancel` fires.
async fn transmit<P, T>(
    inner: &OutboxInner<P, T>,
    context: &mut FragmenterContext<P>,
    cancel: &CancellationToken,
) where
    P: Debug,
    T: Transport<P>,
{
    for transmission in context.poll_transmit(now()) {
        if let Some(limiter) = &inner.limiter {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return,
                () = limiter.acquire(1) => {}
            }
        }
        metrics::inc_fragments_sent(1, transmission.retransmission);
        if let Err(err) = inner.transport.send(context.target(), transmission.datagram) {
            warn!(
                "fragment send failed: target={:?}, message_id={}, index={}, error={err}",
                context.target(),
                context.message_id(),
                transmission.index
            );
        }
    }
}

async fn drive<P, T>(
    inner: Arc<OutboxInner<P, T>>,
    mut context: FragmenterContext<P>,
    mut acks: mpsc::Receiver<AckMessage>,
    cancel: CancellationToken,
    outcome_tx: oneshot::Sender<DeliveryResult>,
) where
    P: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Transport<P>,
{
    let message_id = context.message_id();
    let result = loop {
        transmit(&inner, &mut context, &cancel).await;
        let deadline = context.next_deadline();

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                context.cancel();
                break if inner.shutdown.is_cancelled() {
                    Err(DeliveryError::Aborted { message_id })
                } else {
                    Err(DeliveryError::Cancelled { message_id })
                };
            }
            ack = acks.recv() => {
                let Some(ack) = ack else {
                    break Err(DeliveryError::Aborted { message_id });
                };
                if let AckOutcome::Complete(report) = context.process_ack(&ack, now()) {
                    break Ok(report);
                }
            }
            () = sleep_until(deadline) => {
                if let TimerOutcome::Failed(err) = context.on_timeout(now()) {
                    break Err(err);
                }
            }
        }
    };

    inner
        .routes
        .remove(&(context.target().clone(), message_id));
    match &result {
        Ok(report) => {
            debug!(
                "message delivered: target={:?}, message_id={message_id}, transmissions={}, rounds={}",
                context.target(),
                report.transmissions,
                report.rounds
            );
            if let Some(delay) = report.mean_ack_delay {
                remember_delay(
                    &inner.expected_delays,
                    context.target().clone(),
                    delay,
                    now(),
                    EXPECTED_DELAY_TARGETS,
                );
            }
            metrics::inc_messages(Outcome::Delivered);
        }
        Err(DeliveryError::Failed { rounds, .. }) => {
            tracing::error!(
                message_id = message_id.get(),
                rounds,
                "delivery failed: retry budget exhausted"
            );
            metrics::inc_messages(Outcome::Failed);
        }
        Err(err) => {
            debug!("delivery ended: message_id={message_id}, reason={err}");
            metrics::inc_messages(Outcome::Cancelled);
        }
    }
    // The caller may have dropped its handle.
    let _ = outcome_tx.send(result);
}
