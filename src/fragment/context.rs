//! Sans-IO state machine driving reliable delivery of one oversized message.
//!
//! A [`FragmenterContext`] owns a copy of the message, its fragments, and the
//! retransmission schedule. It never touches the network or a clock on its
//! own: callers feed it the current time, acknowledgments, and timer
//! expirations, and it answers with the datagrams to transmit and the
//! terminal outcome. The async [`Outbox`](crate::outbox::Outbox) is one such
//! driver; tests drive it directly with synthetic instants.

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{
    AckBitmap,
    AckMessage,
    DeliveryError,
    FragmentIndex,
    FragmentationConfig,
    FragmentationError,
    MessageId,
    RetransmitBackoff,
    fragmenter::{FragmentFrame, build_fragments},
};
use crate::transport::Target;

#[derive(Debug)]
struct FragmentSlot {
    frame: FragmentFrame,
    datagram: Bytes,
    transmitted: bool,
    acked: bool,
    last_sent: Option<Instant>,
}

/// Lifecycle of a [`FragmenterContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// Fragments are being transmitted and acknowledged.
    Active,
    /// Every fragment was acknowledged.
    Complete,
    /// The retry budget ran out.
    Failed,
    /// The caller abandoned the message.
    Cancelled,
}

/// A datagram the driver should hand to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmission {
    /// Position of the fragment within its message.
    pub index: FragmentIndex,
    /// Encoded fragment, ready for the wire.
    pub datagram: Bytes,
    /// Whether this fragment was sent before.
    pub retransmission: bool,
}

/// Summary of a successfully delivered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Identifier of the delivered message.
    pub message_id: MessageId,
    /// Number of fragments the message was split into.
    pub fragments: usize,
    /// Datagrams handed to the transport, retransmissions included.
    pub transmissions: u64,
    /// Retransmission rounds started after the first.
    pub rounds: u32,
    /// Time from creation to full acknowledgment.
    pub elapsed: Duration,
    /// Mean delay between a fragment's last transmission and its ack.
    ///
    /// Feed this into [`FragmenterContext::with_expected_delay`] for the next
    /// message to the same peer.
    pub mean_ack_delay: Option<Duration>,
}

/// Result of applying an acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack names another message or the context is no longer active.
    Ignored,
    /// The ack carried no new information.
    Unchanged,
    /// New fragments were acknowledged; more remain outstanding.
    Progress {
        /// Number of fragments acknowledged by this ack.
        newly_acked: usize,
    },
    /// The final outstanding fragment was acknowledged.
    Complete(DeliveryReport),
}

/// Result of a retransmission timer expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The context is not active or its deadline has not passed.
    NotDue,
    /// A new round started; call [`FragmenterContext::poll_transmit`].
    Retransmit,
    /// The retry budget is exhausted and the context is torn down.
    Failed(DeliveryError),
}

/// Sender-side state for one outgoing oversized message.
///
/// # Examples
///
/// ```
/// use std::time::Instant;
///
/// use fragmentation::{
///     fragment::{AckBitmap, AckMessage, AckOutcome, FragmentationConfig, FragmenterContext, MessageId},
///     transport::Target,
/// };
///
/// let config = FragmentationConfig { mtu: 512, ..FragmentationConfig::default() };
/// let now = Instant::now();
/// let mut ctx = FragmenterContext::<u8>::new(
///     MessageId::new(1),
///     Target::Peer(9),
///     vec![0_u8; 1025],
///     &config,
///     now,
/// )
/// .expect("valid context");
///
/// assert_eq!(ctx.poll_transmit(now).len(), 3);
/// let ack = AckMessage::new(MessageId::new(1), AckBitmap::full(3));
/// assert!(matches!(ctx.process_ack(&ack, now), AckOutcome::Complete(_)));
/// ```
#[derive(Debug)]
pub struct FragmenterContext<P> {
    message_id: MessageId,
    target: Target<P>,
    slots: Vec<FragmentSlot>,
    window: usize,
    max_rounds: u32,
    backoff: RetransmitBackoff,
    acked: AckBitmap,
    all: AckBitmap,
    state: ContextState,
    deadline: Option<Instant>,
    progressed: bool,
    idle_rounds: u32,
    rounds: u32,
    transmissions: u64,
    created_at: Instant,
    ack_delay_total: Duration,
    ack_delay_samples: u32,
}

impl<P> FragmenterContext<P> {
    /// Split `message` and prepare it for delivery to `target`.
    ///
    /// Nothing is transmitted until [`poll_transmit`](Self::poll_transmit)
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::InvalidConfiguration`] when `config`
    /// fails validation (for example an MTU smaller than the fragment
    /// overhead), [`FragmentationError::MessageTooLarge`] when the message
    /// exceeds `max_message_size`, and
    /// [`FragmentationError::TooManyFragments`] when it needs more fragments
    /// than an acknowledgment can track.
    pub fn new(
        message_id: MessageId,
        target: Target<P>,
        message: impl Into<Bytes>,
        config: &FragmentationConfig,
        now: Instant,
    ) -> Result<Self, FragmentationError> {
        config.validate()?;
        let message = message.into();
        if message.len() > config.max_message_size.get() {
            return Err(FragmentationError::MessageTooLarge {
                len: message.len(),
                limit: config.max_message_size.get(),
            });
        }

        let slots = build_fragments(message_id, &message, config.max_payload())?
            .into_iter()
            .map(|frame| {
                Ok(FragmentSlot {
                    datagram: frame.encode()?,
                    frame,
                    transmitted: false,
                    acked: false,
                    last_sent: None,
                })
            })
            .collect::<Result<Vec<_>, FragmentationError>>()?;

        Ok(Self {
            message_id,
            target,
            all: AckBitmap::full(slots.len()),
            slots,
            window: config.window.get(),
            max_rounds: config.max_rounds,
            backoff: RetransmitBackoff::new(config.retransmit_base, config.retransmit_max),
            acked: AckBitmap::empty(),
            state: ContextState::Active,
            deadline: None,
            progressed: false,
            idle_rounds: 0,
            rounds: 0,
            transmissions: 0,
            created_at: now,
            ack_delay_total: Duration::ZERO,
            ack_delay_samples: 0,
        })
    }

    /// Seed the retransmission timeout with an ack delay observed on an
    /// earlier message, clamped to the configured bounds.
    #[must_use]
    pub fn with_expected_delay(mut self, delay: Duration) -> Self {
        self.backoff = self.backoff.with_base(delay);
        self
    }

    /// Identifier carried by every fragment.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Destination of the message.
    #[must_use]
    pub const fn target(&self) -> &Target<P> { &self.target }

    /// Number of fragments the message was split into.
    #[must_use]
    pub fn fragment_count(&self) -> usize { self.slots.len() }

    /// Fragments acknowledged so far.
    #[must_use]
    pub const fn acked(&self) -> AckBitmap { self.acked }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContextState { self.state }

    /// Whether the context reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.state != ContextState::Active }

    /// Instant at which the current round ends, if one is running.
    #[must_use]
    pub const fn next_deadline(&self) -> Option<Instant> { self.deadline }

    /// Fragments transmitted in the current round and not yet acknowledged.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.transmitted && !slot.acked)
            .count()
    }

    /// Collect the fragments to transmit now.
    ///
    /// Unacknowledged fragments not yet sent in the current round are
    /// returned in increasing offset order until the in-flight window is
    /// full. The first transmission of a round arms the round deadline.
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Transmission> {
        if self.state != ContextState::Active {
            return Vec::new();
        }
        let budget = self.window.saturating_sub(self.in_flight());
        let mut out = Vec::with_capacity(budget.min(self.slots.len()));
        for slot in self
            .slots
            .iter_mut()
            .filter(|slot| !slot.acked && !slot.transmitted)
            .take(budget)
        {
            out.push(Transmission {
                index: slot.frame.header().fragment_index(),
                datagram: slot.datagram.clone(),
                retransmission: slot.last_sent.is_some(),
            });
            slot.transmitted = true;
            slot.last_sent = Some(now);
        }
        if !out.is_empty() && self.deadline.is_none() {
            self.deadline = Some(now + self.backoff.current());
        }
        self.transmissions += out.len() as u64;
        out
    }

    /// Apply a cumulative acknowledgment.
    ///
    /// Bits beyond the message's fragment count are ignored, and replaying an
    /// ack that brings nothing new returns [`AckOutcome::Unchanged`].
    pub fn process_ack(&mut self, ack: &AckMessage, now: Instant) -> AckOutcome {
        if self.state != ContextState::Active || ack.message_id() != self.message_id {
            return AckOutcome::Ignored;
        }
        let newly = ack.received().intersection(self.all).difference(self.acked);
        if newly.is_empty() {
            return AckOutcome::Unchanged;
        }

        for index in newly.iter() {
            let Some(slot) = self.slots.get_mut(index.get() as usize) else {
                continue;
            };
            slot.acked = true;
            if let Some(sent) = slot.last_sent {
                self.ack_delay_total += now.saturating_duration_since(sent);
                self.ack_delay_samples += 1;
            }
        }
        self.acked = AckBitmap::from_bits(self.acked.bits() | newly.bits());
        self.progressed = true;

        if self.acked == self.all {
            self.state = ContextState::Complete;
            self.deadline = None;
            return AckOutcome::Complete(self.report(now));
        }
        AckOutcome::Progress {
            newly_acked: newly.len(),
        }
    }

    /// React to the retransmission timer.
    ///
    /// When the round deadline has passed, a round without new
    /// acknowledgments doubles the timeout and counts towards the retry
    /// budget, while a round with progress resets both. Unacknowledged
    /// fragments become eligible for retransmission.
    pub fn on_timeout(&mut self, now: Instant) -> TimerOutcome {
        if self.state != ContextState::Active {
            return TimerOutcome::NotDue;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return TimerOutcome::NotDue,
        }

        if self.progressed {
            self.idle_rounds = 0;
            self.backoff.reset();
        } else {
            self.idle_rounds += 1;
            if self.idle_rounds >= self.max_rounds {
                self.state = ContextState::Failed;
                self.deadline = None;
                return TimerOutcome::Failed(DeliveryError::Failed {
                    message_id: self.message_id,
                    rounds: self.idle_rounds,
                });
            }
            self.backoff.escalate();
        }

        self.progressed = false;
        self.rounds += 1;
        self.deadline = None;
        for slot in self.slots.iter_mut().filter(|slot| !slot.acked) {
            slot.transmitted = false;
        }
        TimerOutcome::Retransmit
    }

    /// Abandon the message. Further calls become no-ops.
    pub fn cancel(&mut self) {
        if self.state == ContextState::Active {
            self.state = ContextState::Cancelled;
            self.deadline = None;
        }
    }

    /// Snapshot of the delivery statistics so far.
    #[must_use]
    pub fn report(&self, now: Instant) -> DeliveryReport {
        DeliveryReport {
            message_id: self.message_id,
            fragments: self.slots.len(),
            transmissions: self.transmissions,
            rounds: self.rounds,
            elapsed: now.saturating_duration_since(self.created_at),
            mean_ack_delay: self
                .ack_delay_total
                .checked_div(self.ack_delay_samples),
        }
    }
}
