//! Receiver-side pool of reassembly buffers shared by every sender.
//!
//! [`DefragmenterPool`] keys partial messages by `(sender, MessageId)`,
//! enforces a per-sender and a pool-wide cap on concurrent reassemblies, and
//! remembers recently finished messages so that late duplicates are
//! re-acknowledged instead of delivered twice. Like the sender's
//! [`FragmenterContext`](super::FragmenterContext) it performs no I/O: every
//! operation takes an explicit `now` and returns the acknowledgments the
//! caller must transmit.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    time::{Duration, Instant},
};

use bytes::Bytes;
use log::{debug, warn};

use super::{
    AckBitmap,
    AckMessage,
    CapacityScope,
    FragmentHeader,
    FragmentStatus,
    FragmentationConfig,
    LateFragmentPolicy,
    MalformedReason,
    MessageId,
    ReassemblyBuffer,
    ReassemblyError,
};
use crate::metrics;

/// Retirement records kept per sender before the oldest is forgotten.
const RETIRED_PER_SENDER: usize = 64;

/// Container for a fully reassembled message and the peer that sent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReassembledMessage<P> {
    sender: P,
    message_id: MessageId,
    payload: Bytes,
}

impl<P> ReassembledMessage<P> {
    /// Construct a new [`ReassembledMessage`].
    #[must_use]
    pub fn new(sender: P, message_id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            sender,
            message_id,
            payload: payload.into(),
        }
    }

    /// Peer the fragments arrived from.
    #[must_use]
    pub const fn sender(&self) -> &P { &self.sender }

    /// Identifier shared by the fragments that formed this message.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Borrow the reassembled payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Consume the message, returning the owned payload bytes.
    #[must_use]
    pub fn into_payload(self) -> Bytes { self.payload }
}

/// Why a reassembly buffer was discarded before completing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionReason {
    /// No fragment arrived within the reassembly timeout.
    TimedOut,
    /// The buffer made room for a newer message.
    Capacity(CapacityScope),
}

/// A reassembly buffer discarded before its message completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eviction<P> {
    /// Peer that was sending the message.
    pub sender: P,
    /// Identifier of the abandoned message.
    pub message_id: MessageId,
    /// Why the buffer was discarded.
    pub reason: EvictionReason,
}

/// Everything the caller must act on after feeding one fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Processed<P> {
    /// How the fragment affected its message.
    pub status: FragmentStatus,
    /// Acknowledgment to send back to the fragment's sender.
    pub ack: Option<AckMessage>,
    /// The message completed by this fragment.
    pub delivered: Option<ReassembledMessage<P>>,
    /// A buffer discarded while handling this fragment: evicted to make
    /// room for its message, or its own message found timed out.
    pub evicted: Option<Eviction<P>>,
}

impl<P> Processed<P> {
    fn status(status: FragmentStatus, ack: Option<AckMessage>) -> Self {
        Self {
            status,
            ack,
            delivered: None,
            evicted: None,
        }
    }
}

/// Output of a periodic maintenance pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sweep<P> {
    /// Buffers discarded because they went idle.
    pub expired: Vec<Eviction<P>>,
    /// Coalesced acknowledgments that became due.
    pub acks: Vec<(P, AckMessage)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Retirement {
    Delivered(AckBitmap),
    Abandoned,
}

#[derive(Clone, Copy, Debug)]
struct RetiredMessage {
    retirement: Retirement,
    retired_at: Instant,
}

#[derive(Debug)]
struct SenderState {
    buffers: HashMap<MessageId, ReassemblyBuffer>,
    retired: HashMap<MessageId, RetiredMessage>,
}

impl SenderState {
    fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    fn retire(&mut self, message_id: MessageId, retirement: Retirement, now: Instant) {
        if self.retired.len() >= RETIRED_PER_SENDER
            && !self.retired.contains_key(&message_id)
            && let Some(oldest) = self
                .retired
                .iter()
                .min_by_key(|(_, record)| record.retired_at)
                .map(|(id, _)| *id)
        {
            self.retired.remove(&oldest);
        }
        self.retired.insert(
            message_id,
            RetiredMessage {
                retirement,
                retired_at: now,
            },
        );
    }

    fn is_idle(&self) -> bool { self.buffers.is_empty() && self.retired.is_empty() }

    /// Least recently active buffer, skipping the most recently active one.
    fn eviction_candidate(&self) -> Option<(MessageId, Instant)> {
        let newest = self
            .buffers
            .iter()
            .max_by_key(|(_, buffer)| buffer.last_activity())
            .map(|(id, _)| *id)?;
        self.buffers
            .iter()
            .filter(|(id, _)| **id != newest)
            .map(|(id, buffer)| (*id, buffer.last_activity()))
            .min_by_key(|(_, at)| *at)
    }
}

/// Bounded set of in-progress reassemblies keyed by sender and message.
///
/// # Examples
///
/// ```
/// use std::time::Instant;
///
/// use fragmentation::fragment::{DefragmenterPool, FragmentationConfig, Fragmenter};
///
/// let config = FragmentationConfig { mtu: 512, ..FragmentationConfig::default() };
/// let fragmenter = Fragmenter::for_mtu(config.mtu).expect("valid mtu");
/// let batch = fragmenter.fragment_bytes(vec![7_u8; 1025]).expect("fragment");
///
/// let mut pool = DefragmenterPool::new(config).expect("valid config");
/// let now = Instant::now();
/// let mut delivered = None;
/// for frame in batch {
///     let processed = pool
///         .process_at(&"peer", *frame.header(), frame.payload(), now)
///         .expect("accepted");
///     delivered = delivered.or(processed.delivered);
/// }
/// let message = delivered.expect("message completed");
/// assert_eq!(message.payload(), &[7_u8; 1025][..]);
/// ```
#[derive(Debug)]
pub struct DefragmenterPool<P> {
    config: FragmentationConfig,
    senders: HashMap<P, SenderState>,
    live: usize,
}

impl<P> DefragmenterPool<P>
where
    P: Clone + Eq + Hash + Debug,
{
    /// Create an empty pool.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](super::ConfigError) when `config` fails
    /// validation.
    pub fn new(config: FragmentationConfig) -> Result<Self, super::ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            senders: HashMap::new(),
            live: 0,
        })
    }

    /// Configuration the pool enforces.
    #[must_use]
    pub const fn config(&self) -> &FragmentationConfig { &self.config }

    /// Number of incomplete messages currently buffered.
    #[must_use]
    pub const fn buffered_len(&self) -> usize { self.live }

    /// Number of incomplete messages buffered for `sender`.
    #[must_use]
    pub fn buffered_len_for(&self, sender: &P) -> usize {
        self.senders
            .get(sender)
            .map_or(0, |state| state.buffers.len())
    }

    /// Process a fragment using the current time.
    ///
    /// # Errors
    ///
    /// See [`process_at`](Self::process_at).
    pub fn process(
        &mut self,
        sender: &P,
        header: FragmentHeader,
        payload: &[u8],
    ) -> Result<Processed<P>, ReassemblyError> {
        self.process_at(sender, header, payload, Instant::now())
    }

    /// Process a fragment using an explicit clock reading.
    ///
    /// Fragments may arrive in any order and any number of times. The
    /// returned [`Processed`] carries the acknowledgment to send, if one is
    /// due, and the reassembled message once the final missing bytes arrive.
    /// A message is delivered at most once: duplicates of a completed message
    /// are answered with its full acknowledgment and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::Malformed`] when the header is inconsistent
    /// with itself, with the carried payload, with the configured message
    /// ceiling, or with earlier fragments of the same message. Returns
    /// [`ReassemblyError::CapacityExceeded`] when the fragment starts a new
    /// message and no buffer can be evicted to make room. Errors never
    /// modify other buffers.
    pub fn process_at(
        &mut self,
        sender: &P,
        header: FragmentHeader,
        payload: &[u8],
        now: Instant,
    ) -> Result<Processed<P>, ReassemblyError> {
        let message_id = header.message_id();
        if let Err(reason) = self.check_header(&header, payload.len()) {
            return Err(Self::malformed(sender, message_id, reason));
        }

        let expired = self.expire_stale(sender, message_id, now);
        if let Some(mut processed) = self.handle_retired(sender, message_id, now) {
            processed.evicted = expired;
            return Ok(processed);
        }

        let created = !self.has_buffer(sender, message_id);
        let evicted = if created {
            self.make_room(sender, message_id)?
        } else {
            None
        };

        let ack_interval = self.config.ack_interval;
        let state = self
            .senders
            .entry(sender.clone())
            .or_insert_with(SenderState::new);
        let buffer = state.buffers.entry(message_id).or_insert_with(|| {
            // Validated headers declare at most `max_message_size` bytes.
            ReassemblyBuffer::new(message_id, header.total_len() as usize, now)
        });
        if created {
            debug!(
                "started reassembly: sender={sender:?}, message_id={message_id}, total_len={}",
                header.total_len()
            );
        }

        let status = buffer
            .accept(&header, payload, now)
            .map_err(|reason| Self::malformed(sender, message_id, reason))?;
        metrics::inc_fragment_received(status);

        let mut processed = Processed::status(status, None);
        if status == FragmentStatus::Complete {
            if let Some(done) = state.buffers.remove(&message_id) {
                let ack = done.ack();
                state.retire(message_id, Retirement::Delivered(ack.received()), now);
                debug!(
                    "reassembled message: sender={sender:?}, message_id={message_id}, len={}",
                    done.total_len()
                );
                metrics::inc_messages_reassembled();
                processed.ack = Some(ack);
                processed.delivered = Some(ReassembledMessage::new(
                    sender.clone(),
                    message_id,
                    done.into_payload(),
                ));
            }
        } else {
            processed.ack = buffer.take_ack(now, ack_interval, false);
        }
        processed.evicted = evicted.or(expired);
        self.live = self.count_live();
        Ok(processed)
    }

    /// Remove buffers that went idle for the reassembly timeout using the
    /// current time.
    pub fn purge_expired(&mut self) -> Vec<Eviction<P>> { self.purge_expired_at(Instant::now()) }

    /// Remove buffers that went idle for the reassembly timeout and forget
    /// retirement records of the same age.
    ///
    /// Returns the evicted messages. Their partial data is never delivered.
    pub fn purge_expired_at(&mut self, now: Instant) -> Vec<Eviction<P>> {
        let timeout = self.config.reassembly_timeout;
        let mut expired = Vec::new();

        for (sender, state) in &mut self.senders {
            let stale: Vec<MessageId> = state
                .buffers
                .iter()
                .filter(|(_, buffer)| buffer.is_expired(now, timeout))
                .map(|(id, _)| *id)
                .collect();
            for message_id in stale {
                state.buffers.remove(&message_id);
                state.retire(message_id, Retirement::Abandoned, now);
                debug!("reassembly timed out: sender={sender:?}, message_id={message_id}");
                metrics::inc_reassembly_evicted(EvictionReason::TimedOut);
                expired.push(Eviction {
                    sender: sender.clone(),
                    message_id,
                    reason: EvictionReason::TimedOut,
                });
            }
            state
                .retired
                .retain(|_, record| now.saturating_duration_since(record.retired_at) < timeout);
        }
        self.senders.retain(|_, state| !state.is_idle());
        self.live = self.count_live();
        expired
    }

    /// Collect coalesced acknowledgments that became due.
    pub fn flush_acks_at(&mut self, now: Instant) -> Vec<(P, AckMessage)> {
        let interval = self.config.ack_interval;
        self.senders
            .iter_mut()
            .flat_map(|(sender, state)| {
                state
                    .buffers
                    .values_mut()
                    .filter_map(|buffer| buffer.flush_ack(now, interval))
                    .map(|ack| (sender.clone(), ack))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Run both maintenance passes.
    pub fn sweep_at(&mut self, now: Instant) -> Sweep<P> {
        let expired = self.purge_expired_at(now);
        let acks = self.flush_acks_at(now);
        Sweep { expired, acks }
    }

    fn check_header(&self, header: &FragmentHeader, carried: usize) -> Result<(), MalformedReason> {
        header.validate(carried)?;
        let limit = self.config.max_message_size;
        if !usize::try_from(header.total_len()).is_ok_and(|total| total <= limit.get()) {
            return Err(MalformedReason::MessageTooLarge {
                total_len: header.total_len(),
                limit,
            });
        }
        Ok(())
    }

    /// Time out the buffer for `message_id` if it went idle, as the sweep
    /// would have, so a fragment arriving before the next sweep cannot
    /// complete it.
    fn expire_stale(
        &mut self,
        sender: &P,
        message_id: MessageId,
        now: Instant,
    ) -> Option<Eviction<P>> {
        let timeout = self.config.reassembly_timeout;
        let state = self.senders.get_mut(sender)?;
        if !state.buffers.get(&message_id)?.is_expired(now, timeout) {
            return None;
        }
        state.buffers.remove(&message_id);
        state.retire(message_id, Retirement::Abandoned, now);
        self.live = self.count_live();
        debug!("reassembly timed out: sender={sender:?}, message_id={message_id}");
        metrics::inc_reassembly_evicted(EvictionReason::TimedOut);
        Some(Eviction {
            sender: sender.clone(),
            message_id,
            reason: EvictionReason::TimedOut,
        })
    }

    fn malformed(sender: &P, message_id: MessageId, reason: MalformedReason) -> ReassemblyError {
        warn!("dropping malformed fragment: sender={sender:?}, message_id={message_id}, reason={reason}");
        metrics::inc_fragment_malformed();
        ReassemblyError::Malformed { message_id, reason }
    }

    fn has_buffer(&self, sender: &P, message_id: MessageId) -> bool {
        self.senders
            .get(sender)
            .is_some_and(|state| state.buffers.contains_key(&message_id))
    }

    fn count_live(&self) -> usize { self.senders.values().map(|state| state.buffers.len()).sum() }

    /// Answer fragments of retired messages without touching live buffers.
    fn handle_retired(
        &mut self,
        sender: &P,
        message_id: MessageId,
        now: Instant,
    ) -> Option<Processed<P>> {
        let state = self.senders.get_mut(sender)?;
        let record = *state.retired.get(&message_id)?;
        let expired = now.saturating_duration_since(record.retired_at) >= self.config.reassembly_timeout;
        match record.retirement {
            _ if expired => {
                state.retired.remove(&message_id);
                None
            }
            Retirement::Delivered(received) => {
                metrics::inc_fragment_received(FragmentStatus::Duplicate);
                Some(Processed::status(
                    FragmentStatus::Duplicate,
                    Some(AckMessage::new(message_id, received)),
                ))
            }
            Retirement::Abandoned => match self.config.late_fragment_policy {
                LateFragmentPolicy::Drop => {
                    debug!("dropping fragment of retired message: sender={sender:?}, message_id={message_id}");
                    metrics::inc_fragment_received(FragmentStatus::Retired);
                    Some(Processed::status(FragmentStatus::Retired, None))
                }
                LateFragmentPolicy::StartFresh => {
                    state.retired.remove(&message_id);
                    None
                }
            },
        }
    }

    /// Evict buffers until a new message from `sender` fits both caps.
    fn make_room(
        &mut self,
        sender: &P,
        message_id: MessageId,
    ) -> Result<Option<Eviction<P>>, ReassemblyError> {
        let per_sender = self.config.per_sender_cap;
        let mut evicted = None;

        if self.buffered_len_for(sender) >= per_sender.get() {
            let candidate = self
                .senders
                .get(sender)
                .and_then(SenderState::eviction_candidate);
            let Some((victim, _)) = candidate else {
                return Err(Self::refuse(sender, message_id, CapacityScope::PerSender, per_sender));
            };
            evicted = Some(self.evict(sender, victim, CapacityScope::PerSender));
        }

        let global = self.config.global_cap;
        if self.live >= global.get() {
            let Some((victim_sender, victim)) = self.global_candidate() else {
                return Err(Self::refuse(sender, message_id, CapacityScope::Global, global));
            };
            evicted = Some(self.evict(&victim_sender, victim, CapacityScope::Global));
        }
        Ok(evicted)
    }

    fn global_candidate(&self) -> Option<(P, MessageId)> {
        let all = || {
            self.senders.iter().flat_map(|(sender, state)| {
                state
                    .buffers
                    .iter()
                    .map(move |(id, buffer)| (sender, *id, buffer.last_activity()))
            })
        };
        let (newest_sender, newest_id, _) = all().max_by_key(|(_, _, at)| *at)?;
        all()
            .filter(|(sender, id, _)| !(*sender == newest_sender && *id == newest_id))
            .min_by_key(|(_, _, at)| *at)
            .map(|(sender, id, _)| (sender.clone(), id))
    }

    fn evict(&mut self, sender: &P, message_id: MessageId, scope: CapacityScope) -> Eviction<P> {
        let now = self
            .senders
            .get(sender)
            .and_then(|state| state.buffers.get(&message_id))
            .map(ReassemblyBuffer::last_activity);
        if let Some(state) = self.senders.get_mut(sender) {
            state.buffers.remove(&message_id);
            if let Some(at) = now {
                state.retire(message_id, Retirement::Abandoned, at);
            }
        }
        self.live = self.count_live();
        debug!("evicted reassembly for capacity: sender={sender:?}, message_id={message_id}, scope={scope}");
        metrics::inc_reassembly_evicted(EvictionReason::Capacity(scope));
        Eviction {
            sender: sender.clone(),
            message_id,
            reason: EvictionReason::Capacity(scope),
        }
    }

    fn refuse(
        sender: &P,
        message_id: MessageId,
        scope: CapacityScope,
        limit: std::num::NonZeroUsize,
    ) -> ReassemblyError {
        warn!("refusing new reassembly: sender={sender:?}, message_id={message_id}, scope={scope}, limit={limit}");
        ReassemblyError::CapacityExceeded {
            message_id,
            scope,
            limit,
        }
    }
}

impl<P> DefragmenterPool<P> {
    /// How long a retired message id is remembered.
    #[must_use]
    pub const fn retirement_window(&self) -> Duration { self.config.reassembly_timeout }
}
