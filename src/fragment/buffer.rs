//! Receiver-side accumulator for the fragments of one message.

use std::{
    collections::BTreeSet,
    ops::Range,
    time::{Duration, Instant},
};

use super::{
    AckBitmap,
    AckMessage,
    FragmentHeader,
    FragmentStatus,
    MalformedReason,
    MessageId,
    ReceivedRanges,
};

/// Partially received message keyed by `(sender, MessageId)` in the pool.
///
/// The buffer is sized from the total length declared by the first fragment
/// and every later fragment is copied to its declared offset, so arrival
/// order never matters. Bytes that are already covered are never copied
/// twice.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    message_id: MessageId,
    data: Vec<u8>,
    received: ReceivedRanges,
    applied_offsets: BTreeSet<u32>,
    acked: AckBitmap,
    last_activity: Instant,
    last_ack: Option<Instant>,
    ack_pending: bool,
}

impl ReassemblyBuffer {
    /// Allocate a buffer for a message of `total_len` bytes.
    #[must_use]
    pub fn new(message_id: MessageId, total_len: usize, now: Instant) -> Self {
        Self {
            message_id,
            data: vec![0; total_len],
            received: ReceivedRanges::new(),
            applied_offsets: BTreeSet::new(),
            acked: AckBitmap::empty(),
            last_activity: now,
            last_ack: None,
            ack_pending: false,
        }
    }

    /// Identifier of the message being reassembled.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Length of the complete message.
    #[must_use]
    pub fn total_len(&self) -> usize { self.data.len() }

    /// Byte ranges received so far.
    #[must_use]
    pub fn received(&self) -> &ReceivedRanges { &self.received }

    /// Offsets of the fragments whose payload was copied in.
    #[must_use]
    pub fn applied_offsets(&self) -> &BTreeSet<u32> { &self.applied_offsets }

    /// Time the last fragment for this message arrived.
    #[must_use]
    pub const fn last_activity(&self) -> Instant { self.last_activity }

    /// Whether every byte has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.received.is_complete(self.data.len()) }

    /// Whether no fragment arrived within `timeout` of `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// Cumulative acknowledgment describing the current receive state.
    #[must_use]
    pub const fn ack(&self) -> AckMessage { AckMessage::new(self.message_id, self.acked) }

    /// Apply one validated fragment.
    ///
    /// The header must already have passed [`FragmentHeader::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`MalformedReason::TotalLengthMismatch`] when the fragment
    /// declares a different total length than the fragment that created the
    /// buffer. The buffer is left untouched in that case.
    pub fn accept(
        &mut self,
        header: &FragmentHeader,
        payload: &[u8],
        now: Instant,
    ) -> Result<FragmentStatus, MalformedReason> {
        if usize::try_from(header.total_len()).ok() != Some(self.data.len()) {
            return Err(MalformedReason::TotalLengthMismatch {
                expected: self.data.len(),
                found: header.total_len(),
            });
        }
        let range = Self::local_range(header);
        self.last_activity = now;

        let duplicate = self.received.covers(&range);
        if !duplicate {
            self.data[range.clone()].copy_from_slice(payload);
            self.received.insert(range);
            self.applied_offsets.insert(header.offset());
        }
        // A covered range counts as received for acknowledgment purposes even
        // when other fragments supplied the bytes.
        self.acked.insert(header.fragment_index());

        Ok(if self.is_complete() {
            FragmentStatus::Complete
        } else if duplicate {
            FragmentStatus::Duplicate
        } else {
            FragmentStatus::Incomplete
        })
    }

    /// Return an ack if one is due.
    ///
    /// `force` bypasses coalescing. Otherwise an ack is produced only when
    /// `interval` has elapsed since the previous one; a suppressed ack is
    /// remembered and released later by [`flush_ack`](Self::flush_ack).
    pub fn take_ack(&mut self, now: Instant, interval: Duration, force: bool) -> Option<AckMessage> {
        let due = force
            || self
                .last_ack
                .is_none_or(|sent| now.saturating_duration_since(sent) >= interval);
        if due {
            self.last_ack = Some(now);
            self.ack_pending = false;
            Some(self.ack())
        } else {
            self.ack_pending = true;
            None
        }
    }

    /// Release an ack suppressed by coalescing once its interval elapsed.
    pub fn flush_ack(&mut self, now: Instant, interval: Duration) -> Option<AckMessage> {
        if self.ack_pending {
            self.take_ack(now, interval, false)
        } else {
            None
        }
    }

    /// Consume the buffer, returning the reassembled bytes.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> { self.data }

    fn local_range(header: &FragmentHeader) -> Range<usize> {
        // Validated headers end within `total_len`, which fits in `usize`.
        let start = header.offset() as usize;
        start..start + usize::from(header.payload_len())
    }
}
