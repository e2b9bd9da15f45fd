//! Outbound helper that splits logical messages into transport fragments.
//!
//! [`Fragmenter`] chunks a message into fixed-size fragments, tagging each
//! with a [`FragmentHeader`] that records the fragment's offset within the
//! original message. It performs no acknowledgment tracking; reliable
//! delivery is layered on top by [`FragmenterContext`](super::FragmenterContext).
//! The struct allocates [`MessageId`] values internally so callers can
//! request chunking without worrying about identifier collisions.

use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU32, Ordering},
};

use bytes::Bytes;

use super::{
    ConfigError,
    FragmentFlags,
    FragmentHeader,
    FragmentIndex,
    FragmentationError,
    MAX_FRAGMENTS,
    MessageId,
    encode_fragment_payload,
    max_payload_for_mtu,
};

/// Splits logical messages into fragment-sized frames.
#[derive(Debug)]
pub struct Fragmenter {
    max_payload: NonZeroUsize,
    next_message_id: AtomicU32,
}

impl Fragmenter {
    /// Create a fragmenter that caps fragment payloads at `max_payload` bytes.
    ///
    /// # Panics
    ///
    /// Debug builds panic when `max_payload` exceeds `u16::MAX`, the largest
    /// payload a [`FragmentHeader`] can describe. Use
    /// [`for_mtu`](Self::for_mtu) to derive a checked value.
    #[must_use]
    pub const fn new(max_payload: NonZeroUsize) -> Self {
        Self::with_starting_id(max_payload, MessageId::new(0))
    }

    /// Create a fragmenter starting from a specific [`MessageId`].
    #[must_use]
    pub const fn with_starting_id(max_payload: NonZeroUsize, start_at: MessageId) -> Self {
        debug_assert!(max_payload.get() <= u16::MAX as usize);
        Self {
            max_payload,
            next_message_id: AtomicU32::new(start_at.get()),
        }
    }

    /// Create a fragmenter whose encoded fragments fit within `mtu` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MtuTooSmall`] or [`ConfigError::MtuTooLarge`]
    /// when `mtu` cannot be used.
    pub fn for_mtu(mtu: usize) -> Result<Self, ConfigError> {
        Ok(Self::new(max_payload_for_mtu(mtu)?))
    }

    /// Return the maximum fragment payload size in bytes.
    #[must_use]
    pub const fn max_payload(&self) -> NonZeroUsize { self.max_payload }

    /// Generate and return the next [`MessageId`].
    ///
    /// Identifiers wrap after `u32::MAX`; a wrapped identifier only collides
    /// with a message that is still being reassembled after four billion
    /// newer messages, which the receiver's timeout rules out.
    #[must_use]
    pub fn next_message_id(&self) -> MessageId {
        MessageId::new(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Split `payload` into fragments, generating a fresh [`MessageId`].
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::MessageTooLarge`] when the payload length
    /// does not fit a header, or [`FragmentationError::TooManyFragments`] when
    /// more than [`MAX_FRAGMENTS`] fragments would be required.
    pub fn fragment_bytes(
        &self,
        payload: impl Into<Bytes>,
    ) -> Result<FragmentBatch, FragmentationError> {
        let message_id = self.next_message_id();
        self.fragment_with_id(message_id, payload)
    }

    /// Split `payload` into fragments, tagging them with `message_id`.
    ///
    /// # Errors
    ///
    /// See [`fragment_bytes`](Self::fragment_bytes).
    pub fn fragment_with_id(
        &self,
        message_id: MessageId,
        payload: impl Into<Bytes>,
    ) -> Result<FragmentBatch, FragmentationError> {
        let fragments = build_fragments(message_id, &payload.into(), self.max_payload)?;
        Ok(FragmentBatch::new(message_id, fragments))
    }
}

/// Compute the fragments of `payload`, sharing its storage.
pub(crate) fn build_fragments(
    message_id: MessageId,
    payload: &Bytes,
    max_payload: NonZeroUsize,
) -> Result<Vec<FragmentFrame>, FragmentationError> {
    let total = payload.len();
    let total_len = u32::try_from(total).map_err(|_| FragmentationError::MessageTooLarge {
        len: total,
        limit: u32::MAX as usize,
    })?;
    let max = max_payload.get();
    let required = total.div_ceil(max).max(1);
    if required > MAX_FRAGMENTS {
        return Err(FragmentationError::TooManyFragments {
            required,
            limit: MAX_FRAGMENTS,
        });
    }

    if payload.is_empty() {
        let header = FragmentHeader::new(
            message_id,
            FragmentIndex::zero(),
            0,
            0,
            0,
            FragmentFlags::LAST,
        );
        return Ok(vec![FragmentFrame::new(header, Bytes::new())]);
    }

    let mut fragments = Vec::with_capacity(required);
    for (position, start) in (0..total).step_by(max).enumerate() {
        let end = (start + max).min(total);
        let flags = if end == total {
            FragmentFlags::LAST
        } else {
            FragmentFlags::NONE
        };
        // `required <= MAX_FRAGMENTS` and `max <= u16::MAX` bound both casts.
        let index = FragmentIndex::try_from(position).unwrap_or(FragmentIndex::zero());
        let offset = u32::try_from(start).unwrap_or(u32::MAX);
        let len = u16::try_from(end - start).unwrap_or(u16::MAX);
        fragments.push(FragmentFrame::new(
            FragmentHeader::new(message_id, index, total_len, offset, len, flags),
            payload.slice(start..end),
        ));
    }

    Ok(fragments)
}

/// Split `message` for a transport limited to `mtu` bytes and hand every
/// encoded fragment to `emit`, in offset order, without acknowledgment
/// tracking.
///
/// Returns the number of fragments emitted.
///
/// # Errors
///
/// Returns [`FragmentationError::InvalidConfiguration`] when `mtu` cannot
/// carry a fragment, and the errors of [`Fragmenter::fragment_with_id`]
/// otherwise. Nothing is emitted on error.
///
/// # Examples
///
/// ```
/// use fragmentation::fragment::{MessageId, fragment_once};
///
/// let mut datagrams = Vec::new();
/// let count = fragment_once(MessageId::new(1), vec![7_u8; 1025], 512, |datagram| {
///     datagrams.push(datagram);
/// })
/// .expect("fragment message");
/// assert_eq!(count, 3);
/// assert!(datagrams.iter().all(|d| d.len() <= 512));
/// ```
pub fn fragment_once(
    message_id: MessageId,
    message: impl Into<Bytes>,
    mtu: usize,
    mut emit: impl FnMut(Bytes),
) -> Result<usize, FragmentationError> {
    let max_payload = max_payload_for_mtu(mtu)?;
    let fragments = build_fragments(message_id, &message.into(), max_payload)?;
    let encoded = fragments
        .iter()
        .map(FragmentFrame::encode)
        .collect::<Result<Vec<_>, _>>()?;
    let count = encoded.len();
    for datagram in encoded {
        emit(datagram);
    }
    Ok(count)
}

/// Metadata and payload for a single outbound fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentFrame {
    header: FragmentHeader,
    payload: Bytes,
}

impl FragmentFrame {
    /// Construct a new fragment frame.
    #[must_use]
    pub fn new(header: FragmentHeader, payload: Bytes) -> Self { Self { header, payload } }

    /// Return the fragment header.
    #[must_use]
    pub fn header(&self) -> &FragmentHeader { &self.header }

    /// Return the fragment payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Encode the frame as a wire datagram.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::Encode`] if the header cannot be encoded.
    pub fn encode(&self) -> Result<Bytes, FragmentationError> {
        Ok(encode_fragment_payload(self.header, &self.payload)?.into())
    }

    /// Consume the frame, returning its components.
    #[must_use]
    pub fn into_parts(self) -> (FragmentHeader, Bytes) { (self.header, self.payload) }
}

/// Collection of fragments produced for a single logical message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentBatch {
    message_id: MessageId,
    fragments: Vec<FragmentFrame>,
}

impl FragmentBatch {
    fn new(message_id: MessageId, fragments: Vec<FragmentFrame>) -> Self {
        debug_assert!(!fragments.is_empty(), "fragment batches must not be empty");
        Self {
            message_id,
            fragments,
        }
    }

    /// Return the [`MessageId`] shared by all fragments.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Return the fragments as a slice.
    #[must_use]
    pub fn fragments(&self) -> &[FragmentFrame] { self.fragments.as_slice() }

    /// Number of fragments in the batch.
    #[expect(
        clippy::len_without_is_empty,
        reason = "batches are guaranteed non-empty"
    )]
    #[must_use]
    pub fn len(&self) -> usize { self.fragments.len() }

    /// Whether the logical message required more than one fragment.
    #[must_use]
    pub fn is_fragmented(&self) -> bool { self.len() > 1 }

    /// Consume the batch, returning all fragments.
    #[must_use]
    pub fn into_fragments(self) -> Vec<FragmentFrame> { self.fragments }
}

impl IntoIterator for FragmentBatch {
    type Item = FragmentFrame;
    type IntoIter = std::vec::IntoIter<FragmentFrame>;

    fn into_iter(self) -> Self::IntoIter { self.fragments.into_iter() }
}
