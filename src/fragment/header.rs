use std::ops::Range;

use bincode::{Decode, Encode};

use super::{FragmentIndex, MalformedReason, MessageId};

/// Bit flags carried in every fragment header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct FragmentFlags(u8);

impl FragmentFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Marks the fragment that ends at the message's total length.
    pub const LAST: Self = Self(0b0000_0001);

    /// Return the raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u8 { self.0 }

    /// Whether every bit in `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }
}

/// Header prefixed to every fragment payload on the wire.
///
/// The header is self-describing: a receiver can place the payload at the
/// right position and size its buffer without having seen any other fragment
/// of the message, and without knowing the MTU the sender used.
///
/// # Examples
///
/// ```
/// use fragmentation::fragment::{FragmentFlags, FragmentHeader, FragmentIndex, MessageId};
/// let header = FragmentHeader::new(
///     MessageId::new(7),
///     FragmentIndex::new(1),
///     1_000,
///     487,
///     487,
///     FragmentFlags::NONE,
/// );
/// assert_eq!(header.byte_range(), 487..974);
/// assert!(!header.is_last_fragment());
/// assert!(header.validate(487).is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct FragmentHeader {
    message_id: MessageId,
    fragment_index: FragmentIndex,
    total_len: u32,
    offset: u32,
    payload_len: u16,
    flags: FragmentFlags,
}

impl FragmentHeader {
    /// Create a new fragment header.
    #[must_use]
    pub const fn new(
        message_id: MessageId,
        fragment_index: FragmentIndex,
        total_len: u32,
        offset: u32,
        payload_len: u16,
        flags: FragmentFlags,
    ) -> Self {
        Self {
            message_id,
            fragment_index,
            total_len,
            offset,
            payload_len,
            flags,
        }
    }

    /// Return the logical message identifier.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Return the fragment position relative to the message.
    #[must_use]
    pub const fn fragment_index(&self) -> FragmentIndex { self.fragment_index }

    /// Length of the original, unfragmented message.
    #[must_use]
    pub const fn total_len(&self) -> u32 { self.total_len }

    /// Byte offset of this fragment within the original message.
    #[must_use]
    pub const fn offset(&self) -> u32 { self.offset }

    /// Number of payload bytes that follow the header.
    #[must_use]
    pub const fn payload_len(&self) -> u16 { self.payload_len }

    /// Return the raw header flags.
    #[must_use]
    pub const fn flags(&self) -> FragmentFlags { self.flags }

    /// Report whether this is the final fragment.
    #[must_use]
    pub const fn is_last_fragment(&self) -> bool { self.flags.contains(FragmentFlags::LAST) }

    /// Byte range of the original message covered by this fragment.
    ///
    /// Computed in `u64` so a hostile `offset` near `u32::MAX` cannot wrap.
    #[must_use]
    pub fn byte_range(&self) -> Range<u64> {
        let start = u64::from(self.offset);
        start..start + u64::from(self.payload_len)
    }

    /// Check the header against the payload actually carried with it.
    ///
    /// # Errors
    ///
    /// Returns a [`MalformedReason`] when the declared payload length differs
    /// from `carried`, when the fragment extends past the declared total
    /// length, when the index cannot be acknowledged, or when the `LAST` flag
    /// is set on a fragment that does not end the message.
    pub fn validate(&self, carried: usize) -> Result<(), MalformedReason> {
        if usize::from(self.payload_len) != carried {
            return Err(MalformedReason::LengthMismatch {
                declared: self.payload_len,
                carried,
            });
        }
        let range = self.byte_range();
        if range.end > u64::from(self.total_len) {
            return Err(MalformedReason::OutOfBounds {
                offset: self.offset,
                payload_len: self.payload_len,
                total_len: self.total_len,
            });
        }
        if !self.fragment_index.is_addressable() {
            return Err(MalformedReason::IndexOutOfRange {
                index: self.fragment_index,
            });
        }
        if self.is_last_fragment() && range.end != u64::from(self.total_len) {
            return Err(MalformedReason::MisplacedLastFlag {
                index: self.fragment_index,
            });
        }
        Ok(())
    }
}
