use bincode::{Decode, Encode};
use derive_more::{Display, From, Into};

/// Identifier shared by every fragment of one oversized message.
///
/// Identifiers are unique per sender for the lifetime of one message. The
/// receiver keys reassembly state by `(sender, MessageId)`, so two peers may
/// use the same value concurrently without colliding.
///
/// # Examples
///
/// ```
/// use fragmentation::fragment::MessageId;
/// let id = MessageId::new(42);
/// assert_eq!(id.get(), 42);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode, Display, From, Into)]
#[display("{_0}")]
pub struct MessageId(u32);

impl MessageId {
    /// Create a new identifier.
    #[must_use]
    pub const fn new(value: u32) -> Self { Self(value) }

    /// Return the inner numeric identifier.
    #[must_use]
    pub const fn get(self) -> u32 { self.0 }
}
