use bincode::{Decode, Encode};

use super::{AckBitmap, MessageId};

/// Cumulative acknowledgment sent from the receiver back to the sender.
///
/// Each ack describes the complete receive state of one message, so a later
/// ack for the same [`MessageId`] supersedes every earlier one and replaying
/// an ack is harmless.
///
/// # Examples
///
/// ```
/// use fragmentation::fragment::{AckBitmap, AckMessage, MessageId};
/// let ack = AckMessage::new(MessageId::new(3), AckBitmap::full(2));
/// assert_eq!(ack.message_id(), MessageId::new(3));
/// assert_eq!(ack.received().len(), 2);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct AckMessage {
    message_id: MessageId,
    received: AckBitmap,
}

impl AckMessage {
    /// Create a new acknowledgment.
    #[must_use]
    pub const fn new(message_id: MessageId, received: AckBitmap) -> Self {
        Self {
            message_id,
            received,
        }
    }

    /// Identifier of the acknowledged message.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Fragment positions received so far.
    #[must_use]
    pub const fn received(&self) -> AckBitmap { self.received }
}
