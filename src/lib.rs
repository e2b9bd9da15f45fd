#![doc(html_root_url = "https://docs.rs/fragmentation/latest")]
//! Public API for the `fragmentation` library.
//!
//! This crate splits messages larger than a transport's MTU into fragments,
//! delivers them over unreliable datagram links with selective
//! acknowledgments and backoff-driven retransmission, and reassembles them
//! on the receiving side with bounded memory.
//!
//! The [`fragment`] module holds the sans-IO state machines. The
//! [`outbox`], [`inbox`], and [`endpoint`] modules drive them on tokio.

pub mod endpoint;
pub mod fragment;
pub mod inbox;
pub mod metrics;
pub mod outbox;
pub mod transport;

pub use endpoint::{Endpoint, EndpointError, Inbound};
pub use fragment::{
    AckBitmap,
    AckMessage,
    ConfigError,
    DefragmenterPool,
    DeliveryError,
    DeliveryReport,
    FragmentHeader,
    FragmentStatus,
    FragmentationConfig,
    FragmentationError,
    Fragmenter,
    FragmenterContext,
    LateFragmentPolicy,
    MessageId,
    ReassembledMessage,
    ReassemblyError,
    fragment_once,
    fragment_overhead,
};
pub use inbox::{InboundFragment, Inbox, InboxError, InboxHandle};
pub use outbox::{DeliveryHandle, Outbox};
pub use transport::{Target, Transport, TransportError};
