//! Fragmentation and reassembly of messages larger than the transport MTU.
//!
//! This module collects the sans-IO building blocks of the engine. Each
//! sub-module focuses on a single concept: identifiers and headers on the
//! wire, the codec that frames them into datagrams, the sender's
//! [`FragmenterContext`] with its retransmission schedule, and the
//! receiver's [`DefragmenterPool`]. The async drivers in
//! [`outbox`](crate::outbox) and [`inbox`](crate::inbox) wrap these types
//! with timers and channels.

pub mod ack;
pub mod backoff;
pub mod bitmap;
pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod fragmenter;
pub mod header;
pub mod id;
pub mod index;
pub mod payload;
pub mod pool;
pub mod ranges;

pub use ack::AckMessage;
pub use backoff::RetransmitBackoff;
pub use bitmap::AckBitmap;
pub use buffer::ReassemblyBuffer;
pub use config::{FragmentationConfig, LateFragmentPolicy, max_payload_for_mtu};
pub use context::{
    AckOutcome,
    ContextState,
    DeliveryReport,
    FragmenterContext,
    TimerOutcome,
    Transmission,
};
pub use error::{
    CapacityScope,
    ConfigError,
    DeliveryError,
    FragmentStatus,
    FragmentationError,
    MalformedReason,
    ReassemblyError,
};
pub use fragmenter::{FragmentBatch, FragmentFrame, Fragmenter, fragment_once};
pub use header::{FragmentFlags, FragmentHeader};
pub use id::MessageId;
pub use index::{FragmentIndex, MAX_FRAGMENTS};
pub use payload::{
    ACK_MAGIC,
    Datagram,
    FRAGMENT_MAGIC,
    ack_datagram_len,
    decode_datagram,
    encode_ack_payload,
    encode_fragment_payload,
    fragment_overhead,
};
pub use pool::{
    DefragmenterPool,
    Eviction,
    EvictionReason,
    Processed,
    ReassembledMessage,
    Sweep,
};
pub use ranges::ReceivedRanges;
