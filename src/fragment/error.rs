//! Error and status types emitted by the fragmentation layer.
//!
//! Sender-side creation errors, receiver-side per-fragment errors, and
//! terminal delivery outcomes are kept in separate enums so that each call
//! site only has to handle the failures it can actually observe.

use std::{num::NonZeroUsize, time::Duration};

use bincode::error::EncodeError;
use thiserror::Error;

use super::{FragmentIndex, MessageId};

/// Result of feeding a fragment into a reassembly buffer or pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentStatus {
    /// The logical message still expects more fragments.
    Incomplete,
    /// The fragment completed the logical message.
    Complete,
    /// Every byte of the fragment had already been received.
    Duplicate,
    /// The fragment belongs to a message that already timed out and the
    /// pool is configured to drop such stragglers.
    Retired,
}

/// Reasons a fragment header is rejected as malformed.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MalformedReason {
    /// The header's payload length differs from the bytes carried.
    #[error("declared payload length {declared} but carried {carried} bytes")]
    LengthMismatch { declared: u16, carried: usize },
    /// The fragment extends past the declared message length.
    #[error("fragment at offset {offset} with {payload_len} bytes exceeds total length {total_len}")]
    OutOfBounds {
        offset: u32,
        payload_len: u16,
        total_len: u32,
    },
    /// The fragment index cannot be represented in an acknowledgment.
    #[error("fragment index {index} exceeds the acknowledgment bitmap")]
    IndexOutOfRange { index: FragmentIndex },
    /// The `LAST` flag is set on a fragment that does not end the message.
    #[error("fragment {index} is flagged last but does not end the message")]
    MisplacedLastFlag { index: FragmentIndex },
    /// The declared message length exceeds the configured ceiling.
    #[error("declared message length {total_len} exceeds limit {limit}")]
    MessageTooLarge { total_len: u32, limit: NonZeroUsize },
    /// The declared message length disagrees with earlier fragments.
    #[error("declared message length {found} differs from established length {expected}")]
    TotalLengthMismatch { expected: usize, found: u32 },
}

/// Which capacity bound refused a new reassembly buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityScope {
    /// The per-sender cap on concurrent reassemblies.
    PerSender,
    /// The pool-wide cap on concurrent reassemblies.
    Global,
}

impl std::fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerSender => f.write_str("per-sender"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// Errors produced while processing an inbound fragment.
///
/// Every variant is contained to the offending fragment: the pool and all
/// other reassembly buffers are left untouched.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    /// The fragment header violates its invariants.
    #[error("malformed fragment for message {message_id}: {reason}")]
    Malformed {
        message_id: MessageId,
        reason: MalformedReason,
    },
    /// No buffer could be created or evicted to make room for the message.
    #[error("{scope} reassembly capacity of {limit} exhausted for message {message_id}")]
    CapacityExceeded {
        message_id: MessageId,
        scope: CapacityScope,
        limit: NonZeroUsize,
    },
}

/// Invalid configuration values.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The MTU cannot hold the fragment overhead plus one payload byte.
    #[error("mtu {mtu} must exceed the fragment overhead of {overhead} bytes")]
    MtuTooSmall { mtu: usize, overhead: usize },
    /// The MTU exceeds the largest payload length a header can describe.
    #[error("mtu {mtu} leaves more payload per fragment than a header can describe")]
    MtuTooLarge { mtu: usize },
    /// A duration that must be positive was zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    /// The retransmission base exceeds its cap.
    #[error("retransmit base {base:?} exceeds retransmit max {max:?}")]
    BackoffInverted { base: Duration, max: Duration },
    /// The retry budget was zero.
    #[error("max_rounds must be at least one")]
    ZeroRounds,
    /// The global cap is smaller than the per-sender cap.
    #[error("global cap {global} is smaller than per-sender cap {per_sender}")]
    GlobalCapBelowPerSender {
        global: NonZeroUsize,
        per_sender: NonZeroUsize,
    },
    /// The message size ceiling cannot be described by a fragment header.
    #[error("max message size {limit} exceeds u32::MAX")]
    MaxMessageSizeTooLarge { limit: NonZeroUsize },
}

/// Errors produced while fragmenting outbound messages.
#[derive(Debug, Error)]
pub enum FragmentationError {
    /// The configuration cannot be used for fragmentation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    /// The message needs more fragments than an acknowledgment can track.
    #[error("message needs {required} fragments, at most {limit} are supported")]
    TooManyFragments { required: usize, limit: usize },
    /// The message exceeds the configured or representable size.
    #[error("message of {len} bytes exceeds limit {limit}")]
    MessageTooLarge { len: usize, limit: usize },
    /// Encoding a fragment for the wire failed.
    #[error("failed to encode fragment: {0}")]
    Encode(#[from] EncodeError),
}

/// Terminal failure of one outbound message.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The retry budget was exhausted without full acknowledgment.
    #[error("delivery of message {message_id} failed after {rounds} rounds without progress")]
    Failed { message_id: MessageId, rounds: u32 },
    /// The caller cancelled the delivery.
    #[error("delivery of message {message_id} was cancelled")]
    Cancelled { message_id: MessageId },
    /// The driver stopped before reaching an outcome.
    #[error("delivery of message {message_id} was aborted by shutdown")]
    Aborted { message_id: MessageId },
}
