//! Metric helpers for the fragmentation engine.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::fragment::{CapacityScope, EvictionReason, FragmentStatus};

/// Name of the counter tracking fragment datagrams handed to the transport.
pub const FRAGMENTS_SENT: &str = "fragmentation_fragments_sent_total";
/// Name of the counter tracking inbound fragments by outcome.
pub const FRAGMENTS_RECEIVED: &str = "fragmentation_fragments_received_total";
/// Name of the counter tracking messages by terminal outcome.
pub const MESSAGES_TOTAL: &str = "fragmentation_messages_total";
/// Name of the counter tracking reassembly buffers discarded before completion.
pub const REASSEMBLY_EVICTED: &str = "fragmentation_reassembly_evicted_total";
/// Name of the counter tracking acknowledgment datagrams.
pub const ACKS_TOTAL: &str = "fragmentation_acks_total";

/// Direction of an acknowledgment.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Acknowledgments received from a peer.
    Inbound,
    /// Acknowledgments sent to a peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "used only by metrics"))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Terminal outcome of an outbound message.
#[derive(Clone, Copy)]
pub enum Outcome {
    /// Every fragment was acknowledged.
    Delivered,
    /// The retry budget ran out.
    Failed,
    /// The caller cancelled delivery.
    Cancelled,
    /// A complete message was handed to the receiver's application.
    Reassembled,
}

impl Outcome {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "used only by metrics"))]
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
            Outcome::Reassembled => "reassembled",
        }
    }
}

#[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "used only by metrics"))]
fn status_label(status: FragmentStatus) -> &'static str {
    match status {
        FragmentStatus::Incomplete => "incomplete",
        FragmentStatus::Complete => "complete",
        FragmentStatus::Duplicate => "duplicate",
        FragmentStatus::Retired => "retired",
    }
}

#[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "used only by metrics"))]
fn eviction_label(reason: EvictionReason) -> &'static str {
    match reason {
        EvictionReason::TimedOut => "timeout",
        EvictionReason::Capacity(CapacityScope::PerSender) => "per_sender_cap",
        EvictionReason::Capacity(CapacityScope::Global) => "global_cap",
    }
}

/// Record fragment datagrams handed to the transport.
pub fn inc_fragments_sent(count: usize, retransmission: bool) {
    #[cfg(feature = "metrics")]
    counter!(
        FRAGMENTS_SENT,
        "kind" => if retransmission { "retransmission" } else { "initial" }
    )
    .increment(count as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = (count, retransmission);
}

/// Record an inbound fragment and how it affected its message.
pub fn inc_fragment_received(status: FragmentStatus) {
    #[cfg(feature = "metrics")]
    counter!(FRAGMENTS_RECEIVED, "status" => status_label(status)).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = status;
}

/// Record an inbound fragment rejected as malformed.
pub fn inc_fragment_malformed() {
    #[cfg(feature = "metrics")]
    counter!(FRAGMENTS_RECEIVED, "status" => "malformed").increment(1);
}

/// Record the terminal outcome of a message.
pub fn inc_messages(outcome: Outcome) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_TOTAL, "outcome" => outcome.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Record a completed reassembly.
pub fn inc_messages_reassembled() { inc_messages(Outcome::Reassembled); }

/// Record a reassembly buffer discarded before completion.
pub fn inc_reassembly_evicted(reason: EvictionReason) {
    #[cfg(feature = "metrics")]
    counter!(REASSEMBLY_EVICTED, "reason" => eviction_label(reason)).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = reason;
}

/// Record an acknowledgment datagram for the given direction.
pub fn inc_acks(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(ACKS_TOTAL, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}
