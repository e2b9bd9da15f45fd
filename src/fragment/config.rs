//! Configuration shared by the sending and receiving halves of the engine.

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};

use super::{ConfigError, fragment_overhead};

/// What to do with a fragment whose message recently timed out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateFragmentPolicy {
    /// Drop the fragment until the retirement record expires.
    #[default]
    Drop,
    /// Start a fresh reassembly buffer for the message.
    StartFresh,
}

/// Settings bounding fragment sizes, retransmission, and reassembly state.
///
/// # Default Values
/// - `mtu`: 1400 bytes
/// - `window`: 16 fragments
/// - `retransmit_base`: 250 milliseconds, `retransmit_max`: 8 seconds
/// - `max_rounds`: 5
/// - `per_sender_cap`: 3, `global_cap`: 384
/// - `reassembly_timeout`: 30 seconds
/// - `ack_interval`: 20 milliseconds
/// - `max_message_size`: 64 KiB
/// - `sweep_interval`: 1 second
///
/// # Examples
///
/// ```
/// use fragmentation::fragment::FragmentationConfig;
///
/// let config = FragmentationConfig {
///     mtu: 512,
///     ..FragmentationConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_payload().get(), 512 - fragmentation::fragment_overhead().get());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentationConfig {
    /// Largest datagram the transport carries, fragment header included.
    pub mtu: usize,
    /// Maximum number of transmitted but unacknowledged fragments.
    pub window: NonZeroUsize,
    /// Retransmission timeout of the first round.
    pub retransmit_base: Duration,
    /// Ceiling for the doubled retransmission timeout.
    pub retransmit_max: Duration,
    /// Consecutive rounds without a new acknowledgment before giving up.
    pub max_rounds: u32,
    /// Concurrent incomplete reassemblies allowed per sender.
    pub per_sender_cap: NonZeroUsize,
    /// Concurrent incomplete reassemblies allowed across all senders.
    pub global_cap: NonZeroUsize,
    /// Inactivity window after which an incomplete reassembly is dropped.
    pub reassembly_timeout: Duration,
    /// Minimum spacing between acknowledgments for one message. Zero acks
    /// every fragment.
    pub ack_interval: Duration,
    /// Largest message a receiver agrees to reassemble.
    pub max_message_size: NonZeroUsize,
    /// Handling of fragments for recently timed-out messages.
    pub late_fragment_policy: LateFragmentPolicy,
    /// Period of the receiver's timeout and ack-flush sweep.
    pub sweep_interval: Duration,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            window: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            retransmit_base: Duration::from_millis(250),
            retransmit_max: Duration::from_secs(8),
            max_rounds: 5,
            per_sender_cap: NonZeroUsize::new(3).unwrap_or(NonZeroUsize::MIN),
            global_cap: NonZeroUsize::new(384).unwrap_or(NonZeroUsize::MIN),
            reassembly_timeout: Duration::from_secs(30),
            ack_interval: Duration::from_millis(20),
            max_message_size: NonZeroUsize::new(64 * 1024).unwrap_or(NonZeroUsize::MIN),
            late_fragment_policy: LateFragmentPolicy::Drop,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Largest payload a fragment can carry inside a datagram of `mtu` bytes.
///
/// # Errors
///
/// Returns [`ConfigError::MtuTooSmall`] when `mtu` cannot carry the fragment
/// overhead plus one payload byte, and [`ConfigError::MtuTooLarge`] when the
/// resulting payload does not fit the header's `u16` length field.
pub fn max_payload_for_mtu(mtu: usize) -> Result<NonZeroUsize, ConfigError> {
    let overhead = fragment_overhead().get();
    let Some(payload) = NonZeroUsize::new(mtu.saturating_sub(overhead)) else {
        return Err(ConfigError::MtuTooSmall { mtu, overhead });
    };
    if payload.get() > usize::from(u16::MAX) {
        return Err(ConfigError::MtuTooLarge { mtu });
    }
    Ok(payload)
}

impl FragmentationConfig {
    /// Check every field for consistency.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        max_payload_for_mtu(self.mtu)?;
        for (field, value) in [
            ("retransmit_base", self.retransmit_base),
            ("reassembly_timeout", self.reassembly_timeout),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        if self.retransmit_base > self.retransmit_max {
            return Err(ConfigError::BackoffInverted {
                base: self.retransmit_base,
                max: self.retransmit_max,
            });
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::ZeroRounds);
        }
        if self.global_cap < self.per_sender_cap {
            return Err(ConfigError::GlobalCapBelowPerSender {
                global: self.global_cap,
                per_sender: self.per_sender_cap,
            });
        }
        if u32::try_from(self.max_message_size.get()).is_err() {
            return Err(ConfigError::MaxMessageSizeTooLarge {
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    /// Payload bytes carried by each full fragment.
    ///
    /// Falls back to one byte when the MTU is invalid; call
    /// [`validate`](Self::validate) before relying on this value.
    #[must_use]
    pub fn max_payload(&self) -> NonZeroUsize {
        max_payload_for_mtu(self.mtu).unwrap_or(NonZeroUsize::MIN)
    }
}
