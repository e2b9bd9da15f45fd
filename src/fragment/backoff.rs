//! Exponential back-off for fragment retransmission rounds.

use std::time::Duration;

/// Retransmission timeout that doubles after every round without progress.
///
/// The timeout starts at `base`, doubles on each call to
/// [`escalate`](Self::escalate), and never exceeds `max`. A round that
/// brings new acknowledgments calls [`reset`](Self::reset).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use fragmentation::fragment::RetransmitBackoff;
///
/// let mut backoff = RetransmitBackoff::new(Duration::from_millis(100), Duration::from_millis(300));
/// assert_eq!(backoff.current(), Duration::from_millis(100));
/// backoff.escalate();
/// assert_eq!(backoff.current(), Duration::from_millis(200));
/// backoff.escalate();
/// assert_eq!(backoff.current(), Duration::from_millis(300));
/// backoff.reset();
/// assert_eq!(backoff.current(), Duration::from_millis(100));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetransmitBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl RetransmitBackoff {
    /// Create a back-off schedule, clamping the delays to sane bounds.
    ///
    /// Both delays are raised to at least one millisecond and swapped when
    /// `base` exceeds `max`, so an inverted configuration cannot produce a
    /// shrinking schedule.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        let mut base = base.max(Duration::from_millis(1));
        let mut max = max.max(Duration::from_millis(1));
        if base > max {
            std::mem::swap(&mut base, &mut max);
        }
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Replace the base delay with an observed acknowledgment delay, clamped
    /// to the configured bounds.
    #[must_use]
    pub fn with_base(mut self, observed: Duration) -> Self {
        self.base = observed.clamp(self.base, self.max);
        self.current = self.base;
        self
    }

    /// Timeout of the current round.
    #[must_use]
    pub const fn current(&self) -> Duration { self.current }

    /// Double the timeout for the next round, capped at the maximum.
    pub fn escalate(&mut self) { self.current = self.current.saturating_mul(2).min(self.max); }

    /// Return to the base timeout.
    pub fn reset(&mut self) { self.current = self.base; }
}
