//! Reconnect delay policies.
//!
//! Both channels retry with a delay computed from how many attempts have
//! failed so far. The two formulas differ a lot under sustained outages, so
//! each channel picks one explicitly:
//!
//! - Socket channel: [`BackoffPolicy::Exponential`], `min(base * 2^attempt, cap)`,
//!   where `attempt` counts failures *before* this retry (0 for the first).
//! - Stream channel: [`BackoffPolicy::Linear`], `interval * min(attempt, max_factor)`,
//!   where `attempt` is the already-incremented count (1 for the first).

use std::time::Duration;

/// Delay policy for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Doubling delay starting at `base`, never above `cap`.
    Exponential {
        /// Delay for attempt 0.
        base: Duration,
        /// Upper bound.
        cap: Duration,
    },
    /// Delay growing by `interval` per attempt up to `max_factor` intervals.
    Linear {
        /// Unit delay.
        interval: Duration,
        /// Largest multiplier applied to `interval`.
        max_factor: u32,
    },
}

impl BackoffPolicy {
    /// Policy used by the socket channel.
    #[must_use]
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self::Exponential { base, cap }
    }

    /// Policy used by the stream channel.
    #[must_use]
    pub fn linear(interval: Duration, max_factor: u32) -> Self {
        Self::Linear {
            interval,
            max_factor,
        }
    }

    /// Delay before the retry numbered `attempt`.
    ///
    /// Pure and deterministic. The result never exceeds [`Self::cap`] and
    /// never decreases as `attempt` grows.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Exponential { base, cap } => {
                // 2^20 already dwarfs any sane cap; clamp so the shift can't overflow.
                let multiplier = 1_u32 << attempt.min(20);
                base.saturating_mul(multiplier).min(cap)
            }
            Self::Linear {
                interval,
                max_factor,
            } => interval.saturating_mul(attempt.min(max_factor)),
        }
    }

    /// Largest delay this policy can produce.
    #[must_use]
    pub fn cap(&self) -> Duration {
        match *self {
            Self::Exponential { cap, .. } => cap,
            Self::Linear {
                interval,
                max_factor,
            } => interval.saturating_mul(max_factor),
        }
    }

    /// [`Self::next_delay`] plus up to `jitter` of random spread.
    ///
    /// The upper bound is still [`Self::cap`].
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let delay = self.next_delay(attempt);
        let jitter_ms = jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        let spread = Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1));
        (delay + spread).min(self.cap())
    }
}
