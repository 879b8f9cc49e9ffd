// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

/// Periodic flush cadence.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(15);

/// First retry delay after a failed delivery attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Upper bound on the per-item retry delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Configuration parameters for the outbox dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Interval between periodic flushes of the pending queue.
    ///
    /// Flushes are additionally triggered after every enqueue and by explicit
    /// `flush` calls, so this is the worst-case delivery latency while
    /// online, not the usual one.
    ///
    /// Default: 15 seconds.
    pub(crate) flush_interval: Duration,

    /// Retry delay after the first failed attempt of an item; it doubles per
    /// attempt.
    ///
    /// Default: 2 seconds.
    pub(crate) backoff_base: Duration,

    /// Maximum per-item retry delay.
    ///
    /// Default: 5 minutes.
    pub(crate) backoff_cap: Duration,
}

impl DispatcherConfig {
    /// Return a default instance of `DispatcherConfig`.
    pub fn new() -> Self {
        Default::default()
    }

    /// Define the periodic flush interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Define the base retry delay after a failed attempt.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Define the maximum per-item retry delay.
    pub fn backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}
