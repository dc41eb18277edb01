//! Runtime configuration.

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::wire::WireFormat;
use std::time::Duration;

/// Tunables for one runtime process.
///
/// The defaults suit a localhost cluster; the builder methods exist so a
/// deployment can trade latency against idle CPU and bound its frame
/// sizes.
///
/// # Example
///
/// ```
/// use plexus::config::RuntimeConfig;
/// use std::time::Duration;
///
/// let config = RuntimeConfig::default()
///     .with_idle_poll_interval(Duration::from_millis(5))
///     .with_max_frame_length(1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long the event loop sleeps when there is neither readable
    /// input nor runnable work. Zero effectively busy-polls.
    ///
    /// This is a sleep between non-blocking scans, not the timeout of a
    /// readiness poll: nothing wakes the loop early when bytes arrive,
    /// so every message sitting in a peer's socket waits out the
    /// remainder of the interval. The default is therefore milliseconds
    /// rather than seconds — at one second, a single remote call would
    /// stall up to a second per hop. Deployments that prefer idle CPU
    /// savings over latency can raise it.
    pub idle_poll_interval: Duration,
    /// Upper bound on one frame (message) in bytes, both directions.
    pub max_frame_length: usize,
    /// On-wire message encoding.
    pub wire_format: WireFormat,
    /// Dial attempts while a peer's listener comes up during bootstrap.
    pub connect_attempts: u32,
    /// Pause between dial attempts.
    pub connect_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_millis(1),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            wire_format: WireFormat::default(),
            connect_attempts: 100,
            connect_backoff: Duration::from_millis(20),
        }
    }
}

impl RuntimeConfig {
    /// Sets the idle sleep interval.
    #[must_use]
    pub const fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Sets the maximum frame length.
    #[must_use]
    pub const fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes;
        self
    }

    /// Sets the on-wire encoding.
    #[must_use]
    pub const fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Sets the bootstrap dial retry budget.
    #[must_use]
    pub const fn with_connect_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert_eq!(config.wire_format, WireFormat::Bincode);
        assert!(config.idle_poll_interval > Duration::ZERO);
        assert!(config.connect_attempts > 0);
    }

    #[test]
    fn builders_override() {
        let config = RuntimeConfig::default()
            .with_wire_format(WireFormat::Json)
            .with_max_frame_length(512)
            .with_idle_poll_interval(Duration::from_millis(7))
            .with_connect_retry(3, Duration::from_millis(1));
        assert_eq!(config.wire_format, WireFormat::Json);
        assert_eq!(config.max_frame_length, 512);
        assert_eq!(config.idle_poll_interval, Duration::from_millis(7));
        assert_eq!(config.connect_attempts, 3);
    }
}
