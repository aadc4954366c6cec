use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// Delay between two reconnection attempts.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// The heartbeat line sent by convention.
pub const PING_LINE: &str = "0:ping";

/// The heartbeat reply expected by convention.
pub const PONG_LINE: &str = "0:OK:pong";

/// A heartbeat strategy for detecting a silently dead connection.
///
/// On every interval tick the connection sends the ping line; when the
/// previous ping is still unanswered at the next tick, the connection is
/// declared dead, force-closed, and a reconnection is scheduled.
///
/// A received line satisfying the pong predicate is swallowed before
/// reaching any line listener.
#[derive(Clone)]
pub struct Heartbeat {
    ping: String,
    is_pong: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    interval: Duration,
}

impl Heartbeat {
    /// Creates a [`Heartbeat`] from a ping line, a pong predicate, and a
    /// check interval.
    #[must_use]
    #[inline]
    pub fn new(
        ping: impl Into<String>,
        is_pong: impl Fn(&str) -> bool + Send + Sync + 'static,
        interval: Duration,
    ) -> Self {
        Self {
            ping: ping.into(),
            is_pong: Arc::new(is_pong),
            interval,
        }
    }

    /// Creates a [`Heartbeat`] following the gateway convention:
    /// [`PING_LINE`] as ping and an equality check against [`PONG_LINE`].
    ///
    /// The identifier `0` is reserved for heartbeat traffic, so the reply
    /// never collides with a pending request.
    #[must_use]
    #[inline]
    pub fn convention(interval: Duration) -> Self {
        Self::new(PING_LINE, |line| line == PONG_LINE, interval)
    }

    /// Returns the ping line.
    #[must_use]
    #[inline]
    pub fn ping(&self) -> &str {
        &self.ping
    }

    /// Checks whether a received line answers the ping.
    #[must_use]
    #[inline]
    pub fn is_pong(&self, line: &str) -> bool {
        (self.is_pong)(line)
    }

    /// Returns the check interval.
    #[must_use]
    #[inline]
    pub const fn interval(&self) -> Duration {
        self.interval
    }
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat")
            .field("ping", &self.ping)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Configuration of a gateway connection.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    host: String,
    port: u16,
    retry_delay: Duration,
    heartbeat: Option<Heartbeat>,
}

impl LinkConfig {
    /// Creates a [`LinkConfig`] for the gateway reachable at the given host
    /// and port.
    #[must_use]
    #[inline]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            retry_delay: DEFAULT_RETRY_DELAY,
            heartbeat: None,
        }
    }

    /// Sets the delay between two reconnection attempts.
    #[must_use]
    #[inline]
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Installs a [`Heartbeat`] strategy.
    #[must_use]
    #[inline]
    pub fn heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Returns the gateway host.
    #[must_use]
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the gateway port.
    #[must_use]
    #[inline]
    pub const fn port(&self) -> u16 {
        self.port
    }

    pub(crate) const fn retry_delay_value(&self) -> Duration {
        self.retry_delay
    }

    pub(crate) fn heartbeat_strategy(&self) -> Option<&Heartbeat> {
        self.heartbeat.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Heartbeat, LinkConfig, PONG_LINE};

    #[test]
    fn config_defaults() {
        let config = LinkConfig::new("10.0.0.7", 6641);

        assert_eq!(config.host(), "10.0.0.7");
        assert_eq!(config.port(), 6641);
        assert!(config.heartbeat_strategy().is_none());
    }

    #[test]
    fn conventional_heartbeat() {
        let heartbeat = Heartbeat::convention(Duration::from_secs(5));

        assert_eq!(heartbeat.ping(), "0:ping");
        assert!(heartbeat.is_pong(PONG_LINE));
        assert!(!heartbeat.is_pong("0:OK"));
        assert_eq!(heartbeat.interval(), Duration::from_secs(5));
    }
}
