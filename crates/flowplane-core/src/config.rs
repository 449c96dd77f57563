//! Every tunable named in §6.3, collected as plain data with a `Default`
//! matching the wire defaults. No I/O lives here; the application builds or
//! deserializes a `Config` and hands it to `Core::new`.

use std::time::Duration;

/// Bounds on a Conn's outbound FIFO (§4.4): whichever limit is hit first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutboundQueueLimits {
    pub max_messages: usize,
    pub max_bytes: usize,
}

impl Default for OutboundQueueLimits {
    fn default() -> Self {
        Self { max_messages: 1024, max_bytes: 4 * 1024 * 1024 }
    }
}

/// Reconnection backoff bounds for actively-originated Conns (§4.2, §6.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(120) }
    }
}

/// After how many consecutive failures the backoff sequence below is
/// already exhausted and every further attempt just waits `max` (§8
/// scenario 6: 1s, 3s, 7s, 15s, then clamped at 120s — four explicit
/// steps, not a smoothly continuing doubling series).
const BACKOFF_STEPS: u32 = 4;

impl ReconnectPolicy {
    /// Backoff after `consecutive_failures` (0-based) failed attempts:
    /// `2^(n+1) - 1` multiples of `initial` for the first [`BACKOFF_STEPS`]
    /// failures (1s, 3s, 7s, 15s), `max` from there on (§4.2, §8 scenario 6).
    pub fn backoff_after(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures >= BACKOFF_STEPS {
            return self.max;
        }
        let multiplier = (1u32 << (consecutive_failures + 1)) - 1;
        self.initial.saturating_mul(multiplier).min(self.max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub controller_port: u16,
    pub datapath_port: u16,
    pub listen_backlog: i32,
    pub echo_interval: Duration,
    pub echo_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub features_reply_timeout: Duration,
    pub get_config_reply_timeout: Duration,
    pub barrier_reply_timeout: Duration,
    pub outbound_queue: OutboundQueueLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_port: 6633,
            datapath_port: 6653,
            listen_backlog: 10,
            echo_interval: Duration::from_secs(5),
            echo_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            features_reply_timeout: Duration::from_secs(10),
            get_config_reply_timeout: Duration::from_secs(10),
            barrier_reply_timeout: Duration::from_secs(10),
            outbound_queue: OutboundQueueLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_well_known_values() {
        let cfg = Config::default();
        assert_eq!(cfg.controller_port, 6633);
        assert_eq!(cfg.datapath_port, 6653);
        assert_eq!(cfg.listen_backlog, 10);
        assert_eq!(cfg.echo_interval, Duration::from_secs(5));
    }

    #[test]
    fn backoff_follows_the_documented_sequence_then_clamps_at_the_fourth_failure() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_after(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(1), Duration::from_secs(3));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(7));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(15));
        assert_eq!(policy.backoff_after(4), Duration::from_secs(120));
        assert_eq!(policy.backoff_after(10), Duration::from_secs(120));
    }
}
