//! Per-stack and per-TCP-instance configuration.

use smoltcp::time::Duration;

/// Tunables for one TCP instance. All fields have working defaults; the
/// chainable setters exist so services only name what they change.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Advertised receive window in bytes.
    pub window_size: u32,
    /// Window scale shift offered in our SYN.
    pub window_scale: u8,
    /// Maximum segment size advertised to the peer.
    pub mss: u16,
    /// How long an ACK may be delayed waiting for a piggyback.
    pub delayed_ack_timeout: Duration,
    /// Maximum segment lifetime; TIME_WAIT lasts twice this.
    pub msl: Duration,
    /// Offer RFC 1323 timestamps.
    pub timestamps_enabled: bool,
    /// Offer RFC 2018 selective acknowledgments.
    pub sack_enabled: bool,
    /// Half-open connections allowed per listener.
    pub max_syn_backlog: usize,
    /// Retransmissions before the connection aborts with a timeout.
    pub max_retransmissions: u32,
    /// Idle interval before keepalive probing starts; `None` disables.
    pub keepalive_interval: Option<Duration>,
    /// Failed keepalive probes tolerated before aborting.
    pub keepalive_probes: u32,
    /// PRNG seed for ISS and ephemeral ports; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            window_size: 8192,
            window_scale: 5,
            mss: 1460,
            delayed_ack_timeout: Duration::from_millis(40),
            msl: Duration::from_secs(30),
            timestamps_enabled: true,
            sack_enabled: true,
            max_syn_backlog: 64,
            max_retransmissions: 15,
            keepalive_interval: None,
            keepalive_probes: 9,
            seed: None,
        }
    }
}

impl TcpConfig {
    pub fn window_size(mut self, bytes: u32) -> Self {
        self.window_size = bytes;
        self
    }

    pub fn window_scale(mut self, shift: u8) -> Self {
        self.window_scale = shift;
        self
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.mss = mss;
        self
    }

    pub fn delayed_ack_timeout(mut self, timeout: Duration) -> Self {
        self.delayed_ack_timeout = timeout;
        self
    }

    pub fn msl(mut self, msl: Duration) -> Self {
        self.msl = msl;
        self
    }

    pub fn timestamps_enabled(mut self, enabled: bool) -> Self {
        self.timestamps_enabled = enabled;
        self
    }

    pub fn sack_enabled(mut self, enabled: bool) -> Self {
        self.sack_enabled = enabled;
        self
    }

    pub fn max_syn_backlog(mut self, backlog: usize) -> Self {
        self.max_syn_backlog = backlog;
        self
    }

    pub fn max_retransmissions(mut self, count: u32) -> Self {
        self.max_retransmissions = count;
        self
    }

    pub fn keepalive(mut self, interval: Duration, probes: u32) -> Self {
        self.keepalive_interval = Some(interval);
        self.keepalive_probes = probes;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// ARP behavior knobs.
#[derive(Debug, Clone)]
pub struct ArpConfig {
    /// Lifetime of a learned cache entry.
    pub cache_ttl: Duration,
    /// Resolution attempts before queued frames are dropped.
    pub request_retries: u8,
    /// Cadence of the resolver retry timer.
    pub resolve_interval: Duration,
}

impl Default for ArpConfig {
    fn default() -> Self {
        ArpConfig {
            cache_ttl: Duration::from_secs(60),
            request_retries: 3,
            resolve_interval: Duration::from_secs(1),
        }
    }
}
