//! Round-trip estimation and retransmission timeout, RFC 6298.

use smoltcp::time::Duration;

/// Clock granularity G used in the variance floor.
const GRANULARITY: Duration = Duration::from_millis(1);

const RTO_MIN: Duration = Duration::from_secs(1);
const RTO_MAX: Duration = Duration::from_secs(60);

/// Smoothed RTT state for one connection.
///
/// Samples must come only from segments that were never retransmitted
/// (Karn's algorithm); the caller enforces that by invalidating its probe on
/// retransmission.
#[derive(Debug)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: RTO_MIN,
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Feed one measurement.
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let var_term = self.rttvar * 4;
        let var_term = if var_term > GRANULARITY { var_term } else { GRANULARITY };
        self.rto = clamp(self.srtt.expect("srtt set") + var_term);
    }

    /// Exponential backoff after a retransmission timeout.
    pub fn backoff(&mut self) {
        self.rto = clamp(self.rto * 2);
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp(rto: Duration) -> Duration {
    if rto < RTO_MIN {
        RTO_MIN
    } else if rto > RTO_MAX {
        RTO_MAX
    } else {
        rto
    }
}
