use std::{
    cmp,
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{config::TransportConfig, congestion, TIMER_GRANULARITY};

use super::pacing::Pacer;

/// Description of a particular network path
pub(super) struct PathData {
    pub(super) remote: SocketAddr,
    pub(super) rtt: RttEstimator,
    /// Whether we're enabling ECN on outgoing packets
    pub(super) sending_ecn: bool,
    /// Congestion controller state
    pub(super) congestion: Box<dyn congestion::Controller>,
    /// Pacing state
    pub(super) pacing: Pacer,
    pub(super) challenge: Option<u64>,
    pub(super) challenge_pending: bool,
    /// PATH_CHALLENGE token to reflect back in a PATH_RESPONSE
    pub(super) challenge_response: Option<u64>,
    /// Whether we're certain the peer can both send and receive on this address
    ///
    /// Always true for clients; for servers, true once the peer has proven it can
    /// read our packets (handshake keys or a PATH_RESPONSE).
    pub(super) validated: bool,
    /// Total size of all UDP datagrams sent on this path
    pub(super) total_sent: u64,
    /// Total size of all UDP datagrams received on this path
    pub(super) total_recvd: u64,
    /// UDP payload size for this path
    pub(super) current_mtu: u16,
    /// Congestion-controlled bytes currently in flight
    pub(super) in_flight: InFlight,
}

impl PathData {
    pub(super) fn new(
        remote: SocketAddr,
        now: Instant,
        validated: bool,
        config: &TransportConfig,
    ) -> Self {
        let congestion = config
            .congestion_controller_factory
            .clone()
            .build(now, config.udp_send_packet_len);
        Self {
            remote,
            rtt: RttEstimator::new(config.initial_rtt),
            sending_ecn: true,
            pacing: Pacer::new(
                config.pacing_enabled,
                config.pacing_tick_interval,
                congestion.initial_window(),
                config.initial_rtt,
                config.udp_send_packet_len,
                config.max_batch_size as u64,
            ),
            congestion,
            challenge: None,
            challenge_pending: false,
            challenge_response: None,
            validated,
            total_sent: 0,
            total_recvd: 0,
            current_mtu: config.udp_send_packet_len,
            in_flight: InFlight::new(),
        }
    }

    /// Indicates whether we're a server that hasn't validated the peer's address and
    /// hasn't received enough data from the peer to permit sending `bytes_to_send`
    /// additional bytes
    pub(super) fn anti_amplification_blocked(&self, bytes_to_send: u64) -> bool {
        !self.validated && self.total_recvd * 3 < self.total_sent + bytes_to_send
    }

    /// Bytes the congestion window permits sending right now
    pub(super) fn congestion_writable_bytes(&self) -> u64 {
        self.congestion
            .window()
            .saturating_sub(self.in_flight.bytes)
    }
}

/// RTT estimation for a particular network path
#[derive(Copy, Clone)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously
    /// unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection
    smoothed: Option<Duration>,
    /// The RTT variance
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay
    min: Duration,
}

impl RttEstimator {
    pub(crate) fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Conservative estimate of RTT
    ///
    /// Takes the maximum of smoothed and latest RTT.
    pub fn conservative(&self) -> Duration {
        self.get().max(self.latest)
    }

    /// Minimum RTT registered so far for this estimator
    pub fn min(&self) -> Duration {
        self.min
    }

    /// The most recent RTT sample
    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Whether a sample has been recorded
    pub fn has_samples(&self) -> bool {
        self.smoothed.is_some()
    }

    /// Base PTO interval: `srtt + max(4·rttvar, granularity)`
    pub(crate) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    /// Incorporate one sample
    ///
    /// `ack_delay` is the peer's self-reported delay, already unscaled; it is
    /// subtracted from the sample for smoothing purposes unless doing so would pull
    /// the estimate below the observed minimum.
    pub(crate) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay
        self.min = cmp::min(self.min, self.latest);
        if let Some(smoothed) = self.smoothed {
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                cmp::max(self.latest - ack_delay, Duration::from_micros(1))
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
        }
    }
}

/// Number of bytes and packets in flight, for congestion control purposes
///
/// Counts only ack-eliciting packets.
pub(super) struct InFlight {
    /// Sum of the sizes of all sent packets considered "in flight" by congestion
    /// control
    ///
    /// The size does not include IP or UDP overhead. Packets only containing ACK
    /// frames do not count towards this to ensure congestion control does not impede
    /// congestion feedback.
    pub(super) bytes: u64,
    /// Number of packets in flight
    pub(super) ack_eliciting: u64,
}

impl InFlight {
    pub(super) fn new() -> Self {
        Self {
            bytes: 0,
            ack_eliciting: 0,
        }
    }

    pub(super) fn insert(&mut self, size: u16) {
        self.bytes += u64::from(size);
        self.ack_eliciting += 1;
    }

    /// Update counters to account for a packet no longer being in flight
    pub(super) fn remove(&mut self, size: u16) {
        self.bytes -= u64::from(size);
        self.ack_eliciting -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initializes() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(rtt.get(), Duration::from_millis(100));
        assert_eq!(rtt.min(), Duration::from_millis(100));
        assert_eq!(rtt.var, Duration::from_millis(50));
    }

    #[test]
    fn ewma_smoothing() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        rtt.update(Duration::ZERO, Duration::from_millis(200));
        // srtt = 7/8 * 100 + 1/8 * 200 = 112.5ms
        assert_eq!(rtt.get(), Duration::from_micros(112_500));
        assert_eq!(rtt.latest(), Duration::from_millis(200));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn ack_delay_subtracted_but_bounded() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        // Ack delay larger than the margin over min: use the raw sample
        rtt.update(Duration::from_millis(90), Duration::from_millis(120));
        assert!(rtt.get() >= Duration::from_millis(100));
        // min is tracked on the raw sample
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn smoothing_is_convex_combination() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        let samples = [50u64, 70, 60, 90, 55, 65];
        for &s in &samples {
            rtt.update(Duration::ZERO, Duration::from_millis(s));
        }
        let min = *samples.iter().min().unwrap();
        let max = *samples.iter().max().unwrap();
        let got = rtt.get().as_millis() as u64;
        assert!((min..=max).contains(&got), "srtt {got} out of [{min}, {max}]");
    }

    #[test]
    fn pto_includes_variance() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(
            rtt.pto_base(),
            Duration::from_millis(100) + 4 * Duration::from_millis(50)
        );
    }
}
