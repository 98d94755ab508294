use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::RttEstimator;

use super::{Controller, ControllerFactory, BASE_DATAGRAM_SIZE};

/// CUBIC window growth scaling constant, RFC 8312 §4.1
const CUBE_SCALE: f64 = 0.4;
/// Multiplicative decrease on congestion
const BETA_CUBIC: f64 = 0.7;

/// CUBIC congestion controller, RFC 8312
///
/// Loss-based; grows the window as a cubic function of time since the last
/// congestion event, converging quickly back to the window where loss last occurred.
#[derive(Debug, Clone)]
pub struct Cubic {
    config: Arc<CubicConfig>,
    current_mtu: u64,
    /// Maximum number of bytes in flight that may be sent
    window: u64,
    /// Slow start threshold in bytes. When the congestion window is below ssthresh,
    /// the mode is slow start and the window grows by the number of bytes acknowledged.
    ssthresh: u64,
    /// The time when QUIC first detects a loss, causing it to enter recovery. When a
    /// packet sent after this time is acknowledged, QUIC exits recovery.
    recovery_start_time: Option<Instant>,
    /// Window size before the last congestion event, in bytes
    w_max: f64,
    /// Time at which the cubic function resumes growth after a congestion event
    k: f64,
    /// Bytes acked since the last window increase, for Reno-friendly growth
    bytes_acked: u64,
    congestion_event_time: Option<Instant>,
}

impl Cubic {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<CubicConfig>, _now: Instant, current_mtu: u16) -> Self {
        Self {
            window: config.initial_window,
            ssthresh: u64::MAX,
            recovery_start_time: None,
            config,
            current_mtu: current_mtu as u64,
            w_max: 0.0,
            k: 0.0,
            bytes_acked: 0,
            congestion_event_time: None,
        }
    }

    fn minimum_window(&self) -> u64 {
        2 * self.current_mtu
    }

    /// W_cubic(t) = C*(t-K)^3 + W_max (RFC 8312 §4.1), in bytes
    fn w_cubic(&self, t: Duration) -> f64 {
        let c = CUBE_SCALE / self.current_mtu as f64;
        c * (t.as_secs_f64() - self.k).powi(3) * self.current_mtu as f64 + self.w_max
    }

    fn w_est(&self, t: Duration, rtt: Duration) -> f64 {
        if rtt.is_zero() {
            return self.w_max;
        }
        self.w_max * BETA_CUBIC
            + 3.0 * (1.0 - BETA_CUBIC) / (1.0 + BETA_CUBIC)
                * (t.as_secs_f64() / rtt.as_secs_f64())
                * self.current_mtu as f64
    }
}

impl Controller for Cubic {
    fn on_ack(
        &mut self,
        now: Instant,
        _packet_number: u64,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
        if app_limited
            || self
                .recovery_start_time
                .map(|recovery_start_time| sent <= recovery_start_time)
                .unwrap_or(false)
        {
            return;
        }

        if self.window < self.ssthresh {
            // Slow start
            self.window += bytes;
            return;
        }

        // Congestion avoidance
        let t = now - self.congestion_event_time.unwrap_or(now);
        let target = self
            .w_cubic(t + rtt.get())
            .max(self.w_est(t, rtt.get()))
            .min(1.5 * self.window as f64);
        let window_increase = (target - self.window as f64).max(0.0) / self.window as f64;
        self.bytes_acked += bytes;
        let increase = (self.bytes_acked as f64 * window_increase) as u64;
        if increase > 0 {
            self.bytes_acked = 0;
            self.window += increase.max(1);
        }
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        _lost_bytes: u64,
    ) {
        if self
            .recovery_start_time
            .map(|recovery_start_time| sent <= recovery_start_time)
            .unwrap_or(false)
        {
            return;
        }
        self.recovery_start_time = Some(now);
        self.congestion_event_time = Some(now);

        // Fast convergence: if losing below the previous W_max, the path lost
        // capacity, so remember an even smaller peak
        let window = self.window as f64;
        self.w_max = if window < self.w_max {
            window * (1.0 + BETA_CUBIC) / 2.0
        } else {
            window
        };
        self.k = (self.w_max * (1.0 - BETA_CUBIC) / (CUBE_SCALE * self.current_mtu as f64))
            .cbrt();
        self.ssthresh = ((window * BETA_CUBIC) as u64).max(self.minimum_window());
        self.window = self.ssthresh;
        self.bytes_acked = 0;

        if is_persistent_congestion {
            self.window = self.minimum_window();
            self.w_max = self.window as f64;
            self.ssthresh = u64::MAX;
            self.recovery_start_time = None;
            self.congestion_event_time = None;
        }
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_window
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Configuration for the [`Cubic`] congestion controller
#[derive(Debug, Clone)]
pub struct CubicConfig {
    initial_window: u64,
}

impl CubicConfig {
    /// Default limit on the amount of outstanding data in bytes
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self {
            initial_window: 10 * BASE_DATAGRAM_SIZE,
        }
    }
}

impl ControllerFactory for CubicConfig {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(Cubic::new(self, now, current_mtu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_doubles_per_round() {
        let mut cubic = Cubic::new(Arc::new(CubicConfig::default()), Instant::now(), 1200);
        let now = Instant::now();
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let before = cubic.window();
        cubic.on_ack(now, 0, now, before, false, &rtt);
        assert_eq!(cubic.window(), 2 * before);
    }

    #[test]
    fn loss_multiplicative_decrease() {
        let mut cubic = Cubic::new(Arc::new(CubicConfig::default()), Instant::now(), 1200);
        let now = Instant::now();
        let before = cubic.window();
        cubic.on_congestion_event(now, now, false, 1200);
        assert_eq!(cubic.window(), (before as f64 * BETA_CUBIC) as u64);
    }

    #[test]
    fn persistent_congestion_resets_to_minimum() {
        let mut cubic = Cubic::new(Arc::new(CubicConfig::default()), Instant::now(), 1200);
        let now = Instant::now();
        cubic.on_congestion_event(now, now, true, 1200);
        assert_eq!(cubic.window(), 2 * 1200);
    }
}
