use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use crate::connection::RttEstimator;

use super::{Controller, ControllerFactory, BASE_DATAGRAM_SIZE};

/// A simple, standard congestion controller, RFC 9002 appendix B
#[derive(Debug, Clone)]
pub struct NewReno {
    config: Arc<NewRenoConfig>,
    current_mtu: u64,
    /// Maximum number of bytes in flight that may be sent
    window: u64,
    /// Slow start threshold in bytes. When the congestion window is below ssthresh,
    /// the mode is slow start and the window grows by the number of bytes
    /// acknowledged.
    ssthresh: u64,
    /// The time when QUIC first detects a loss, causing it to enter recovery. When a
    /// packet sent after this time is acknowledged, QUIC exits recovery.
    recovery_start_time: Instant,
    /// Bytes which had been acked by the peer since leaving slow start
    bytes_acked: u64,
}

impl NewReno {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<NewRenoConfig>, now: Instant, current_mtu: u16) -> Self {
        Self {
            window: config.initial_window,
            ssthresh: u64::MAX,
            recovery_start_time: now,
            current_mtu: current_mtu as u64,
            config,
            bytes_acked: 0,
        }
    }

    fn minimum_window(&self) -> u64 {
        2 * self.current_mtu
    }
}

impl Controller for NewReno {
    fn on_ack(
        &mut self,
        _now: Instant,
        _packet_number: u64,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        _rtt: &RttEstimator,
    ) {
        if app_limited || sent <= self.recovery_start_time {
            return;
        }
        if self.window < self.ssthresh {
            // Slow start
            self.window += bytes;
            if self.window >= self.ssthresh {
                // Exiting slow start; initialize congestion avoidance state
                self.bytes_acked = self.window - self.ssthresh;
            }
        } else {
            // Congestion avoidance: one MTU of growth per window acknowledged
            self.bytes_acked += bytes;
            if self.bytes_acked >= self.window {
                self.bytes_acked -= self.window;
                self.window += self.current_mtu;
            }
        }
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        _lost_bytes: u64,
    ) {
        if sent <= self.recovery_start_time {
            return;
        }
        self.recovery_start_time = now;
        self.window = ((self.window as f32 * 0.5) as u64).max(self.minimum_window());
        self.ssthresh = self.window;
        if is_persistent_congestion {
            self.window = self.minimum_window();
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

/// Configuration for the [`NewReno`] congestion controller
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    initial_window: u64,
}

impl NewRenoConfig {
    /// Default limit on the amount of outstanding data in bytes
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            initial_window: 10 * BASE_DATAGRAM_SIZE,
        }
    }
}

impl ControllerFactory for NewRenoConfig {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(NewReno::new(self, now, current_mtu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_on_loss() {
        let now = Instant::now();
        let mut reno = NewReno::new(Arc::new(NewRenoConfig::default()), now, 1200);
        let before = reno.window();
        reno.on_congestion_event(now + std::time::Duration::from_millis(1), now + std::time::Duration::from_micros(1), false, 1200);
        assert_eq!(reno.window(), before / 2);
    }

    #[test]
    fn recovery_suppresses_further_decrease() {
        let now = Instant::now();
        let mut reno = NewReno::new(Arc::new(NewRenoConfig::default()), now, 1200);
        let t1 = now + std::time::Duration::from_millis(1);
        reno.on_congestion_event(t1, t1, false, 1200);
        let after_first = reno.window();
        // A loss of a packet sent before recovery began must not shrink again
        reno.on_congestion_event(t1 + std::time::Duration::from_millis(1), t1, false, 1200);
        assert_eq!(reno.window(), after_first);
    }
}
