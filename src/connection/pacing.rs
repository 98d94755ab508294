//! Pacing of packet transmissions.

use std::time::{Duration, Instant};

use tracing::warn;

/// A batch-oriented token bucket pacer
///
/// The congestion controller supplies a target rate; each call to
/// [`update_and_get_write_batch_size`](Pacer::update_and_get_write_batch_size)
/// converts the time elapsed since the previous call into a packet budget for the
/// current write loop. Unused budget carries over, but never beyond one burst, so a
/// stalled event loop catches up without dumping an arbitrarily large train of
/// packets onto the path.
pub(super) struct Pacer {
    enabled: bool,
    /// Target rate in bytes per second
    rate: u64,
    tick_interval: Duration,
    packet_len: u64,
    /// Accrued sending budget in bytes
    tokens: u64,
    /// Upper bound on `tokens`
    capacity: u64,
    last_update: Option<Instant>,
}

impl Pacer {
    pub(super) fn new(
        enabled: bool,
        tick_interval: Duration,
        initial_window: u64,
        srtt: Duration,
        packet_len: u16,
        max_burst_packets: u64,
    ) -> Self {
        let packet_len = u64::from(packet_len);
        let rate = initial_rate(initial_window, srtt);
        let capacity = burst_capacity(rate, tick_interval, packet_len, max_burst_packets);
        // Start with a full initial window of budget so the first flight is not
        // delayed behind the token clock
        let tokens = initial_window
            .max(capacity)
            .min(max_burst_packets.saturating_mul(packet_len).max(packet_len));
        Self {
            enabled,
            rate,
            tick_interval,
            packet_len,
            tokens,
            capacity,
            last_update: None,
        }
    }

    /// Adopt a rate computed directly by the congestion controller
    pub(super) fn set_rate(&mut self, rate: u64, max_burst_packets: u64) {
        if rate == 0 {
            return;
        }
        self.rate = rate;
        self.capacity =
            burst_capacity(rate, self.tick_interval, self.packet_len, max_burst_packets);
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Derive a rate from the congestion window, for controllers with no native one
    ///
    /// The 5/4 factor keeps the pacer from becoming the limit as the window grows.
    pub(super) fn refresh_pacing_rate(
        &mut self,
        cwnd: u64,
        srtt: Duration,
        max_burst_packets: u64,
    ) {
        let srtt_micros = srtt.as_micros() as u64;
        if srtt_micros == 0 {
            return;
        }
        self.set_rate(
            cwnd.saturating_mul(1_000_000) / srtt_micros * 5 / 4,
            max_burst_packets,
        );
    }

    /// Account elapsed time and return how many packets this loop may write
    pub(super) fn update_and_get_write_batch_size(&mut self, now: Instant) -> u64 {
        if !self.enabled {
            return u64::MAX;
        }
        if let Some(last) = self.last_update {
            let elapsed = match now.checked_duration_since(last) {
                Some(x) => x,
                None => {
                    warn!("pacing clock went backwards, ignoring interval");
                    Duration::ZERO
                }
            };
            let accrued = (self.rate as f64 * elapsed.as_secs_f64()) as u64;
            self.tokens = self.tokens.saturating_add(accrued).min(self.capacity);
        }
        self.last_update = Some(now);
        self.tokens / self.packet_len
    }

    /// Account one transmitted packet against the budget
    pub(super) fn on_packet_sent(&mut self) {
        self.tokens = self.tokens.saturating_sub(self.packet_len);
    }

    /// When the budget next reaches a full packet, for timer arming
    ///
    /// `None` means a packet may be sent immediately.
    pub(super) fn next_send_time(&self, now: Instant) -> Option<Instant> {
        if !self.enabled || self.tokens >= self.packet_len || self.rate == 0 {
            return None;
        }
        let deficit = self.packet_len - self.tokens;
        let wait = Duration::from_secs_f64(deficit as f64 / self.rate as f64);
        Some(now + wait.max(self.tick_interval))
    }
}

fn initial_rate(initial_window: u64, srtt: Duration) -> u64 {
    let micros = srtt.as_micros() as u64;
    if micros == 0 {
        return u64::MAX / 2;
    }
    initial_window.saturating_mul(1_000_000) / micros
}

fn burst_capacity(
    rate: u64,
    tick_interval: Duration,
    packet_len: u64,
    max_burst_packets: u64,
) -> u64 {
    let per_tick = (rate as f64 * tick_interval.as_secs_f64()) as u64;
    per_tick
        .max(packet_len)
        .min(max_burst_packets.saturating_mul(packet_len))
        .max(packet_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(rate: u64) -> Pacer {
        let mut p = Pacer::new(
            true,
            Duration::from_millis(1),
            12_000,
            Duration::from_millis(100),
            1200,
            10,
        );
        p.set_rate(rate, 10);
        p
    }

    #[test]
    fn disabled_is_unlimited() {
        let mut p = Pacer::new(
            false,
            Duration::from_millis(1),
            12_000,
            Duration::from_millis(100),
            1200,
            10,
        );
        assert_eq!(p.update_and_get_write_batch_size(Instant::now()), u64::MAX);
    }

    #[test]
    fn starts_with_full_burst() {
        let mut p = pacer(1_200_000);
        let batch = p.update_and_get_write_batch_size(Instant::now());
        assert!(batch >= 1);
        assert!(batch <= 10);
    }

    #[test]
    fn long_run_rate_matches_target() {
        // 1.2 MB/s at 1200-byte packets is 1000 packets/s
        let mut p = pacer(1_200_000);
        let start = Instant::now();
        let mut sent = 0u64;
        for ms in 1..=1000u64 {
            let now = start + Duration::from_millis(ms);
            let batch = p.update_and_get_write_batch_size(now);
            for _ in 0..batch {
                p.on_packet_sent();
                sent += 1;
            }
        }
        // Within the burst allowance of the ideal 1000
        assert!((990..=1011).contains(&sent), "sent {sent}");
    }

    #[test]
    fn burst_capped_after_stall() {
        let mut p = pacer(1_200_000);
        let start = Instant::now();
        p.update_and_get_write_batch_size(start);
        for _ in 0..10 {
            p.on_packet_sent();
        }
        // A long stall must not produce more than one burst of budget
        let batch = p.update_and_get_write_batch_size(start + Duration::from_secs(5));
        assert!(batch <= 10, "batch {batch}");
    }

    #[test]
    fn next_send_time_when_empty() {
        let mut p = pacer(1_200_000);
        let start = Instant::now();
        let batch = p.update_and_get_write_batch_size(start);
        for _ in 0..batch {
            p.on_packet_sent();
        }
        if p.update_and_get_write_batch_size(start) == 0 {
            assert!(p.next_send_time(start).is_some());
        }
    }
}
