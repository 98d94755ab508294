use std::time::Duration;

use crate::{config::AckFrequencyConfig, frame, VarInt};

/// State for the acknowledgement frequency extension
///
/// Tracks the one in-flight ACK_FREQUENCY frame we allow at a time, and the
/// `max_ack_delay` the peer has committed to, which feeds the PTO computation.
pub(super) struct AckFrequencyState {
    in_flight_frame: Option<(u64, Duration)>,
    next_sequence_number: u64,
    /// Most recent request the peer has acknowledged, if any
    pub(super) peer_max_ack_delay: Duration,
}

impl AckFrequencyState {
    pub(super) fn new(peer_max_ack_delay: Duration) -> Self {
        Self {
            in_flight_frame: None,
            next_sequence_number: 0,
            peer_max_ack_delay,
        }
    }

    /// The `max_ack_delay` to request of the peer, derived from the measured min RTT
    /// unless the config pins a value
    pub(super) fn candidate_max_ack_delay(
        &self,
        min_rtt: Duration,
        config: &AckFrequencyConfig,
    ) -> Duration {
        config
            .max_ack_delay
            .unwrap_or_else(|| (min_rtt / config.min_rtt_divisor).max(crate::TIMER_GRANULARITY))
    }

    /// The `max_ack_delay` for PTO purposes: the peer's current commitment, or any
    /// stricter value still in flight
    pub(super) fn max_ack_delay_for_pto(&self) -> Duration {
        match self.in_flight_frame {
            Some((_, requested)) => self.peer_max_ack_delay.max(requested),
            None => self.peer_max_ack_delay,
        }
    }

    /// Whether an ACK_FREQUENCY frame should be sent now
    pub(super) fn should_send(&self, candidate: Duration) -> bool {
        if self.in_flight_frame.is_some() {
            return false;
        }
        // Re-request only when the target differs enough to matter
        self.next_sequence_number == 0
            || candidate.as_micros().abs_diff(self.peer_max_ack_delay.as_micros())
                > self.peer_max_ack_delay.as_micros() / 4
    }

    /// Build the next frame to send, marking it in flight
    pub(super) fn frame_to_send(
        &mut self,
        candidate: Duration,
        reordering_threshold: VarInt,
        ack_eliciting_threshold: VarInt,
    ) -> frame::AckFrequency {
        let sequence = self.next_sequence_number;
        self.next_sequence_number += 1;
        frame::AckFrequency {
            sequence: VarInt::from_u64(sequence).unwrap(),
            ack_eliciting_threshold,
            request_max_ack_delay: VarInt::from_u64(candidate.as_micros() as u64)
                .unwrap_or(VarInt::MAX),
            reordering_threshold,
        }
    }

    pub(super) fn frame_sent(&mut self, pn: u64, requested_max_ack_delay: Duration) {
        self.in_flight_frame = Some((pn, requested_max_ack_delay));
    }

    /// Note an acked packet; commits the in-flight request if it was acked
    pub(super) fn on_acked(&mut self, pn: u64) {
        if let Some((number, requested)) = self.in_flight_frame {
            if number == pn {
                self.in_flight_frame = None;
                self.peer_max_ack_delay = requested;
            }
        }
    }

    /// Note a lost packet carrying our request, allowing a re-send
    pub(super) fn on_lost(&mut self, pn: u64) {
        if let Some((number, _)) = self.in_flight_frame {
            if number == pn {
                self.in_flight_frame = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_on_ack() {
        let mut state = AckFrequencyState::new(Duration::from_millis(25));
        let requested = Duration::from_millis(10);
        assert!(state.should_send(requested));
        state.frame_sent(7, requested);
        assert!(!state.should_send(requested));
        assert_eq!(state.max_ack_delay_for_pto(), Duration::from_millis(25));
        state.on_acked(7);
        assert_eq!(state.peer_max_ack_delay, requested);
    }

    #[test]
    fn lost_frame_resendable() {
        let mut state = AckFrequencyState::new(Duration::from_millis(25));
        state.frame_sent(3, Duration::from_millis(5));
        state.on_lost(3);
        assert!(state.should_send(Duration::from_millis(5)));
        assert_eq!(state.peer_max_ack_delay, Duration::from_millis(25));
    }

    #[test]
    fn pto_uses_stricter_in_flight_value() {
        let mut state = AckFrequencyState::new(Duration::from_millis(10));
        state.frame_sent(1, Duration::from_millis(40));
        assert_eq!(state.max_ack_delay_for_pto(), Duration::from_millis(40));
    }
}
