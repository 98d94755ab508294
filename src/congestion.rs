//! Logic for controlling the rate at which data is sent

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::RttEstimator;

mod bbr2;
mod cubic;
mod new_reno;

pub use bbr2::{Bbr2, Bbr2Config};
pub use cubic::{Cubic, CubicConfig};
pub use new_reno::{NewReno, NewRenoConfig};

/// Common interface for different congestion controllers
pub trait Controller: Send + Sync {
    /// One or more packets were just sent
    #[allow(unused_variables)]
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {}

    /// An ack for a single previously unacked packet was processed
    ///
    /// `app_limited` indicates whether the connection was blocked on outgoing
    /// application data when the acked packet was sent.
    #[allow(unused_variables)]
    fn on_ack(
        &mut self,
        now: Instant,
        packet_number: u64,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
    }

    /// Packets are acked in batches, all with the same `now` argument. This indicates
    /// one of those batches has completed.
    #[allow(unused_variables)]
    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
    }

    /// Packets were deemed lost or marked congested
    ///
    /// `in_persistent_congestion` indicates whether all packets sent within the
    /// persistent congestion threshold period ending when the most recent packet in
    /// this batch was sent were lost.
    /// `lost_bytes` indicates how many bytes were lost. This value will be 0 for ECN
    /// triggers.
    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    );

    /// A previously declared loss turned out to be spurious; the packet was delivered
    #[allow(unused_variables)]
    fn on_spurious_congestion_event(&mut self, now: Instant, bytes: u64) {}

    /// Number of ack-eliciting bytes that may be in flight
    fn window(&self) -> u64;

    /// Target rate for departing bytes, in bytes per second, if this controller paces
    fn pacing_rate(&self) -> Option<u64> {
        None
    }

    /// The estimated bottleneck bandwidth in bytes per second, if measured
    fn bandwidth_estimate(&self) -> Option<u64> {
        None
    }

    /// Signal that the connection had nothing to send when the window allowed more
    #[allow(unused_variables)]
    fn set_app_limited(&mut self, app_limited: bool) {}

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn Controller>;

    /// Initial congestion window
    fn initial_window(&self) -> u64;

    /// Returns Self for use in down-casting to extract implementation details
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Constructs controllers on demand
pub trait ControllerFactory {
    /// Construct a fresh `Controller`
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller>;
}

/// Bandwidth over an interval, in bytes per second
pub(crate) fn bw_from_delta(bytes: u64, interval: Duration) -> Option<u64> {
    let micros = interval.as_micros() as u64;
    if micros == 0 {
        return None;
    }
    Some(bytes * 1_000_000 / micros)
}

pub(crate) const BASE_DATAGRAM_SIZE: u64 = 1200;
