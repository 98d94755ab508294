//! Connection statistics

use std::time::Duration;

/// Statistics on UDP datagrams transmitted or received
#[derive(Default, Debug, Copy, Clone)]
#[non_exhaustive]
pub struct UdpStats {
    /// The total amount of UDP datagrams observed
    pub datagrams: u64,
    /// The total amount of bytes which have been transferred inside UDP datagrams
    pub bytes: u64,
}

impl UdpStats {
    pub(crate) fn on_io(&mut self, bytes: u64) {
        self.datagrams += 1;
        self.bytes += bytes;
    }
}

/// Statistics related to the current transmission path
#[derive(Default, Debug, Copy, Clone)]
#[non_exhaustive]
pub struct PathStats {
    /// Current best estimate of this connection's latency (round-trip-time)
    pub rtt: Duration,
    /// Current congestion window of the connection
    pub cwnd: u64,
    /// Congestion events on the connection
    pub congestion_events: u64,
    /// The amount of packets lost on this path
    pub lost_packets: u64,
    /// The amount of bytes lost on this path
    pub lost_bytes: u64,
    /// Losses that later turned out to be delivered
    pub spurious_losses: u64,
    /// The amount of packets sent on this path
    pub sent_packets: u64,
    /// The amount of ack-eliciting packets sent on this path
    pub sent_ack_eliciting_packets: u64,
    /// The amount of packet bytes acknowledged by the peer
    pub acked_bytes: u64,
    /// Bytes queued for retransmission after loss
    pub retransmitted_bytes: u64,
    /// Probe timeouts fired
    pub ptos: u64,
}

/// Connection statistics
#[derive(Default, Debug, Copy, Clone)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// Statistics about UDP datagrams transmitted on a connection
    pub udp_tx: UdpStats,
    /// Statistics about UDP datagrams received on a connection
    pub udp_rx: UdpStats,
    /// Statistics about the current transmission path
    pub path: PathStats,
    /// 1-RTT key regenerations, locally or peer initiated
    pub key_updates: u64,
}
