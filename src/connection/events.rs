use std::time::{Duration, Instant};

use crate::{frame::EcnCounts, packet::SpaceId, Dir, StreamId, VarInt};

use super::ConnectionError;

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// The handshake produced data the application may want before `Connected`
    ///
    /// For a server, emitted when the client's first flight has been consumed, so
    /// e.g. the negotiated application protocol can be inspected.
    HandshakeDataReady,
    /// The connection was successfully established
    Connected,
    /// The connection was lost
    ///
    /// Emitted if the peer closes the connection, an idle timeout fires, or a
    /// protocol violation is detected.
    ConnectionLost {
        /// Reason that the connection was closed
        reason: ConnectionError,
    },
    /// Stream events
    Stream(StreamEvent),
    /// One or more application datagrams have been received
    DatagramReceived,
    /// An ACK frame was processed
    ///
    /// Only emitted when [`ObserverConfig::acks_processed`](crate::ObserverConfig)
    /// is set.
    AckProcessed(AckEvent),
    /// Outstanding packets were declared lost
    ///
    /// Only emitted when [`ObserverConfig::loss_detected`](crate::ObserverConfig)
    /// is set.
    LossDetected(LossEvent),
    /// A packet declared lost was later acknowledged
    ///
    /// Only emitted when [`ObserverConfig::spurious_loss`](crate::ObserverConfig)
    /// is set.
    SpuriousLoss(SpuriousLossEvent),
    /// A new RTT sample was taken
    ///
    /// Only emitted when [`ObserverConfig::rtt_samples`](crate::ObserverConfig)
    /// is set.
    RttSample(RttSample),
    /// A batch of packets was handed to the transmit path
    ///
    /// Only emitted when [`ObserverConfig::packets_sent`](crate::ObserverConfig)
    /// is set.
    PacketsSent {
        /// Packets in the batch
        count: u64,
        /// Total encoded size, including headers and AEAD overhead
        bytes: u64,
    },
}

/// Application-facing stream activity
#[derive(Debug)]
pub enum StreamEvent {
    /// One or more new streams has been opened by the peer and might be readable
    Opened {
        /// Directionality for which streams have been opened
        dir: Dir,
    },
    /// A currently open stream has data waiting to be read
    Readable {
        /// Which stream is now readable
        id: StreamId,
    },
    /// A formerly write-blocked stream might be ready for a write or have been
    /// stopped
    Writable {
        /// Which stream is now writable
        id: StreamId,
    },
    /// A finished stream has been fully acknowledged or stopped
    Finished {
        /// Which stream has been finished
        id: StreamId,
    },
    /// The peer asked us to stop sending on an outgoing stream
    Stopped {
        /// Which stream has been stopped
        id: StreamId,
        /// Error code supplied by the peer
        error_code: VarInt,
    },
    /// At least one new stream of a certain directionality may be opened
    Available {
        /// Directionality for which streams are newly available
        dir: Dir,
    },
    /// A stream left both send and receive use; its state has been dropped
    Closed {
        /// Which stream was closed
        id: StreamId,
    },
}

/// Summary of one processed ACK frame
#[derive(Debug, Clone)]
pub struct AckEvent {
    /// Space the ACK arrived in
    pub space: SpaceId,
    /// When the ACK was received
    pub ack_time: Instant,
    /// Receive time minus the peer's self-reported delay
    pub adjusted_ack_time: Instant,
    /// The peer's self-reported delay, unscaled
    pub ack_delay: Duration,
    /// The largest packet number this ACK newly acknowledged, if any
    pub largest_newly_acked: Option<u64>,
    /// Total bytes newly acknowledged
    pub newly_acked_bytes: u64,
    /// Number of packets newly acknowledged
    pub newly_acked_packets: u64,
    /// RTT sample taken from this ACK, when the largest acked was newly acked
    pub rtt_sample: Option<Duration>,
    /// ECN counts carried by the frame, if any
    pub ecn: Option<EcnCounts>,
    /// Whether this was an internally-generated ack implied by handshake
    /// confirmation rather than a frame from the peer
    pub implicit: bool,
}

/// Summary of one round of loss detection
#[derive(Debug, Clone)]
pub struct LossEvent {
    /// Space the losses were declared in
    pub space: SpaceId,
    /// Number of packets declared lost
    pub packets: u64,
    /// Total size of packets declared lost
    pub bytes: u64,
    /// Largest packet number declared lost
    pub largest_lost: u64,
    /// Whether the span of losses triggered persistent congestion
    pub persistent_congestion: bool,
}

/// A packet formerly declared lost has been acknowledged after all
#[derive(Debug, Clone)]
pub struct SpuriousLossEvent {
    /// Space of the rehabilitated packet
    pub space: SpaceId,
    /// Its packet number
    pub packet_number: u64,
}

/// One RTT measurement
#[derive(Debug, Clone, Copy)]
pub struct RttSample {
    /// The raw sample
    pub rtt: Duration,
    /// The peer's self-reported ack delay, already unscaled
    pub ack_delay: Duration,
}
