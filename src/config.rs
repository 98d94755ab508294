use std::{fmt, sync::Arc, time::Duration};

use crate::{
    congestion::{self, ControllerFactory},
    crypto::HmacKey,
    VarInt, DEFAULT_VERSION, INITIAL_MTU, MAX_UDP_PAYLOAD,
};

/// Global configuration for an endpoint, affecting all connections
///
/// Default values should be suitable for most internet applications.
#[derive(Clone)]
pub struct EndpointConfig {
    pub(crate) local_cid_len: usize,
    pub(crate) max_udp_payload_size: VarInt,
    /// Keys the endpoint for stateless reset token derivation
    pub(crate) reset_key: Arc<dyn HmacKey>,
    pub(crate) supported_versions: Vec<u32>,
}

impl EndpointConfig {
    /// Create a default config with a particular stateless reset key
    pub fn new(reset_key: Arc<dyn HmacKey>) -> Self {
        Self {
            local_cid_len: 8,
            max_udp_payload_size: VarInt::from_u32(MAX_UDP_PAYLOAD as u32),
            reset_key,
            supported_versions: vec![DEFAULT_VERSION],
        }
    }

    /// Length of connection IDs issued to peers for routing to this endpoint
    ///
    /// Must be zero for an endpoint serving a single connection, or long enough for
    /// the deployment's routing layer otherwise.
    pub fn local_cid_len(&mut self, value: usize) -> &mut Self {
        debug_assert!(value <= crate::MAX_CID_SIZE);
        self.local_cid_len = value;
        self
    }

    /// Maximum UDP payload size this endpoint is willing to receive
    pub fn max_udp_payload_size(&mut self, value: u16) -> &mut Self {
        self.max_udp_payload_size = VarInt::from_u32(value.into());
        self
    }

    /// Override the QUIC versions to advertise and accept, in preference order
    pub fn supported_versions(&mut self, versions: Vec<u32>) -> &mut Self {
        self.supported_versions = versions;
        self
    }
}

#[cfg(feature = "ring")]
impl Default for EndpointConfig {
    fn default() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 64];
        rand::rng().fill_bytes(&mut seed);
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &seed);
        Self::new(Arc::new(key))
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("local_cid_len", &self.local_cid_len)
            .field("max_udp_payload_size", &self.max_udp_payload_size)
            .field("supported_versions", &self.supported_versions)
            .finish_non_exhaustive()
    }
}

/// How outgoing packets are grouped into transmits
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum BatchingMode {
    /// One packet per transmit
    #[default]
    None,
    /// Successive equal-sized packets built into one contiguous buffer, to be sent
    /// with generic segmentation offload
    Gso,
    /// Multiple independent packets per poll, to be sent with `sendmmsg`
    Sendmmsg,
}

/// Congestion control algorithm selection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum CongestionAlgorithm {
    /// Model-based; see [`congestion::Bbr2`]
    #[default]
    Bbr2,
    /// Loss-based; see [`congestion::Cubic`]
    Cubic,
    /// Loss-based; see [`congestion::NewReno`]
    NewReno,
}

impl CongestionAlgorithm {
    fn factory(self) -> Arc<dyn ControllerFactory + Send + Sync> {
        match self {
            Self::Bbr2 => Arc::new(congestion::Bbr2Config::default()),
            Self::Cubic => Arc::new(congestion::CubicConfig::default()),
            Self::NewReno => Arc::new(congestion::NewRenoConfig::default()),
        }
    }
}

/// Parameters for the acknowledgement cadence we ask of the peer, and apply ourselves
#[derive(Debug, Clone)]
pub struct AckFrequencyConfig {
    pub(crate) ack_eliciting_threshold: VarInt,
    pub(crate) reordering_threshold: VarInt,
    /// Request acks no later than the path min RTT divided by this
    pub(crate) min_rtt_divisor: u32,
    /// Acknowledge every other packet until the handshake confirms, so early RTT
    /// samples and loss signals stay sharp
    pub(crate) small_threshold_during_handshake: bool,
    pub(crate) max_ack_delay: Option<Duration>,
}

impl AckFrequencyConfig {
    /// Number of ack-eliciting packets the peer may receive before sending an ACK
    pub fn ack_eliciting_threshold(&mut self, value: VarInt) -> &mut Self {
        self.ack_eliciting_threshold = value;
        self
    }

    /// Out-of-order distance that triggers an immediate ACK from the peer
    pub fn reordering_threshold(&mut self, value: VarInt) -> &mut Self {
        self.reordering_threshold = value;
        self
    }

    /// Divisor applied to min RTT when requesting the peer's maximum ack delay
    pub fn min_rtt_divisor(&mut self, value: u32) -> &mut Self {
        self.min_rtt_divisor = value.max(1);
        self
    }

    /// Whether to hold the peer to a small threshold until the handshake confirms
    pub fn small_threshold_during_handshake(&mut self, value: bool) -> &mut Self {
        self.small_threshold_during_handshake = value;
        self
    }

    /// Fixed maximum ack delay to request, overriding the RTT-derived value
    pub fn max_ack_delay(&mut self, value: Option<Duration>) -> &mut Self {
        self.max_ack_delay = value;
        self
    }
}

impl Default for AckFrequencyConfig {
    fn default() -> Self {
        Self {
            ack_eliciting_threshold: VarInt::from_u32(10),
            reordering_threshold: VarInt::from_u32(1),
            min_rtt_divisor: 4,
            small_threshold_during_handshake: true,
            max_ack_delay: None,
        }
    }
}

/// Which classes of observer events a connection emits
///
/// All off by default; each enabled class adds [`Event`](crate::Event) variants to the
/// connection's event stream.
#[derive(Debug, Copy, Clone, Default)]
pub struct ObserverConfig {
    /// Emit an event per processed ACK frame
    pub acks_processed: bool,
    /// Emit an event per loss declaration
    pub loss_detected: bool,
    /// Emit an event when a declared loss is later acked
    pub spurious_loss: bool,
    /// Emit an event per RTT sample
    pub rtt_samples: bool,
    /// Emit events on stream open and close
    pub streams: bool,
    /// Emit an event per transmitted batch
    pub packets_sent: bool,
}

impl ObserverConfig {
    /// Enable every event class
    pub fn all() -> Self {
        Self {
            acks_processed: true,
            loss_detected: true,
            spurious_loss: true,
            rtt_samples: true,
            streams: true,
            packets_sent: true,
        }
    }
}

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications. Applications
/// protocols which forbid remotely-initiated streams should set
/// `max_concurrent_bidi_streams` and `max_concurrent_uni_streams` to zero.
pub struct TransportConfig {
    pub(crate) max_concurrent_bidi_streams: VarInt,
    pub(crate) max_concurrent_uni_streams: VarInt,
    pub(crate) max_idle_timeout: Option<VarInt>,
    pub(crate) stream_receive_window: VarInt,
    pub(crate) receive_window: VarInt,
    pub(crate) send_window: u64,

    pub(crate) udp_send_packet_len: u16,
    pub(crate) max_batch_size: usize,
    pub(crate) batching_mode: BatchingMode,

    pub(crate) max_ack_delay_ms: u64,
    pub(crate) ack_frequency: AckFrequencyConfig,

    pub(crate) initial_rtt: Duration,
    pub(crate) packet_reorder_threshold: u32,
    pub(crate) adaptive_reorder_threshold: bool,
    pub(crate) time_threshold: f32,
    pub(crate) persistent_congestion_threshold: u32,

    pub(crate) keep_alive_interval: Option<Duration>,
    pub(crate) crypto_buffer_size: usize,

    pub(crate) datagram_receive_buffer_size: Option<usize>,
    pub(crate) datagram_send_buffer_size: usize,

    pub(crate) pacing_enabled: bool,
    pub(crate) pacing_tick_interval: Duration,
    pub(crate) write_limit_rtt_fraction: u32,
    pub(crate) priority_queue_writes_per_stream: usize,

    pub(crate) initiate_key_update: bool,
    pub(crate) key_update_packet_interval: u64,

    pub(crate) enable_writable_bytes_limit: bool,
    pub(crate) immediate_initial_retransmit: bool,

    pub(crate) congestion_controller_factory: Arc<dyn ControllerFactory + Send + Sync>,
    pub(crate) observer: ObserverConfig,
}

impl TransportConfig {
    /// Maximum number of incoming bidirectional streams that may be open concurrently
    pub fn max_concurrent_bidi_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_bidi_streams = value;
        self
    }

    /// Maximum number of incoming unidirectional streams that may be open concurrently
    pub fn max_concurrent_uni_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_uni_streams = value;
        self
    }

    /// Maximum duration of inactivity to accept before timing out the connection, in
    /// milliseconds; `None` disables the timeout
    pub fn max_idle_timeout(&mut self, value: Option<VarInt>) -> &mut Self {
        self.max_idle_timeout = value;
        self
    }

    /// Maximum number of bytes the peer may transmit on any one stream before
    /// becoming blocked
    pub fn stream_receive_window(&mut self, value: VarInt) -> &mut Self {
        self.stream_receive_window = value;
        self
    }

    /// Maximum number of bytes the peer may transmit across all streams of a
    /// connection before becoming blocked
    pub fn receive_window(&mut self, value: VarInt) -> &mut Self {
        self.receive_window = value;
        self
    }

    /// Maximum number of bytes to buffer for sending across all streams
    pub fn send_window(&mut self, value: u64) -> &mut Self {
        self.send_window = value;
        self
    }

    /// UDP payload size of outgoing packets
    pub fn udp_send_packet_len(&mut self, value: u16) -> &mut Self {
        self.udp_send_packet_len = value.max(INITIAL_MTU);
        self
    }

    /// Maximum number of packets built per write loop invocation
    pub fn max_batch_size(&mut self, value: usize) -> &mut Self {
        self.max_batch_size = value.max(1);
        self
    }

    /// How outgoing packets are grouped into transmits
    pub fn batching_mode(&mut self, value: BatchingMode) -> &mut Self {
        self.batching_mode = value;
        self
    }

    /// Select a built-in congestion controller
    pub fn congestion_algorithm(&mut self, value: CongestionAlgorithm) -> &mut Self {
        self.congestion_controller_factory = value.factory();
        self
    }

    /// Provide a custom congestion controller factory
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn ControllerFactory + Send + Sync>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }

    /// Acknowledgement cadence parameters
    pub fn ack_frequency(&mut self, value: AckFrequencyConfig) -> &mut Self {
        self.ack_frequency = value;
        self
    }

    /// Whether to proactively rotate 1-RTT keys
    pub fn initiate_key_update(&mut self, value: bool) -> &mut Self {
        self.initiate_key_update = value;
        self
    }

    /// Packets sent in a key phase before a locally-initiated key update
    pub fn key_update_packet_interval(&mut self, value: u64) -> &mut Self {
        self.key_update_packet_interval = value.max(1);
        self
    }

    /// Fraction of the smoothed RTT a single write loop may consume
    pub fn write_limit_rtt_fraction(&mut self, value: u32) -> &mut Self {
        self.write_limit_rtt_fraction = value.max(1);
        self
    }

    /// Successive stream frames drawn from one stream per packet-build pass
    pub fn priority_queue_writes_per_stream(&mut self, value: usize) -> &mut Self {
        self.priority_queue_writes_per_stream = value.max(1);
        self
    }

    /// Whether to pace outgoing packets to the congestion controller's rate
    pub fn pacing_enabled(&mut self, value: bool) -> &mut Self {
        self.pacing_enabled = value;
        self
    }

    /// Granularity of the pacer's token accrual
    pub fn pacing_tick_interval(&mut self, value: Duration) -> &mut Self {
        self.pacing_tick_interval = value.max(Duration::from_micros(100));
        self
    }

    /// Limit server sends to three times received bytes until the client's address
    /// is validated
    pub fn enable_writable_bytes_limit(&mut self, value: bool) -> &mut Self {
        self.enable_writable_bytes_limit = value;
        self
    }

    /// Clone the client's first Initial packet immediately rather than waiting for
    /// loss detection
    pub fn immediate_initial_retransmit(&mut self, value: bool) -> &mut Self {
        self.immediate_initial_retransmit = value;
        self
    }

    /// Ping the peer when no ack-eliciting packet has been sent recently
    pub fn keep_alive_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.keep_alive_interval = value;
        self
    }

    /// Maximum unordered crypto data to buffer per encryption level
    pub fn crypto_buffer_size(&mut self, value: usize) -> &mut Self {
        self.crypto_buffer_size = value.max(4096);
        self
    }

    /// Incoming DATAGRAM frame buffer, `None` to decline datagram support
    pub fn datagram_receive_buffer_size(&mut self, value: Option<usize>) -> &mut Self {
        self.datagram_receive_buffer_size = value;
        self
    }

    /// Outgoing DATAGRAM frame buffer
    pub fn datagram_send_buffer_size(&mut self, value: usize) -> &mut Self {
        self.datagram_send_buffer_size = value;
        self
    }

    /// Maximum reordering in packet numbers before loss is declared, and whether the
    /// threshold adapts upward when reordering proves deeper than assumed
    pub fn packet_reorder_threshold(&mut self, value: u32, adaptive: bool) -> &mut Self {
        self.packet_reorder_threshold = value.max(1);
        self.adaptive_reorder_threshold = adaptive;
        self
    }

    /// Which observer events the connection surfaces
    pub fn observer(&mut self, value: ObserverConfig) -> &mut Self {
        self.observer = value;
        self
    }

    /// RTT used before an actual sample is available
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u32 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u32 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;

        Self {
            max_concurrent_bidi_streams: VarInt::from_u32(100),
            max_concurrent_uni_streams: VarInt::from_u32(100),
            max_idle_timeout: Some(VarInt::from_u32(30_000)),
            stream_receive_window: VarInt::from_u32(STREAM_RWND),
            receive_window: VarInt::from_u32(8 * STREAM_RWND),
            send_window: 8 * STREAM_RWND as u64,

            udp_send_packet_len: 1452,
            max_batch_size: 16,
            batching_mode: BatchingMode::default(),

            max_ack_delay_ms: 25,
            ack_frequency: AckFrequencyConfig::default(),

            initial_rtt: Duration::from_millis(333),
            packet_reorder_threshold: 3,
            adaptive_reorder_threshold: false,
            time_threshold: 9.0 / 8.0,
            persistent_congestion_threshold: 3,

            keep_alive_interval: None,
            crypto_buffer_size: 16 * 1024,

            datagram_receive_buffer_size: Some(65536),
            datagram_send_buffer_size: 65536,

            pacing_enabled: true,
            pacing_tick_interval: Duration::from_millis(1),
            write_limit_rtt_fraction: 4,
            priority_queue_writes_per_stream: 2,

            initiate_key_update: false,
            key_update_packet_interval: 1 << 22,

            enable_writable_bytes_limit: true,
            immediate_initial_retransmit: false,

            congestion_controller_factory: CongestionAlgorithm::default().factory(),
            observer: ObserverConfig::default(),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("max_concurrent_bidi_streams", &self.max_concurrent_bidi_streams)
            .field("max_concurrent_uni_streams", &self.max_concurrent_uni_streams)
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("stream_receive_window", &self.stream_receive_window)
            .field("receive_window", &self.receive_window)
            .field("send_window", &self.send_window)
            .field("udp_send_packet_len", &self.udp_send_packet_len)
            .field("batching_mode", &self.batching_mode)
            .field("initial_rtt", &self.initial_rtt)
            .field("pacing_enabled", &self.pacing_enabled)
            .finish_non_exhaustive()
    }
}
