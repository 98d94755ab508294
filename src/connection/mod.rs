use std::{
    collections::{BTreeMap, VecDeque},
    fmt, mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    config::{BatchingMode, EndpointConfig, TransportConfig},
    crypto::{self, HmacKey, KeyChange, KeyPair},
    frame::{self, ApplicationClose, Close, ConnectionClose, Datagram, Frame, FrameStruct},
    packet::{Header, LongType, PacketNumber, PartialDecode, SpaceId},
    range_set::RangeSet,
    shared::{ConnectionId, EcnCodepoint, ResetToken},
    transport_error::{Code as TransportErrorCode, TransportError},
    transport_parameters::TransportParameters,
    Dir, Side, StreamId, VarInt, MIN_INITIAL_SIZE, RESET_TOKEN_SIZE, TIMER_GRANULARITY,
};

mod ack_frequency;
mod assembler;
mod events;
mod pacing;
mod packet_builder;
mod paths;
mod send_buffer;
mod spaces;
mod stats;
mod streams;
mod timer;

use ack_frequency::AckFrequencyState;
pub use events::{AckEvent, Event, LossEvent, RttSample, SpuriousLossEvent, StreamEvent};
use packet_builder::PacketBuilder;
use paths::PathData;
pub use paths::RttEstimator;
use spaces::{PacketSpace, Retransmits, SentPacket};
pub use stats::ConnectionStats;
pub use streams::{ReadError, WriteError};
use streams::StreamsState;
use timer::{Timer, TimerTable};

/// An outgoing batch of datagrams, ready for the UDP socket
#[derive(Debug)]
pub struct Transmit {
    /// The socket this datagram should be sent to
    pub destination: SocketAddr,
    /// Explicit congestion notification bits to set on the packet
    pub ecn: Option<EcnCodepoint>,
    /// Contents of the datagram(s)
    pub contents: Vec<u8>,
    /// The size of a single datagram in the payload, when `contents` holds several
    /// equal-sized datagrams for segmentation offload
    pub segment_size: Option<usize>,
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("aborted by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer closed the connection
    #[error("closed by peer: {0}")]
    ApplicationClosed(ApplicationClose),
    /// The peer is unable to continue processing this connection, usually due to
    /// having restarted
    #[error("reset by peer")]
    Reset,
    /// Communication with the peer has lapsed for longer than the negotiated idle
    /// timeout
    #[error("timed out")]
    TimedOut,
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
}

/// Errors that can arise when sending an unreliable datagram
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SendDatagramError {
    /// The peer does not support receiving datagram frames
    #[error("datagrams not supported by peer")]
    UnsupportedByPeer,
    /// Datagram support is disabled locally
    #[error("datagram support disabled")]
    Disabled,
    /// The datagram is larger than the connection can currently accommodate
    #[error("datagram too large")]
    TooLarge,
}

/// Protocol state machine for a single connection
///
/// Objects of this type receive datagrams, timer expirations, and application calls,
/// and produce datagrams to send, timer deadlines, and events; they perform no I/O
/// themselves. All state lives here: stream state, packet-number spaces with their
/// outstanding-packet records, the loss detector, congestion control, and keys.
pub struct Connection {
    side: Side,
    config: Arc<TransportConfig>,
    session: Box<dyn crypto::Session>,
    version: u32,
    /// CID the peer addresses us by
    local_cid: ConnectionId,
    local_cid_len: usize,
    next_local_cid_seq: u64,
    /// Current destination CID for egress; exactly one at any moment
    rem_cid: ConnectionId,
    /// Whether the peer's handshake source CID has been adopted
    rem_cid_set: bool,
    rem_cid_seq: u64,
    /// Spare CIDs the peer has issued
    rem_cids: BTreeMap<u64, (ConnectionId, ResetToken)>,
    /// Stateless reset tokens that terminate this connection on sight
    peer_reset_tokens: Vec<ResetToken>,
    reset_key: Arc<dyn HmacKey>,

    path: PathData,
    prev_remote: Option<SocketAddr>,
    state: State,
    error: Option<ConnectionError>,

    spaces: [PacketSpace; 3],
    highest_space: SpaceId,
    /// Earliest space that still holds keys
    lowest_space: SpaceId,
    handshake_confirmed: bool,

    /// 1-RTT read keys of the previous key phase, kept briefly for reordered packets
    prev_rx_key: Option<Box<dyn crypto::PacketKey>>,
    /// Packet keys of the next key phase
    next_crypto: Option<KeyPair<Box<dyn crypto::PacketKey>>>,
    key_phase: bool,
    /// First packet sent in the current phase after a locally-initiated update,
    /// awaiting acknowledgement under the new phase
    key_update_pending_verify: Option<u64>,

    streams: StreamsState,
    datagrams: DatagramState,
    ack_frequency: AckFrequencyState,
    /// Cadence the peer has asked of us via ACK_FREQUENCY
    requested_ack_threshold: Option<u64>,
    last_ack_frequency_seq: Option<u64>,
    requested_max_ack_delay: Option<Duration>,

    peer_params: TransportParameters,
    peer_params_ready: bool,
    local_params: TransportParameters,

    timers: TimerTable,
    idle_timeout: Option<Duration>,
    pto_count: u32,
    /// Adaptive packet-reorder threshold for loss detection, per spurious losses
    reorder_threshold: u64,
    /// Packet numbers declared lost, for spurious-loss detection
    declared_lost: [RangeSet; 3],

    clone_counter: u64,
    /// Probe content cloned from an outstanding packet, consumed by the next build
    probe_clone: Option<ProbeClone>,

    /// 1-RTT datagrams received before keys were available
    pre_key_datagrams: VecDeque<(Instant, SocketAddr, Option<EcnCodepoint>, BytesMut)>,

    /// CLOSE may be sent in response to each incoming packet while closing
    close_pending: bool,

    events: VecDeque<Event>,
    stats: ConnectionStats,
    app_limited: bool,

    rng: rand::rngs::StdRng,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RxKeySelect {
    Current,
    Prev,
    Next,
}

struct ProbeClone {
    space: SpaceId,
    clone_id: u64,
    stream_frames: frame::StreamMetaVec,
    crypto: Option<std::ops::Range<u64>>,
}

struct DatagramState {
    incoming: VecDeque<Bytes>,
    incoming_bytes: usize,
    outgoing: VecDeque<Datagram>,
    outgoing_bytes: usize,
}

#[derive(Debug, Clone)]
enum State {
    Handshake,
    Established,
    /// Locally closed; CLOSE frames go out until the drain period ends
    Closing { reason: Close },
    /// Peer closed or stateless reset; stay quiet until the drain period ends
    Draining,
    Drained,
}

impl State {
    fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }
    fn is_closed(&self) -> bool {
        matches!(self, Self::Closing { .. } | Self::Draining | Self::Drained)
    }
    fn is_drained(&self) -> bool {
        matches!(self, Self::Drained)
    }
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoint_config: &EndpointConfig,
        config: Arc<TransportConfig>,
        side: Side,
        version: u32,
        local_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddr,
        session: Box<dyn crypto::Session>,
        local_params: TransportParameters,
        now: Instant,
    ) -> Self {
        let mut spaces = [
            PacketSpace::new(now),
            PacketSpace::new(now),
            PacketSpace::new(now),
        ];
        // Both sides can compute Initial keys from the client's first destination CID
        let initial_dst = match side {
            Side::Client => rem_cid,
            Side::Server => local_cid,
        };
        spaces[SpaceId::Initial].crypto = Some(crypto::initial_keys(version, &initial_dst, side));
        let mut rng_seed = [0u8; 32];
        rand::rng().fill_bytes(&mut rng_seed);
        let mut this = Self {
            side,
            path: PathData::new(remote, now, side.is_client(), &config),
            prev_remote: None,
            state: State::Handshake,
            error: None,
            spaces,
            highest_space: SpaceId::Initial,
            lowest_space: SpaceId::Initial,
            handshake_confirmed: false,
            prev_rx_key: None,
            next_crypto: None,
            key_phase: false,
            key_update_pending_verify: None,
            streams: StreamsState::new(side, &config),
            datagrams: DatagramState {
                incoming: VecDeque::new(),
                incoming_bytes: 0,
                outgoing: VecDeque::new(),
                outgoing_bytes: 0,
            },
            ack_frequency: AckFrequencyState::new(Duration::from_millis(25)),
            requested_ack_threshold: None,
            last_ack_frequency_seq: None,
            requested_max_ack_delay: None,
            peer_params: TransportParameters::default(),
            peer_params_ready: false,
            local_params,
            timers: TimerTable::default(),
            idle_timeout: config
                .max_idle_timeout
                .map(|ms| Duration::from_millis(ms.into_inner())),
            pto_count: 0,
            reorder_threshold: u64::from(config.packet_reorder_threshold),
            declared_lost: [RangeSet::new(), RangeSet::new(), RangeSet::new()],
            clone_counter: 0,
            probe_clone: None,
            pre_key_datagrams: VecDeque::new(),
            close_pending: false,
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
            app_limited: false,
            rng: rand::SeedableRng::from_seed(rng_seed),
            session,
            version,
            local_cid,
            local_cid_len: endpoint_config.local_cid_len,
            next_local_cid_seq: 1,
            rem_cid,
            rem_cid_seq: 0,
            rem_cid_set: false,
            rem_cids: BTreeMap::new(),
            peer_reset_tokens: Vec::new(),
            reset_key: endpoint_config.reset_key.clone(),
            config,
        };
        if side.is_client() {
            // Kick off the handshake; the first poll_transmit carries the ClientHello
            this.drive_handshake(now);
        }
        this
    }

    /// The side of this connection
    pub fn side(&self) -> Side {
        self.side
    }

    /// Current best estimate of the path round-trip time
    pub fn rtt(&self) -> Duration {
        self.path.rtt.get()
    }

    /// Connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats;
        stats.path.rtt = self.path.rtt.get();
        stats.path.cwnd = self.path.congestion.window();
        stats
    }

    /// Whether the handshake has not yet completed
    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, State::Handshake)
    }

    /// Whether the connection is closed locally or by the peer
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether the drain period has passed and all state may be discarded
    pub fn is_drained(&self) -> bool {
        self.state.is_drained()
    }

    /// The CID the peer currently addresses us by
    pub(crate) fn local_cid(&self) -> ConnectionId {
        self.local_cid
    }

    /// Returns application-facing events
    pub fn poll(&mut self) -> Option<Event> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        self.streams.poll_event().map(Event::Stream)
    }

    /// Next instant at which `handle_timeout` must be called, if any
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        if self.state.is_drained() {
            return None;
        }
        self.timers.next_timeout()
    }

    // === Application stream API ===

    /// Open a new stream, if the peer's stream limits allow
    pub fn open(&mut self, dir: Dir) -> Option<StreamId> {
        if self.state.is_closed() {
            return None;
        }
        let id = self.streams.open(dir)?;
        trace!(stream = %id, "opened");
        Some(id)
    }

    /// Accept a stream the peer opened, if one is waiting
    pub fn accept(&mut self, dir: Dir) -> Option<StreamId> {
        self.streams.accept(dir)
    }

    /// Queue stream data for transmission, with optional FIN
    pub fn write(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize, WriteError> {
        if self.state.is_closed() {
            return Err(WriteError::ClosedStream);
        }
        let n = self.streams.write(id, data, fin)?;
        Ok(n)
    }

    /// Read available stream data, in order
    ///
    /// Returns `Ok(None)` at end of stream.
    pub fn read(
        &mut self,
        id: StreamId,
        max_length: usize,
    ) -> Result<Option<(Bytes, bool)>, ReadError> {
        self.streams.read(id, max_length)
    }

    /// Signal no further data will be written to `id`
    pub fn finish(&mut self, id: StreamId) -> Result<(), WriteError> {
        self.streams.finish(id)
    }

    /// Abandon sending on `id`
    ///
    /// With `reliable_size`, commits to delivering that prefix before the reset takes
    /// effect.
    pub fn reset(&mut self, id: StreamId, error_code: VarInt, reliable_size: Option<u64>) {
        if let Some(frame) = self.streams.reset(id, error_code, reliable_size) {
            self.spaces[SpaceId::Data].pending.reset_stream.push(frame);
        }
    }

    /// Ask the peer to abandon sending on `id`
    pub fn stop_sending(&mut self, id: StreamId, error_code: VarInt) {
        if let Some(frame) = self.streams.stop_sending(id, error_code) {
            self.spaces[SpaceId::Data].pending.stop_sending.push(frame);
        }
    }

    /// Set the scheduling priority of `id`
    pub fn set_priority(&mut self, id: StreamId, priority: i32, incremental: bool) -> bool {
        self.streams.set_priority(id, priority, incremental)
    }

    /// Queue an unreliable datagram
    pub fn send_datagram(&mut self, data: Bytes) -> Result<(), SendDatagramError> {
        let max = self
            .peer_params
            .max_datagram_frame_size
            .ok_or(SendDatagramError::UnsupportedByPeer)?
            .into_inner() as usize;
        let frame = Datagram { data };
        if frame.size(true) > max.min(self.path.current_mtu as usize - 20) {
            return Err(SendDatagramError::TooLarge);
        }
        self.datagrams.outgoing_bytes += frame.data.len();
        self.datagrams.outgoing.push_back(frame);
        while self.datagrams.outgoing_bytes > self.config.datagram_send_buffer_size {
            let dropped = self.datagrams.outgoing.pop_front().unwrap();
            self.datagrams.outgoing_bytes -= dropped.data.len();
            debug!("dropping outgoing datagram: send buffer full");
        }
        Ok(())
    }

    /// Receive an unreliable datagram, if one is queued
    pub fn recv_datagram(&mut self) -> Option<Bytes> {
        let data = self.datagrams.incoming.pop_front()?;
        self.datagrams.incoming_bytes -= data.len();
        Some(data)
    }

    /// Close the connection with an application error
    ///
    /// The connection keeps answering incoming packets with CONNECTION_CLOSE for
    /// three PTOs, then drains.
    pub fn close(&mut self, now: Instant, error_code: VarInt, reason: Bytes) {
        self.close_impl(
            now,
            Close::Application(ApplicationClose { error_code, reason }),
        );
        if self.error.is_none() {
            self.error = Some(ConnectionError::LocallyClosed);
        }
    }

    /// Rotate 1-RTT keys now, if the state machine allows it
    pub fn initiate_key_update(&mut self) -> bool {
        self.try_key_update(true)
    }

    // === Ingress ===

    /// Process an incoming UDP datagram
    pub fn handle_datagram(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
    ) {
        if self.state.is_drained() {
            return;
        }
        self.stats.udp_rx.on_io(data.len() as u64);
        if self.is_stateless_reset(&data) {
            debug!("stateless reset detected");
            self.terminate(now, ConnectionError::Reset);
            return;
        }
        if remote == self.path.remote {
            self.path.total_recvd = self.path.total_recvd.saturating_add(data.len() as u64);
        }

        let mut remaining = Some(data);
        while let Some(segment) = remaining.take() {
            if segment.is_empty() {
                break;
            }
            let (partial, rest) = match PartialDecode::new(segment, self.local_cid_len) {
                Ok(x) => x,
                Err(e) => {
                    trace!("malformed header: {e}");
                    return;
                }
            };
            remaining = rest;
            self.handle_decode(now, remote, ecn, partial);
            if self.state.is_drained() {
                return;
            }
        }
    }

    fn is_stateless_reset(&self, data: &BytesMut) -> bool {
        if data.len() < RESET_TOKEN_SIZE + 5 {
            return false;
        }
        let tail = &data[data.len() - RESET_TOKEN_SIZE..];
        self.peer_reset_tokens.iter().any(|token| &token[..] == tail)
    }

    fn handle_decode(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        partial: PartialDecode,
    ) {
        let Some(space_id) = partial.space() else {
            trace!("dropping version negotiation or unsupported packet");
            return;
        };
        if partial.is_0rtt() {
            // Servers that wanted 0-RTT would install early keys here instead
            trace!("dropping 0-RTT packet");
            return;
        }
        if self.spaces[space_id].crypto.is_none() {
            if space_id == SpaceId::Data && !self.state.is_closed() {
                // 1-RTT packets may arrive while the handshake is still concluding
                if self.pre_key_datagrams.len() < MAX_PRE_KEY_DATAGRAMS {
                    trace!("queueing 1-RTT packet received before keys");
                    // Reconstruct the raw bytes for later processing
                    let bytes = BytesMut::from(partial.data());
                    self.pre_key_datagrams.push_back((now, remote, ecn, bytes));
                }
            } else {
                trace!(?space_id, "dropping packet for space without keys");
            }
            return;
        }

        let number_space_largest = self.spaces[space_id].rx_packet;
        let key_phase_current = self.key_phase;
        let packet = {
            let keys = self.spaces[space_id].crypto.as_ref().unwrap();
            match partial.finish(Some(keys.header.remote.as_ref())) {
                Ok(packet) => packet,
                Err(e) => {
                    trace!("header protection removal failed: {e}");
                    return;
                }
            }
        };
        let number = match packet.header.number() {
            Some(pn) => pn.expand(number_space_largest),
            None => {
                trace!("dropping packet without number");
                return;
            }
        };

        // Select the packet key, accounting for 1-RTT key phase
        let phase_flipped =
            space_id == SpaceId::Data && packet.header.key_phase() != key_phase_current;
        let mut payload = packet.payload;
        let key_select = match self.decrypt_payload(
            space_id,
            number,
            phase_flipped,
            &packet.header_data,
            &mut payload,
        ) {
            Ok(x) => x,
            Err(()) => {
                trace!(space = ?space_id, pn = number, "payload decryption failed, dropping packet");
                return;
            }
        };

        if self.spaces[space_id].dedup.insert(number) {
            trace!(pn = number, "discarding duplicate packet");
            return;
        }
        self.spaces[space_id].rx_packet = self.spaces[space_id].rx_packet.max(number);

        // Adopt the peer's handshake source CID as our destination
        if !self.rem_cid_set {
            if let Header::Initial { src_cid, .. } | Header::Long { src_cid, .. } =
                &packet.header
            {
                self.rem_cid = *src_cid;
                self.rem_cid_set = true;
            }
        }

        // An authenticated packet from the peer proves it holds keys for this space
        if space_id == SpaceId::Handshake && self.side.is_server() {
            self.path.validated = true;
            self.discard_space(now, SpaceId::Initial);
        }
        if key_select == RxKeySelect::Next {
            self.commit_peer_key_update();
        }

        // Migration: an authenticated non-probing packet from a new address moves
        // the path
        if remote != self.path.remote && self.state.is_established() {
            self.migrate(now, remote);
        }

        if self.state.is_closed() {
            // Answer each incoming packet with at most one CLOSE
            self.close_pending = matches!(self.state, State::Closing { .. });
            return;
        }

        if let Err(e) = self.process_payload(
            now,
            space_id,
            number,
            ecn,
            payload.freeze(),
            key_select == RxKeySelect::Prev,
        ) {
            self.fail_with(now, e);
        } else {
            self.reset_idle_timer(now);
            self.flush_pre_key_datagrams(now);
        }
    }

    /// Decrypt a packet body in place; `Err` means drop the packet
    ///
    /// On a flipped key-phase bit, the retired key is tried first (a reordered
    /// packet from the previous phase), then the next-phase key (a peer-initiated
    /// key update).
    fn decrypt_payload(
        &mut self,
        space_id: SpaceId,
        number: u64,
        phase_flipped: bool,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<RxKeySelect, ()> {
        if !phase_flipped {
            let keys = self.spaces[space_id].crypto.as_ref().unwrap();
            return keys
                .packet
                .remote
                .decrypt(number, header, payload)
                .map(|()| RxKeySelect::Current)
                .map_err(|_| ());
        }
        if let Some(ref prev_key) = self.prev_rx_key {
            let mut copy = payload.clone();
            if prev_key.decrypt(number, header, &mut copy).is_ok() {
                *payload = copy;
                return Ok(RxKeySelect::Prev);
            }
        }
        if self.next_crypto.is_none() {
            self.next_crypto = self.session.next_1rtt_keys();
        }
        let Some(next) = self.next_crypto.as_ref() else {
            return Err(());
        };
        next.remote
            .decrypt(number, header, payload)
            .map(|()| RxKeySelect::Next)
            .map_err(|_| ())
    }

    /// Adopt the peer-initiated key update after a packet authenticated under the
    /// next phase
    fn commit_peer_key_update(&mut self) {
        let Some(next) = self.next_crypto.take() else {
            return;
        };
        let keys = self.spaces[SpaceId::Data].crypto.as_mut().unwrap();
        let old_packet = mem::replace(&mut keys.packet, next);
        self.prev_rx_key = Some(old_packet.remote);
        self.key_phase = !self.key_phase;
        self.spaces[SpaceId::Data].sent_with_keys = 0;
        self.next_crypto = self.session.next_1rtt_keys();
        self.stats.key_updates += 1;
        debug!(phase = self.key_phase, "key update (peer initiated)");
    }

    /// Begin a locally-initiated key update
    fn try_key_update(&mut self, forced: bool) -> bool {
        if !self.handshake_confirmed || self.key_update_pending_verify.is_some() {
            return false;
        }
        if !forced
            && self.spaces[SpaceId::Data].sent_with_keys < self.config.key_update_packet_interval
        {
            return false;
        }
        if self.next_crypto.is_none() {
            self.next_crypto = self.session.next_1rtt_keys();
        }
        let Some(next) = self.next_crypto.take() else {
            return false;
        };
        let space = &mut self.spaces[SpaceId::Data];
        let keys = space.crypto.as_mut().unwrap();
        let old = mem::replace(&mut keys.packet, next);
        self.prev_rx_key = Some(old.remote);
        self.key_phase = !self.key_phase;
        self.key_update_pending_verify = Some(space.next_packet_number);
        space.sent_with_keys = 0;
        self.next_crypto = self.session.next_1rtt_keys();
        self.stats.key_updates += 1;
        debug!(phase = self.key_phase, "key update (locally initiated)");
        true
    }

    fn flush_pre_key_datagrams(&mut self, now: Instant) {
        if self.spaces[SpaceId::Data].crypto.is_none() {
            return;
        }
        while let Some((_, remote, ecn, data)) = self.pre_key_datagrams.pop_front() {
            self.handle_datagram(now, remote, ecn, data);
        }
    }

    fn process_payload(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        number: u64,
        ecn: Option<EcnCodepoint>,
        payload: Bytes,
        old_phase: bool,
    ) -> Result<(), TransportError> {
        let mut ack_eliciting = false;
        let mut closed = false;
        for result in frame::Iter::new(payload)? {
            let frame = result?;
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Crypto(crypto) => {
                    self.process_crypto(now, space_id, crypto)?;
                }
                Frame::Ack(ack) => {
                    self.on_ack_received(now, space_id, ack, old_phase)?;
                }
                Frame::Stream(stream) => {
                    if space_id != SpaceId::Data {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "STREAM frame outside application space",
                        ));
                    }
                    self.streams.received_stream_frame(stream)?;
                }
                Frame::ResetStream(reset) => {
                    self.streams.received_reset(&reset)?;
                }
                Frame::StopSending(frame::StopSending { id, error_code }) => {
                    if let Some(reset) = self.streams.received_stop_sending(id, error_code)? {
                        self.spaces[SpaceId::Data].pending.reset_stream.push(reset);
                    }
                }
                Frame::MaxData(limit) => {
                    self.streams.received_max_data(limit.into_inner());
                }
                Frame::MaxStreamData { id, offset } => {
                    self.streams.received_max_stream_data(id, offset);
                }
                Frame::MaxStreams { dir, count } => {
                    self.streams.received_max_streams(dir, count)?;
                }
                Frame::DataBlocked { offset } => {
                    debug!(offset, "peer claims to be blocked at connection level");
                }
                Frame::StreamDataBlocked { id, offset } => {
                    debug!(stream = %id, offset, "peer claims to be blocked at stream level");
                }
                Frame::StreamsBlocked { dir, limit } => {
                    debug!(%dir, limit, "peer claims to be blocked on stream count");
                }
                Frame::NewConnectionId(frame) => {
                    self.handle_new_cid(frame)?;
                }
                Frame::RetireConnectionId { sequence } => {
                    self.handle_retire_cid(sequence)?;
                }
                Frame::PathChallenge(token) => {
                    // Reflected in a packet on the same path; one pending at a time
                    self.path.challenge_response = Some(token);
                }
                Frame::PathResponse(token) => {
                    if self.path.challenge == Some(token) {
                        self.path.challenge = None;
                        self.path.challenge_pending = false;
                        self.path.validated = true;
                        self.timers.stop(Timer::PathValidation);
                        trace!("path validated");
                    }
                }
                Frame::Close(close) => {
                    self.handle_peer_close(now, close);
                    closed = true;
                }
                Frame::HandshakeDone => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "client sent HANDSHAKE_DONE",
                        ));
                    }
                    if !self.handshake_confirmed {
                        self.confirm_handshake(now);
                    }
                }
                Frame::Datagram(datagram) => {
                    self.handle_datagram_frame(datagram)?;
                }
                Frame::AckFrequency(freq) => {
                    self.handle_ack_frequency(freq)?;
                }
                Frame::ImmediateAck => {
                    self.spaces[space_id].pending_acks.set_immediate();
                }
                Frame::NewToken(_) => {
                    // Address validation tokens are managed outside the core
                }
            }
            if closed {
                return Ok(());
            }
        }

        let threshold = self.ack_eliciting_threshold(space_id);
        self.spaces[space_id].pending_acks.packet_received(
            number,
            now,
            ack_eliciting,
            ecn,
            threshold,
        );
        if let Some(codepoint) = ecn {
            self.spaces[space_id].ecn_counters += codepoint;
        }
        if ack_eliciting {
            self.arm_max_ack_delay_timer(now, space_id);
        }
        Ok(())
    }

    /// Ack-eliciting packets tolerated before an immediate ACK
    fn ack_eliciting_threshold(&self, space_id: SpaceId) -> u64 {
        if let Some(requested) = self.requested_ack_threshold {
            return requested.max(1);
        }
        let cfg = &self.config.ack_frequency;
        if space_id != SpaceId::Data
            || (cfg.small_threshold_during_handshake && !self.handshake_confirmed)
        {
            return 2;
        }
        cfg.ack_eliciting_threshold.into_inner().max(1)
    }

    fn arm_max_ack_delay_timer(&mut self, _now: Instant, space_id: SpaceId) {
        if self.spaces[space_id]
            .pending_acks
            .needs_to_send_ack_immediately()
        {
            self.timers.stop(Timer::MaxAckDelay);
            return;
        }
        if let Some(received) = self.spaces[space_id].pending_acks.earliest_deadline() {
            let delay = self
                .requested_max_ack_delay
                .unwrap_or(Duration::from_millis(self.config.max_ack_delay_ms));
            self.timers.set(Timer::MaxAckDelay, received + delay);
        }
    }

    fn process_crypto(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        crypto: frame::Crypto,
    ) -> Result<(), TransportError> {
        let space = &mut self.spaces[space_id];
        let end = crypto.offset + crypto.data.len() as u64;
        if end > space.crypto_stream.bytes_read() + self.config.crypto_buffer_size as u64 {
            return Err(TransportError::CRYPTO_BUFFER_EXCEEDED(""));
        }
        space.crypto_stream.insert(crypto.offset, crypto.data);
        while let Some(chunk) = self.spaces[space_id].crypto_stream.read(usize::MAX) {
            trace!(space = ?space_id, len = chunk.len(), "consumed crypto bytes");
            if self.session.read_handshake(&chunk)? && !self.peer_params_ready {
                self.adopt_peer_params()?;
            }
        }
        self.drive_handshake(now);
        Ok(())
    }

    /// Pump the handshake object: drain outgoing bytes per level, install new keys
    fn drive_handshake(&mut self, now: Instant) {
        loop {
            let mut outgoing = Vec::new();
            let change = self.session.write_handshake(&mut outgoing);
            let outgoing_empty = outgoing.is_empty();
            if !outgoing_empty {
                let space = &mut self.spaces[self.highest_space];
                trace!(space = ?self.highest_space, len = outgoing.len(), "queueing crypto bytes");
                space.crypto_out.write(Bytes::from(outgoing));
            }
            match change {
                Some(KeyChange::Handshake { keys }) => {
                    self.spaces[SpaceId::Handshake].crypto = Some(keys);
                    self.highest_space = SpaceId::Handshake;
                    if self.side.is_client() {
                        // The client has handshake keys; Initial is done
                        self.discard_space(now, SpaceId::Initial);
                    }
                }
                Some(KeyChange::OneRtt { keys, next }) => {
                    self.spaces[SpaceId::Data].crypto = Some(keys);
                    self.next_crypto = Some(next);
                    self.highest_space = SpaceId::Data;
                }
                None => {
                    if outgoing_empty {
                        break;
                    }
                }
            }
        }
        if !self.session.is_handshaking() && !self.state.is_established() && !self.state.is_closed()
        {
            self.state = State::Established;
            if !self.peer_params_ready {
                if let Err(e) = self.adopt_peer_params() {
                    self.fail_with(now, e);
                    return;
                }
            }
            self.events.push_back(Event::Connected);
            if self.side.is_server() {
                // HANDSHAKE_DONE tells the client; sending it confirms for us
                self.spaces[SpaceId::Data].pending.handshake_done = true;
                self.confirm_handshake(now);
            }
            self.issue_local_cids();
        }
    }

    fn adopt_peer_params(&mut self) -> Result<(), TransportError> {
        let params = match self.session.transport_parameters()? {
            Some(params) => params,
            None => return Ok(()),
        };
        self.peer_params_ready = true;
        self.events.push_back(Event::HandshakeDataReady);
        self.streams.set_params(&params);
        self.ack_frequency.peer_max_ack_delay =
            Duration::from_millis(params.max_ack_delay.into_inner());
        if let Some(token) = params.stateless_reset_token {
            self.peer_reset_tokens.push(token);
        }
        let peer_idle = params.max_idle_timeout.into_inner();
        if peer_idle != 0 {
            let peer_idle = Duration::from_millis(peer_idle);
            self.idle_timeout = Some(match self.idle_timeout {
                Some(local) => local.min(peer_idle),
                None => peer_idle,
            });
        }
        self.peer_params = params;
        Ok(())
    }

    /// Handshake confirmation: implicit-ack and drop the handshake spaces
    fn confirm_handshake(&mut self, now: Instant) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        self.discard_space(now, SpaceId::Initial);
        self.discard_space(now, SpaceId::Handshake);
        self.lowest_space = SpaceId::Data;
        trace!("handshake confirmed");
    }

    /// Drop a space's keys and ack state, implicitly acknowledging everything
    /// outstanding in it
    fn discard_space(&mut self, now: Instant, space_id: SpaceId) {
        if self.spaces[space_id].crypto.is_none() {
            return;
        }
        debug_assert!(space_id != SpaceId::Data);
        let space = &mut self.spaces[space_id];
        space.crypto = None;
        space.loss_time = None;
        space.loss_probes = 0;
        space.ping_pending = false;
        space.pending_acks = Default::default();
        let sent_packets = mem::take(&mut space.sent_packets);
        let mut acked_bytes = 0u64;
        let mut count = 0u64;
        for (pn, packet) in sent_packets {
            count += 1;
            if packet.ack_eliciting {
                acked_bytes += u64::from(packet.size);
                self.path.in_flight.remove(packet.size);
                self.spaces[space_id].in_flight -= u64::from(packet.size);
            }
            self.apply_ack_visitor(space_id, pn, &packet);
        }
        if count > 0 && self.config.observer.acks_processed {
            self.events.push_back(Event::AckProcessed(AckEvent {
                space: space_id,
                ack_time: now,
                adjusted_ack_time: now,
                ack_delay: Duration::ZERO,
                largest_newly_acked: None,
                newly_acked_bytes: acked_bytes,
                newly_acked_packets: count,
                rtt_sample: None,
                ecn: None,
                implicit: true,
            }));
        }
        if self.lowest_space == space_id {
            self.lowest_space = match space_id {
                SpaceId::Initial => SpaceId::Handshake,
                _ => SpaceId::Data,
            };
        }
        self.set_loss_detection_timer(now);
    }

    fn handle_new_cid(&mut self, frame: frame::NewConnectionId) -> Result<(), TransportError> {
        if self.rem_cid.is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "NEW_CONNECTION_ID when peer uses empty CIDs",
            ));
        }
        let limit = self.local_params.active_connection_id_limit.into_inner();
        self.rem_cids
            .insert(frame.sequence, (frame.id, frame.reset_token));
        self.peer_reset_tokens.push(frame.reset_token);
        // Retirements requested by the peer
        if frame.retire_prior_to > self.rem_cid_seq {
            let retired: Vec<u64> = self
                .rem_cids
                .range(..frame.retire_prior_to)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in retired {
                self.rem_cids.remove(&seq);
                self.spaces[SpaceId::Data].pending.retire_cids.push(seq);
            }
            self.spaces[SpaceId::Data]
                .pending
                .retire_cids
                .push(self.rem_cid_seq);
            // Switch to the lowest still-valid CID
            if let Some((&seq, &(cid, _))) = self.rem_cids.range(frame.retire_prior_to..).next() {
                self.rem_cid = cid;
                self.rem_cid_seq = seq;
                self.rem_cids.remove(&seq);
            } else {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "peer retired all connection IDs",
                ));
            }
        }
        if self.rem_cids.len() as u64 > limit {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR(
                "active_connection_id_limit exceeded",
            ));
        }
        Ok(())
    }

    fn handle_retire_cid(&mut self, sequence: u64) -> Result<(), TransportError> {
        if sequence >= self.next_local_cid_seq {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "retired a connection ID we never issued",
            ));
        }
        // Replace the retired CID to keep the peer supplied
        self.issue_one_local_cid();
        Ok(())
    }

    /// Issue additional CIDs up to the peer's limit
    fn issue_local_cids(&mut self) {
        if self.local_cid_len == 0 {
            return;
        }
        let target = self.peer_params.issue_cids_limit();
        while self.next_local_cid_seq < target {
            self.issue_one_local_cid();
        }
    }

    fn issue_one_local_cid(&mut self) {
        if self.local_cid_len == 0 {
            return;
        }
        let cid = ConnectionId::random(&mut self.rng, self.local_cid_len);
        let mut token = [0u8; RESET_TOKEN_SIZE];
        let mut signature = vec![0u8; self.reset_key.signature_len()];
        self.reset_key.sign(&cid, &mut signature);
        token.copy_from_slice(&signature[..RESET_TOKEN_SIZE]);
        let sequence = self.next_local_cid_seq;
        self.next_local_cid_seq += 1;
        self.spaces[SpaceId::Data]
            .pending
            .new_cids
            .push(frame::NewConnectionId {
                sequence,
                retire_prior_to: 0,
                id: cid,
                reset_token: token.into(),
            });
    }

    fn handle_datagram_frame(&mut self, datagram: Datagram) -> Result<(), TransportError> {
        let Some(window) = self.config.datagram_receive_buffer_size else {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "unexpected DATAGRAM frame",
            ));
        };
        if datagram.data.len() > window {
            return Err(TransportError::PROTOCOL_VIOLATION("oversized datagram"));
        }
        self.datagrams.incoming_bytes += datagram.data.len();
        self.datagrams.incoming.push_back(datagram.data);
        // Drop from the front on overflow; newest data is most useful
        while self.datagrams.incoming_bytes > window {
            let dropped = self.datagrams.incoming.pop_front().unwrap();
            self.datagrams.incoming_bytes -= dropped.len();
            debug!("dropping incoming datagram: receive buffer full");
        }
        self.events.push_back(Event::DatagramReceived);
        Ok(())
    }

    fn handle_ack_frequency(&mut self, freq: frame::AckFrequency) -> Result<(), TransportError> {
        if self.local_params.min_ack_delay.is_none() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "ACK_FREQUENCY without negotiation",
            ));
        }
        let seq = freq.sequence.into_inner();
        if let Some(last) = self.last_ack_frequency_seq {
            if seq <= last {
                // Out-of-order request; newest wins
                return Ok(());
            }
        }
        self.last_ack_frequency_seq = Some(seq);
        self.requested_ack_threshold = Some(freq.ack_eliciting_threshold.into_inner() + 1);
        let delay = freq.request_max_ack_delay.into_inner();
        if Duration::from_micros(delay)
            < Duration::from_micros(self.local_params.min_ack_delay.unwrap().into_inner())
        {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "requested max_ack_delay below min_ack_delay",
            ));
        }
        self.requested_max_ack_delay = Some(Duration::from_micros(delay));
        Ok(())
    }

    fn handle_peer_close(&mut self, now: Instant, close: Close) {
        let reason = match close {
            Close::Connection(c) => ConnectionError::ConnectionClosed(c),
            Close::Application(c) => ConnectionError::ApplicationClosed(c),
        };
        if !self.state.is_closed() {
            self.events.push_back(Event::ConnectionLost {
                reason: reason.clone(),
            });
        }
        self.error = Some(reason);
        self.state = State::Draining;
        self.timers.set(Timer::Close, now + 3 * self.pto(SpaceId::Data));
    }

    fn migrate(&mut self, now: Instant, remote: SocketAddr) {
        debug!(%remote, "migration initiated");
        self.prev_remote = Some(self.path.remote);
        self.path.remote = remote;
        self.path.validated = false;
        self.path.total_sent = 0;
        self.path.total_recvd = 0;
        self.path.challenge = Some(self.rng.next_u64());
        self.path.challenge_pending = true;
        self.timers
            .set(Timer::PathValidation, now + 3 * self.pto(SpaceId::Data));
    }

    // === Ack processing and loss detection ===

    fn on_ack_received(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        ack: frame::Ack,
        old_phase: bool,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.spaces[space_id].next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked"));
        }
        ack.scan_blocks()
            .map_err(|_| TransportError::FRAME_ENCODING_ERROR("malformed ACK ranges"))?;

        // Scale the delay; reject overflow of a microsecond duration
        let exponent = if space_id == SpaceId::Data && self.peer_params_ready {
            self.peer_params.ack_delay_exponent.into_inner() as u32
        } else {
            3
        };
        let delay_micros = ack
            .delay
            .checked_shl(exponent)
            .ok_or(TransportError::FRAME_ENCODING_ERROR("ACK delay overflow"))?;
        let ack_delay = Duration::from_micros(delay_micros);

        let mut newly_acked = Vec::new();
        for range in ack.iter() {
            let range = *range.start()..range.end() + 1;
            for (&pn, _) in self.spaces[space_id].sent_packets.range(range.clone()) {
                newly_acked.push(pn);
            }
            // Rehabilitate packets we had declared lost
            let mut spurious = Vec::new();
            for lost_range in self.declared_lost[space_id as usize].iter() {
                let start = lost_range.start.max(range.start);
                let end = lost_range.end.min(range.end);
                for pn in start..end {
                    spurious.push(pn);
                }
            }
            for pn in spurious {
                self.declared_lost[space_id as usize].remove(pn..pn + 1);
                self.on_spurious_loss(now, space_id, pn);
            }
        }
        newly_acked.sort_unstable();

        if newly_acked.is_empty() {
            self.maybe_update_largest_acked(space_id, ack.largest, now);
            return Ok(());
        }

        // Key update verification: an ack for the first new-phase packet must arrive
        // under the new phase
        if let Some(pending) = self.key_update_pending_verify {
            if newly_acked.contains(&pending) {
                if space_id == SpaceId::Data && old_phase {
                    return Err(TransportError::KEY_UPDATE_ERROR(
                        "new-phase packet acknowledged under the old keys",
                    ));
                }
                self.key_update_pending_verify = None;
                self.prev_rx_key = None;
                trace!("key update verified");
            }
        }

        let largest_newly_acked = *newly_acked.last().unwrap();
        let largest_info = self.spaces[space_id]
            .sent_packets
            .get(&largest_newly_acked)
            .cloned();

        // RTT sample when the largest acked is newly acked and ack-eliciting
        let mut rtt_sample = None;
        if largest_newly_acked == ack.largest {
            if let Some(ref info) = largest_info {
                if info.ack_eliciting {
                    let raw = now.saturating_duration_since(info.time_sent);
                    let clamped_delay = if space_id == SpaceId::Data && self.handshake_confirmed {
                        ack_delay.min(self.ack_frequency.max_ack_delay_for_pto())
                    } else {
                        ack_delay
                    };
                    self.path.rtt.update(clamped_delay, raw);
                    rtt_sample = Some(raw);
                    if self.config.observer.rtt_samples {
                        self.events.push_back(Event::RttSample(RttSample {
                            rtt: raw,
                            ack_delay: clamped_delay,
                        }));
                    }
                }
            }
        }

        let mut newly_acked_bytes = 0u64;
        for &pn in &newly_acked {
            let Some(packet) = self.spaces[space_id].sent_packets.remove(&pn) else {
                continue;
            };
            if packet.ack_eliciting {
                newly_acked_bytes += u64::from(packet.size);
                self.path.in_flight.remove(packet.size);
                self.spaces[space_id].in_flight -= u64::from(packet.size);
                self.path.congestion.on_ack(
                    now,
                    pn,
                    packet.time_sent,
                    u64::from(packet.size),
                    packet.app_limited,
                    &self.path.rtt,
                );
            }
            self.spaces[space_id].clone_erased(packet.clone_id, true);
            self.apply_ack_visitor(space_id, pn, &packet);
        }
        self.stats.path.acked_bytes += newly_acked_bytes;

        self.maybe_update_largest_acked(space_id, ack.largest, now);

        // ECN feedback; a CE increase is a congestion signal without loss
        if let Some(ecn) = ack.ecn {
            match self.spaces[space_id].detect_ecn(newly_acked.len() as u64, ecn) {
                Ok(true) => {
                    let sent = largest_info
                        .as_ref()
                        .map_or(now, |info| info.time_sent);
                    self.stats.path.congestion_events += 1;
                    self.path.congestion.on_congestion_event(now, sent, false, 0);
                }
                Ok(false) => {}
                Err(e) => {
                    debug!("invalid ECN feedback, ignoring: {e}");
                    self.path.sending_ecn = false;
                }
            }
        }

        self.path.congestion.on_end_acks(
            now,
            self.path.in_flight.bytes,
            self.app_limited,
            Some(largest_newly_acked),
        );

        if self.config.observer.acks_processed {
            self.events.push_back(Event::AckProcessed(AckEvent {
                space: space_id,
                ack_time: now,
                adjusted_ack_time: now.checked_sub(ack_delay).unwrap_or(now),
                ack_delay,
                largest_newly_acked: Some(largest_newly_acked),
                newly_acked_bytes,
                newly_acked_packets: newly_acked.len() as u64,
                rtt_sample,
                ecn: ack.ecn,
                implicit: false,
            }));
        }

        self.pto_count = 0;
        self.detect_lost_packets(now, space_id);
        self.set_loss_detection_timer(now);
        Ok(())
    }

    fn maybe_update_largest_acked(&mut self, space_id: SpaceId, largest: u64, now: Instant) {
        let space = &mut self.spaces[space_id];
        if space.largest_acked_packet.is_none_or(|prev| largest > prev) {
            space.largest_acked_packet = Some(largest);
            space.largest_acked_packet_sent = now;
        }
    }

    /// Everything that must happen when an outstanding packet is acknowledged
    fn apply_ack_visitor(&mut self, space_id: SpaceId, pn: u64, packet: &SentPacket) {
        for meta in &packet.stream_frames {
            self.streams.ack_stream_meta(meta);
        }
        if let Some(ref range) = packet.crypto {
            self.spaces[space_id].crypto_out.ack(range.clone());
        }
        // Stop re-sending ack ranges the peer has seen
        let acks = packet.acks.clone();
        self.spaces[space_id].pending_acks.subtract(&acks);
        // Settle one-shot control frames
        for reset in &packet.retransmits.reset_stream {
            self.streams.reset_acked(reset.id);
        }
        if space_id == SpaceId::Data {
            self.ack_frequency.on_acked(pn);
        }
    }

    fn on_spurious_loss(&mut self, now: Instant, space_id: SpaceId, pn: u64) {
        self.stats.path.spurious_losses += 1;
        if self.config.adaptive_reorder_threshold {
            // Reordering was deeper than assumed; tolerate more before declaring loss
            if let Some(largest) = self.spaces[space_id].largest_acked_packet {
                let distance = largest.saturating_sub(pn).max(1);
                self.reorder_threshold = self.reorder_threshold.max(distance).min(MAX_REORDER_THRESHOLD);
            }
        }
        self.path.congestion.on_spurious_congestion_event(now, 0);
        if self.config.observer.spurious_loss {
            self.events.push_back(Event::SpuriousLoss(SpuriousLossEvent {
                space: space_id,
                packet_number: pn,
            }));
        }
    }

    fn detect_lost_packets(&mut self, now: Instant, space_id: SpaceId) {
        let Some(largest_acked) = self.spaces[space_id].largest_acked_packet else {
            return;
        };
        let rtt = self.path.rtt.conservative();
        let loss_delay = rtt.mul_f32(self.config.time_threshold).max(TIMER_GRANULARITY);
        let lost_send_time = now.checked_sub(loss_delay);

        let mut lost: Vec<u64> = Vec::new();
        let mut next_loss_time: Option<Instant> = None;
        for (&pn, packet) in self.spaces[space_id].sent_packets.iter() {
            if pn > largest_acked {
                break;
            }
            let by_reorder = largest_acked.saturating_sub(pn) >= self.reorder_threshold
                && pn != largest_acked;
            let by_time = lost_send_time.is_some_and(|t| packet.time_sent <= t);
            if by_reorder || by_time {
                lost.push(pn);
            } else {
                // Will cross the time threshold later; keep the earliest deadline
                let when = packet.time_sent + loss_delay;
                next_loss_time = Some(next_loss_time.map_or(when, |x: Instant| x.min(when)));
            }
        }
        self.spaces[space_id].loss_time = next_loss_time;
        if lost.is_empty() {
            return;
        }

        let mut lost_bytes = 0u64;
        let mut first_lost_sent: Option<Instant> = None;
        let mut last_lost_sent: Option<Instant> = None;
        let largest_lost = *lost.last().unwrap();
        for &pn in &lost {
            let Some(packet) = self.spaces[space_id].sent_packets.remove(&pn) else {
                continue;
            };
            trace!(space = ?space_id, pn, "packet lost");
            if packet.ack_eliciting {
                lost_bytes += u64::from(packet.size);
                self.path.in_flight.remove(packet.size);
                self.spaces[space_id].in_flight -= u64::from(packet.size);
            }
            first_lost_sent = Some(first_lost_sent.map_or(packet.time_sent, |x| x.min(packet.time_sent)));
            last_lost_sent = Some(last_lost_sent.map_or(packet.time_sent, |x| x.max(packet.time_sent)));
            self.declared_lost[space_id as usize].insert(pn..pn + 1);
            let apply_loss = self.spaces[space_id].clone_erased(packet.clone_id, false);
            if apply_loss {
                self.apply_loss_visitor(space_id, pn, packet);
            }
        }
        self.stats.path.lost_packets += lost.len() as u64;
        self.stats.path.lost_bytes += lost_bytes;
        self.stats.path.congestion_events += 1;

        // Persistent congestion: an unbroken span of losses longer than several PTOs
        let persistent = match (first_lost_sent, last_lost_sent) {
            (Some(first), Some(last)) if self.path.rtt.has_samples() => {
                let period = self.pto_base_for(SpaceId::Data)
                    * self.config.persistent_congestion_threshold;
                last.saturating_duration_since(first) > period
            }
            _ => false,
        };
        self.path.congestion.on_congestion_event(
            now,
            last_lost_sent.unwrap_or(now),
            persistent,
            lost_bytes,
        );

        // Bound memory for spurious-loss tracking
        while self.declared_lost[space_id as usize].len() > MAX_TRACKED_LOSSES {
            self.declared_lost[space_id as usize].pop_min();
        }

        if self.config.observer.loss_detected {
            self.events.push_back(Event::LossDetected(LossEvent {
                space: space_id,
                packets: lost.len() as u64,
                bytes: lost_bytes,
                largest_lost,
                persistent_congestion: persistent,
            }));
        }
    }

    /// Everything that must happen when an outstanding packet is declared lost
    fn apply_loss_visitor(&mut self, space_id: SpaceId, pn: u64, packet: SentPacket) {
        for meta in &packet.stream_frames {
            self.streams.on_stream_frame_lost(meta);
            self.stats.path.retransmitted_bytes += meta.offsets.end - meta.offsets.start;
        }
        if let Some(range) = packet.crypto {
            self.spaces[space_id].crypto_out.mark_lost(range);
        }
        // Reset frames must reach the peer; re-arm any carried by this packet
        for reset in &packet.retransmits.reset_stream {
            if let Some(frame) = self.streams.reset_lost_needs_retransmit(reset.id) {
                self.spaces[space_id].pending.reset_stream.push(frame);
            }
        }
        let mut rest = packet.retransmits;
        rest.reset_stream.clear();
        self.spaces[space_id].pending |= rest;
        if space_id == SpaceId::Data {
            self.ack_frequency.on_lost(pn);
        }
    }

    fn pto_base_for(&self, space_id: SpaceId) -> Duration {
        let mut pto = self.path.rtt.pto_base();
        if space_id == SpaceId::Data {
            pto += self.ack_frequency.max_ack_delay_for_pto();
        }
        pto
    }

    fn pto(&self, space_id: SpaceId) -> Duration {
        self.pto_base_for(space_id) * 2u32.pow(self.pto_count.min(MAX_BACKOFF_EXPONENT))
    }

    fn set_loss_detection_timer(&mut self, _now: Instant) {
        // Time-threshold loss takes precedence
        let loss_time = SpaceId::iter()
            .filter_map(|id| self.spaces[id].loss_time)
            .min();
        if let Some(when) = loss_time {
            self.timers.set(Timer::LossDetection, when);
            return;
        }
        if self.path.in_flight.ack_eliciting == 0 && !self.is_handshaking() {
            self.timers.stop(Timer::LossDetection);
            return;
        }
        // PTO for the earliest space with outstanding ack-eliciting data
        let mut earliest: Option<(SpaceId, Instant)> = None;
        for id in SpaceId::iter() {
            if self.spaces[id].crypto.is_none() {
                continue;
            }
            if let Some(t) = self.spaces[id].time_of_last_ack_eliciting_packet {
                if self.spaces[id].in_flight > 0 && earliest.is_none() {
                    earliest = Some((id, t));
                }
            }
        }
        let Some((space_id, last_send)) = earliest else {
            self.timers.stop(Timer::LossDetection);
            return;
        };
        let timeout = self.pto(space_id);
        self.timers.set(Timer::LossDetection, last_send + timeout);
    }

    // === Timers ===

    /// Process timer expirations as of `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state.is_drained() {
            return;
        }
        for &timer in &Timer::VALUES {
            if !self.timers.is_expired(timer, now) {
                continue;
            }
            self.timers.stop(timer);
            trace!(?timer, "timeout");
            match timer {
                Timer::Close => {
                    self.state = State::Drained;
                }
                Timer::Idle => {
                    // Silent close
                    self.error = Some(ConnectionError::TimedOut);
                    self.events.push_back(Event::ConnectionLost {
                        reason: ConnectionError::TimedOut,
                    });
                    self.state = State::Drained;
                }
                Timer::LossDetection => {
                    self.on_loss_detection_timeout(now);
                }
                Timer::KeepAlive => {
                    trace!("sending keep-alive");
                    self.spaces[self.highest_space].ping_pending = true;
                }
                Timer::PathValidation => {
                    debug!("path validation failed");
                    self.path.challenge = None;
                    self.path.challenge_pending = false;
                    if let Some(prev) = self.prev_remote.take() {
                        self.path.remote = prev;
                        self.path.validated = true;
                    }
                }
                Timer::MaxAckDelay => {
                    for id in SpaceId::iter() {
                        self.spaces[id].pending_acks.set_immediate();
                    }
                }
                Timer::Pacing => {}
            }
        }
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) {
        // Time-threshold loss first
        let loss_space = SpaceId::iter()
            .filter(|&id| {
                self.spaces[id]
                    .loss_time
                    .is_some_and(|t| t <= now)
            })
            .min_by_key(|&id| self.spaces[id].loss_time);
        if let Some(space_id) = loss_space {
            self.detect_lost_packets(now, space_id);
            self.set_loss_detection_timer(now);
            return;
        }
        // PTO fired: probe the earliest space with outstanding ack-eliciting data
        self.pto_count += 1;
        self.stats.path.ptos += 1;
        let mut probe_space = None;
        for id in SpaceId::iter() {
            if self.spaces[id].crypto.is_some() && self.spaces[id].in_flight > 0 {
                probe_space = Some(id);
                break;
            }
        }
        let space_id = probe_space.unwrap_or(self.highest_space);
        trace!(space = ?space_id, count = self.pto_count, "PTO fired");
        self.spaces[space_id].loss_probes =
            (self.spaces[space_id].loss_probes + 2).min(MAX_LOSS_PROBES);
        self.prepare_probe(space_id);
        self.set_loss_detection_timer(now);
    }

    /// Pick content for a probe: clone an outstanding packet's data if available
    fn prepare_probe(&mut self, space_id: SpaceId) {
        let streams_have_data = space_id == SpaceId::Data && self.streams.can_send_stream_data();
        if self.probe_clone.is_some() {
            return;
        }
        // Clone the oldest outstanding packet that carried reconstructible data
        let mut source = None;
        for (&pn, packet) in self.spaces[space_id].sent_packets.iter() {
            if packet.ack_eliciting
                && (!packet.stream_frames.is_empty() || packet.crypto.is_some())
            {
                source = Some(pn);
                break;
            }
        }
        if let Some(pn) = source {
            let clone_id = {
                let packet = self.spaces[space_id].sent_packets.get_mut(&pn).unwrap();
                match packet.clone_id {
                    Some(id) => id,
                    None => {
                        let id = self.clone_counter;
                        self.clone_counter += 1;
                        packet.clone_id = Some(id);
                        id
                    }
                }
            };
            // Register the original's membership
            let packet = self.spaces[space_id].sent_packets.get(&pn).unwrap().clone();
            self.spaces[space_id].register_clone_member(clone_id);
            self.probe_clone = Some(ProbeClone {
                space: space_id,
                clone_id,
                stream_frames: packet.stream_frames.clone(),
                crypto: packet.crypto.clone(),
            });
            return;
        }
        self.spaces[space_id].maybe_queue_probe(streams_have_data);
        // Ask for an unconditional ack along with the probe when the peer
        // understands the extension
        if space_id == SpaceId::Data && self.peer_params.min_ack_delay.is_some() {
            self.spaces[space_id].immediate_ack_pending = true;
        }
    }

    fn reset_idle_timer(&mut self, now: Instant) {
        if let Some(timeout) = self.idle_timeout {
            self.timers.set(Timer::Idle, now + timeout);
        }
        if let Some(interval) = self.config.keep_alive_interval {
            self.timers.set(Timer::KeepAlive, now + interval);
        }
    }

    // === Egress ===

    /// Build the next batch of packets to transmit, if anything needs sending
    pub fn poll_transmit(&mut self, now: Instant, max_datagrams: usize) -> Option<Transmit> {
        if self.state.is_drained() {
            return None;
        }
        if matches!(self.state, State::Draining) {
            return None;
        }
        if let State::Closing { ref reason } = self.state {
            if !mem::take(&mut self.close_pending) {
                return None;
            }
            let reason = reason.clone();
            return self.build_close_transmit(now, reason);
        }

        // Anti-amplification for unvalidated peers
        if self.config.enable_writable_bytes_limit
            && self
                .path
                .anti_amplification_blocked(self.path.current_mtu as u64)
        {
            trace!("anti-amplification blocked");
            return None;
        }

        // Pacing gates the batch size
        let mtu = self.path.current_mtu as usize;
        let mut batch = self
            .path
            .pacing
            .update_and_get_write_batch_size(now)
            .min(self.config.max_batch_size as u64)
            .min(max_datagrams as u64) as usize;
        if batch == 0 {
            if let Some(at) = self.path.pacing.next_send_time(now) {
                self.timers.set(Timer::Pacing, at);
            }
            return None;
        }
        if self.config.batching_mode == BatchingMode::None {
            batch = 1;
        }
        // A single write loop is also bounded by a fraction of the RTT's worth of
        // data at the current pacing rate
        if let Some(rate) = self.path.congestion.pacing_rate() {
            let rtt_budget = self.path.rtt.get() / self.config.write_limit_rtt_fraction;
            let byte_budget = (rate as f64 * rtt_budget.as_secs_f64()) as u64;
            let packet_budget = (byte_budget / mtu as u64).max(1) as usize;
            batch = batch.min(packet_budget);
        }

        // Possibly initiate a key update by schedule
        if self.config.initiate_key_update
            && self.spaces[SpaceId::Data].sent_with_keys >= self.config.key_update_packet_interval
        {
            self.try_key_update(false);
        }

        let mut buf = Vec::with_capacity(batch * mtu);
        let mut datagrams = 0usize;
        let mut sent_any = true;
        while datagrams < batch && sent_any {
            sent_any = false;
            let datagram_start = buf.len();
            let mut datagram_has_initial = false;
            let congestion_budget = self.path.congestion_writable_bytes();
            if congestion_budget < mtu as u64 && self.path.in_flight.bytes > 0 {
                break;
            }
            // Coalesce packets of ascending encryption levels into the datagram
            for space_id in SpaceId::iter() {
                if self.spaces[space_id].crypto.is_none() {
                    continue;
                }
                if !self.space_can_send(space_id) {
                    continue;
                }
                let buf_capacity = (datagram_start + mtu).min(buf.len() + mtu);
                if buf_capacity.saturating_sub(buf.len()) < MIN_PACKET_SPACE {
                    continue;
                }
                if let Some(built) =
                    self.build_packet(now, space_id, &mut buf, datagram_start, buf_capacity)
                {
                    sent_any = true;
                    datagram_has_initial |= space_id == SpaceId::Initial && built;
                }
            }
            if buf.len() == datagram_start {
                break;
            }
            // Initial-bearing datagrams are padded to the amplification floor by the
            // builder; account the datagram
            let _ = datagram_has_initial;
            datagrams += 1;
            self.path.pacing.on_packet_sent();
            let len = (buf.len() - datagram_start) as u64;
            self.path.total_sent = self.path.total_sent.saturating_add(len);
            self.stats.udp_tx.on_io(len);
            if self.config.enable_writable_bytes_limit
                && self.path.anti_amplification_blocked(mtu as u64)
            {
                break;
            }
        }

        if buf.is_empty() {
            return None;
        }
        // Optionally shadow the first Initial with an immediate clone rather than
        // waiting out a PTO if it is lost
        if self.config.immediate_initial_retransmit
            && self.side.is_client()
            && self.spaces[SpaceId::Initial].crypto.is_some()
            && self.spaces[SpaceId::Initial].next_packet_number == 1
            && self.probe_clone.is_none()
        {
            self.spaces[SpaceId::Initial].loss_probes =
                self.spaces[SpaceId::Initial].loss_probes.max(1);
            self.prepare_probe(SpaceId::Initial);
        }
        if self.config.observer.packets_sent {
            self.events.push_back(Event::PacketsSent {
                count: datagrams as u64,
                bytes: buf.len() as u64,
            });
        }
        // Refresh pacing from the congestion controller for the next round
        match self.path.congestion.pacing_rate() {
            Some(rate) if rate > 0 => self
                .path
                .pacing
                .set_rate(rate, self.config.max_batch_size as u64),
            _ => self.path.pacing.refresh_pacing_rate(
                self.path.congestion.window(),
                self.path.rtt.get(),
                self.config.max_batch_size as u64,
            ),
        }
        self.set_loss_detection_timer(now);
        let segment_size = match datagrams > 1 {
            true => Some(mtu),
            false => None,
        };
        Some(Transmit {
            destination: self.path.remote,
            ecn: self.path.sending_ecn.then_some(EcnCodepoint::Ect0),
            contents: buf,
            segment_size,
        })
    }

    /// Whether `space_id` has anything worth a packet
    fn space_can_send(&mut self, space_id: SpaceId) -> bool {
        let streams_queued = space_id == SpaceId::Data && self.streams.can_send_stream_data();
        let datagrams_queued =
            space_id == SpaceId::Data && !self.datagrams.outgoing.is_empty();
        let challenge = space_id == SpaceId::Data
            && (self.path.challenge_pending || self.path.challenge_response.is_some());
        let probe_clone = self.probe_clone.as_ref().is_some_and(|p| p.space == space_id);
        self.spaces[space_id].can_send_other(streams_queued)
            || self.spaces[space_id]
                .pending_acks
                .needs_to_send_ack_immediately()
            || datagrams_queued
            || challenge
            || probe_clone
    }

    /// Build one packet into `buf`; returns `Some(true)` if written
    fn build_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        datagram_start: usize,
        buf_capacity: usize,
    ) -> Option<bool> {
        let exact_number = self.spaces[space_id].get_tx_number();
        let largest_acked = self.spaces[space_id].largest_acked_packet.unwrap_or(0);
        let number = PacketNumber::new(exact_number, largest_acked);
        let header = match space_id {
            SpaceId::Initial => Header::Initial {
                dst_cid: self.rem_cid,
                src_cid: self.local_cid,
                token: Bytes::new(),
                number,
                version: self.version,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid: self.rem_cid,
                src_cid: self.local_cid,
                number,
                version: self.version,
            },
            SpaceId::Data => Header::Short {
                spin: false,
                key_phase: self.key_phase,
                dst_cid: self.rem_cid,
                number,
            },
        };
        let (tag_len, sample_size) = {
            let keys = self.spaces[space_id].crypto.as_ref().unwrap();
            (
                keys.packet.local.tag_len(),
                keys.header.local.sample_size(),
            )
        };
        let mut builder = PacketBuilder::new(
            buf,
            &header,
            exact_number,
            datagram_start,
            buf_capacity,
            tag_len,
            sample_size,
        );

        let sent = self.populate_packet(now, space_id, buf, &mut builder);
        if buf.len() == builder.partial_encode.start + builder.partial_encode.header_len
            && !sent.forced
        {
            // Nothing was written; roll the packet back
            buf.truncate(builder.partial_encode.start);
            self.spaces[space_id].next_packet_number -= 1;
            self.spaces[space_id].sent_with_keys -= 1;
            return None;
        }

        if space_id == SpaceId::Initial && (builder.ack_eliciting || self.side.is_client()) {
            // Initial-bearing datagrams are padded to the amplification floor
            builder.pad_to_datagram_min(MIN_INITIAL_SIZE as usize);
        }

        let ack_eliciting = builder.ack_eliciting;
        let size = {
            let keys = self.spaces[space_id].crypto.as_ref().unwrap();
            builder.finish(buf, keys.packet.local.as_ref(), keys.header.local.as_ref())
        };

        let packet = SentPacket {
            time_sent: now,
            size: if ack_eliciting { size as u16 } else { 0 },
            ack_eliciting,
            acks: sent.acks,
            retransmits: sent.retransmits,
            stream_frames: sent.stream_frames,
            crypto: sent.crypto,
            clone_id: sent.clone_id,
            app_limited: self.app_limited,
            dsr: false,
            largest_acked_at_send: self.spaces[space_id].largest_acked_packet,
        };
        self.stats.path.sent_packets += 1;
        if ack_eliciting {
            self.stats.path.sent_ack_eliciting_packets += 1;
            self.spaces[space_id].time_of_last_ack_eliciting_packet = Some(now);
            self.path.in_flight.insert(size as u16);
            self.path
                .congestion
                .on_sent(now, size as u64, exact_number);
        }
        self.spaces[space_id].sent(exact_number, packet);
        Some(true)
    }

    fn build_close_transmit(&mut self, _now: Instant, reason: Close) -> Option<Transmit> {
        let mtu = self.path.current_mtu as usize;
        let mut buf = Vec::with_capacity(mtu);
        // Emit a CLOSE in every space we still hold write keys for, so a peer at any
        // handshake stage learns of the termination
        for space_id in SpaceId::iter() {
            if self.spaces[space_id].crypto.is_none() {
                continue;
            }
            let datagram_start = 0;
            let exact_number = self.spaces[space_id].get_tx_number();
            let largest_acked = self.spaces[space_id].largest_acked_packet.unwrap_or(0);
            let number = PacketNumber::new(exact_number, largest_acked);
            let header = match space_id {
                SpaceId::Initial => Header::Initial {
                    dst_cid: self.rem_cid,
                    src_cid: self.local_cid,
                    token: Bytes::new(),
                    number,
                    version: self.version,
                },
                SpaceId::Handshake => Header::Long {
                    ty: LongType::Handshake,
                    dst_cid: self.rem_cid,
                    src_cid: self.local_cid,
                    number,
                    version: self.version,
                },
                SpaceId::Data => Header::Short {
                    spin: false,
                    key_phase: self.key_phase,
                    dst_cid: self.rem_cid,
                    number,
                },
            };
            let (tag_len, sample_size) = {
                let keys = self.spaces[space_id].crypto.as_ref().unwrap();
                (
                    keys.packet.local.tag_len(),
                    keys.header.local.sample_size(),
                )
            };
            let buf_capacity = buf.len() + mtu.min(1200);
            let mut builder = PacketBuilder::new(
                &mut buf,
                &header,
                exact_number,
                datagram_start,
                buf_capacity,
                tag_len,
                sample_size,
            );
            // In pre-1-RTT spaces an application close is masked as a transport
            // error to avoid leaking application state
            let close_to_send = match (&reason, space_id) {
                (Close::Application(_), SpaceId::Initial | SpaceId::Handshake) => {
                    Close::Connection(ConnectionClose {
                        error_code: TransportErrorCode::APPLICATION_ERROR,
                        frame_type: None,
                        reason: Bytes::new(),
                    })
                }
                _ => reason.clone(),
            };
            let space_remaining = builder.frame_space_remaining(&buf);
            close_to_send.encode(&mut buf, space_remaining);
            let keys = self.spaces[space_id].crypto.as_ref().unwrap();
            builder.finish(&mut buf, keys.packet.local.as_ref(), keys.header.local.as_ref());
        }
        if buf.is_empty() {
            return None;
        }
        self.stats.udp_tx.on_io(buf.len() as u64);
        Some(Transmit {
            destination: self.path.remote,
            ecn: None,
            contents: buf,
            segment_size: None,
        })
    }

    // === Frame scheduling (the per-packet fill order) ===

    fn populate_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        builder: &mut PacketBuilder,
    ) -> SentFrames {
        let mut sent = SentFrames::default();
        let max_size = builder.max_size;

        // ACK: highest urgency so peers' loss detectors stay accurate
        {
            let space = &mut self.spaces[space_id];
            let wants_ack = space.pending_acks.needs_to_send_ack_immediately();
            let opportunistic = space.pending_acks.can_send();
            if (wants_ack || opportunistic) && !space.pending_acks.ranges().is_empty() {
                let ecn = if space.ecn_counters != frame::EcnCounts::ZERO {
                    Some(space.ecn_counters)
                } else {
                    None
                };
                let delay_micros = space
                    .pending_acks
                    .earliest_deadline()
                    .map_or(0, |t| now.saturating_duration_since(t).as_micros() as u64);
                let delay = delay_micros
                    >> u64::from(crate::transport_parameters::ACK_DELAY_EXPONENT);
                // Budget check is implicit: ranges are capped well under an MTU
                frame::Ack::encode(delay, space.pending_acks.ranges(), ecn.as_ref(), buf);
                sent.acks = space.pending_acks.ranges().clone();
                space.pending_acks.acks_sent();
                self.timers.stop(Timer::MaxAckDelay);
            }
        }

        // PATH_CHALLENGE / PATH_RESPONSE
        if space_id == SpaceId::Data {
            if let Some(token) = self.path.challenge_response.take() {
                if buf.len() + 9 < max_size {
                    buf_write_path_frame(buf, frame::FrameType::PATH_RESPONSE, token);
                    builder.ack_eliciting = true;
                    sent.forced = true;
                }
            }
            if self.path.challenge_pending && buf.len() + 9 < max_size {
                if let Some(token) = self.path.challenge {
                    buf_write_path_frame(buf, frame::FrameType::PATH_CHALLENGE, token);
                    self.path.challenge_pending = false;
                    builder.ack_eliciting = true;
                    sent.forced = true;
                }
            }
        }

        // CRYPTO
        {
            let space = &mut self.spaces[space_id];
            while space.crypto_out.has_sendable()
                && buf.len() + frame::Crypto::SIZE_BOUND < max_size
            {
                let budget = (max_size - buf.len() - frame::Crypto::SIZE_BOUND) as u64;
                let offsets = space.crypto_out.poll_transmit(budget);
                if offsets.is_empty() {
                    break;
                }
                let mut data = Vec::with_capacity((offsets.end - offsets.start) as usize);
                let mut cursor = offsets.start;
                while cursor < offsets.end {
                    let chunk = space.crypto_out.get(cursor..offsets.end);
                    if chunk.is_empty() {
                        break;
                    }
                    data.extend_from_slice(chunk);
                    cursor += chunk.len() as u64;
                }
                let frame = frame::Crypto {
                    offset: offsets.start,
                    data: Bytes::from(data),
                };
                frame.encode(buf);
                builder.ack_eliciting = true;
                sent.crypto = Some(match sent.crypto.take() {
                    None => offsets,
                    Some(prev) => prev.start.min(offsets.start)..prev.end.max(offsets.end),
                });
            }
        }

        // One-shot control frames
        if space_id == SpaceId::Data && self.state.is_established() {
            self.populate_control_frames(now, buf, builder, &mut sent, max_size);
        }

        // PING (probe of last resort, and keep-alives)
        if self.spaces[space_id].ping_pending && buf.len() + 1 < max_size {
            self.spaces[space_id].ping_pending = false;
            buf.push(0x01);
            builder.ack_eliciting = true;
        }
        if self.spaces[space_id].immediate_ack_pending && buf.len() + 1 < max_size {
            self.spaces[space_id].immediate_ack_pending = false;
            buf.push(0x1f);
            builder.ack_eliciting = true;
        }

        // Probe clone: rebuild an outstanding packet's data under a new number
        if let Some(probe) = self.probe_clone.take() {
            if self.spaces[probe.space].clone_group_acked(probe.clone_id) {
                // A sibling was acknowledged while the probe was queued; settle the
                // membership we reserved for it
                self.spaces[probe.space].clone_erased(Some(probe.clone_id), true);
            } else if probe.space == space_id && self.spaces[space_id].loss_probes > 0 {
                self.spaces[space_id].loss_probes -= 1;
                sent.clone_id = Some(probe.clone_id);
                if let Some(range) = probe.crypto.clone() {
                    let space = &mut self.spaces[space_id];
                    let mut data = Vec::with_capacity((range.end - range.start) as usize);
                    let mut cursor = range.start;
                    while cursor < range.end {
                        let chunk = space.crypto_out.get(cursor..range.end);
                        if chunk.is_empty() {
                            break;
                        }
                        data.extend_from_slice(chunk);
                        cursor += chunk.len() as u64;
                    }
                    if !data.is_empty() {
                        frame::Crypto {
                            offset: range.start,
                            data: Bytes::from(data),
                        }
                        .encode(buf);
                        builder.ack_eliciting = true;
                        sent.crypto = Some(range);
                        sent.forced = true;
                    }
                }
                for meta in &probe.stream_frames {
                    let data = self.stream_bytes_for(meta);
                    if data.is_empty() && !meta.fin {
                        continue;
                    }
                    frame::Stream {
                        id: meta.id,
                        offset: meta.offsets.start,
                        fin: meta.fin,
                        data,
                    }
                    .encode(true, buf);
                    builder.ack_eliciting = true;
                    sent.forced = true;
                    sent.stream_frames.push(meta.clone());
                }
            } else {
                self.probe_clone = Some(probe);
            }
        }

        // DATAGRAM
        if space_id == SpaceId::Data {
            while let Some(datagram) = self.datagrams.outgoing.front() {
                let required = frame::Datagram::SIZE_BOUND + datagram.data.len();
                if buf.len() + required > max_size {
                    break;
                }
                let datagram = self.datagrams.outgoing.pop_front().unwrap();
                self.datagrams.outgoing_bytes -= datagram.data.len();
                datagram.encode(true, buf);
                builder.ack_eliciting = true;
                // Datagrams are fire-and-forget: no retransmit state
            }
        }

        // STREAM, scheduled by priority
        if space_id == SpaceId::Data && self.state.is_established() {
            let metas = self.streams.write_stream_frames(buf, max_size);
            if !metas.is_empty() {
                builder.ack_eliciting = true;
            }
            for meta in metas {
                sent.stream_frames.push(meta);
            }
        }

        sent
    }

    fn populate_control_frames(
        &mut self,
        _now: Instant,
        buf: &mut Vec<u8>,
        builder: &mut PacketBuilder,
        sent: &mut SentFrames,
        max_size: usize,
    ) {
        use crate::coding::BufMutExt;

        // HANDSHAKE_DONE
        if mem::take(&mut self.spaces[SpaceId::Data].pending.handshake_done)
            && buf.len() + 1 < max_size
        {
            buf.push(0x1e);
            builder.ack_eliciting = true;
            sent.retransmits.handshake_done = true;
        }

        // RESET_STREAM / RESET_STREAM_AT
        while let Some(reset) = self.spaces[SpaceId::Data].pending.reset_stream.pop() {
            if buf.len() + frame::ResetStream::SIZE_BOUND > max_size {
                self.spaces[SpaceId::Data].pending.reset_stream.push(reset);
                break;
            }
            reset.encode(buf);
            builder.ack_eliciting = true;
            sent.retransmits.reset_stream.push(reset);
        }

        // STOP_SENDING
        while let Some(frame) = self.spaces[SpaceId::Data].pending.stop_sending.pop() {
            if buf.len() + frame::StopSending::SIZE_BOUND > max_size {
                self.spaces[SpaceId::Data].pending.stop_sending.push(frame);
                break;
            }
            frame.encode(buf);
            builder.ack_eliciting = true;
            sent.retransmits.stop_sending.push(frame);
        }

        // MAX_DATA, also re-sent with the current limit if a carrier was lost
        let resend_max_data = mem::take(&mut self.spaces[SpaceId::Data].pending.max_data);
        if (resend_max_data || self.streams.take_max_data().is_some()) && buf.len() + 9 < max_size
        {
            buf.write(frame::FrameType::MAX_DATA);
            buf.write(self.streams.current_max_data());
            builder.ack_eliciting = true;
            sent.retransmits.max_data = true;
        }

        // MAX_STREAM_DATA: fresh updates plus lost carriers, with current values
        let mut max_stream_data = self.streams.take_max_stream_data();
        for id in mem::take(&mut self.spaces[SpaceId::Data].pending.max_stream_data) {
            if max_stream_data.iter().any(|&(seen, _)| seen == id) {
                continue;
            }
            if let Some(limit) = self.streams.current_max_stream_data(id) {
                max_stream_data.push((id, limit));
            }
        }
        for (id, limit) in max_stream_data {
            if buf.len() + 17 > max_size {
                break;
            }
            buf.write(frame::FrameType::MAX_STREAM_DATA);
            buf.write(id);
            buf.write(limit);
            builder.ack_eliciting = true;
            sent.retransmits.max_stream_data.insert(id);
        }

        // MAX_STREAMS
        for dir in [Dir::Bi, Dir::Uni] {
            let resend = mem::take(&mut self.spaces[SpaceId::Data].pending.max_streams[dir as usize]);
            let fresh = self.streams.take_max_streams(dir);
            if (resend || fresh.is_some()) && buf.len() + 9 < max_size {
                buf.write(match dir {
                    Dir::Bi => frame::FrameType::MAX_STREAMS_BIDI,
                    Dir::Uni => frame::FrameType::MAX_STREAMS_UNI,
                });
                buf.write_var(self.streams.current_max_streams(dir));
                builder.ack_eliciting = true;
                sent.retransmits.max_streams[dir as usize] = true;
            }
        }

        // Blocked frames; lost carriers re-send their recorded offsets
        let resend_blocked = self.spaces[SpaceId::Data].pending.data_blocked.take();
        if (self.streams.take_blocked_pending() || resend_blocked.is_some())
            && buf.len() + 9 < max_size
        {
            let offset = resend_blocked.unwrap_or_else(|| self.streams.data_blocked_at());
            buf.write(frame::FrameType::DATA_BLOCKED);
            buf.write_var(offset);
            builder.ack_eliciting = true;
            sent.retransmits.data_blocked = Some(offset);
        }
        let mut stream_blocked = self.streams.take_stream_blocked();
        stream_blocked
            .extend(mem::take(&mut self.spaces[SpaceId::Data].pending.stream_data_blocked));
        for (id, offset) in stream_blocked {
            if buf.len() + 17 > max_size {
                break;
            }
            buf.write(frame::FrameType::STREAM_DATA_BLOCKED);
            buf.write(id);
            buf.write_var(offset);
            builder.ack_eliciting = true;
            sent.retransmits.stream_data_blocked.push((id, offset));
        }
        for dir in [Dir::Bi, Dir::Uni] {
            let resend = self.spaces[SpaceId::Data].pending.streams_blocked[dir as usize].take();
            if (self.streams.take_streams_blocked_pending(dir) || resend.is_some())
                && buf.len() + 9 < max_size
            {
                let limit = resend.unwrap_or_else(|| self.streams.blocked_streams_limit(dir));
                buf.write(match dir {
                    Dir::Bi => frame::FrameType::STREAMS_BLOCKED_BIDI,
                    Dir::Uni => frame::FrameType::STREAMS_BLOCKED_UNI,
                });
                buf.write_var(limit);
                builder.ack_eliciting = true;
                sent.retransmits.streams_blocked[dir as usize] = Some(limit);
            }
        }

        // NEW_CONNECTION_ID / RETIRE_CONNECTION_ID
        while let Some(frame) = self.spaces[SpaceId::Data].pending.new_cids.pop() {
            if buf.len() + frame::NewConnectionId::SIZE_BOUND > max_size {
                self.spaces[SpaceId::Data].pending.new_cids.push(frame);
                break;
            }
            frame.encode(buf);
            builder.ack_eliciting = true;
            sent.retransmits.new_cids.push(frame);
        }
        while let Some(seq) = self.spaces[SpaceId::Data].pending.retire_cids.pop() {
            if buf.len() + 9 > max_size {
                self.spaces[SpaceId::Data].pending.retire_cids.push(seq);
                break;
            }
            buf.write(frame::FrameType::RETIRE_CONNECTION_ID);
            buf.write_var(seq);
            builder.ack_eliciting = true;
            sent.retransmits.retire_cids.push(seq);
        }

        // ACK_FREQUENCY; a lost carrier re-sends through `should_send` once
        // `on_lost` has cleared the in-flight record
        mem::take(&mut self.spaces[SpaceId::Data].pending.ack_frequency);
        if self.peer_params.min_ack_delay.is_some() && self.handshake_confirmed {
            let candidate = self
                .ack_frequency
                .candidate_max_ack_delay(self.path.rtt.min(), &self.config.ack_frequency);
            if self.ack_frequency.should_send(candidate)
                && buf.len() + frame::AckFrequency::SIZE_BOUND < max_size
            {
                let frame = self.ack_frequency.frame_to_send(
                    candidate,
                    self.config.ack_frequency.reordering_threshold,
                    self.config.ack_frequency.ack_eliciting_threshold,
                );
                frame.encode(buf);
                self.ack_frequency
                    .frame_sent(builder.exact_number, candidate);
                builder.ack_eliciting = true;
                sent.retransmits.ack_frequency = true;
            }
        }
    }

    /// Fetch stream bytes for a cloned retransmission, best effort
    fn stream_bytes_for(&self, meta: &frame::StreamMeta) -> Bytes {
        let Some(data) = self.streams.copy_unacked(meta.id, meta.offsets.clone()) else {
            return Bytes::new();
        };
        data
    }

    // === Close paths ===

    fn close_impl(&mut self, now: Instant, reason: Close) {
        if self.state.is_closed() {
            return;
        }
        self.state = State::Closing { reason };
        self.close_pending = true;
        self.timers
            .set(Timer::Close, now + 3 * self.pto(self.highest_space));
    }

    /// Terminate silently: no CLOSE frames are emitted
    fn terminate(&mut self, now: Instant, reason: ConnectionError) {
        self.events
            .push_back(Event::ConnectionLost {
                reason: reason.clone(),
            });
        self.error = Some(reason);
        self.state = State::Draining;
        self.timers.set(Timer::Close, now + 3 * self.pto(self.highest_space));
    }

    /// Protocol violation by the peer: close with a transport error
    fn fail_with(&mut self, now: Instant, error: TransportError) {
        debug!("closing connection: {error}");
        self.events.push_back(Event::ConnectionLost {
            reason: ConnectionError::TransportError(error.clone()),
        });
        self.error = Some(ConnectionError::TransportError(error.clone()));
        self.close_impl(now, Close::Connection(error.into()));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("state", &self.state)
            .field("local_cid", &self.local_cid)
            .field("rem_cid", &self.rem_cid)
            .finish_non_exhaustive()
    }
}

/// Record of frames written into one packet, used to build its `SentPacket`
#[derive(Default)]
struct SentFrames {
    acks: RangeSet,
    retransmits: Retransmits,
    stream_frames: frame::StreamMetaVec,
    crypto: Option<std::ops::Range<u64>>,
    clone_id: Option<u64>,
    /// Packet must go out even if otherwise empty-looking
    forced: bool,
}

fn buf_write_path_frame(buf: &mut Vec<u8>, ty: frame::FrameType, token: u64) {
    use crate::coding::BufMutExt;
    buf.write(ty);
    buf.write(token);
}

const MAX_PRE_KEY_DATAGRAMS: usize = 10;
const MAX_LOSS_PROBES: u32 = 2;
const MAX_BACKOFF_EXPONENT: u32 = 10;
const MAX_REORDER_THRESHOLD: u64 = 256;
const MAX_TRACKED_LOSSES: usize = 1024;
/// Don't bother coalescing a packet that can't hold at least this much
const MIN_PACKET_SPACE: usize = 40;
