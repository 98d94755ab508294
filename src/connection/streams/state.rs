use std::collections::{BinaryHeap, VecDeque};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    config::TransportConfig,
    frame::{self, FrameStruct, StreamMeta, StreamMetaVec},
    transport_error::TransportError,
    transport_parameters::TransportParameters,
    Dir, Side, StreamId, VarInt, MAX_STREAM_COUNT,
};

use super::super::events::StreamEvent;
use super::recv::{Recv, RecvState};
use super::send::{Send, SendState};
use super::{ReadError, WriteError};

/// Entry in the queue of streams with data to send
///
/// Ordered by priority level first; within a level, lower recency goes first, giving
/// round-robin across incremental streams and stable head-of-queue for
/// non-incremental ones.
#[derive(Eq, PartialEq)]
struct PendingStream {
    priority: i32,
    recency: u64,
    id: StreamId,
}

impl Ord for PendingStream {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.recency.cmp(&self.recency))
    }
}

impl PartialOrd for PendingStream {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Peer-advertised send limits for freshly opened streams, by type
#[derive(Debug, Default, Copy, Clone)]
struct PeerStreamLimits {
    /// Streams we initiate, bidirectional
    ours_bidi: u64,
    /// Streams the peer initiated, bidirectional
    theirs_bidi: u64,
    /// Unidirectional streams we initiate
    uni: u64,
}

/// State of all streams of one connection, plus both levels of flow control
pub(crate) struct StreamsState {
    side: Side,
    send: FxHashMap<StreamId, Send>,
    recv: FxHashMap<StreamId, Recv>,

    /// Next index to open locally, per directionality
    next: [u64; 2],
    /// Peer-imposed limit on locally-opened streams, per directionality
    max: [u64; 2],
    /// We tried to open a stream and were blocked; STREAMS_BLOCKED pending
    streams_blocked_pending: [bool; 2],

    /// Count of remote streams we allow, per directionality
    max_remote: [u64; 2],
    /// Count of remote streams opened so far, per directionality
    opened_remote: [u64; 2],
    /// Remote streams opened but not yet surfaced through `accept`
    unaccepted: [VecDeque<StreamId>; 2],
    /// Fully closed remote streams not yet returned as MAX_STREAMS credit
    closed_remote: [u64; 2],
    max_streams_dirty: [bool; 2],

    /// Peer's connection-level flow control limit on outgoing data
    pub(crate) max_data: u64,
    /// Connection-level flow control credit consumed by queued data
    data_sent: u64,
    /// DATA_BLOCKED pending
    blocked_pending: bool,
    /// Bound on total unacknowledged buffered data
    send_window: u64,
    unacked_data: u64,

    /// Our advertised connection-level receive limit
    local_max_data: u64,
    /// Credit reissued per connection window update
    receive_window: u64,
    /// Sum over streams of the highest received offset
    data_recvd: u64,
    /// Bytes delivered to or discarded by the application
    consumed: u64,
    max_data_dirty: bool,

    /// Initial limits for streams we open, learned from the peer's parameters
    peer_limits: PeerStreamLimits,
    /// Initial limit for streams the peer opens toward us
    local_stream_receive_window: u64,

    pending: BinaryHeap<PendingStream>,
    recency: u64,
    /// Consecutive dequeues of the stream at the head of the queue
    run: Option<(StreamId, usize)>,
    writes_per_stream: usize,

    events: VecDeque<StreamEvent>,
}

impl StreamsState {
    pub(crate) fn new(side: Side, config: &TransportConfig) -> Self {
        Self {
            side,
            send: FxHashMap::default(),
            recv: FxHashMap::default(),
            next: [0, 0],
            max: [0, 0],
            streams_blocked_pending: [false, false],
            max_remote: [
                config.max_concurrent_bidi_streams.into_inner(),
                config.max_concurrent_uni_streams.into_inner(),
            ],
            opened_remote: [0, 0],
            unaccepted: [VecDeque::new(), VecDeque::new()],
            closed_remote: [0, 0],
            max_streams_dirty: [false, false],
            max_data: 0,
            data_sent: 0,
            blocked_pending: false,
            send_window: config.send_window,
            unacked_data: 0,
            local_max_data: config.receive_window.into_inner(),
            receive_window: config.receive_window.into_inner(),
            data_recvd: 0,
            consumed: 0,
            max_data_dirty: false,
            peer_limits: PeerStreamLimits::default(),
            local_stream_receive_window: config.stream_receive_window.into_inner(),
            pending: BinaryHeap::new(),
            recency: 0,
            run: None,
            writes_per_stream: config.priority_queue_writes_per_stream,
            events: VecDeque::new(),
        }
    }

    /// Adopt limits from the peer's transport parameters
    pub(crate) fn set_params(&mut self, params: &TransportParameters) {
        self.max[Dir::Bi as usize] = params.initial_max_streams_bidi.into_inner();
        self.max[Dir::Uni as usize] = params.initial_max_streams_uni.into_inner();
        self.max_data = params.initial_max_data.into_inner();
        self.peer_limits = PeerStreamLimits {
            ours_bidi: params.initial_max_stream_data_bidi_remote.into_inner(),
            theirs_bidi: params.initial_max_stream_data_bidi_local.into_inner(),
            uni: params.initial_max_stream_data_uni.into_inner(),
        };
        // Streams opened before the handshake finished learn their limits late
        for (&id, send) in &mut self.send {
            if id.initiator() == self.side {
                send.max_data = send.max_data.max(match id.dir() {
                    Dir::Bi => self.peer_limits.ours_bidi,
                    Dir::Uni => self.peer_limits.uni,
                });
            }
        }
        for dir in [Dir::Bi, Dir::Uni] {
            if self.next[dir as usize] < self.max[dir as usize] {
                self.events.push_back(StreamEvent::Available { dir });
            }
        }
    }

    /// Open a locally-initiated stream, if stream limits allow
    pub(crate) fn open(&mut self, dir: Dir) -> Option<StreamId> {
        if self.next[dir as usize] >= self.max[dir as usize] {
            self.streams_blocked_pending[dir as usize] = true;
            return None;
        }
        let id = StreamId::new(self.side, dir, self.next[dir as usize]);
        self.next[dir as usize] += 1;
        let send_limit = match dir {
            Dir::Bi => self.peer_limits.ours_bidi,
            Dir::Uni => self.peer_limits.uni,
        };
        self.send.insert(id, Send::new(send_limit));
        if dir == Dir::Bi {
            self.recv
                .insert(id, Recv::new(self.local_stream_receive_window));
        }
        Some(id)
    }

    /// Accept a remotely-initiated stream, if one is waiting
    pub(crate) fn accept(&mut self, dir: Dir) -> Option<StreamId> {
        self.unaccepted[dir as usize].pop_front()
    }

    /// The current limit we're blocked on, for STREAMS_BLOCKED
    pub(crate) fn blocked_streams_limit(&self, dir: Dir) -> u64 {
        self.max[dir as usize]
    }

    pub(crate) fn take_streams_blocked_pending(&mut self, dir: Dir) -> bool {
        std::mem::take(&mut self.streams_blocked_pending[dir as usize])
    }

    pub(crate) fn take_blocked_pending(&mut self) -> bool {
        std::mem::take(&mut self.blocked_pending)
    }

    pub(crate) fn poll_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    /// Connection-level flow control credit remaining for queueing
    fn conn_send_budget(&self) -> u64 {
        let flow = self.max_data.saturating_sub(self.data_sent);
        let buffer = self.send_window.saturating_sub(self.unacked_data);
        flow.min(buffer)
    }

    pub(crate) fn write(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<usize, WriteError> {
        self.validate_send_id(id).ok_or(WriteError::ClosedStream)?;
        let budget = self.conn_send_budget();
        let stream = self.send.get_mut(&id).ok_or(WriteError::ClosedStream)?;
        let mut written = 0;
        if !data.is_empty() {
            written = match stream.write(data, budget) {
                Ok(n) => n,
                Err(WriteError::Blocked) => {
                    if self.max_data <= self.data_sent {
                        self.blocked_pending = true;
                    }
                    return Err(WriteError::Blocked);
                }
                Err(e) => return Err(e),
            };
            self.data_sent += written as u64;
            self.unacked_data += written as u64;
        }
        if fin && written == data.len() {
            stream.finish()?;
        }
        if stream.has_sendable_data() {
            let (priority, incremental) = (stream.priority, stream.incremental);
            self.queue_stream(id, priority, incremental);
        }
        Ok(written)
    }

    pub(crate) fn read(
        &mut self,
        id: StreamId,
        max_length: usize,
    ) -> Result<Option<(Bytes, bool)>, ReadError> {
        let stream = self.recv.get_mut(&id).ok_or(ReadError::ClosedStream)?;
        let result = stream.read(max_length);
        match &result {
            Ok(Some((chunk, at_end))) => {
                self.consumed += chunk.len() as u64;
                if let Some(new_max) = self.recv.get_mut(&id).unwrap().maybe_issue_credit() {
                    trace!(stream = %id, new_max, "issuing stream credit");
                }
                self.maybe_issue_conn_credit();
                if *at_end {
                    self.stream_freed_if_closed(id);
                }
            }
            Ok(None) | Err(ReadError::Reset(_)) => {
                // Terminal: any unread remainder counts as consumed
                let stream = self.recv.get_mut(&id).unwrap();
                if let Some(final_offset) = stream.final_offset {
                    self.consumed += final_offset.saturating_sub(stream.assembler.bytes_read());
                }
                self.maybe_issue_conn_credit();
                self.stream_freed_if_closed(id);
            }
            _ => {}
        }
        result
    }

    fn maybe_issue_conn_credit(&mut self) {
        let target = self.consumed + self.receive_window;
        if target > self.local_max_data
            && target - self.local_max_data >= self.receive_window / 8
        {
            self.local_max_data = target;
            self.max_data_dirty = true;
        }
    }

    pub(crate) fn finish(&mut self, id: StreamId) -> Result<(), WriteError> {
        let stream = self.send.get_mut(&id).ok_or(WriteError::ClosedStream)?;
        stream.finish()?;
        if stream.has_sendable_data() {
            let (priority, incremental) = (stream.priority, stream.incremental);
            self.queue_stream(id, priority, incremental);
        }
        Ok(())
    }

    /// Reset the send half; returns the frame to transmit, or `None` if redundant
    pub(crate) fn reset(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        reliable_size: Option<u64>,
    ) -> Option<frame::ResetStream> {
        let stream = self.send.get_mut(&id)?;
        let before = stream.buffer.unacked();
        if !stream.reset(error_code, reliable_size) {
            return None;
        }
        let dropped = before - stream.buffer.unacked();
        self.unacked_data = self.unacked_data.saturating_sub(dropped);
        Some(frame::ResetStream {
            id,
            error_code,
            final_offset: VarInt::from_u64(stream.final_size()).unwrap(),
            reliable_size: stream
                .reliable_size
                .map(|x| VarInt::from_u64(x).unwrap()),
        })
    }

    /// Ask the peer to stop sending; returns the frame to transmit
    pub(crate) fn stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
    ) -> Option<frame::StopSending> {
        let stream = self.recv.get_mut(&id)?;
        stream.stop(error_code).then_some(frame::StopSending { id, error_code })
    }

    pub(crate) fn set_priority(&mut self, id: StreamId, priority: i32, incremental: bool) -> bool {
        match self.send.get_mut(&id) {
            Some(stream) => {
                stream.priority = priority;
                stream.incremental = incremental;
                true
            }
            None => false,
        }
    }

    /// Check that `id` identifies a send half this side may use
    fn validate_send_id(&self, id: StreamId) -> Option<()> {
        if id.dir() == Dir::Uni && id.initiator() != self.side {
            return None;
        }
        Some(())
    }

    /// Check that receiving data on `id` is admissible, creating remote streams as
    /// needed
    fn ensure_remote_stream(&mut self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() == self.side {
            if id.dir() == Dir::Uni {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "data received on locally-initiated unidirectional stream",
                ));
            }
            // Peer responding on a stream we opened; it must exist or have existed
            if id.index() >= self.next[Dir::Bi as usize] {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "data received on unopened local stream",
                ));
            }
            return Ok(());
        }
        let dir = id.dir();
        if id.index() >= self.max_remote[dir as usize] {
            return Err(TransportError::STREAM_LIMIT_ERROR("stream limit exceeded"));
        }
        while self.opened_remote[dir as usize] <= id.index() {
            let new_id = StreamId::new(!self.side, dir, self.opened_remote[dir as usize]);
            self.recv
                .insert(new_id, Recv::new(self.local_stream_receive_window));
            if dir == Dir::Bi {
                self.send
                    .insert(new_id, Send::new(self.peer_limits.theirs_bidi));
            }
            self.unaccepted[dir as usize].push_back(new_id);
            self.opened_remote[dir as usize] += 1;
            self.events.push_back(StreamEvent::Opened { dir });
        }
        Ok(())
    }

    /// Ingest a received STREAM frame
    pub(crate) fn received_stream_frame(
        &mut self,
        frame: frame::Stream,
    ) -> Result<(), TransportError> {
        let id = frame.id;
        self.ensure_remote_stream(id)?;
        let Some(stream) = self.recv.get_mut(&id) else {
            // Stream already fully closed; stale retransmission
            return Ok(());
        };
        let credit = stream.ingest(frame)?;
        self.data_recvd += credit;
        if self.data_recvd > self.local_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection flow control limit exceeded",
            ));
        }
        if self.recv.get(&id).unwrap().is_readable() {
            self.events.push_back(StreamEvent::Readable { id });
        }
        Ok(())
    }

    /// Ingest RESET_STREAM or RESET_STREAM_AT
    pub(crate) fn received_reset(
        &mut self,
        frame: &frame::ResetStream,
    ) -> Result<(), TransportError> {
        let id = frame.id;
        self.ensure_remote_stream(id)?;
        let Some(stream) = self.recv.get_mut(&id) else {
            return Ok(());
        };
        let credit = stream.on_reset(frame)?;
        self.data_recvd += credit;
        if self.data_recvd > self.local_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection flow control limit exceeded",
            ));
        }
        self.events.push_back(StreamEvent::Readable { id });
        Ok(())
    }

    /// Ingest STOP_SENDING; returns a reset frame to queue in response, if any
    pub(crate) fn received_stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
    ) -> Result<Option<frame::ResetStream>, TransportError> {
        if id.initiator() != self.side {
            if id.dir() == Dir::Uni {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "STOP_SENDING for a stream the peer sends on",
                ));
            }
            self.ensure_remote_stream(id)?;
        } else if id.index() >= self.next[id.dir() as usize] {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STOP_SENDING for an unopened stream",
            ));
        }
        let Some(stream) = self.send.get_mut(&id) else {
            return Ok(None);
        };
        if stream.state != SendState::Ready {
            return Ok(None);
        }
        stream.stop(error_code);
        self.events.push_back(StreamEvent::Stopped { id, error_code });
        // Respond with a reset carrying the peer's code
        Ok(self.reset(id, error_code, None))
    }

    pub(crate) fn received_max_stream_data(&mut self, id: StreamId, offset: u64) {
        if let Some(stream) = self.send.get_mut(&id) {
            if offset > stream.max_data {
                let was_blocked = !stream.has_sendable_data() && stream.buffer.unsent() != 0;
                stream.max_data = offset;
                stream.blocked_pending = false;
                if was_blocked {
                    self.events.push_back(StreamEvent::Writable { id });
                    let (priority, incremental) = (stream.priority, stream.incremental);
                    self.queue_stream(id, priority, incremental);
                }
            }
        }
    }

    pub(crate) fn received_max_data(&mut self, limit: u64) {
        let was_blocked = self.conn_send_budget() == 0;
        if limit > self.max_data {
            self.max_data = limit;
            if was_blocked && self.conn_send_budget() > 0 {
                // Any stream might now make progress
                for (&id, _) in self.send.iter() {
                    self.events.push_back(StreamEvent::Writable { id });
                }
            }
        }
    }

    pub(crate) fn received_max_streams(
        &mut self,
        dir: Dir,
        count: u64,
    ) -> Result<(), TransportError> {
        if count > MAX_STREAM_COUNT {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "MAX_STREAMS limit out of range",
            ));
        }
        if count > self.max[dir as usize] {
            self.max[dir as usize] = count;
            self.events.push_back(StreamEvent::Available { dir });
        }
        Ok(())
    }

    /// Process acknowledgement of a stream frame
    pub(crate) fn ack_stream_meta(&mut self, meta: &StreamMeta) {
        let id = meta.id;
        let Some(stream) = self.send.get_mut(&id) else {
            return;
        };
        let len = meta.offsets.end - meta.offsets.start;
        self.unacked_data = self.unacked_data.saturating_sub(len);
        if stream.ack(meta) {
            self.events.push_back(StreamEvent::Finished { id });
            self.stream_freed_if_closed(id);
        }
    }

    /// Process loss of a stream frame
    pub(crate) fn on_stream_frame_lost(&mut self, meta: &StreamMeta) {
        let id = meta.id;
        let Some(stream) = self.send.get_mut(&id) else {
            return;
        };
        stream.on_lost(meta);
        if stream.has_sendable_data() {
            let (priority, incremental) = (stream.priority, stream.incremental);
            self.queue_stream(id, priority, incremental);
        }
    }

    /// Process acknowledgement of our reset frame
    pub(crate) fn reset_acked(&mut self, id: StreamId) {
        if let Some(stream) = self.send.get_mut(&id) {
            if stream.reset_acked() {
                self.events.push_back(StreamEvent::Finished { id });
                self.stream_freed_if_closed(id);
            }
        }
    }

    /// Whether our reset frame for `id` must be retransmitted after loss
    pub(crate) fn reset_lost_needs_retransmit(&self, id: StreamId) -> Option<frame::ResetStream> {
        let stream = self.send.get(&id)?;
        if stream.state != SendState::ResetSent || !stream.reset_pending {
            return None;
        }
        Some(frame::ResetStream {
            id,
            error_code: stream.error_code_to_peer?,
            final_offset: VarInt::from_u64(stream.final_size()).unwrap(),
            reliable_size: stream.reliable_size.map(|x| VarInt::from_u64(x).unwrap()),
        })
    }

    /// Drop state for a stream whose halves have both reached a terminal state
    fn stream_freed_if_closed(&mut self, id: StreamId) {
        let send_done = self
            .send
            .get(&id)
            .is_none_or(|s| s.state == SendState::Closed);
        let recv_done = self
            .recv
            .get(&id)
            .is_none_or(|r| r.state == RecvState::Closed);
        // Unidirectional halves that never existed count as done
        let send_applicable = id.dir() == Dir::Bi || id.initiator() == self.side;
        let recv_applicable = id.dir() == Dir::Bi || id.initiator() != self.side;
        if (!send_applicable || send_done) && (!recv_applicable || recv_done) {
            let had_state =
                self.send.remove(&id).is_some() | self.recv.remove(&id).is_some();
            if had_state {
                self.events.push_back(StreamEvent::Closed { id });
                if id.initiator() != self.side {
                    let dir = id.dir();
                    self.closed_remote[dir as usize] += 1;
                    self.max_remote[dir as usize] += 1;
                    self.max_streams_dirty[dir as usize] = true;
                }
            }
        }
    }

    /// Largest stream count to advertise in MAX_STREAMS, clearing the dirty bit
    pub(crate) fn take_max_streams(&mut self, dir: Dir) -> Option<u64> {
        if !std::mem::take(&mut self.max_streams_dirty[dir as usize]) {
            return None;
        }
        self.closed_remote[dir as usize] = 0;
        Some(self.max_remote[dir as usize])
    }

    /// Connection-level limit to advertise in MAX_DATA, clearing the dirty bit
    pub(crate) fn take_max_data(&mut self) -> Option<VarInt> {
        if !std::mem::take(&mut self.max_data_dirty) {
            return None;
        }
        Some(VarInt::from_u64(self.local_max_data).unwrap())
    }

    /// The current connection-level limit, for retransmitting a lost MAX_DATA
    pub(crate) fn current_max_data(&self) -> VarInt {
        VarInt::from_u64(self.local_max_data).unwrap()
    }

    /// The current limit for one stream, for retransmitting a lost MAX_STREAM_DATA
    pub(crate) fn current_max_stream_data(&self, id: StreamId) -> Option<VarInt> {
        let stream = self.recv.get(&id)?;
        if stream.state != RecvState::Open || stream.final_offset.is_some() {
            return None;
        }
        Some(VarInt::from_u64(stream.max_data).unwrap())
    }

    /// The current stream-count limit, for retransmitting a lost MAX_STREAMS
    pub(crate) fn current_max_streams(&self, dir: Dir) -> u64 {
        self.max_remote[dir as usize]
    }

    /// Streams with MAX_STREAM_DATA updates to send
    pub(crate) fn take_max_stream_data(&mut self) -> Vec<(StreamId, VarInt)> {
        let mut out = Vec::new();
        for (&id, stream) in &mut self.recv {
            if std::mem::take(&mut stream.max_data_pending) {
                out.push((id, VarInt::from_u64(stream.max_data).unwrap()));
            }
        }
        out
    }

    /// Streams with STREAM_DATA_BLOCKED to send
    pub(crate) fn take_stream_blocked(&mut self) -> Vec<(StreamId, u64)> {
        let mut out = Vec::new();
        for (&id, stream) in &mut self.send {
            if std::mem::take(&mut stream.blocked_pending) {
                out.push((id, stream.max_data));
            }
        }
        out
    }

    /// Current connection-level send offset, for DATA_BLOCKED
    pub(crate) fn data_blocked_at(&self) -> u64 {
        self.max_data
    }

    pub(crate) fn can_send_stream_data(&self) -> bool {
        !self.pending.is_empty()
    }

    fn queue_stream(&mut self, id: StreamId, priority: i32, _incremental: bool) {
        let stream = match self.send.get_mut(&id) {
            Some(x) => x,
            None => return,
        };
        if stream.queued {
            return;
        }
        stream.queued = true;
        self.recency += 1;
        self.pending.push(PendingStream {
            priority,
            recency: self.recency,
            id,
        });
    }

    /// Fill `buf` with STREAM frames, highest priority streams first
    ///
    /// Returns metadata for each frame written, in order.
    pub(crate) fn write_stream_frames(
        &mut self,
        buf: &mut Vec<u8>,
        max_buf_size: usize,
    ) -> StreamMetaVec {
        let mut metas = StreamMetaVec::new();
        while buf.len() + frame::Stream::SIZE_BOUND < max_buf_size {
            let Some(head) = self.pending.pop() else {
                break;
            };
            let id = head.id;
            let Some(stream) = self.send.get_mut(&id) else {
                continue;
            };
            stream.queued = false;
            if !stream.has_sendable_data() {
                continue;
            }
            // Cap the run of a single stream so equal-priority peers round-robin
            let run = match self.run {
                Some((run_id, count)) if run_id == id => count + 1,
                _ => 1,
            };
            self.run = Some((id, run));

            let max_data_len = (max_buf_size - buf.len() - frame::Stream::SIZE_BOUND) as u64;
            let offsets = stream.buffer.poll_transmit(max_data_len);
            let fin = stream.fin_offset == Some(offsets.end)
                && (stream.fin_pending || offsets.end != offsets.start);
            if fin {
                stream.fin_pending = false;
            }

            let mut data = Vec::with_capacity((offsets.end - offsets.start) as usize);
            let mut cursor = offsets.start;
            while cursor < offsets.end {
                let chunk = stream.buffer.get(cursor..offsets.end);
                if chunk.is_empty() {
                    break;
                }
                data.extend_from_slice(chunk);
                cursor += chunk.len() as u64;
            }

            let frame = frame::Stream {
                id,
                offset: offsets.start,
                fin,
                data: Bytes::from(data),
            };
            // The final frame in a packet may omit its length
            frame.encode(true, buf);
            trace!(stream = %id, offset = offsets.start, len = offsets.end - offsets.start, fin, "STREAM");
            metas.push(StreamMeta {
                id,
                offsets,
                fin,
            });

            let still_sendable = stream.has_sendable_data();
            if !still_sendable {
                self.run = None;
                continue;
            }
            let (priority, incremental) = (stream.priority, stream.incremental);
            stream.queued = true;
            if incremental && run >= self.writes_per_stream {
                // Run exhausted: rejoin the level behind its peers
                self.run = None;
                self.recency += 1;
                self.pending.push(PendingStream {
                    priority,
                    recency: self.recency,
                    id,
                });
            } else {
                // Keep the original recency so the stream stays at the head of its
                // level until the run is used up
                self.pending.push(PendingStream {
                    priority,
                    recency: head.recency,
                    id,
                });
            }
        }
        metas
    }

    /// Copy still-unacknowledged bytes of `range`, for clone-based retransmission
    ///
    /// Bytes already acknowledged (or truncated away by a reliable reset) are
    /// simply absent from the result.
    pub(crate) fn copy_unacked(
        &self,
        id: StreamId,
        range: std::ops::Range<u64>,
    ) -> Option<Bytes> {
        let stream = self.send.get(&id)?;
        let mut data = Vec::new();
        let mut cursor = range.start;
        while cursor < range.end {
            let chunk = stream.buffer.get(cursor..range.end);
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(chunk);
            cursor += chunk.len() as u64;
        }
        Some(Bytes::from(data))
    }

    /// Total bytes queued by the application and not yet acknowledged
    ///
    /// Diagnostic accounting across pending, in-flight, and lost data.
    #[cfg(test)]
    pub(crate) fn unacked(&self) -> u64 {
        self.send.values().map(|s| s.buffer.unacked()).sum()
    }

    #[cfg(test)]
    pub(crate) fn send_state(&self, id: StreamId) -> Option<SendState> {
        self.send.get(&id).map(|s| s.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig::default()
    }

    fn peer_params() -> TransportParameters {
        TransportParameters {
            initial_max_data: VarInt::from_u32(1 << 20),
            initial_max_stream_data_bidi_local: VarInt::from_u32(1 << 20),
            initial_max_stream_data_bidi_remote: VarInt::from_u32(1 << 20),
            initial_max_stream_data_uni: VarInt::from_u32(1 << 20),
            initial_max_streams_bidi: VarInt::from_u32(10),
            initial_max_streams_uni: VarInt::from_u32(10),
            ..TransportParameters::default()
        }
    }

    fn client_streams() -> StreamsState {
        let cfg = config();
        let mut streams = StreamsState::new(Side::Client, &cfg);
        streams.set_params(&peer_params());
        streams
    }

    #[test]
    fn open_respects_limits() {
        let cfg = config();
        let mut streams = StreamsState::new(Side::Client, &cfg);
        // No limits learned yet
        assert_eq!(streams.open(Dir::Bi), None);
        streams.set_params(&peer_params());
        for i in 0..10 {
            let id = streams.open(Dir::Bi).unwrap();
            assert_eq!(id.index(), i);
            assert_eq!(id.initiator(), Side::Client);
        }
        assert_eq!(streams.open(Dir::Bi), None);
        assert!(streams.take_streams_blocked_pending(Dir::Bi));
    }

    #[test]
    fn single_stream_frame_write() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Bi).unwrap();
        assert_eq!(streams.write(id, b"hello", true).unwrap(), 5);
        let mut buf = Vec::new();
        let metas = streams.write_stream_frames(&mut buf, 1200);
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].offsets, 0..5);
        assert!(metas[0].fin);
        assert!(!buf.is_empty());
        // Nothing left to send
        assert!(!streams.can_send_stream_data());
    }

    #[test]
    fn ack_closes_stream() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Bi).unwrap();
        streams.write(id, b"hello", true).unwrap();
        let mut buf = Vec::new();
        let metas = streams.write_stream_frames(&mut buf, 1200);
        streams.ack_stream_meta(&metas[0]);
        assert_eq!(streams.send_state(id), Some(SendState::Closed));
    }

    #[test]
    fn remote_stream_auto_created() {
        let mut streams = client_streams();
        let id = StreamId::new(Side::Server, Dir::Uni, 3);
        streams
            .received_stream_frame(frame::Stream {
                id,
                offset: 0,
                fin: false,
                data: Bytes::from_static(b"x"),
            })
            .unwrap();
        // Streams 0..=3 now exist
        for expected in 0..4 {
            let got = streams.accept(Dir::Uni).unwrap();
            assert_eq!(got.index(), expected);
        }
        assert_eq!(streams.accept(Dir::Uni), None);
    }

    #[test]
    fn remote_stream_limit_enforced() {
        let mut streams = client_streams();
        let id = StreamId::new(Side::Server, Dir::Uni, 100);
        let err = streams
            .received_stream_frame(frame::Stream {
                id,
                offset: 0,
                fin: false,
                data: Bytes::new(),
            })
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_LIMIT_ERROR);
    }

    #[test]
    fn priority_orders_frames() {
        let mut streams = client_streams();
        let low = streams.open(Dir::Uni).unwrap();
        let high = streams.open(Dir::Uni).unwrap();
        streams.set_priority(low, -1, true);
        streams.set_priority(high, 1, true);
        streams.write(low, b"low", false).unwrap();
        streams.write(high, b"high", false).unwrap();
        let mut buf = Vec::new();
        let metas = streams.write_stream_frames(&mut buf, 1200);
        assert_eq!(metas[0].id, high);
        assert_eq!(metas[1].id, low);
    }

    /// Fill packets of `budget` bytes until both streams drain, recording which
    /// stream each frame came from
    fn frame_order(streams: &mut StreamsState, budget: usize, rounds: usize) -> Vec<StreamId> {
        let mut order = Vec::new();
        for _ in 0..rounds {
            let mut buf = Vec::new();
            let metas = streams.write_stream_frames(&mut buf, budget);
            if metas.is_empty() {
                break;
            }
            order.extend(metas.iter().map(|m| m.id));
        }
        order
    }

    #[test]
    fn equal_priority_streams_round_robin() {
        let mut cfg = config();
        cfg.priority_queue_writes_per_stream(1);
        let mut streams = StreamsState::new(Side::Client, &cfg);
        streams.set_params(&peer_params());
        let a = streams.open(Dir::Uni).unwrap();
        let b = streams.open(Dir::Uni).unwrap();
        streams.write(a, &[0xaa; 4000], false).unwrap();
        streams.write(b, &[0xbb; 4000], false).unwrap();

        // Each fill holds one frame's worth; with a run limit of one, the head of
        // the level hands off after every frame
        let order = frame_order(&mut streams, 1200, 8);
        assert!(order.len() >= 4, "too few frames: {order:?}");
        for pair in order.windows(2) {
            assert_ne!(pair[0], pair[1], "no hand-off in {order:?}");
        }
        assert!(order.contains(&a) && order.contains(&b));
    }

    #[test]
    fn writes_per_stream_caps_consecutive_dequeues() {
        let mut cfg = config();
        cfg.priority_queue_writes_per_stream(2);
        let mut streams = StreamsState::new(Side::Client, &cfg);
        streams.set_params(&peer_params());
        let a = streams.open(Dir::Uni).unwrap();
        let b = streams.open(Dir::Uni).unwrap();
        streams.write(a, &[0xaa; 4000], false).unwrap();
        streams.write(b, &[0xbb; 4000], false).unwrap();

        // The head stream keeps its place for two frames, then yields
        let order = frame_order(&mut streams, 1200, 6);
        assert!(order.len() >= 6, "too few frames: {order:?}");
        assert_eq!(order[0], order[1]);
        assert_ne!(order[1], order[2]);
        assert_eq!(order[2], order[3]);
        assert_eq!(order[4], order[0]);
    }

    #[test]
    fn non_incremental_stream_holds_the_head() {
        let mut cfg = config();
        cfg.priority_queue_writes_per_stream(1);
        let mut streams = StreamsState::new(Side::Client, &cfg);
        streams.set_params(&peer_params());
        let first = streams.open(Dir::Uni).unwrap();
        let second = streams.open(Dir::Uni).unwrap();
        streams.set_priority(first, 0, false);
        streams.write(first, &[0x11; 3000], false).unwrap();
        streams.write(second, &[0x22; 3000], false).unwrap();

        // A non-incremental stream is exempt from the run cap: it drains fully
        // before an equal-priority peer gets a turn
        let order = frame_order(&mut streams, 1200, 8);
        let switch = order
            .iter()
            .position(|&id| id == second)
            .expect("second stream never scheduled");
        assert!(order[..switch].iter().all(|&id| id == first));
        assert!(order[switch..].iter().all(|&id| id == second));
    }

    #[test]
    fn stop_sending_triggers_reset() {
        let mut streams = client_streams();
        let id = streams.open(Dir::Uni).unwrap();
        streams.write(id, b"data", false).unwrap();
        let reset = streams
            .received_stop_sending(id, VarInt::from_u32(7))
            .unwrap()
            .expect("reset queued");
        assert_eq!(reset.error_code, VarInt::from_u32(7));
        assert_eq!(streams.send_state(id), Some(SendState::ResetSent));
    }

    #[test]
    fn conn_flow_control_consumed_by_writes() {
        let cfg = config();
        let mut streams = StreamsState::new(Side::Client, &cfg);
        let mut params = peer_params();
        params.initial_max_data = VarInt::from_u32(8);
        streams.set_params(&params);
        let a = streams.open(Dir::Uni).unwrap();
        let b = streams.open(Dir::Uni).unwrap();
        assert_eq!(streams.write(a, b"12345", false).unwrap(), 5);
        assert_eq!(streams.write(b, b"67890", false).unwrap(), 3);
        assert!(matches!(
            streams.write(b, b"x", false),
            Err(WriteError::Blocked)
        ));
        streams.received_max_data(100);
        assert_eq!(streams.write(b, b"x", false).unwrap(), 1);
    }

    #[test]
    fn conn_flow_control_enforced_on_receive() {
        let cfg = config();
        let mut streams = StreamsState::new(Side::Server, &cfg);
        streams.set_params(&peer_params());
        streams.local_max_data = 4;
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        let err = streams
            .received_stream_frame(frame::Stream {
                id,
                offset: 0,
                fin: false,
                data: Bytes::from_static(b"hello"),
            })
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn closed_remote_stream_returns_credit() {
        let mut streams = client_streams();
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        streams
            .received_stream_frame(frame::Stream {
                id,
                offset: 0,
                fin: true,
                data: Bytes::from_static(b"x"),
            })
            .unwrap();
        assert_eq!(streams.accept(Dir::Uni), Some(id));
        // Drain the stream
        let _ = streams.read(id, 100);
        let _ = streams.read(id, 100);
        let new_limit = streams.take_max_streams(Dir::Uni).expect("credit");
        assert_eq!(new_limit, 101);
    }
}
