use std::{
    fmt, io,
    ops::{Range, RangeInclusive},
};

use bytes::{Buf, BufMut, Bytes};
use tinyvec::TinyVec;

use crate::{
    coding::{self, BufExt, BufMutExt, Codec, UnexpectedEnd},
    range_set::RangeSet,
    shared::{ConnectionId, EcnCodepoint},
    transport_error::{Code as TransportErrorCode, TransportError},
    Dir, ResetToken, StreamId, VarInt, MAX_CID_SIZE, MAX_STREAM_COUNT, RESET_TOKEN_SIZE,
};

/// A QUIC frame type
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u64);

impl FrameType {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }
    fn datagram(self) -> Option<DatagramInfo> {
        if DATAGRAM_TYS.contains(&self.0) {
            Some(DatagramInfo(self.0 as u8))
        } else {
            None
        }
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

pub(crate) trait FrameStruct {
    /// Smallest number of bytes this type of frame is guaranteed to fit within.
    const SIZE_BOUND: usize;
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub(crate) const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    x if DATAGRAM_TYS.contains(&x) => f.write_str("DATAGRAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    // STREAM = 0x08..=0x0f
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
    IMMEDIATE_ACK = 0x1f,
    RESET_STREAM_AT = 0x24,
    // DATAGRAM = 0x30..=0x31
    ACK_FREQUENCY = 0xaf,
}

const STREAM_TYS: RangeInclusive<u64> = RangeInclusive::new(0x08, 0x0f);
const DATAGRAM_TYS: RangeInclusive<u64> = RangeInclusive::new(0x30, 0x31);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct DatagramInfo(u8);

impl DatagramInfo {
    fn len(self) -> bool {
        self.0 & 0x01 != 0
    }
}

#[derive(Debug)]
pub(crate) enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    NewToken(NewToken),
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Dir, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    Close(Close),
    Datagram(Datagram),
    AckFrequency(AckFrequency),
    ImmediateAck,
    HandshakeDone,
}

impl Frame {
    pub(crate) fn ty(&self) -> FrameType {
        use Frame::*;
        match *self {
            Padding => FrameType::PADDING,
            Ping => FrameType::PING,
            Ack(_) => FrameType::ACK,
            ResetStream(ref x) => x.ty(),
            StopSending(_) => FrameType::STOP_SENDING,
            Crypto(_) => FrameType::CRYPTO,
            NewToken(_) => FrameType::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = *STREAM_TYS.start();
                if x.fin {
                    ty |= 0x01;
                }
                if x.offset != 0 {
                    ty |= 0x04;
                }
                FrameType(ty)
            }
            MaxData(_) => FrameType::MAX_DATA,
            MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            MaxStreams { dir: Dir::Bi, .. } => FrameType::MAX_STREAMS_BIDI,
            MaxStreams { dir: Dir::Uni, .. } => FrameType::MAX_STREAMS_UNI,
            DataBlocked { .. } => FrameType::DATA_BLOCKED,
            StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            StreamsBlocked { dir: Dir::Bi, .. } => FrameType::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { dir: Dir::Uni, .. } => FrameType::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => FrameType::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            PathChallenge(_) => FrameType::PATH_CHALLENGE,
            PathResponse(_) => FrameType::PATH_RESPONSE,
            Close(self::Close::Connection(_)) => FrameType::CONNECTION_CLOSE,
            Close(self::Close::Application(_)) => FrameType::APPLICATION_CLOSE,
            Datagram(_) => FrameType(*DATAGRAM_TYS.start()),
            AckFrequency(_) => FrameType::ACK_FREQUENCY,
            ImmediateAck => FrameType::IMMEDIATE_ACK,
            HandshakeDone => FrameType::HANDSHAKE_DONE,
        }
    }

    /// A packet containing at least one frame other than ACK, PADDING, or
    /// CONNECTION_CLOSE elicits an acknowledgement.
    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Self::Ack(_) | Self::Padding | Self::Close(_))
    }
}

/// Peer-initiated stream abort, optionally committing to a reliable prefix
///
/// Carries both RESET_STREAM and RESET_STREAM_AT; the latter promises delivery of the
/// stream prefix up to `reliable_size` before the reset takes effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResetStream {
    pub(crate) id: StreamId,
    pub(crate) error_code: VarInt,
    pub(crate) final_offset: VarInt,
    pub(crate) reliable_size: Option<VarInt>,
}

impl ResetStream {
    fn ty(&self) -> FrameType {
        if self.reliable_size.is_some() {
            FrameType::RESET_STREAM_AT
        } else {
            FrameType::RESET_STREAM
        }
    }

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(self.ty());
        out.write(self.id);
        out.write(self.error_code);
        out.write(self.final_offset);
        if let Some(reliable_size) = self.reliable_size {
            out.write(reliable_size);
        }
    }
}

impl FrameStruct for ResetStream {
    const SIZE_BOUND: usize = 2 + 8 + 8 + 8 + 8;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct StopSending {
    pub(crate) id: StreamId,
    pub(crate) error_code: VarInt,
}

impl StopSending {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::STOP_SENDING);
        out.write(self.id);
        out.write(self.error_code);
    }
}

impl FrameStruct for StopSending {
    const SIZE_BOUND: usize = 1 + 8 + 8;
}

#[derive(Debug, Clone)]
pub(crate) struct Crypto {
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
}

impl Crypto {
    pub(crate) const SIZE_BOUND: usize = 17;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NewToken {
    pub(crate) token: Bytes,
}

impl NewToken {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_TOKEN);
        out.write_var(self.token.len() as u64);
        out.put_slice(&self.token);
    }

    pub(crate) fn size(&self) -> usize {
        1 + VarInt::from_u64(self.token.len() as u64).unwrap().size() + self.token.len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) offset: u64,
    pub(crate) fin: bool,
    pub(crate) data: Bytes,
}

impl Stream {
    /// Encode `self`, including the length field iff `length` is set
    pub(crate) fn encode<W: BufMut>(&self, length: bool, out: &mut W) {
        let mut ty = *STREAM_TYS.start();
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        out.write_var(ty);
        out.write(self.id);
        if self.offset != 0 {
            out.write_var(self.offset);
        }
        if length {
            out.write_var(self.data.len() as u64);
        }
        out.put_slice(&self.data);
    }
}

impl FrameStruct for Stream {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

/// Metadata from a stream frame, as stored with a sent packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StreamMeta {
    pub(crate) id: StreamId,
    pub(crate) offsets: Range<u64>,
    pub(crate) fin: bool,
}

/// A vector of [`StreamMeta`] that avoids allocating for the common single-frame case
pub(crate) type StreamMetaVec = TinyVec<[StreamMeta; 1]>;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

impl EcnCounts {
    pub const ZERO: Self = Self {
        ect0: 0,
        ect1: 0,
        ce: 0,
    };

    pub fn record(&mut self, codepoint: EcnCodepoint) {
        match codepoint {
            EcnCodepoint::Ect0 => self.ect0 += 1,
            EcnCodepoint::Ect1 => self.ect1 += 1,
            EcnCodepoint::Ce => self.ce += 1,
        }
    }
}

impl std::ops::AddAssign<EcnCodepoint> for EcnCounts {
    fn add_assign(&mut self, rhs: EcnCodepoint) {
        self.record(rhs);
    }
}

impl coding::Codec for EcnCounts {
    fn decode<B: Buf>(r: &mut B) -> coding::Result<Self> {
        Ok(Self {
            ect0: r.get_var()?,
            ect1: r.get_var()?,
            ce: r.get_var()?,
        })
    }
    fn encode<B: BufMut>(&self, out: &mut B) {
        out.write_var(self.ect0);
        out.write_var(self.ect1);
        out.write_var(self.ce);
    }
}

/// An ACK frame, with ranges kept in their encoded form
///
/// Decoding the blocks is deferred to iteration so that a frame can be routed before
/// the ranges are needed; `scan_blocks` performs the format validation up front.
#[derive(Clone, Eq, PartialEq)]
pub(crate) struct Ack {
    pub(crate) largest: u64,
    pub(crate) delay: u64,
    pub(crate) additional: Bytes,
    pub(crate) ecn: Option<EcnCounts>,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges = self
            .iter()
            .map(|range| format!("{range:?}"))
            .collect::<Vec<_>>()
            .join(",");
        f.debug_struct("Ack")
            .field("largest", &self.largest)
            .field("delay", &self.delay)
            .field("ecn", &self.ecn)
            .field("ranges", &ranges)
            .finish()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = RangeInclusive<u64>;
    type IntoIter = AckIter<'a>;

    fn into_iter(self) -> AckIter<'a> {
        AckIter::new(self.largest, &self.additional[..])
    }
}

impl Ack {
    pub(crate) fn encode<W: BufMut>(
        delay: u64,
        ranges: &RangeSet,
        ecn: Option<&EcnCounts>,
        buf: &mut W,
    ) {
        let mut rest = ranges.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        let first_size = first.end - first.start;
        buf.write(if ecn.is_some() {
            FrameType::ACK_ECN
        } else {
            FrameType::ACK
        });
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first_size - 1);
        let mut prev = first.start;
        for block in rest {
            let size = block.end - block.start;
            buf.write_var(prev - block.end - 1);
            buf.write_var(size - 1);
            prev = block.start;
        }
        if let Some(x) = ecn {
            x.encode(buf)
        }
    }

    pub(crate) fn iter(&self) -> AckIter<'_> {
        self.into_iter()
    }

    /// Verify that the encoded blocks all land at or above packet number zero
    pub(crate) fn scan_blocks(&self) -> Result<(), IterErr> {
        let mut buf = io::Cursor::new(&self.additional[..]);
        let mut smallest = self.largest;
        let extra = buf.get_var().map_err(|_| IterErr::UnexpectedEnd)?;
        let first = buf.get_var().map_err(|_| IterErr::UnexpectedEnd)?;
        smallest = smallest.checked_sub(first).ok_or(IterErr::Malformed)?;
        for _ in 0..extra {
            let gap = buf.get_var().map_err(|_| IterErr::UnexpectedEnd)?;
            smallest = smallest.checked_sub(gap + 2).ok_or(IterErr::Malformed)?;
            let block = buf.get_var().map_err(|_| IterErr::UnexpectedEnd)?;
            smallest = smallest.checked_sub(block).ok_or(IterErr::Malformed)?;
        }
        if buf.has_remaining() {
            return Err(IterErr::Malformed);
        }
        Ok(())
    }
}

pub(crate) struct AckIter<'a> {
    largest: u64,
    data: io::Cursor<&'a [u8]>,
    first: bool,
    done: bool,
}

impl<'a> AckIter<'a> {
    fn new(largest: u64, payload: &'a [u8]) -> Self {
        Self {
            largest,
            data: io::Cursor::new(payload),
            first: true,
            done: false,
        }
    }
}

impl Iterator for AckIter<'_> {
    type Item = RangeInclusive<u64>;
    fn next(&mut self) -> Option<RangeInclusive<u64>> {
        if self.done {
            return None;
        }
        if self.first {
            self.first = false;
            // Skip the block count; termination is by buffer exhaustion
            let _count = self.data.get_var().ok()?;
            let size = self.data.get_var().ok()?;
            let smallest = self.largest.checked_sub(size)?;
            let range = smallest..=self.largest;
            self.largest = smallest;
            return Some(range);
        }
        if !self.data.has_remaining() {
            self.done = true;
            return None;
        }
        let gap = self.data.get_var().ok()?;
        let largest = match self.largest.checked_sub(gap + 2) {
            Some(x) => x,
            None => {
                self.done = true;
                return None;
            }
        };
        let size = self.data.get_var().ok()?;
        let smallest = match largest.checked_sub(size) {
            Some(x) => x,
            None => {
                self.done = true;
                return None;
            }
        };
        self.largest = smallest;
        Some(smallest..=largest)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NewConnectionId {
    pub(crate) sequence: u64,
    pub(crate) retire_prior_to: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

impl NewConnectionId {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write_var(self.retire_prior_to);
        out.write(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }
}

impl FrameStruct for NewConnectionId {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 1 + MAX_CID_SIZE + RESET_TOKEN_SIZE;
}

/// An unreliable datagram
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Payload
    pub data: Bytes,
}

impl Datagram {
    pub(crate) const SIZE_BOUND: usize = 3;

    pub(crate) fn encode(&self, length: bool, out: &mut Vec<u8>) {
        out.write(FrameType(*DATAGRAM_TYS.start() | u64::from(length)));
        if length {
            // Safe to unwrap because we check length sanity before queueing datagrams
            out.write(VarInt::from_u64(self.data.len() as u64).unwrap());
        }
        out.extend_from_slice(&self.data);
    }

    pub(crate) fn size(&self, length: bool) -> usize {
        1 + if length {
            VarInt::from_u64(self.data.len() as u64).unwrap().size()
        } else {
            0
        } + self.data.len()
    }
}

/// ACK_FREQUENCY, asking the peer to adjust its acknowledgement cadence
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct AckFrequency {
    pub(crate) sequence: VarInt,
    pub(crate) ack_eliciting_threshold: VarInt,
    pub(crate) request_max_ack_delay: VarInt,
    pub(crate) reordering_threshold: VarInt,
}

impl AckFrequency {
    pub(crate) fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(FrameType::ACK_FREQUENCY);
        buf.write(self.sequence);
        buf.write(self.ack_eliciting_threshold);
        buf.write(self.request_max_ack_delay);
        buf.write(self.reordering_threshold);
    }
}

impl FrameStruct for AckFrequency {
    const SIZE_BOUND: usize = 2 + 8 + 8 + 8 + 8;
}

#[derive(Debug, Clone)]
pub(crate) enum Close {
    Connection(ConnectionClose),
    Application(ApplicationClose),
}

impl Close {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        match *self {
            Self::Connection(ref x) => x.encode(out, max_len),
            Self::Application(ref x) => x.encode(out, max_len),
        }
    }
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Self::Connection(x.into())
    }
}
impl From<ConnectionClose> for Close {
    fn from(x: ConnectionClose) -> Self {
        Self::Connection(x)
    }
}
impl From<ApplicationClose> for Close {
    fn from(x: ApplicationClose) -> Self {
        Self::Application(x)
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded in the specification
    pub error_code: TransportErrorCode,
    /// Type of frame that caused the close
    pub frame_type: Option<FrameType>,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.as_ref().is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            frame_type: x.frame,
            reason: x.reason.into(),
        }
    }
}

impl FrameStruct for ConnectionClose {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

impl ConnectionClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(FrameType::CONNECTION_CLOSE);
        out.write(self.error_code);
        let ty = self.frame_type.map_or(0, |x| x.0);
        out.write_var(ty);
        let max_len = max_len
            - 3
            - VarInt::from_u64(ty).unwrap().size()
            - VarInt::from_u64(self.reason.len() as u64).unwrap().size();
        let actual_len = self.reason.len().min(max_len);
        out.write_var(actual_len as u64);
        out.put_slice(&self.reason[0..actual_len]);
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: VarInt,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reason.as_ref().is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
            f.write_str(" (code ")?;
            self.error_code.fmt(f)?;
            f.write_str(")")?;
        } else {
            self.error_code.fmt(f)?;
        }
        Ok(())
    }
}

impl FrameStruct for ApplicationClose {
    const SIZE_BOUND: usize = 1 + 8 + 8;
}

impl ApplicationClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(FrameType::APPLICATION_CLOSE);
        out.write(self.error_code);
        let max_len = max_len
            - 3
            - VarInt::from_u64(self.reason.len() as u64).unwrap().size();
        let actual_len = self.reason.len().min(max_len);
        out.write_var(actual_len as u64);
        out.put_slice(&self.reason[0..actual_len]);
    }
}

/// Decoder for the frames of one packet payload
pub(crate) struct Iter {
    bytes: io::Cursor<Bytes>,
    last_ty: Option<FrameType>,
}

impl Iter {
    pub(crate) fn new(payload: Bytes) -> Result<Self, TransportError> {
        if payload.is_empty() {
            // A packet payload must contain at least one frame
            return Err(TransportError::PROTOCOL_VIOLATION("packet payload is empty"));
        }
        Ok(Self {
            bytes: io::Cursor::new(payload),
            last_ty: None,
        })
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(UnexpectedEnd);
        }
        let start = self.bytes.position() as usize;
        self.bytes.advance(len as usize);
        Ok(self.bytes.get_ref().slice(start..(start + len as usize)))
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<FrameType>()?;
        self.last_ty = Some(ty);
        Ok(match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::ACK | FrameType::ACK_ECN => {
                let largest = self.bytes.get_var()?;
                let delay = self.bytes.get_var()?;
                let extra_blocks = self.bytes.get_var()?;
                let start = self.bytes.position() as usize - varint_len(extra_blocks);
                let n = self.bytes.get_var()?;
                let mut smallest = largest.checked_sub(n).ok_or(IterErr::Malformed)?;
                for _ in 0..extra_blocks {
                    let gap = self.bytes.get_var()?;
                    smallest = smallest.checked_sub(gap + 2).ok_or(IterErr::Malformed)?;
                    let block = self.bytes.get_var()?;
                    smallest = smallest.checked_sub(block).ok_or(IterErr::Malformed)?;
                }
                let end = self.bytes.position() as usize;
                Frame::Ack(Ack {
                    largest,
                    delay,
                    additional: self.bytes.get_ref().slice(start..end),
                    ecn: if ty != FrameType::ACK_ECN {
                        None
                    } else {
                        Some(self.bytes.get()?)
                    },
                })
            }
            FrameType::RESET_STREAM | FrameType::RESET_STREAM_AT => {
                let id = self.bytes.get()?;
                let error_code = self.bytes.get()?;
                let final_offset = self.bytes.get::<VarInt>()?;
                let reliable_size = if ty == FrameType::RESET_STREAM_AT {
                    let size = self.bytes.get::<VarInt>()?;
                    if size > final_offset {
                        // The reliable prefix cannot extend past the final size
                        return Err(IterErr::Malformed);
                    }
                    Some(size)
                } else {
                    None
                };
                Frame::ResetStream(ResetStream {
                    id,
                    error_code,
                    final_offset,
                    reliable_size,
                })
            }
            FrameType::STOP_SENDING => Frame::StopSending(StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
            }),
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            FrameType::NEW_TOKEN => {
                let token = self.take_len()?;
                if token.is_empty() {
                    return Err(IterErr::Malformed);
                }
                Frame::NewToken(NewToken { token })
            }
            FrameType::MAX_DATA => Frame::MaxData(self.bytes.get()?),
            FrameType::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_BIDI | FrameType::MAX_STREAMS_UNI => {
                let count = self.bytes.get_var()?;
                if count > MAX_STREAM_COUNT {
                    return Err(IterErr::Malformed);
                }
                Frame::MaxStreams {
                    dir: if ty == FrameType::MAX_STREAMS_BIDI {
                        Dir::Bi
                    } else {
                        Dir::Uni
                    },
                    count,
                }
            }
            FrameType::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_BIDI | FrameType::STREAMS_BLOCKED_UNI => {
                let limit = self.bytes.get_var()?;
                if limit > MAX_STREAM_COUNT {
                    return Err(IterErr::Malformed);
                }
                Frame::StreamsBlocked {
                    dir: if ty == FrameType::STREAMS_BLOCKED_BIDI {
                        Dir::Bi
                    } else {
                        Dir::Uni
                    },
                    limit,
                }
            }
            FrameType::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                if retire_prior_to > sequence {
                    return Err(IterErr::Malformed);
                }
                let length = self.bytes.get::<u8>()? as usize;
                if length > MAX_CID_SIZE || length == 0 {
                    return Err(IterErr::Malformed);
                }
                if length > self.bytes.remaining() {
                    return Err(IterErr::UnexpectedEnd);
                }
                let id = ConnectionId::from_buf(&mut self.bytes, length);
                if self.bytes.remaining() < RESET_TOKEN_SIZE {
                    return Err(IterErr::UnexpectedEnd);
                }
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token: reset_token.into(),
                })
            }
            FrameType::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            FrameType::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            FrameType::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            FrameType::CONNECTION_CLOSE => Frame::Close(Close::Connection(ConnectionClose {
                error_code: self.bytes.get()?,
                frame_type: {
                    let x = self.bytes.get_var()?;
                    if x == 0 {
                        None
                    } else {
                        Some(FrameType(x))
                    }
                },
                reason: self.take_len()?,
            })),
            FrameType::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            })),
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            FrameType::ACK_FREQUENCY => Frame::AckFrequency(AckFrequency {
                sequence: self.bytes.get()?,
                ack_eliciting_threshold: self.bytes.get()?,
                request_max_ack_delay: self.bytes.get()?,
                reordering_threshold: self.bytes.get()?,
            }),
            FrameType::IMMEDIATE_ACK => Frame::ImmediateAck,
            _ => {
                if let Some(s) = ty.stream() {
                    Frame::Stream(Stream {
                        id: self.bytes.get()?,
                        offset: if s.off() { self.bytes.get_var()? } else { 0 },
                        fin: s.fin(),
                        data: if s.len() {
                            self.take_len()?
                        } else {
                            self.take_remaining()
                        },
                    })
                } else if let Some(d) = ty.datagram() {
                    Frame::Datagram(Datagram {
                        data: if d.len() {
                            self.take_len()?
                        } else {
                            self.take_remaining()
                        },
                    })
                } else {
                    return Err(IterErr::InvalidFrameId);
                }
            }
        })
    }

    fn take_remaining(&mut self) -> Bytes {
        let start = self.bytes.position() as usize;
        let end = self.bytes.get_ref().len();
        self.bytes.set_position(end as u64);
        self.bytes.get_ref().slice(start..end)
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, InvalidFrame>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(Ok(x)),
            Err(e) => {
                // Corrupt frame, skip it and everything that follows
                self.bytes.set_position(self.bytes.get_ref().len() as u64);
                Some(Err(InvalidFrame {
                    ty: self.last_ty,
                    reason: e.reason(),
                }))
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct InvalidFrame {
    pub(crate) ty: Option<FrameType>,
    pub(crate) reason: &'static str,
}

impl From<InvalidFrame> for TransportError {
    fn from(err: InvalidFrame) -> Self {
        let mut te = Self::FRAME_ENCODING_ERROR(err.reason);
        te.frame = err.ty;
        te
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum IterErr {
    UnexpectedEnd,
    InvalidFrameId,
    Malformed,
}

impl IterErr {
    fn reason(&self) -> &'static str {
        use IterErr::*;
        match *self {
            UnexpectedEnd => "unexpected end",
            InvalidFrameId => "invalid frame ID",
            Malformed => "malformed",
        }
    }
}

impl From<UnexpectedEnd> for IterErr {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

fn varint_len(x: u64) -> usize {
    VarInt::from_u64(x).unwrap().size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frames(payload: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(payload))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn ack_coding() {
        const PACKETS: &[u64] = &[1, 2, 3, 5, 10, 11, 14];
        let mut ranges = RangeSet::new();
        for &packet in PACKETS {
            ranges.insert_one(packet);
        }
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, None, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match decoded[0] {
            Frame::Ack(ref ack) => {
                let mut packets = ack.iter().flatten().collect::<Vec<_>>();
                packets.sort_unstable();
                assert_eq!(&packets[..], PACKETS);
                assert_eq!(ack.delay, 42);
            }
            ref x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ack_gap_semantics() {
        // largest=1000, one extra block, first block len 9 (covers 991..=1000),
        // gap=10 -> next largest 979, block len 9 -> 970..=979
        let mut buf = Vec::new();
        buf.write(FrameType::ACK);
        buf.write_var(1000); // largest
        buf.write_var(100); // delay (raw)
        buf.write_var(1); // extra block count
        buf.write_var(9); // first block
        buf.write_var(10); // gap
        buf.write_var(9); // second block
        let decoded = frames(buf);
        match decoded[0] {
            Frame::Ack(ref ack) => {
                let ranges = ack.iter().collect::<Vec<_>>();
                assert_eq!(ranges, vec![991..=1000, 970..=979]);
            }
            ref x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ack_blocks_below_zero() {
        let mut buf = Vec::new();
        buf.write(FrameType::ACK);
        buf.write_var(10); // largest
        buf.write_var(0); // delay
        buf.write_var(1); // extra blocks
        buf.write_var(5); // first block
        buf.write_var(10); // gap descends past zero
        buf.write_var(1);
        let result = Iter::new(Bytes::from(buf))
            .unwrap()
            .collect::<Result<Vec<_>, _>>();
        assert!(result.is_err());
    }

    #[test]
    fn reset_stream_at_roundtrip() {
        let frame = ResetStream {
            id: StreamId(8),
            error_code: VarInt::from_u32(7),
            final_offset: VarInt::from_u32(64),
            reliable_size: Some(VarInt::from_u32(32)),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        assert_matches!(&decoded[0], Frame::ResetStream(x) if *x == frame);
    }

    #[test]
    fn reset_stream_at_reliable_size_exceeds_final() {
        let mut buf = Vec::new();
        buf.write(FrameType::RESET_STREAM_AT);
        buf.write(StreamId(0));
        buf.write_var(0); // error code
        buf.write_var(10); // final size
        buf.write_var(11); // reliable size > final size
        let result = Iter::new(Bytes::from(buf))
            .unwrap()
            .collect::<Result<Vec<_>, _>>();
        let err = result.unwrap_err();
        let te = TransportError::from(err);
        assert_eq!(te.code, TransportErrorCode::FRAME_ENCODING_ERROR);
        assert_eq!(te.frame, Some(FrameType::RESET_STREAM_AT));
    }

    #[test]
    fn stream_frame_roundtrip() {
        let frame = Stream {
            id: StreamId(4),
            offset: 100,
            fin: true,
            data: Bytes::from_static(b"hello"),
        };
        let mut buf = Vec::new();
        frame.encode(true, &mut buf);
        let decoded = frames(buf);
        match decoded[0] {
            Frame::Stream(ref x) => {
                assert_eq!(x.id, StreamId(4));
                assert_eq!(x.offset, 100);
                assert!(x.fin);
                assert_eq!(&x.data[..], b"hello");
            }
            ref x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ack_frequency_roundtrip() {
        let frame = AckFrequency {
            sequence: VarInt::from_u32(3),
            ack_eliciting_threshold: VarInt::from_u32(20),
            request_max_ack_delay: VarInt::from_u32(50_000),
            reordering_threshold: VarInt::from_u32(2),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let decoded = frames(buf);
        assert_matches!(&decoded[0], Frame::AckFrequency(x) if *x == frame);
    }

    #[test]
    fn immediate_ack() {
        let mut buf = Vec::new();
        buf.write(FrameType::IMMEDIATE_ACK);
        let decoded = frames(buf);
        assert_matches!(decoded[0], Frame::ImmediateAck);
        assert!(decoded[0].is_ack_eliciting());
    }

    #[test]
    fn new_connection_id_roundtrip() {
        let frame = NewConnectionId {
            sequence: 2,
            retire_prior_to: 1,
            id: ConnectionId::new(&[0xab; 8]),
            reset_token: [0xcd; RESET_TOKEN_SIZE].into(),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let decoded = frames(buf);
        assert_matches!(&decoded[0], Frame::NewConnectionId(x) if *x == frame);
    }

    #[test]
    fn close_truncates_reason() {
        let close = ConnectionClose {
            error_code: TransportErrorCode::PROTOCOL_VIOLATION,
            frame_type: None,
            reason: Bytes::from(vec![b'x'; 100]),
        };
        let mut buf = Vec::new();
        close.encode(&mut buf, 32);
        assert!(buf.len() <= 32);
        let decoded = frames(buf);
        assert_matches!(decoded[0], Frame::Close(Close::Connection(_)));
    }

    #[test]
    fn datagram_roundtrip() {
        let frame = Datagram {
            data: Bytes::from_static(b"ping"),
        };
        let mut buf = Vec::new();
        frame.encode(true, &mut buf);
        let decoded = frames(buf);
        match decoded[0] {
            Frame::Datagram(ref x) => assert_eq!(&x.data[..], b"ping"),
            ref x => panic!("incorrect frame {x:?}"),
        }
    }
}
