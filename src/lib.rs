//! Protocol state machine for a QUIC v1 transport
//!
//! This crate contains the pure protocol logic: connection state machines, stream
//! state and flow control, loss recovery, and congestion control, with no networking
//! or TLS record layer of its own. It performs no I/O. The caller feeds in received
//! UDP datagrams and timer expirations, and polls for datagrams to transmit, timers
//! to arm, and application-visible events.
//!
//! The TLS handshake is consumed through the [`crypto::Session`] trait: an object
//! that, fed incoming crypto bytes, emits outgoing crypto bytes and traffic secrets.
//! Packet protection is provided by the *ring*-backed implementation in
//! [`crypto::ring`].
//!
//! Each connection is a single-threaded cooperative unit; drive it from one thread
//! (or behind one lock) and run as many connections as you like in parallel.

use std::{fmt, ops, time::Duration};

mod coding;
mod range_set;
mod varint;

pub use varint::{VarInt, VarIntBoundsExceeded};

mod shared;
pub use shared::{ConnectionId, EcnCodepoint, ResetToken};

mod frame;
pub use frame::{ApplicationClose, ConnectionClose, Datagram, EcnCounts, FrameType};

mod packet;
pub use packet::SpaceId;

mod transport_error;
pub use transport_error::{Code as TransportErrorCode, TransportError};

mod transport_parameters;
pub use transport_parameters::TransportParameters;

mod config;
pub use config::{
    AckFrequencyConfig, BatchingMode, CongestionAlgorithm, EndpointConfig, ObserverConfig,
    TransportConfig,
};

pub mod congestion;

pub mod crypto;

mod connection;
pub use connection::{
    AckEvent, Connection, ConnectionError, ConnectionStats, Event, LossEvent, ReadError,
    RttSample, SendDatagramError, SpuriousLossEvent, StreamEvent, Transmit, WriteError,
};

mod endpoint;
pub use endpoint::{AcceptError, ConnectError, ConnectionHandle, DatagramEvent, Endpoint};

/// The QUIC protocol version implemented
pub const DEFAULT_VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// The low two bits encode the initiating side and the directionality.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    /// Create a new StreamId
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(
            f,
            "{} {}directional stream {}",
            initiator,
            dir,
            self.index()
        )
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        unsafe { Self::from_u64_unchecked(x.0) }
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).unwrap().encode(buf);
    }
}

/// The maximum number of CIDs we bother to issue per connection
pub(crate) const LOC_CID_COUNT: u64 = 8;
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
pub(crate) const MAX_CID_SIZE: usize = 20;
pub(crate) const MIN_INITIAL_SIZE: u16 = 1200;
/// <https://www.rfc-editor.org/rfc/rfc9000.html#name-datagram-size>
pub(crate) const INITIAL_MTU: u16 = 1200;
pub(crate) const MAX_UDP_PAYLOAD: u16 = 65527;
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Stream-count limits are bounded by 2^60 so that stream IDs stay within 62 bits
pub(crate) const MAX_STREAM_COUNT: u64 = 1 << 60;
