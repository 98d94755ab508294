use std::{cmp::Ordering, io, ops::Range};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    crypto,
    shared::ConnectionId,
};

/// Decodes a QUIC packet's invariant header
///
/// Due to packet number encryption, it is impossible to fully decode a header
/// (which includes a variable-length packet number) without crypto context.
/// The crypto context is usually part of the `Connection`, or can be derived
/// from the destination CID for Initial packets.
///
/// To cope with this, we decode the invariant header (which should be stable
/// across QUIC versions), which gives us the destination CID and allows us
/// to inspect the version and packet type (which depends on the version).
/// This information allows us to fully decode and decrypt the packet.
#[derive(Debug)]
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    /// Begin decoding a datagram
    ///
    /// On success, the second tuple element contains the remainder of a coalesced
    /// datagram, if any.
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    /// The undecoded bytes of this packet
    pub(crate) fn data(&self) -> &[u8] {
        self.buf.get_ref()
    }

    pub(crate) fn has_long_header(&self) -> bool {
        !matches!(self.plain_header, PlainHeader::Short { .. })
    }

    pub(crate) fn is_initial(&self) -> bool {
        self.space() == Some(SpaceId::Initial)
    }

    pub(crate) fn space(&self) -> Option<SpaceId> {
        use PlainHeader::*;
        match self.plain_header {
            Initial { .. } => Some(SpaceId::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(SpaceId::Data),
            Short { .. } => Some(SpaceId::Data),
            _ => None,
        }
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        match self.plain_header {
            PlainHeader::Long { ty, .. } => ty == LongType::ZeroRtt,
            _ => false,
        }
    }

    pub(crate) fn dst_cid(&self) -> ConnectionId {
        self.plain_header.dst_cid()
    }

    pub(crate) fn version(&self) -> Option<u32> {
        use PlainHeader::*;
        match self.plain_header {
            Initial { version, .. } | Long { version, .. } | Retry { version, .. } => {
                Some(version)
            }
            _ => None,
        }
    }

    /// Length of the QUIC packet being decoded
    pub(crate) fn len(&self) -> usize {
        self.buf.get_ref().len()
    }

    /// Remove header protection and produce a fully decoded packet
    pub(crate) fn finish(
        self,
        header_key: Option<&dyn crypto::HeaderKey>,
    ) -> Result<Packet, PacketDecodeError> {
        use PlainHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        if let VersionNegotiate {
            dst_cid, src_cid, ..
        } = plain_header
        {
            let mut supported = Vec::new();
            while buf.has_remaining() {
                if buf.remaining() < 4 {
                    return Err(PacketDecodeError::InvalidHeader(
                        "malformed version negotiation",
                    ));
                }
                supported.push(buf.get_u32());
            }
            return Ok(Packet {
                header: Header::VersionNegotiate {
                    dst_cid,
                    src_cid,
                    supported,
                },
                header_data: Bytes::new(),
                payload: BytesMut::new(),
            });
        }

        if let Retry {
            dst_cid,
            src_cid,
            version,
        } = plain_header
        {
            let mut bytes = buf.into_inner();
            let header_len = bytes.len();
            let header_data = bytes.split_to(header_len).freeze();
            return Ok(Packet {
                header: Header::Retry {
                    dst_cid,
                    src_cid,
                    version,
                },
                header_data,
                payload: bytes,
            });
        }

        let key = header_key.ok_or(PacketDecodeError::MissingKeys)?;
        let number = Self::decrypt_header(&mut buf, key)?;
        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        let header_data = bytes.split_to(header_len).freeze();

        let header = match plain_header {
            Initial {
                dst_cid,
                src_cid,
                token_pos,
                version,
                ..
            } => Header::Initial {
                dst_cid,
                src_cid,
                token: header_data.slice(token_pos.start..token_pos.end),
                number,
                version,
            },
            Long {
                ty,
                dst_cid,
                src_cid,
                version,
                ..
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number,
                version,
            },
            Short { spin, dst_cid, .. } => Header::Short {
                spin,
                key_phase: header_data[0] & KEY_PHASE_BIT != 0,
                dst_cid,
                number,
            },
            _ => unreachable!(),
        };
        Ok(Packet {
            header,
            header_data,
            payload: bytes,
        })
    }

    fn decrypt_header(
        buf: &mut io::Cursor<BytesMut>,
        header_key: &dyn crypto::HeaderKey,
    ) -> Result<PacketNumber, PacketDecodeError> {
        let packet_length = buf.get_ref().len();
        let pn_offset = buf.position() as usize;
        if packet_length < pn_offset + 4 + header_key.sample_size() {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to extract header protection sample",
            ));
        }

        header_key.decrypt(pn_offset, buf.get_mut());

        let len = PacketNumber::decode_len(buf.get_ref()[0]);
        PacketNumber::decode(len, buf)
    }
}

pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
        version: u32,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
        version: u32,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        version: u32,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        supported: Vec<u32>,
    },
}

impl Header {
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use Header::*;
        let start = w.len();
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
                version,
            } => {
                w.put_u8(0b1100_0000 | number.tag());
                w.put_u32(version);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                // Two-byte length placeholder, patched when the payload is sealed
                w.put_u16(0b01 << 14);
                let pn_pos = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((pn_pos, number.len())),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
                version,
            } => {
                w.put_u8(0b1100_0000 | (ty as u8) << 4 | number.tag());
                w.put_u32(version);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.put_u16(0b01 << 14);
                let pn_pos = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((pn_pos, number.len())),
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                version,
            } => {
                w.put_u8(0b1100_0000 | (LongHeaderType::RETRY << 4));
                w.put_u32(version);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
            Short {
                spin,
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.put_u8(
                    FIXED_BIT
                        | if key_phase { KEY_PHASE_BIT } else { 0 }
                        | if spin { SPIN_BIT } else { 0 }
                        | number.tag(),
                );
                w.put_slice(dst_cid);
                let pn_pos = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((pn_pos, number.len())),
                }
            }
            VersionNegotiate {
                ref dst_cid,
                ref src_cid,
                ref supported,
            } => {
                w.put_u8(0b1000_0000);
                w.put_u32(0);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                for &version in supported {
                    w.put_u32(version);
                }
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
        }
    }

    pub(crate) fn space(&self) -> SpaceId {
        use Header::*;
        match *self {
            Initial { .. } => SpaceId::Initial,
            Long {
                ty: LongType::Handshake,
                ..
            } => SpaceId::Handshake,
            _ => SpaceId::Data,
        }
    }

    pub(crate) fn key_phase(&self) -> bool {
        match *self {
            Self::Short { key_phase, .. } => key_phase,
            _ => false,
        }
    }

    pub(crate) fn is_short(&self) -> bool {
        matches!(*self, Self::Short { .. })
    }

    pub(crate) fn is_1rtt(&self) -> bool {
        self.is_short()
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        matches!(
            *self,
            Self::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use Header::*;
        Some(match *self {
            Initial { number, .. } | Long { number, .. } | Short { number, .. } => number,
            _ => return None,
        })
    }
}

pub(crate) struct PartialEncode {
    pub(crate) start: usize,
    pub(crate) header_len: usize,
    // Packet number's position and length in the buffer
    pub(crate) pn: Option<(usize, usize)>,
}

impl PartialEncode {
    /// Patch the length field and apply header protection
    ///
    /// `buf` must contain the entire packet (header and sealed payload) beginning at
    /// `self.start`.
    pub(crate) fn finish(self, buf: &mut [u8], header_key: &dyn crypto::HeaderKey) {
        let Some((pn_pos, _)) = self.pn else {
            return;
        };
        let pn_pos = pn_pos - self.start;
        let buf = &mut buf[self.start..];
        if buf[0] & LONG_HEADER_FORM != 0 {
            // Patch the pre-reserved two-byte length to cover the packet number
            // and everything after it
            let len = buf.len() - pn_pos;
            debug_assert!(len < (1 << 14));
            buf[pn_pos - 2..pn_pos].copy_from_slice(&(0b01 << 14 | len as u16).to_be_bytes());
        }
        header_key.encrypt(pn_pos, buf);
    }
}

/// A packet number as it appears on the wire, truncated relative to the largest acked
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        // Keep twice the unacknowledged range representable so the receiver can
        // recover the full number from any packet it might still see.
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else if range < 1 << 32 {
            Self::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        use PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use PacketNumber::*;
        let pn = match len {
            1 => U8(r.get().map_err(|_| PacketDecodeError::truncated())?),
            2 => U16(r.get().map_err(|_| PacketDecodeError::truncated())?),
            3 => {
                if r.remaining() < 3 {
                    return Err(PacketDecodeError::truncated());
                }
                U24(r.get_uint(3) as u32)
            }
            4 => U32(r.get().map_err(|_| PacketDecodeError::truncated())?),
            _ => unreachable!(),
        };
        Ok(pn)
    }

    /// Recover the full 62-bit packet number against the largest successfully
    /// processed packet number in this space
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin and less
        // than or equal to expected + hwin
        //
        // This means we can't just strip the trailing bits from expected and add the
        // truncated because that might yield a value outside the window.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

#[derive(Debug)]
enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
        len: u64,
        version: u32,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
        version: u32,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        version: u32,
    },
    Short {
        spin: bool,
        dst_cid: ConnectionId,
    },
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn dst_cid(&self) -> ConnectionId {
        use PlainHeader::*;
        match self {
            Initial { dst_cid, .. }
            | Long { dst_cid, .. }
            | Retry { dst_cid, .. }
            | Short { dst_cid, .. }
            | VersionNegotiate { dst_cid, .. } => *dst_cid,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        use PlainHeader::*;
        match self {
            Initial { len, .. } | Long { len, .. } => Some(*len),
            _ => None,
        }
    }

    fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>().map_err(|_| PacketDecodeError::truncated())?;
        if first & LONG_HEADER_FORM == 0 {
            // Short header
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::truncated());
            }
            let dst_cid = ConnectionId::from_buf(buf, local_cid_len);
            return Ok(Self::Short {
                spin: first & SPIN_BIT != 0,
                dst_cid,
            });
        }

        let version = buf
            .get::<u32>()
            .map_err(|_| PacketDecodeError::truncated())?;
        let dst_cid = ConnectionId::decode_long(buf).map_err(|_| PacketDecodeError::truncated())?;
        let src_cid = ConnectionId::decode_long(buf).map_err(|_| PacketDecodeError::truncated())?;

        if version == 0 {
            return Ok(Self::VersionNegotiate { dst_cid, src_cid });
        }
        if first & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }

        match LongHeaderType::from_byte(first)? {
            LongHeaderType::Initial => {
                let token_len = buf
                    .get_var()
                    .map_err(|_| PacketDecodeError::truncated())?;
                let token_start = buf.position() as usize;
                if token_len > buf.remaining() as u64 {
                    return Err(PacketDecodeError::truncated());
                }
                buf.advance(token_len as usize);
                let len = buf
                    .get_var()
                    .map_err(|_| PacketDecodeError::truncated())?;
                Ok(Self::Initial {
                    dst_cid,
                    src_cid,
                    token_pos: token_start..token_start + token_len as usize,
                    len,
                    version,
                })
            }
            LongHeaderType::Retry => Ok(Self::Retry {
                dst_cid,
                src_cid,
                version,
            }),
            LongHeaderType::Standard(ty) => Ok(Self::Long {
                ty,
                dst_cid,
                src_cid,
                len: buf
                    .get_var()
                    .map_err(|_| PacketDecodeError::truncated())?,
                version,
            }),
        }
    }
}

/// Long packet types with uniform header structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LongType {
    Handshake = 0x2,
    ZeroRtt = 0x1,
}

enum LongHeaderType {
    Initial,
    Retry,
    Standard(LongType),
}

impl LongHeaderType {
    const RETRY: u8 = 0x3;

    fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use LongHeaderType::*;
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        Ok(match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => Standard(LongType::ZeroRtt),
            0x2 => Standard(LongType::Handshake),
            0x3 => Retry,
            _ => unreachable!(),
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum PacketDecodeError {
    #[error("unsupported version {version:x}")]
    UnsupportedVersion {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        version: u32,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    #[error("no keys available to remove header protection")]
    MissingKeys,
}

impl PacketDecodeError {
    fn truncated() -> Self {
        Self::InvalidHeader("packet too short")
    }
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::truncated()
    }
}

/// Identifier for a packet-number space
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    /// Unprotected packets carrying the start of the handshake
    Initial = 0,
    /// Packets protected with handshake keys
    Handshake = 1,
    /// Application data: 0-RTT and 1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().cloned()
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const SPIN_BIT: u8 = 0x20;
pub(crate) const SHORT_RESERVED_BITS: u8 = 0x18;
pub(crate) const LONG_RESERVED_BITS: u8 = 0x0c;
pub(crate) const KEY_PHASE_BIT: u8 = 0x04;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pn_encode_len() {
        // Small gaps use one byte
        assert_eq!(PacketNumber::new(10, 8), PacketNumber::U8(10));
        // Larger spans grow the encoding
        assert_eq!(PacketNumber::new(0x6b2d79, 0x6afa2f).len(), 3);
    }

    #[test]
    fn pn_expand_roundtrip() {
        for (prev, n) in [
            (0u64, 1u64),
            (254, 255),
            (255, 256),
            (1000, 1001),
            (65534, 65535),
            (0x6afa2f, 0x6b2d79),
            (1 << 30, (1 << 30) + 1),
        ] {
            let encoded = PacketNumber::new(n, prev);
            assert_eq!(encoded.expand(prev), n, "prev={prev} n={n}");
        }
    }

    #[test]
    fn pn_expand_rfc_sample() {
        // RFC 9000 appendix A.3: expected 0xa82f30ea, received 16-bit 0x9b32
        assert_eq!(
            PacketNumber::U16(0x9b32).expand(0xa82f30ea),
            0xa82f_9b32
        );
    }

    #[test]
    fn header_settings() {
        let h = Header::Short {
            spin: false,
            key_phase: true,
            dst_cid: ConnectionId::new(&[1; 8]),
            number: PacketNumber::U16(1),
        };
        assert!(h.is_short());
        assert!(h.key_phase());
        assert_eq!(h.space(), SpaceId::Data);
    }
}
