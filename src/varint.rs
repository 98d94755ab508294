use std::{convert::TryInto, fmt};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, Codec, UnexpectedEnd};

/// An integer less than 2^62
///
/// Values of this type are suitable for encoding as QUIC variable-length integers:
/// the two most significant bits of the first byte select a total width of 1, 2, 4,
/// or 8 bytes, and the remaining bits carry the value big-endian.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    /// The largest representable value
    pub const MAX: Self = Self((1 << 62) - 1);
    /// The largest encoded value length
    pub const MAX_SIZE: usize = 8;

    /// Construct a `VarInt` infallibly
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Succeeds iff `x` < 2^62
    pub fn from_u64(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        if x < 2u64.pow(62) {
            Ok(Self(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    /// Create a VarInt without ensuring it's in range
    ///
    /// # Safety
    ///
    /// `x` must be less than 2^62.
    pub const unsafe fn from_u64_unchecked(x: u64) -> Self {
        Self(x)
    }

    /// Extract the integer value
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Compute the number of bytes needed to encode this value
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < 2u64.pow(6) {
            1
        } else if x < 2u64.pow(14) {
            2
        } else if x < 2u64.pow(30) {
            4
        } else if x < 2u64.pow(62) {
            8
        } else {
            unreachable!()
        }
    }

    /// Saturating integer addition, staying within the representable range
    pub fn saturating_add(self, rhs: impl Into<Self>) -> Self {
        let rhs = rhs.into();
        Self(self.0.saturating_add(rhs.0)).min(Self::MAX)
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> Self {
        x.0
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl TryInto<VarInt> for u64 {
    type Error = VarIntBoundsExceeded;
    fn try_into(self) -> Result<VarInt, VarIntBoundsExceeded> {
        VarInt::from_u64(self)
    }
}

impl TryInto<usize> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_into(self) -> Result<usize, VarIntBoundsExceeded> {
        self.0.try_into().map_err(|_| VarIntBoundsExceeded)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when constructing a `VarInt` from a value >= 2^62
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

impl Codec for VarInt {
    fn decode<B: Buf>(r: &mut B) -> coding::Result<Self> {
        if !r.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let mut buf = [0; 8];
        buf[0] = r.chunk()[0];
        r.advance(1);
        let tag = buf[0] >> 6;
        buf[0] &= 0b0011_1111;
        let x = match tag {
            0b00 => u64::from(buf[0]),
            0b01 => {
                if r.remaining() < 1 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..2]);
                u64::from(u16::from_be_bytes(buf[..2].try_into().unwrap()))
            }
            0b10 => {
                if r.remaining() < 3 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..4]);
                u64::from(u32::from_be_bytes(buf[..4].try_into().unwrap()))
            }
            0b11 => {
                if r.remaining() < 7 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..8]);
                u64::from_be_bytes(buf)
            }
            _ => unreachable!(),
        };
        Ok(Self(x))
    }

    fn encode<B: BufMut>(&self, w: &mut B) {
        let x = self.0;
        if x < 2u64.pow(6) {
            w.put_u8(x as u8);
        } else if x < 2u64.pow(14) {
            w.put_u16(0b01 << 14 | x as u16);
        } else if x < 2u64.pow(30) {
            w.put_u32(0b10 << 30 | x as u32);
        } else if x < 2u64.pow(62) {
            w.put_u64(0b11 << 62 | x);
        } else {
            unreachable!("malformed VarInt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn roundtrip(x: u64) {
        let mut buf = Vec::new();
        VarInt::from_u64(x).unwrap().encode(&mut buf);
        let mut r = io::Cursor::new(&buf);
        assert_eq!(VarInt::decode(&mut r).unwrap().into_inner(), x);
        assert_eq!(buf.len(), VarInt::from_u64(x).unwrap().size());
    }

    #[test]
    fn sizes() {
        assert_eq!(VarInt::from_u32(0).size(), 1);
        assert_eq!(VarInt::from_u32(63).size(), 1);
        assert_eq!(VarInt::from_u32(64).size(), 2);
        assert_eq!(VarInt::from_u32(16383).size(), 2);
        assert_eq!(VarInt::from_u32(16384).size(), 4);
        assert_eq!(VarInt::from_u32(1_073_741_823).size(), 4);
        assert_eq!(VarInt::from_u64(1_073_741_824).unwrap().size(), 8);
        assert_eq!(VarInt::MAX.size(), 8);
    }

    #[test]
    fn bounds() {
        assert_eq!(VarInt::from_u64(1 << 62), Err(VarIntBoundsExceeded));
        assert!(VarInt::from_u64((1 << 62) - 1).is_ok());
    }

    #[test]
    fn roundtrips() {
        for x in [
            0,
            1,
            63,
            64,
            16383,
            16384,
            1_073_741_823,
            1_073_741_824,
            (1 << 62) - 1,
        ] {
            roundtrip(x);
        }
    }

    #[test]
    fn truncated() {
        // Two-byte encoding cut to one byte
        let mut r = io::Cursor::new(&[0b0100_0001][..]);
        assert_eq!(VarInt::decode(&mut r), Err(UnexpectedEnd));
        // Eight-byte encoding cut to seven
        let mut r = io::Cursor::new(&[0xc0, 0, 0, 0, 0, 0, 0][..]);
        assert_eq!(VarInt::decode(&mut r), Err(UnexpectedEnd));
    }

    #[test]
    fn wire_examples() {
        // RFC 9000 appendix A.1 sample values
        let mut r = io::Cursor::new(&hex_literal::hex!("c2197c5eff14e88c")[..]);
        assert_eq!(VarInt::decode(&mut r).unwrap().0, 151_288_809_941_952_652);
        let mut r = io::Cursor::new(&hex_literal::hex!("9d7f3e7d")[..]);
        assert_eq!(VarInt::decode(&mut r).unwrap().0, 494_878_333);
        let mut r = io::Cursor::new(&hex_literal::hex!("7bbd")[..]);
        assert_eq!(VarInt::decode(&mut r).unwrap().0, 15_293);
        let mut r = io::Cursor::new(&hex_literal::hex!("25")[..]);
        assert_eq!(VarInt::decode(&mut r).unwrap().0, 37);
    }
}
