use std::{fmt, ops};

use bytes::{Buf, BufMut};
use rand::RngCore;

use crate::coding::{self, BufExt, BufMutExt};
use crate::MAX_CID_SIZE;

/// Protocol-level identifier for a connection
///
/// Mainly useful for identifying this connection's packets on the wire. Opaque short
/// byte string; an endpoint holds a set of valid local CIDs and exactly one current
/// destination CID for egress at any moment.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId {
    /// length of CID
    len: u8,
    /// CID in byte array
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Generate a random cid of `len` bytes
    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Decode from long header format
    pub(crate) fn decode_long<B: Buf>(buf: &mut B) -> Result<Self, coding::UnexpectedEnd> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        let cid = Self::from_buf(buf, len);
        Ok(cid)
    }

    /// Encode in long header format
    pub(crate) fn encode_long<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.len() as u8);
        buf.put_slice(self);
    }

    pub(crate) fn from_buf(buf: &mut impl Buf, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut res[..len]);
        res
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl ops::DerefMut for ConnectionId {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A stateless reset token
///
/// Used when a peer that has lost connection state wishes to tell us to go away. Each
/// issued connection ID carries one; a datagram whose trailing sixteen bytes match a
/// known token terminates the connection immediately.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct ResetToken([u8; crate::RESET_TOKEN_SIZE]);

impl ResetToken {
    pub(crate) fn new(bytes: [u8; crate::RESET_TOKEN_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<[u8; crate::RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; crate::RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// Explicit congestion notification codepoint
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EcnCodepoint {
    /// The ECT(0) codepoint, indicating that an endpoint is ECN-capable
    Ect0 = 0b10,
    /// The ECT(1) codepoint, indicating that an endpoint is ECN-capable
    Ect1 = 0b01,
    /// The CE codepoint, signalling that congestion was experienced
    Ce = 0b11,
}

impl EcnCodepoint {
    /// Extract the codepoint from the low two bits of an IP TOS/traffic-class field
    pub fn from_bits(x: u8) -> Option<Self> {
        use EcnCodepoint::*;
        Some(match x & 0b11 {
            0b10 => Ect0,
            0b01 => Ect1,
            0b11 => Ce,
            _ => return None,
        })
    }

    /// Whether this codepoint is CE, the congestion signal
    pub fn is_ce(self) -> bool {
        matches!(self, Self::Ce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_roundtrip() {
        let cid = ConnectionId::new(&[0xde, 0xad, 0xbe, 0xef]);
        let mut buf = Vec::new();
        cid.encode_long(&mut buf);
        let mut r = std::io::Cursor::new(&buf);
        assert_eq!(ConnectionId::decode_long(&mut r).unwrap(), cid);
    }

    #[test]
    fn ecn_bits() {
        assert_eq!(EcnCodepoint::from_bits(0b00), None);
        assert_eq!(EcnCodepoint::from_bits(0b01), Some(EcnCodepoint::Ect1));
        assert_eq!(EcnCodepoint::from_bits(0b10), Some(EcnCodepoint::Ect0));
        assert_eq!(EcnCodepoint::from_bits(0b11), Some(EcnCodepoint::Ce));
        assert!(EcnCodepoint::Ce.is_ce());
    }
}
