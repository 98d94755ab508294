//! Traits for the cryptographic collaborators of the transport
//!
//! The connection engine is abstract over both the handshake protocol and the packet
//! protection primitives. [`Session`] models the handshake object: fed incoming
//! crypto bytes, it emits outgoing crypto bytes and, as the handshake advances,
//! traffic keys. [`PacketKey`] and [`HeaderKey`] model AEAD payload protection and
//! header-protection masking for one direction at one encryption level.
//!
//! A *ring*-backed implementation of the key types lives in [`self::ring`]; handshake
//! implementations build [`Keys`] from TLS traffic secrets with its helpers.

use bytes::BytesMut;

use crate::{
    shared::ConnectionId,
    transport_error::TransportError,
    transport_parameters::TransportParameters,
    Side,
};

/// Cryptography interface based on *ring*
#[cfg(feature = "ring")]
pub mod ring;

/// A cryptographic session, commonly the TLS 1.3 handshake
///
/// The transport pumps this object from CRYPTO frames: bytes received at each
/// encryption level are fed to [`read_handshake`](Self::read_handshake), and outgoing
/// bytes drained with [`write_handshake`](Self::write_handshake) are written to the
/// corresponding crypto stream. Traffic keys surface as [`KeyChange`]s.
pub trait Session: Send {
    /// Returns `true` until the handshake completes
    fn is_handshaking(&self) -> bool;

    /// Accept bytes from the peer's crypto stream at the current level
    ///
    /// Returns `true` if the handshake has progressed to the point where the peer's
    /// transport parameters are available.
    fn read_handshake(&mut self, buf: &[u8]) -> Result<bool, TransportError>;

    /// The peer's QUIC transport parameters, once the relevant flight has arrived
    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError>;

    /// Drain outgoing handshake bytes into `buf`
    ///
    /// When the handshake advances to the next encryption level, the new keys are
    /// returned; the bytes written so far belong to the level before the change.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<KeyChange>;

    /// Compute the packet keys for the next key phase
    ///
    /// Invoked on key updates, in either direction. Returns `None` until the 1-RTT
    /// secrets exist.
    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>>;

    /// Early (0-RTT) packet protection, when resumption state allows it
    fn early_crypto(&self) -> Option<(Box<dyn HeaderKey>, Box<dyn PacketKey>)>;

    /// Whether the server accepted this session's 0-RTT data
    fn early_data_accepted(&self) -> Option<bool>;
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Key for encrypting data
    pub local: T,
    /// Key for decrypting data
    pub remote: T,
}

/// A complete set of keys for one encryption level
pub struct Keys {
    /// Header protection keys
    pub header: KeyPair<Box<dyn HeaderKey>>,
    /// Packet protection keys
    pub packet: KeyPair<Box<dyn PacketKey>>,
}

/// New keys surfaced by the handshake
pub enum KeyChange {
    /// Keys for the handshake space
    Handshake {
        /// The keys
        keys: Keys,
    },
    /// Keys for the application data space, plus the first key-update material
    OneRtt {
        /// Keys for the application data space
        keys: Keys,
        /// The packet keys of key phase one, retained for the first update
        next: KeyPair<Box<dyn PacketKey>>,
    },
}

/// Keys used to protect packet payloads
pub trait PacketKey: Send + Sync {
    /// Encrypt the packet payload, in place, with the given packet number
    ///
    /// `buf` contains the unprotected header (the associated data) in its first
    /// `header_len` bytes, the plaintext payload after it, and `tag_len` spare bytes
    /// at the end for the authentication tag.
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize);
    /// Decrypt the packet payload with the given packet number
    ///
    /// On success `payload` holds the plaintext, with the tag removed.
    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets on encryption
    fn tag_len(&self) -> usize;
    /// Maximum number of packets that may be encrypted with this key
    fn confidentiality_limit(&self) -> u64;
    /// Maximum number of failed decryptions tolerable for this key
    fn integrity_limit(&self) -> u64;
}

/// Keys used to protect packet headers
pub trait HeaderKey: Send + Sync {
    /// Remove header protection, given the offset of the packet number field
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Apply header protection, given the offset of the packet number field
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// The sample size used for this key's algorithm
    fn sample_size(&self) -> usize;
}

/// A key for signing with HMAC-based algorithms
pub trait HmacKey: Send + Sync {
    /// Compute a signature of `data`, writing it to `out`
    fn sign(&self, data: &[u8], out: &mut [u8]);
    /// Length of the signatures produced
    fn signature_len(&self) -> usize;
    /// Verify a signature over `data`
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError>;
}

/// Generic crypto failure, deliberately free of detail
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CryptoError;

/// Derive the packet protection keys for the Initial space
///
/// Both sides derive these from the client's first destination CID; they provide no
/// confidentiality against an on-path observer, only protection against accidental
/// corruption and off-path spoofing.
pub fn initial_keys(version: u32, dst_cid: &ConnectionId, side: Side) -> Keys {
    #[cfg(feature = "ring")]
    {
        ring::initial_keys(version, dst_cid, side)
    }
    #[cfg(not(feature = "ring"))]
    {
        let _ = (version, dst_cid, side);
        unimplemented!("no crypto backend enabled")
    }
}
