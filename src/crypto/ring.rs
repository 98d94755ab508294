use bytes::BytesMut;
use ring::{aead, hkdf, hmac};

use crate::{
    crypto::{self, CryptoError, HeaderKey as _, KeyPair, Keys},
    packet::LONG_HEADER_FORM,
    shared::ConnectionId,
    Side,
};

/// Retry and Initial salts are version-specific; new versions append here
const INITIAL_SALTS: &[(u32, [u8; 20])] = &[(
    0x0000_0001,
    [
        0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8,
        0x0c, 0xad, 0xcc, 0xbb, 0x7f, 0x0a,
    ],
)];

fn initial_salt(version: u32) -> &'static [u8; 20] {
    INITIAL_SALTS
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, salt)| salt)
        .expect("unsupported version")
}

/// Derive Initial-space keys from the client's first destination CID
pub fn initial_keys(version: u32, dst_cid: &ConnectionId, side: Side) -> Keys {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, initial_salt(version));
    let initial_secret = salt.extract(dst_cid);

    let mut client_secret = [0u8; 32];
    hkdf_expand_label(&initial_secret, b"client in", &mut client_secret);
    let mut server_secret = [0u8; 32];
    hkdf_expand_label(&initial_secret, b"server in", &mut server_secret);

    let (local, remote) = match side {
        Side::Client => (&client_secret, &server_secret),
        Side::Server => (&server_secret, &client_secret),
    };
    keys_from_secrets(Suite::Aes128Gcm, local, remote)
}

/// Build a full key set from a pair of traffic secrets
///
/// Handshake implementations call this when the TLS stack surfaces new secrets;
/// `local` encrypts what we send, `remote` decrypts what the peer sends.
pub fn keys_from_secrets(suite: Suite, local: &[u8], remote: &[u8]) -> Keys {
    Keys {
        header: KeyPair {
            local: Box::new(header_key_from_secret(suite, local)),
            remote: Box::new(header_key_from_secret(suite, remote)),
        },
        packet: KeyPair {
            local: Box::new(packet_key_from_secret(suite, local)),
            remote: Box::new(packet_key_from_secret(suite, remote)),
        },
    }
}

/// Packet keys only, as needed for key updates
pub fn packet_keys_from_secrets(
    suite: Suite,
    local: &[u8],
    remote: &[u8],
) -> KeyPair<Box<dyn crypto::PacketKey>> {
    KeyPair {
        local: Box::new(packet_key_from_secret(suite, local)),
        remote: Box::new(packet_key_from_secret(suite, remote)),
    }
}

/// Derive the next-generation traffic secret for a key update
pub fn update_secret(secret: &[u8]) -> Vec<u8> {
    let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
    let mut next = vec![0u8; secret.len()];
    hkdf_expand_label(&prk, b"quic ku", &mut next);
    next
}

/// AEAD suites usable for packet protection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Suite {
    /// AES-128-GCM, the mandatory-to-implement suite and the one Initial keys use
    Aes128Gcm,
    /// AES-256-GCM
    Aes256Gcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl Suite {
    fn aead(self) -> &'static aead::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::AES_128_GCM,
            Self::Aes256Gcm => &aead::AES_256_GCM,
            Self::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn header_protection(self) -> &'static aead::quic::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::quic::AES_128,
            Self::Aes256Gcm => &aead::quic::AES_256,
            Self::ChaCha20Poly1305 => &aead::quic::CHACHA20,
        }
    }

    fn key_len(self) -> usize {
        self.aead().key_len()
    }

    fn hp_key_len(self) -> usize {
        self.header_protection().key_len()
    }

    /// AEAD usage limits from RFC 9001 §6.6
    fn confidentiality_limit(self) -> u64 {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm => 1 << 23,
            Self::ChaCha20Poly1305 => u64::MAX,
        }
    }

    fn integrity_limit(self) -> u64 {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm => 1 << 52,
            Self::ChaCha20Poly1305 => 1 << 36,
        }
    }
}

fn packet_key_from_secret(suite: Suite, secret: &[u8]) -> PacketKey {
    let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
    let mut key = [0u8; 32];
    hkdf_expand_label(&prk, b"quic key", &mut key[..suite.key_len()]);
    let mut iv = [0u8; 12];
    hkdf_expand_label(&prk, b"quic iv", &mut iv);
    PacketKey {
        key: aead::LessSafeKey::new(
            aead::UnboundKey::new(suite.aead(), &key[..suite.key_len()]).unwrap(),
        ),
        iv: Iv(iv),
        suite,
    }
}

fn header_key_from_secret(suite: Suite, secret: &[u8]) -> HeaderKey {
    let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
    let mut hp = [0u8; 32];
    hkdf_expand_label(&prk, b"quic hp", &mut hp[..suite.hp_key_len()]);
    HeaderKey(
        aead::quic::HeaderProtectionKey::new(
            suite.header_protection(),
            &hp[..suite.hp_key_len()],
        )
        .unwrap(),
    )
}

/// TLS 1.3 HKDF-Expand-Label with an empty context
fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let context_len = [0u8];
    let info = [&out_len[..], &label_len, PREFIX, label, &context_len];
    prk.expand(&info, OkmLen(out.len()))
        .unwrap()
        .fill(out)
        .unwrap();
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// AEAD IV; XORed with the packet number to form each nonce
struct Iv([u8; 12]);

impl Iv {
    fn nonce_for(&self, packet: u64) -> aead::Nonce {
        let mut nonce = self.0;
        for (b, pn_byte) in nonce[4..].iter_mut().zip(packet.to_be_bytes()) {
            *b ^= pn_byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

/// Packet protection for one direction at one level
pub struct PacketKey {
    key: aead::LessSafeKey,
    iv: Iv,
    suite: Suite,
}

impl crypto::PacketKey for PacketKey {
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) {
        let (header, payload_and_tag) = buf.split_at_mut(header_len);
        let plaintext_len = payload_and_tag.len() - self.tag_len();
        let (payload, tag_storage) = payload_and_tag.split_at_mut(plaintext_len);
        let tag = self
            .key
            .seal_in_place_separate_tag(
                self.iv.nonce_for(packet),
                aead::Aad::from(&*header),
                payload,
            )
            .expect("AEAD seal failed");
        tag_storage.copy_from_slice(tag.as_ref());
    }

    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        let plain_len = {
            let plain = self
                .key
                .open_in_place(
                    self.iv.nonce_for(packet),
                    aead::Aad::from(header),
                    payload.as_mut(),
                )
                .map_err(|_| CryptoError)?;
            plain.len()
        };
        payload.truncate(plain_len);
        Ok(())
    }

    fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }

    fn confidentiality_limit(&self) -> u64 {
        self.suite.confidentiality_limit()
    }

    fn integrity_limit(&self) -> u64 {
        self.suite.integrity_limit()
    }
}

/// Header protection for one direction at one level
pub struct HeaderKey(aead::quic::HeaderProtectionKey);

impl HeaderKey {
    /// Mask the first byte's protected bits and the packet number field
    ///
    /// `masked` selects apply vs. remove: the only difference is whether the packet
    /// number length is read before or after the first byte is unmasked.
    fn xor_in_place(&self, pn_offset: usize, packet: &mut [u8], masked: bool) {
        let sample_offset = pn_offset + 4;
        let mask = self
            .0
            .new_mask(&packet[sample_offset..sample_offset + self.sample_size()])
            .expect("sample size mismatch");
        // The low 4 bits of a long header's first byte are protected, 5 of a short's
        let bits = if packet[0] & LONG_HEADER_FORM != 0 {
            0x0f
        } else {
            0x1f
        };
        let first = &mut packet[0];
        if masked {
            *first ^= mask[0] & bits;
        }
        let pn_len = (packet[0] & 0x03) as usize + 1;
        if !masked {
            packet[0] ^= mask[0] & bits;
        }
        for (pn_byte, mask_byte) in packet[pn_offset..pn_offset + pn_len]
            .iter_mut()
            .zip(&mask[1..])
        {
            *pn_byte ^= mask_byte;
        }
    }
}

impl crypto::HeaderKey for HeaderKey {
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        self.xor_in_place(pn_offset, packet, true);
    }

    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        self.xor_in_place(pn_offset, packet, false);
    }

    fn sample_size(&self) -> usize {
        self.0.algorithm().sample_len()
    }
}

impl crypto::HmacKey for hmac::Key {
    fn sign(&self, data: &[u8], out: &mut [u8]) {
        out.copy_from_slice(hmac::sign(self, data).as_ref());
    }

    fn signature_len(&self) -> usize {
        32
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        hmac::verify(self, data, signature).map_err(|_| CryptoError)
    }
}

/// Retry integrity key and nonce for QUIC v1, RFC 9001 §5.8
const RETRY_INTEGRITY_KEY_V1: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_INTEGRITY_NONCE_V1: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// Compute the integrity tag appended to a Retry packet
pub fn retry_tag(version: u32, orig_dst_cid: &ConnectionId, packet: &[u8]) -> [u8; 16] {
    // Per-version constants, like the Initial salts
    let (key, nonce) = match version {
        0x0000_0001 => (RETRY_INTEGRITY_KEY_V1, RETRY_INTEGRITY_NONCE_V1),
        _ => panic!("unsupported version"),
    };
    let mut pseudo_packet = Vec::with_capacity(packet.len() + orig_dst_cid.len() + 1);
    pseudo_packet.push(orig_dst_cid.len() as u8);
    pseudo_packet.extend_from_slice(orig_dst_cid);
    pseudo_packet.extend_from_slice(packet);

    let key = aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &key).unwrap());
    let tag = key
        .seal_in_place_separate_tag(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(pseudo_packet),
            &mut [],
        )
        .unwrap();
    let mut result = [0; 16];
    result.copy_from_slice(tag.as_ref());
    result
}

/// Check the integrity tag trailing a received Retry packet
///
/// `header` and `payload` together form the Retry packet; its final sixteen bytes are
/// the tag under test.
pub fn is_valid_retry(
    version: u32,
    orig_dst_cid: &ConnectionId,
    header: &[u8],
    payload: &[u8],
) -> bool {
    let tag_start = match payload.len().checked_sub(16) {
        Some(x) => x,
        None => return false,
    };
    let mut packet = Vec::with_capacity(header.len() + tag_start);
    packet.extend_from_slice(header);
    packet.extend_from_slice(&payload[..tag_start]);
    let expected = retry_tag(version, orig_dst_cid, &packet);
    ring::constant_time::verify_slices_are_equal(&expected, &payload[tag_start..]).is_ok()
}

/// Derive a stateless reset token from a static key and a connection ID
pub fn reset_token(key: &hmac::Key, cid: &ConnectionId) -> [u8; crate::RESET_TOKEN_SIZE] {
    let signature = hmac::sign(key, cid);
    let mut result = [0; crate::RESET_TOKEN_SIZE];
    result.copy_from_slice(&signature.as_ref()[..crate::RESET_TOKEN_SIZE]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{HeaderKey as _, PacketKey as _};
    use hex_literal::hex;

    #[test]
    fn initial_secrets_rfc9001() {
        // RFC 9001 appendix A: client Initial protection for CID 0x8394c8f03e515708
        let dst_cid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let keys = initial_keys(0x0000_0001, &dst_cid, Side::Client);
        assert_eq!(keys.packet.local.tag_len(), 16);

        // The appendix's sample short header {0x42, pn=0x654321(3 bytes)} protected
        // with the client's header key yields a deterministic mask; verify the
        // involution property rather than pinning ciphertext.
        let mut packet = Vec::from(&hex!("42000000000000000001654321")[..]);
        packet.extend_from_slice(&[0u8; 20]);
        let original = packet.clone();
        let pn_offset = 10;
        keys.header.local.encrypt(pn_offset, &mut packet);
        assert_ne!(packet, original);
        keys.header.local.decrypt(pn_offset, &mut packet);
        assert_eq!(packet, original);
    }

    #[test]
    fn seal_open_roundtrip() {
        let dst_cid = ConnectionId::new(&hex!("c0ffee"));
        let client = initial_keys(0x0000_0001, &dst_cid, Side::Client);
        let server = initial_keys(0x0000_0001, &dst_cid, Side::Server);

        let header = b"fake header".to_vec();
        let payload = b"a plaintext payload".to_vec();
        let mut buf = header.clone();
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&vec![0; client.packet.local.tag_len()]);
        client.packet.local.encrypt(7, &mut buf, header.len());

        let mut recovered = BytesMut::from(&buf[header.len()..]);
        server
            .packet
            .remote
            .decrypt(7, &header, &mut recovered)
            .unwrap();
        assert_eq!(&recovered[..], &payload[..]);

        // Wrong packet number must fail
        let mut copy = BytesMut::from(&buf[header.len()..]);
        assert!(server.packet.remote.decrypt(8, &header, &mut copy).is_err());
    }

    #[test]
    fn key_update_chain_diverges() {
        let secret = [0x17u8; 32];
        let next = update_secret(&secret);
        let next_next = update_secret(&next);
        assert_ne!(&next[..], &secret[..]);
        assert_ne!(next, next_next);
        assert_eq!(next.len(), 32);
    }

    #[test]
    fn retry_tag_rfc9001() {
        // RFC 9001 appendix A.4 sample Retry packet
        let orig_dst_cid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let packet = hex!("ff000000010008f067a5502a4262b574 6f6b656e");
        let tag = retry_tag(0x0000_0001, &orig_dst_cid, &packet);
        assert_eq!(tag, hex!("04a265ba2eff4d829058fb3f0f2496ba"));
    }
}
