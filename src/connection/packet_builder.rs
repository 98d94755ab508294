use crate::{
    crypto,
    packet::{Header, PartialEncode, SpaceId},
};

/// In-progress assembly of one packet
///
/// Holds the buffer positions needed to seal the packet once its frames are written:
/// where the header ends, where padding must reach, and how much room the AEAD tag
/// needs. The builder has exclusive use of the tail of the transmit buffer from
/// construction until [`finish`](Self::finish).
pub(super) struct PacketBuilder {
    /// Offset of the first byte of this packet's datagram
    pub(super) datagram_start: usize,
    pub(super) space: SpaceId,
    pub(super) partial_encode: PartialEncode,
    pub(super) exact_number: u64,
    pub(super) short_header: bool,
    /// Absolute buffer position frames must reach before sealing, for header
    /// protection sampling and any datagram padding requirement
    pub(super) min_size: usize,
    /// Absolute buffer position frames may not extend past, leaving room for the tag
    pub(super) max_size: usize,
    pub(super) tag_len: usize,
    /// Whether an ack-eliciting frame has been written
    pub(super) ack_eliciting: bool,
}

impl PacketBuilder {
    /// Encode `header` into `buf` and prepare to build the packet's payload
    ///
    /// `buf_capacity` is the absolute position the finished packet (tag included)
    /// may not extend past.
    pub(super) fn new(
        buf: &mut Vec<u8>,
        header: &Header,
        exact_number: u64,
        datagram_start: usize,
        buf_capacity: usize,
        tag_len: usize,
        sample_size: usize,
    ) -> Self {
        let space = header.space();
        let short_header = header.is_short();
        let partial_encode = header.encode(buf);
        let pn_len = partial_encode
            .pn
            .map(|(_, len)| len)
            .expect("packets under construction carry a packet number");
        // The header protection sample starts four bytes past the packet number
        // start; everything up to the end of the sample must exist
        let min_size =
            (buf.len() + 4 + sample_size).saturating_sub(pn_len + tag_len).max(buf.len());
        Self {
            datagram_start,
            space,
            partial_encode,
            exact_number,
            short_header,
            min_size,
            max_size: buf_capacity - tag_len,
            tag_len,
            ack_eliciting: false,
        }
    }

    /// Room remaining for frames
    pub(super) fn frame_space_remaining(&self, buf: &Vec<u8>) -> usize {
        self.max_size.saturating_sub(buf.len())
    }

    /// Require the finished datagram to be at least `min_datagram` bytes
    ///
    /// Used to pad Initial packets (and anything coalesced ahead of them) to the
    /// anti-amplification floor.
    pub(super) fn pad_to_datagram_min(&mut self, min_datagram: usize) {
        self.min_size = self
            .min_size
            .max((self.datagram_start + min_datagram).saturating_sub(self.tag_len));
    }

    /// Pad, seal, and protect the packet; returns its total encoded size
    pub(super) fn finish(
        self,
        buf: &mut Vec<u8>,
        packet_key: &dyn crypto::PacketKey,
        header_key: &dyn crypto::HeaderKey,
    ) -> usize {
        if buf.len() < self.min_size {
            // PADDING frames are encoded as zero bytes
            buf.resize(self.min_size, 0);
        }
        buf.resize(buf.len() + self.tag_len, 0);
        let packet_start = self.partial_encode.start;
        let header_len = self.partial_encode.header_len;
        packet_key.encrypt(self.exact_number, &mut buf[packet_start..], header_len);
        self.partial_encode.finish(buf, header_key);
        buf.len() - packet_start
    }
}
