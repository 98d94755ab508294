use std::{collections::VecDeque, ops::Range};

use bytes::{Buf, Bytes};

use crate::range_set::RangeSet;

/// Buffer of outgoing retransmittable stream data
///
/// Holds every byte the application has queued that the peer has not yet
/// acknowledged, split across three logical sub-ranges that never overlap: bytes not
/// yet transmitted, bytes in flight (tracked per-packet by the outstanding-packet
/// records), and bytes declared lost awaiting retransmission.
#[derive(Default, Debug)]
pub(crate) struct SendBuffer {
    /// Data queued by the application but not yet acknowledged. May or may not have
    /// been sent.
    segments: VecDeque<Bytes>,
    /// Total size of `segments`
    len: usize,
    /// The first offset that hasn't been written by the application, i.e. the offset
    /// past the end of `segments`
    offset: u64,
    /// The first offset that hasn't been sent
    ///
    /// Always lies in `(offset - len)..=offset`
    unsent: u64,
    /// Acknowledged ranges which couldn't be discarded yet as they don't include the
    /// earliest outstanding offset
    acks: RangeSet,
    /// Previously transmitted ranges deemed lost
    lost: RangeSet,
}

impl SendBuffer {
    /// Construct an empty buffer at the initial offset
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append application data to the end of the stream
    pub(crate) fn write(&mut self, data: Bytes) {
        self.len += data.len();
        self.offset += data.len() as u64;
        self.segments.push_back(data);
    }

    /// Discard a range of acknowledged stream data
    pub(crate) fn ack(&mut self, mut range: Range<u64>) {
        // Clamp the range to data which is still tracked
        let base_offset = self.offset - self.len as u64;
        range.start = base_offset.max(range.start);
        range.end = base_offset.max(range.end);
        if range.is_empty() {
            return;
        }

        self.lost.remove(range.clone());
        self.acks.insert(range);

        // Drop the acknowledged prefix
        while self.acks.min() == Some(self.offset - self.len as u64) {
            let prefix = self.acks.pop_min().unwrap();
            let mut to_advance = (prefix.end - prefix.start) as usize;
            self.len -= to_advance;
            while to_advance > 0 {
                let front = self.segments.front_mut().expect("missing buffered data");
                if front.len() <= to_advance {
                    to_advance -= front.len();
                    self.segments.pop_front();
                } else {
                    front.advance(to_advance);
                    to_advance = 0;
                }
            }
        }
        if self.segments.len() * 4 < self.segments.capacity() {
            self.segments.shrink_to_fit();
        }
    }

    /// Queue a transmitted range for retransmission after loss
    pub(crate) fn mark_lost(&mut self, mut range: Range<u64>) {
        debug_assert!(range.end <= self.unsent, "unsent data can't be lost");
        // A late ack may already have covered part of the range
        let base_offset = self.offset - self.len as u64;
        range.start = range.start.max(base_offset);
        if range.is_empty() {
            return;
        }
        self.lost.insert(range.clone());
        self.lost.subtract(&self.acks);
    }

    /// Compute the next range to transmit and account for that transmission
    ///
    /// Lost data is retransmitted before new data is sent.
    pub(crate) fn poll_transmit(&mut self, max_len: u64) -> Range<u64> {
        if let Some(range) = self.lost.pop_min() {
            if range.end - range.start > max_len {
                // Send a prefix, keep the rest queued
                self.lost.insert(range.start + max_len..range.end);
                return range.start..range.start + max_len;
            }
            return range;
        }
        let end = self.offset.min(self.unsent.saturating_add(max_len));
        let result = self.unsent..end;
        self.unsent = end;
        result
    }

    /// Returns data associated with `offsets`, possibly a prefix
    ///
    /// If the data is stored across segment boundaries, a shorter slice than
    /// requested is returned; call again with an advanced start offset for the rest.
    pub(crate) fn get(&self, offsets: Range<u64>) -> &[u8] {
        let base_offset = self.offset - self.len as u64;
        let mut segment_offset = base_offset;
        for segment in &self.segments {
            if offsets.start >= segment_offset
                && offsets.start < segment_offset + segment.len() as u64
            {
                let start = (offsets.start - segment_offset) as usize;
                let end = (offsets.end - segment_offset) as usize;
                return &segment[start..end.min(segment.len())];
            }
            segment_offset += segment.len() as u64;
        }
        &[]
    }

    /// Abandon everything at or past `at`, keeping the reliable prefix
    ///
    /// Used when resetting a stream that has committed to delivering `at` bytes:
    /// unsent data past the boundary is dropped, queued retransmissions are trimmed,
    /// and in-flight data past the boundary will be ignored when acked or lost.
    pub(crate) fn truncate(&mut self, at: u64) {
        let base_offset = self.offset - self.len as u64;
        if self.offset > at {
            let keep = at.saturating_sub(base_offset) as usize;
            while self.len > keep {
                let excess = self.len - keep;
                let back = self.segments.back_mut().expect("missing buffered data");
                if back.len() <= excess {
                    self.len -= back.len();
                    self.segments.pop_back();
                } else {
                    back.truncate(back.len() - excess);
                    self.len -= excess;
                }
            }
            self.offset = at.max(base_offset);
            self.unsent = self.unsent.min(self.offset);
        }
        self.lost.remove(at..u64::MAX);
        self.acks.remove(at..u64::MAX);
    }

    /// First offset not yet written by the application
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// First offset not yet transmitted
    pub(crate) fn unsent_offset(&self) -> u64 {
        self.unsent
    }

    /// Bytes queued but never yet transmitted
    pub(crate) fn unsent(&self) -> u64 {
        self.offset - self.unsent
    }

    /// Whether data queued for retransmission exists
    pub(crate) fn has_lost(&self) -> bool {
        !self.lost.is_empty()
    }

    /// Whether a transmission would have something to carry
    pub(crate) fn has_sendable(&self) -> bool {
        self.unsent() != 0 || self.has_lost()
    }

    /// Whether every transmitted byte has been acknowledged
    pub(crate) fn is_fully_acked(&self) -> bool {
        self.len == 0
    }

    /// Total bytes the application has queued that remain unacknowledged
    pub(crate) fn unacked(&self) -> u64 {
        self.len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(buf: &mut SendBuffer, data: &[u8]) {
        buf.write(Bytes::copy_from_slice(data));
    }

    #[test]
    fn fragment_and_ack() {
        let mut buf = SendBuffer::new();
        write(&mut buf, b"hello world");
        assert_eq!(buf.poll_transmit(5), 0..5);
        assert_eq!(buf.poll_transmit(100), 5..11);
        assert_eq!(buf.get(0..5), b"hello");
        buf.ack(0..5);
        assert!(!buf.is_fully_acked());
        buf.ack(5..11);
        assert!(buf.is_fully_acked());
    }

    #[test]
    fn out_of_order_acks_deferred() {
        let mut buf = SendBuffer::new();
        write(&mut buf, b"abcdef");
        buf.poll_transmit(100);
        buf.ack(3..6);
        assert_eq!(buf.unacked(), 6);
        buf.ack(0..3);
        assert!(buf.is_fully_acked());
    }

    #[test]
    fn loss_retransmitted_first() {
        let mut buf = SendBuffer::new();
        write(&mut buf, b"0123456789");
        assert_eq!(buf.poll_transmit(4), 0..4);
        buf.mark_lost(0..4);
        assert!(buf.has_lost());
        // Retransmission takes priority over the unsent tail
        assert_eq!(buf.poll_transmit(100), 0..4);
        assert_eq!(buf.poll_transmit(100), 4..10);
    }

    #[test]
    fn lost_range_split_by_budget() {
        let mut buf = SendBuffer::new();
        write(&mut buf, b"0123456789");
        buf.poll_transmit(10);
        buf.mark_lost(0..10);
        assert_eq!(buf.poll_transmit(4), 0..4);
        assert_eq!(buf.poll_transmit(100), 4..10);
    }

    #[test]
    fn ack_cancels_pending_retransmit() {
        let mut buf = SendBuffer::new();
        write(&mut buf, b"0123456789");
        buf.poll_transmit(10);
        buf.mark_lost(0..10);
        buf.ack(0..10);
        assert!(!buf.has_lost());
        assert!(buf.is_fully_acked());
    }

    #[test]
    fn truncate_for_reliable_reset() {
        let mut buf = SendBuffer::new();
        write(&mut buf, b"0123456789");
        assert_eq!(buf.poll_transmit(6), 0..6);
        buf.mark_lost(4..6);
        // Commit to delivering only the first 5 bytes
        buf.truncate(5);
        assert_eq!(buf.offset(), 5);
        // The lost range is clipped at the boundary
        assert_eq!(buf.poll_transmit(100), 4..5);
        // No new data remains past the reliable size
        let empty = buf.poll_transmit(100);
        assert!(empty.is_empty());
        buf.ack(0..5);
        assert!(buf.is_fully_acked());
    }

    #[test]
    fn get_stops_at_segment_boundary() {
        let mut buf = SendBuffer::new();
        write(&mut buf, b"abc");
        write(&mut buf, b"def");
        assert_eq!(buf.get(0..6), b"abc");
        assert_eq!(buf.get(3..6), b"def");
    }
}
