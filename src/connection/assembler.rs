use std::collections::BTreeMap;

use bytes::Bytes;

use crate::range_set::RangeSet;

/// Helper to assemble unordered stream frames into an ordered stream
///
/// Chunks are stored keyed by offset, already trimmed of every byte previously
/// received, so the buffer never holds duplicates and memory use is bounded by flow
/// control.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    /// Disjoint pending chunks, keyed by offset
    data: BTreeMap<u64, Bytes>,
    /// Every offset ever received, including consumed ones
    recvd: RangeSet,
    /// Offset of the next byte the application will read
    bytes_read: u64,
    /// Total bytes currently buffered
    buffered: usize,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Buffer a received segment, discarding any portions already received
    pub(crate) fn insert(&mut self, offset: u64, data: Bytes) {
        let end = offset + data.len() as u64;
        if end == offset {
            return;
        }
        let mut cur = offset.max(self.bytes_read);
        while cur < end {
            if let Some(covering) = self.recvd.containing(cur) {
                cur = covering.end.min(end);
                continue;
            }
            let stop = self
                .recvd
                .next_start_after(cur)
                .map_or(end, |start| start.min(end));
            let chunk = data.slice((cur - offset) as usize..(stop - offset) as usize);
            self.buffered += chunk.len();
            self.data.insert(cur, chunk);
            cur = stop;
        }
        self.recvd.insert(offset..end);
    }

    /// Read contiguous bytes from the current offset, at most `max_length`
    pub(crate) fn read(&mut self, max_length: usize) -> Option<Bytes> {
        let (&offset, _) = self.data.iter().next()?;
        if offset != self.bytes_read {
            // Next chunk is after a hole
            return None;
        }
        let mut chunk = self.data.remove(&offset).unwrap();
        let out = if max_length < chunk.len() {
            let out = chunk.split_to(max_length);
            self.data.insert(offset + out.len() as u64, chunk);
            out
        } else {
            chunk
        };
        self.bytes_read += out.len() as u64;
        self.buffered -= out.len();
        Some(out)
    }

    /// Whether a read would currently return data
    pub(crate) fn has_readable(&self) -> bool {
        self.data
            .iter()
            .next()
            .is_some_and(|(&offset, _)| offset == self.bytes_read)
    }

    /// Offset of the next byte the application will read
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes currently buffered awaiting in-order delivery
    pub(crate) fn buffered(&self) -> usize {
        self.buffered
    }

    /// Largest offset past the end of any received segment
    pub(crate) fn highest_received(&self) -> u64 {
        self.recvd.max().map_or(0, |x| x + 1)
    }

    /// Discard buffered data, e.g. after a reset
    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &[u8]) -> Bytes {
        Bytes::copy_from_slice(s)
    }

    #[test]
    fn in_order_read() {
        let mut asm = Assembler::new();
        asm.insert(0, bytes(b"hello"));
        asm.insert(5, bytes(b" world"));
        assert_eq!(asm.read(usize::MAX).unwrap(), bytes(b"hello"));
        assert_eq!(asm.read(usize::MAX).unwrap(), bytes(b" world"));
        assert!(asm.read(usize::MAX).is_none());
        assert_eq!(asm.bytes_read(), 11);
    }

    #[test]
    fn out_of_order_held_back() {
        let mut asm = Assembler::new();
        asm.insert(5, bytes(b"world"));
        assert!(!asm.has_readable());
        assert!(asm.read(usize::MAX).is_none());
        asm.insert(0, bytes(b"hello"));
        assert!(asm.has_readable());
        assert_eq!(asm.read(usize::MAX).unwrap(), bytes(b"hello"));
        assert_eq!(asm.read(usize::MAX).unwrap(), bytes(b"world"));
    }

    #[test]
    fn duplicates_trimmed() {
        let mut asm = Assembler::new();
        asm.insert(0, bytes(b"abcd"));
        // Fully duplicate
        asm.insert(0, bytes(b"abcd"));
        // Overlapping tail extends
        asm.insert(2, bytes(b"cdef"));
        assert_eq!(asm.buffered(), 6);
        assert_eq!(asm.read(usize::MAX).unwrap(), bytes(b"abcd"));
        assert_eq!(asm.read(usize::MAX).unwrap(), bytes(b"ef"));
    }

    #[test]
    fn fills_hole_between_chunks() {
        let mut asm = Assembler::new();
        asm.insert(0, bytes(b"ab"));
        asm.insert(4, bytes(b"ef"));
        asm.insert(0, bytes(b"abcdef"));
        let mut out = Vec::new();
        while let Some(chunk) = asm.read(usize::MAX) {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn partial_read() {
        let mut asm = Assembler::new();
        asm.insert(0, bytes(b"abcdef"));
        assert_eq!(asm.read(4).unwrap(), bytes(b"abcd"));
        assert_eq!(asm.read(4).unwrap(), bytes(b"ef"));
    }

    #[test]
    fn highest_received_tracks_max() {
        let mut asm = Assembler::new();
        asm.insert(10, bytes(b"xy"));
        assert_eq!(asm.highest_received(), 12);
        asm.insert(0, bytes(b"a"));
        assert_eq!(asm.highest_received(), 12);
    }
}
