use bytes::Bytes;

use crate::{frame::StreamMeta, VarInt};

use super::super::send_buffer::SendBuffer;
use super::WriteError;

/// State machine: `Ready` until a reset is sent, `ResetSent` until the peer acks it,
/// then `Closed`. Finishing normally goes straight from `Ready` to `Closed` once all
/// data and the FIN are acknowledged.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SendState {
    /// Sending new data
    Ready,
    /// Stream was reset locally; awaiting acknowledgement of the reset frame
    ResetSent,
    /// All data and FIN acked, or reset acknowledged
    Closed,
}

/// The send half of one stream
pub(super) struct Send {
    pub(super) buffer: SendBuffer,
    pub(super) state: SendState,
    /// Peer's advertised maximum offset
    pub(super) max_data: u64,
    /// Offset of the FIN, once the application has finished the stream
    pub(super) fin_offset: Option<u64>,
    /// FIN queued but not yet carried by any in-flight frame
    pub(super) fin_pending: bool,
    pub(super) fin_acked: bool,
    /// Set when the peer asks us to stop; surfaced to the application on write
    pub(super) stop_reason: Option<VarInt>,
    pub(super) stop_acknowledged: bool,
    /// Error code carried by our reset, fixed for the stream's lifetime
    pub(super) error_code_to_peer: Option<VarInt>,
    /// Bytes we committed to deliver before the reset takes effect
    pub(super) reliable_size: Option<u64>,
    /// Reset frame queued or in flight, not yet acknowledged
    pub(super) reset_pending: bool,
    /// STREAM_DATA_BLOCKED waiting to be sent
    pub(super) blocked_pending: bool,
    pub(super) priority: i32,
    pub(super) incremental: bool,
    /// Whether this stream currently sits in the pending-writes queue
    pub(super) queued: bool,
}

impl Send {
    pub(super) fn new(max_data: u64) -> Self {
        Self {
            buffer: SendBuffer::new(),
            state: SendState::Ready,
            max_data,
            fin_offset: None,
            fin_pending: false,
            fin_acked: false,
            stop_reason: None,
            stop_acknowledged: false,
            error_code_to_peer: None,
            reliable_size: None,
            reset_pending: false,
            blocked_pending: false,
            priority: 0,
            incremental: true,
            queued: false,
        }
    }

    /// Append application data, limited by stream and connection flow control
    ///
    /// `conn_budget` is the connection-level credit still available; the return
    /// value never exceeds it.
    pub(super) fn write(&mut self, data: &[u8], conn_budget: u64) -> Result<usize, WriteError> {
        if let Some(code) = self.stop_reason {
            return Err(WriteError::Stopped(code));
        }
        if self.state != SendState::Ready || self.fin_offset.is_some() {
            return Err(WriteError::ClosedStream);
        }
        let stream_budget = self.max_data.saturating_sub(self.buffer.offset());
        let limit = stream_budget.min(conn_budget);
        if limit == 0 {
            self.blocked_pending = stream_budget == 0;
            return Err(WriteError::Blocked);
        }
        let len = (data.len() as u64).min(limit) as usize;
        self.buffer.write(Bytes::copy_from_slice(&data[..len]));
        Ok(len)
    }

    /// Mark the end of the stream; no further writes are possible
    pub(super) fn finish(&mut self) -> Result<(), WriteError> {
        if let Some(code) = self.stop_reason {
            return Err(WriteError::Stopped(code));
        }
        if self.state != SendState::Ready || self.fin_offset.is_some() {
            return Err(WriteError::ClosedStream);
        }
        self.fin_offset = Some(self.buffer.offset());
        self.fin_pending = true;
        Ok(())
    }

    /// Abandon the stream, optionally committing to deliver a reliable prefix
    ///
    /// Returns `false` if the stream was already reset or fully closed, in which
    /// case nothing is sent.
    pub(super) fn reset(&mut self, error_code: VarInt, reliable_size: Option<u64>) -> bool {
        if self.state != SendState::Ready {
            return false;
        }
        let reliable = reliable_size.unwrap_or(0).min(self.buffer.offset());
        self.buffer.truncate(reliable);
        self.state = SendState::ResetSent;
        self.error_code_to_peer = Some(error_code);
        self.reliable_size = reliable_size.map(|_| reliable);
        self.reset_pending = true;
        self.fin_pending = false;
        true
    }

    /// Final size to carry in the reset frame
    pub(super) fn final_size(&self) -> u64 {
        self.fin_offset.unwrap_or_else(|| self.buffer.offset())
    }

    /// Whether the peer still expects data from us
    ///
    /// After a plain reset nothing is delivered; after a reliable reset the
    /// committed prefix still retransmits until acked.
    pub(super) fn must_deliver(&self) -> bool {
        match self.state {
            SendState::Ready => true,
            SendState::ResetSent => !self.buffer.is_fully_acked(),
            SendState::Closed => false,
        }
    }

    /// Whether new or lost data (or a lone FIN) is ready for a STREAM frame
    pub(super) fn has_sendable_data(&self) -> bool {
        if self.state == SendState::Ready {
            if self.buffer.has_lost() {
                return true;
            }
            let flow_open = self.max_data > self.buffer.unsent_offset();
            (self.buffer.unsent() != 0 && flow_open) || self.fin_pending
        } else {
            // A reliable reset keeps retransmitting the committed prefix
            self.state == SendState::ResetSent && self.buffer.has_sendable()
        }
    }

    /// Process acknowledgement of a stream frame we sent
    ///
    /// Returns `true` if this ack transitioned the stream to `Closed`.
    pub(super) fn ack(&mut self, meta: &StreamMeta) -> bool {
        self.buffer.ack(meta.offsets.clone());
        if meta.fin {
            self.fin_acked = true;
        }
        match self.state {
            SendState::Ready => {
                if self.fin_acked && self.fin_offset.is_some() && self.buffer.is_fully_acked() {
                    self.state = SendState::Closed;
                    return true;
                }
                false
            }
            SendState::ResetSent => self.maybe_close_after_reset(),
            SendState::Closed => false,
        }
    }

    /// Process acknowledgement of our reset frame
    pub(super) fn reset_acked(&mut self) -> bool {
        self.reset_pending = false;
        if self.state == SendState::ResetSent {
            return self.maybe_close_after_reset();
        }
        false
    }

    fn maybe_close_after_reset(&mut self) -> bool {
        // A reliable reset is done once both the reset frame and the committed
        // prefix have been acknowledged
        if !self.reset_pending && self.buffer.is_fully_acked() {
            self.state = SendState::Closed;
            return true;
        }
        false
    }

    /// Process loss of a stream frame we sent
    pub(super) fn on_lost(&mut self, meta: &StreamMeta) {
        if self.state == SendState::Closed {
            return;
        }
        if self.state == SendState::ResetSent {
            // Only the reliable prefix retransmits
            let reliable = self.reliable_size.unwrap_or(0);
            if meta.offsets.start >= reliable {
                return;
            }
            let end = meta.offsets.end.min(reliable);
            if end > meta.offsets.start {
                self.buffer.mark_lost(meta.offsets.start..end);
            }
            return;
        }
        if !meta.offsets.is_empty() {
            self.buffer.mark_lost(meta.offsets.clone());
        }
        if meta.fin {
            self.fin_pending = true;
        }
    }

    /// The peer no longer wants this stream; abandon it with their error code
    pub(super) fn stop(&mut self, error_code: VarInt) {
        self.stop_reason = Some(error_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(range: std::ops::Range<u64>, fin: bool) -> StreamMeta {
        StreamMeta {
            id: crate::StreamId(0),
            offsets: range,
            fin,
        }
    }

    #[test]
    fn write_respects_stream_flow_control() {
        let mut s = Send::new(5);
        assert_eq!(s.write(b"hello world", u64::MAX).unwrap(), 5);
        assert!(matches!(
            s.write(b"more", u64::MAX),
            Err(WriteError::Blocked)
        ));
        assert!(s.blocked_pending);
        // Peer opens the window
        s.max_data = 100;
        assert_eq!(s.write(b" world", u64::MAX).unwrap(), 6);
    }

    #[test]
    fn write_respects_connection_budget() {
        let mut s = Send::new(u64::MAX >> 2);
        assert_eq!(s.write(b"hello", 3).unwrap(), 3);
        assert!(matches!(s.write(b"lo", 0), Err(WriteError::Blocked)));
        // Connection-blocked, not stream-blocked
        assert!(!s.blocked_pending);
    }

    #[test]
    fn closes_when_data_and_fin_acked() {
        let mut s = Send::new(100);
        s.write(b"data", u64::MAX).unwrap();
        s.finish().unwrap();
        assert!(s.has_sendable_data());
        let range = s.buffer.poll_transmit(100);
        assert_eq!(range, 0..4);
        s.fin_pending = false;
        assert!(!s.ack(&meta(0..3, false)));
        assert!(s.ack(&meta(3..4, true)));
        assert_eq!(s.state, SendState::Closed);
    }

    #[test]
    fn write_after_finish_fails() {
        let mut s = Send::new(100);
        s.finish().unwrap();
        assert!(matches!(s.write(b"x", u64::MAX), Err(WriteError::ClosedStream)));
    }

    #[test]
    fn stopped_surfaces_peer_code() {
        let mut s = Send::new(100);
        s.stop(VarInt::from_u32(42));
        assert!(matches!(
            s.write(b"x", u64::MAX),
            Err(WriteError::Stopped(c)) if c == VarInt::from_u32(42)
        ));
    }

    #[test]
    fn plain_reset_abandons_everything() {
        let mut s = Send::new(100);
        s.write(b"0123456789", u64::MAX).unwrap();
        s.buffer.poll_transmit(4);
        assert!(s.reset(VarInt::from_u32(1), None));
        assert_eq!(s.state, SendState::ResetSent);
        assert!(!s.has_sendable_data());
        // Close requires only the reset ack
        assert!(s.reset_acked());
        assert_eq!(s.state, SendState::Closed);
    }

    #[test]
    fn reliable_reset_delivers_prefix() {
        let mut s = Send::new(100);
        s.write(b"0123456789", u64::MAX).unwrap();
        s.buffer.poll_transmit(10);
        assert!(s.reset(VarInt::from_u32(1), Some(6)));
        // Loss of the committed prefix still retransmits
        s.on_lost(&meta(0..10, false));
        assert!(s.has_sendable_data());
        assert_eq!(s.buffer.poll_transmit(100), 0..6);
        // Reset ack alone isn't enough
        assert!(!s.reset_acked());
        assert!(s.ack(&meta(0..6, false)));
        assert_eq!(s.state, SendState::Closed);
    }

    #[test]
    fn second_reset_is_noop() {
        let mut s = Send::new(100);
        assert!(s.reset(VarInt::from_u32(1), None));
        assert!(!s.reset(VarInt::from_u32(2), None));
        assert_eq!(s.error_code_to_peer, Some(VarInt::from_u32(1)));
    }
}
