use bytes::Bytes;

use crate::{frame, transport_error::TransportError, VarInt};

use super::super::assembler::Assembler;
use super::ReadError;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RecvState {
    /// Receiving data
    Open,
    /// All data delivered to the application, or a reset consumed
    Closed,
}

/// The receive half of one stream
pub(super) struct Recv {
    pub(super) assembler: Assembler,
    pub(super) state: RecvState,
    /// Total size of the stream, learned from a FIN or a reset
    pub(super) final_offset: Option<u64>,
    /// Reset received from the peer, pending delivery to the application
    pub(super) reset_code: Option<VarInt>,
    /// With a reliable reset, data below this offset is still delivered first
    pub(super) reliable_size: u64,
    /// Absolute offset limit we've advertised for this stream
    pub(super) max_data: u64,
    /// Credit issued per window update
    pub(super) window_size: u64,
    /// MAX_STREAM_DATA waiting to be sent
    pub(super) max_data_pending: bool,
    /// STOP_SENDING sent with this code, if any
    pub(super) stop_requested: Option<VarInt>,
}

impl Recv {
    pub(super) fn new(initial_max_data: u64) -> Self {
        Self {
            assembler: Assembler::new(),
            state: RecvState::Open,
            final_offset: None,
            reset_code: None,
            reliable_size: 0,
            max_data: initial_max_data,
            window_size: initial_max_data,
            max_data_pending: false,
            stop_requested: None,
        }
    }

    /// Ingest a received STREAM frame
    ///
    /// Returns how many previously unseen bytes this frame contributed to the
    /// connection-level flow control total.
    pub(super) fn ingest(&mut self, frame: frame::Stream) -> Result<u64, TransportError> {
        let end = frame.offset + frame.data.len() as u64;
        if end > self.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "stream flow control limit exceeded",
            ));
        }
        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (frame.fin && end != final_offset) {
                return Err(TransportError::FINAL_SIZE_ERROR("final size changed"));
            }
        }
        if frame.fin {
            if self.assembler.highest_received() > end {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "final size below already-received data",
                ));
            }
            self.final_offset = Some(end);
        }
        let prev_max = self.assembler.highest_received();
        if self.state == RecvState::Open && self.reset_code.is_none() {
            self.assembler.insert(frame.offset, frame.data);
        }
        Ok(self.assembler.highest_received().saturating_sub(prev_max))
    }

    /// Process RESET_STREAM or RESET_STREAM_AT from the peer
    ///
    /// Returns the connection-level flow control contribution of the newly learned
    /// final size.
    pub(super) fn on_reset(
        &mut self,
        frame: &frame::ResetStream,
    ) -> Result<u64, TransportError> {
        let final_offset = frame.final_offset.into_inner();
        if let Some(known) = self.final_offset {
            if known != final_offset {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "reset contradicts known final size",
                ));
            }
        }
        if self.assembler.highest_received() > final_offset {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "reset final size below received data",
            ));
        }
        if final_offset > self.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "reset final size exceeds stream flow control limit",
            ));
        }
        let credit = final_offset.saturating_sub(self.assembler.highest_received());
        if self.reset_code.is_none() {
            self.final_offset = Some(final_offset);
            self.reset_code = Some(frame.error_code);
            self.reliable_size = frame
                .reliable_size
                .map_or(0, VarInt::into_inner)
                .min(final_offset);
            if self.reliable_size == 0 {
                // Nothing left to deliver
                self.assembler.clear();
            }
        }
        Ok(credit)
    }

    /// Read contiguous bytes in offset order
    ///
    /// `Ok(None)` signals end of stream. After a reset, buffered data up to the
    /// reliable size (if any) is delivered before the reset surfaces as an error.
    pub(super) fn read(&mut self, max_length: usize) -> Result<Option<(Bytes, bool)>, ReadError> {
        if self.state == RecvState::Closed {
            return Err(ReadError::ClosedStream);
        }
        if let Some(code) = self.reset_code {
            if self.assembler.bytes_read() >= self.reliable_size {
                self.state = RecvState::Closed;
                return Err(ReadError::Reset(code));
            }
            let budget = (self.reliable_size - self.assembler.bytes_read()) as usize;
            match self.assembler.read(budget.min(max_length)) {
                Some(chunk) => return Ok(Some((chunk, false))),
                None => return Err(ReadError::Blocked),
            }
        }
        match self.assembler.read(max_length) {
            Some(chunk) => {
                let at_end = self.final_offset == Some(self.assembler.bytes_read());
                if at_end {
                    self.state = RecvState::Closed;
                }
                Ok(Some((chunk, at_end)))
            }
            None => {
                if self.final_offset == Some(self.assembler.bytes_read()) {
                    self.state = RecvState::Closed;
                    return Ok(None);
                }
                Err(ReadError::Blocked)
            }
        }
    }

    /// Whether a read would make progress right now
    pub(super) fn is_readable(&self) -> bool {
        if self.state == RecvState::Closed {
            return false;
        }
        if self.reset_code.is_some() {
            return true;
        }
        self.assembler.has_readable() || self.final_offset == Some(self.assembler.bytes_read())
    }

    /// Grow the advertised window as the application drains the stream
    ///
    /// Credit is reissued in `window_size` steps once a meaningful fraction has been
    /// consumed, so MAX_STREAM_DATA frames stay rare.
    pub(super) fn maybe_issue_credit(&mut self) -> Option<u64> {
        if self.final_offset.is_some() || self.state == RecvState::Closed {
            return None;
        }
        let target = self.assembler.bytes_read() + self.window_size;
        if target > self.max_data && target - self.max_data >= self.window_size / 8 {
            self.max_data = target;
            self.max_data_pending = true;
            return Some(self.max_data);
        }
        None
    }

    /// Ask the peer to stop transmitting
    ///
    /// No receive-side state changes until the peer's reset arrives.
    pub(super) fn stop(&mut self, error_code: VarInt) -> bool {
        if self.stop_requested.is_some()
            || self.state == RecvState::Closed
            || self.reset_code.is_some()
        {
            return false;
        }
        self.stop_requested = Some(error_code);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn stream_frame(offset: u64, data: &[u8], fin: bool) -> frame::Stream {
        frame::Stream {
            id: crate::StreamId(0),
            offset,
            fin,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn read_to_eof() {
        let mut r = Recv::new(1000);
        r.ingest(stream_frame(0, b"hello", false)).unwrap();
        r.ingest(stream_frame(5, b" world", true)).unwrap();
        let (chunk, fin) = r.read(5).unwrap().unwrap();
        assert_eq!(chunk, Bytes::from_static(b"hello"));
        assert!(!fin);
        let (chunk, fin) = r.read(100).unwrap().unwrap();
        assert_eq!(chunk, Bytes::from_static(b" world"));
        assert!(fin);
        assert_eq!(r.state, RecvState::Closed);
    }

    #[test]
    fn flow_control_violation() {
        let mut r = Recv::new(4);
        let err = r.ingest(stream_frame(0, b"hello", false)).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn final_size_contradiction() {
        let mut r = Recv::new(1000);
        r.ingest(stream_frame(0, b"abc", true)).unwrap();
        let err = r.ingest(stream_frame(0, b"abcd", true)).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn data_past_fin_rejected() {
        let mut r = Recv::new(1000);
        r.ingest(stream_frame(0, b"abc", true)).unwrap();
        let err = r.ingest(stream_frame(3, b"d", false)).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn plain_reset_discards_and_surfaces() {
        let mut r = Recv::new(1000);
        r.ingest(stream_frame(0, b"abc", false)).unwrap();
        let reset = frame::ResetStream {
            id: crate::StreamId(0),
            error_code: VarInt::from_u32(9),
            final_offset: VarInt::from_u32(3),
            reliable_size: None,
        };
        r.on_reset(&reset).unwrap();
        assert_matches!(r.read(100), Err(ReadError::Reset(c)) if c == VarInt::from_u32(9));
        assert_eq!(r.state, RecvState::Closed);
    }

    #[test]
    fn reliable_reset_delivers_prefix_first() {
        let mut r = Recv::new(1000);
        r.ingest(stream_frame(0, b"abcdef", false)).unwrap();
        let reset = frame::ResetStream {
            id: crate::StreamId(0),
            error_code: VarInt::from_u32(9),
            final_offset: VarInt::from_u32(6),
            reliable_size: Some(VarInt::from_u32(4)),
        };
        r.on_reset(&reset).unwrap();
        let (chunk, _) = r.read(100).unwrap().unwrap();
        assert_eq!(chunk, Bytes::from_static(b"abcd"));
        assert_matches!(r.read(100), Err(ReadError::Reset(_)));
    }

    #[test]
    fn reset_contradicting_data_rejected() {
        let mut r = Recv::new(1000);
        r.ingest(stream_frame(0, b"abcdef", false)).unwrap();
        let reset = frame::ResetStream {
            id: crate::StreamId(0),
            error_code: VarInt::from_u32(9),
            final_offset: VarInt::from_u32(3),
            reliable_size: None,
        };
        let err = r.on_reset(&reset).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn credit_reissued_after_reads() {
        let mut r = Recv::new(100);
        r.ingest(stream_frame(0, &[0; 100], false)).unwrap();
        while r.read(10).is_ok() {}
        let new_max = r.maybe_issue_credit().unwrap();
        assert_eq!(new_max, 200);
        assert!(r.max_data_pending);
    }
}
