use thiserror::Error;

use crate::VarInt;

mod recv;
mod send;
mod state;

pub(crate) use send::SendState;
pub(crate) use state::StreamsState;

/// Errors triggered while writing to a send stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The peer is not able to accept additional data, or the connection is congested
    ///
    /// If the peer issues additional flow control credit, a
    /// [`StreamEvent::Writable`](crate::StreamEvent) event will be generated.
    #[error("unable to accept further writes")]
    Blocked,
    /// The peer is no longer accepting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream has not been opened, was finished or reset locally, or has
    /// already been fully closed
    #[error("closed stream")]
    ClosedStream,
}

/// Errors triggered when reading from a recv stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// No more data is currently available on this stream
    ///
    /// If more data on this stream is received from the peer, a
    /// [`StreamEvent::Readable`](crate::StreamEvent) event will be generated.
    #[error("blocked")]
    Blocked,
    /// The peer abandoned transmitting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("reset by peer: code {0}")]
    Reset(VarInt),
    /// The stream has not been opened or has already been fully read or reset
    #[error("closed stream")]
    ClosedStream,
}
