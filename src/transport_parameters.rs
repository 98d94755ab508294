//! QUIC connection transport parameters
//!
//! The `TransportParameters` type is used to represent the transport parameters
//! negotiated by peers while establishing a connection. This process happens as part
//! of the establishment of the TLS session. As such, the types contained in this
//! modules should generally only be referred to by custom implementations of the
//! `crypto::Session` trait.

use std::convert::TryFrom;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{
    coding::{BufExt, BufMutExt, UnexpectedEnd},
    config::{EndpointConfig, TransportConfig},
    shared::ConnectionId,
    ResetToken, Side, TransportError, VarInt, MAX_CID_SIZE, RESET_TOKEN_SIZE,
};

// Apply `$macro` to a list of (name, id, default) triples for every
// varint-valued transport parameter.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // #[doc] name (id) = default,
            /// Milliseconds, disabled if zero
            max_idle_timeout(0x0001) = 0,
            /// Limits the size of UDP payloads that the endpoint is willing to receive
            max_udp_payload_size(0x0003) = 65527,

            /// Initial value for the maximum amount of data that can be sent on the connection
            initial_max_data(0x0004) = 0,
            /// Initial flow control limit for locally-initiated bidirectional streams
            initial_max_stream_data_bidi_local(0x0005) = 0,
            /// Initial flow control limit for peer-initiated bidirectional streams
            initial_max_stream_data_bidi_remote(0x0006) = 0,
            /// Initial flow control limit for unidirectional streams
            initial_max_stream_data_uni(0x0007) = 0,

            /// Initial maximum number of bidirectional streams the peer may initiate
            initial_max_streams_bidi(0x0008) = 0,
            /// Initial maximum number of unidirectional streams the peer may initiate
            initial_max_streams_uni(0x0009) = 0,

            /// Exponent used to decode the ACK Delay field in the ACK frame
            ack_delay_exponent(0x000a) = 3,
            /// Maximum amount of time in milliseconds by which the endpoint will delay sending acknowledgments
            max_ack_delay(0x000b) = 25,
            /// Maximum number of connection IDs from the peer that an endpoint is willing to store
            active_connection_id_limit(0x000e) = 2,
        }
    };
}

macro_rules! make_struct {
    {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {
        /// Transport parameters used to negotiate connection-level preferences between peers
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub struct TransportParameters {
            $($(#[$doc])* pub(crate) $name : VarInt,)*

            /// Does the endpoint support active connection migration
            pub(crate) disable_active_migration: bool,
            /// Maximum size for datagram frames
            pub(crate) max_datagram_frame_size: Option<VarInt>,
            /// Minimum ack delay the endpoint can honor, in microseconds; advertises
            /// support for the acknowledgement frequency extension
            pub(crate) min_ack_delay: Option<VarInt>,

            // Server-only
            /// The value of the Destination Connection ID field from the first Initial packet sent by the client
            pub(crate) original_dst_cid: Option<ConnectionId>,
            /// The value that the server included in the Source Connection ID field of a Retry packet
            pub(crate) retry_src_cid: Option<ConnectionId>,
            /// Token used by the client to verify a stateless reset from the server
            pub(crate) stateless_reset_token: Option<ResetToken>,
            /// The server's preferred address for communication after handshake completion
            /// The value that the endpoint included in the Source Connection ID field of the first
            /// Initial packet it sends for the connection
            pub(crate) initial_src_cid: Option<ConnectionId>,
        }

        impl Default for TransportParameters {
            /// Standard defaults, used if the peer does not supply a given parameter.
            fn default() -> Self {
                Self {
                    $($name: VarInt::from_u32($default),)*

                    disable_active_migration: false,
                    max_datagram_frame_size: None,
                    min_ack_delay: None,

                    original_dst_cid: None,
                    retry_src_cid: None,
                    stateless_reset_token: None,
                    initial_src_cid: None,
                }
            }
        }
    }
}

apply_params!(make_struct);

impl TransportParameters {
    /// The parameter set an endpoint with these configurations advertises
    ///
    /// Handshake implementations encode this into their transport-parameters
    /// extension; the connection fills in the connection-ID-dependent fields.
    pub fn new(config: &TransportConfig, endpoint_config: &EndpointConfig) -> Self {
        Self {
            initial_max_streams_bidi: config.max_concurrent_bidi_streams,
            initial_max_streams_uni: config.max_concurrent_uni_streams,
            initial_max_data: config.receive_window,
            initial_max_stream_data_bidi_local: config.stream_receive_window,
            initial_max_stream_data_bidi_remote: config.stream_receive_window,
            initial_max_stream_data_uni: config.stream_receive_window,
            max_udp_payload_size: endpoint_config.max_udp_payload_size,
            max_idle_timeout: config.max_idle_timeout.unwrap_or(VarInt(0)),
            max_ack_delay: VarInt::from_u64(config.max_ack_delay_ms).unwrap(),
            ack_delay_exponent: VarInt::from_u32(ACK_DELAY_EXPONENT as u32),
            min_ack_delay: Some(
                VarInt::from_u64(u64::try_from(TIMER_GRANULARITY_MICROS).unwrap()).unwrap(),
            ),
            max_datagram_frame_size: config
                .datagram_receive_buffer_size
                .map(|x| (x.min(u16::MAX.into()) as u32).into()),
            ..Self::default()
        }
    }

    /// Check that these parameters are legal when resuming from certain cached parameters
    pub(crate) fn validate_resumption_from(&self, cached: &Self) -> Result<(), TransportError> {
        if cached.active_connection_id_limit > self.active_connection_id_limit
            || cached.initial_max_data > self.initial_max_data
            || cached.initial_max_stream_data_bidi_local > self.initial_max_stream_data_bidi_local
            || cached.initial_max_stream_data_bidi_remote
                > self.initial_max_stream_data_bidi_remote
            || cached.initial_max_stream_data_uni > self.initial_max_stream_data_uni
            || cached.initial_max_streams_bidi > self.initial_max_streams_bidi
            || cached.initial_max_streams_uni > self.initial_max_streams_uni
            || cached.max_datagram_frame_size > self.max_datagram_frame_size
        {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "0-RTT accepted with incompatible transport parameters",
            ));
        }
        Ok(())
    }

    /// Maximum number of CIDs to issue to this peer
    ///
    /// Consider both a) the active_connection_id_limit from the other end; and
    /// b) LOC_CID_COUNT used locally
    pub(crate) fn issue_cids_limit(&self) -> u64 {
        self.active_connection_id_limit.0.min(crate::LOC_CID_COUNT)
    }
}

/// The ack delay exponent we advertise
pub(crate) const ACK_DELAY_EXPONENT: u8 = 3;
const TIMER_GRANULARITY_MICROS: u128 = crate::TIMER_GRANULARITY.as_micros();

/// Errors encountered while decoding `TransportParameters`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// Parameters that are semantically invalid
    #[error("parameter had illegal value")]
    IllegalValue,
    /// Catch-all error for problems while decoding transport parameters
    #[error("parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        match e {
            Error::IllegalValue => Self::TRANSPORT_PARAMETER_ERROR("illegal value"),
            Error::Malformed => Self::TRANSPORT_PARAMETER_ERROR("malformed"),
        }
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Malformed
    }
}

impl TransportParameters {
    /// Encode `TransportParameters` into buffer
    pub fn write<W: BufMut>(&self, w: &mut W) {
        macro_rules! write_params {
            {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {
                $(
                    if self.$name.0 != $default {
                        w.write_var($id);
                        w.write(VarInt::from_u64(self.$name.size() as u64).unwrap());
                        w.write(self.$name);
                    }
                )*
            }
        }
        apply_params!(write_params);

        if let Some(ref x) = self.stateless_reset_token {
            w.write_var(0x02);
            w.write_var(RESET_TOKEN_SIZE as u64);
            w.put_slice(x);
        }

        if self.disable_active_migration {
            w.write_var(0x0c);
            w.write_var(0);
        }

        if let Some(x) = self.max_datagram_frame_size {
            w.write_var(0x20);
            w.write_var(x.size() as u64);
            w.write(x);
        }

        if let Some(x) = self.min_ack_delay {
            w.write_var(0xff04de1b);
            w.write_var(x.size() as u64);
            w.write(x);
        }

        for &(tag, cid) in &[
            (0x00, &self.original_dst_cid),
            (0x0f, &self.initial_src_cid),
            (0x10, &self.retry_src_cid),
        ] {
            if let Some(ref cid) = *cid {
                w.write_var(tag);
                w.write_var(cid.len() as u64);
                w.put_slice(cid);
            }
        }
    }

    /// Decode `TransportParameters` from buffer
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        // Initialize to protocol-specified defaults
        let mut params = Self::default();

        // State to check for duplicate transport parameters.
        macro_rules! param_state {
            {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {{
                struct ParamState {
                    $($name: bool,)*
                }

                ParamState {
                    $($name: false,)*
                }
            }}
        }
        let mut got = apply_params!(param_state);

        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()?;
            if (r.remaining() as u64) < len {
                return Err(Error::Malformed);
            }
            let len = len as usize;

            match id {
                0x00 => decode_cid(len, &mut params.original_dst_cid, r)?,
                0x02 => {
                    if len != RESET_TOKEN_SIZE || params.stateless_reset_token.is_some() {
                        return Err(Error::Malformed);
                    }
                    let mut tok = [0; RESET_TOKEN_SIZE];
                    r.copy_to_slice(&mut tok);
                    params.stateless_reset_token = Some(tok.into());
                }
                0x0c => {
                    if len != 0 || params.disable_active_migration {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                0x0d => {
                    // Preferred address: recognized but not consumed by this core
                    if side.is_server() {
                        return Err(Error::Malformed);
                    }
                    r.advance(len);
                }
                0x0f => decode_cid(len, &mut params.initial_src_cid, r)?,
                0x10 => decode_cid(len, &mut params.retry_src_cid, r)?,
                0x20 => {
                    if len > 8 || params.max_datagram_frame_size.is_some() {
                        return Err(Error::Malformed);
                    }
                    params.max_datagram_frame_size = Some(r.get()?);
                }
                0xff04de1b => {
                    if params.min_ack_delay.is_some() {
                        return Err(Error::Malformed);
                    }
                    params.min_ack_delay = Some(r.get()?);
                }
                _ => {
                    macro_rules! parse {
                        {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {
                            match id {
                                $($id => {
                                    let value = r.get::<VarInt>()?;
                                    if len != value.size() || got.$name { return Err(Error::Malformed); }
                                    params.$name = value.into();
                                    got.$name = true;
                                })*
                                _ => r.advance(len),
                            }
                        }
                    }
                    apply_params!(parse);
                }
            }
        }

        // Semantic validation

        // https://www.rfc-editor.org/rfc/rfc9000.html#section-18.2-4.26.1
        if params.ack_delay_exponent.0 > 20
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-18.2-4.28.1
            || params.max_ack_delay.0 >= 1 << 14
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-18.2-6.2.1
            || params.active_connection_id_limit.0 < 2
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-18.2-4.10.1
            || params.max_udp_payload_size.0 < 1200
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-4.6-2
            || params.initial_max_streams_bidi.0 > MAX_STREAM_COUNT
            || params.initial_max_streams_uni.0 > MAX_STREAM_COUNT
            // https://www.rfc-editor.org/rfc/rfc9002.html#section-6.2.2.1.3
            || params
                .min_ack_delay
                .map_or(false, |min| min.0 > params.max_ack_delay.0 * 1_000)
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-18.2-8
            || (side.is_server()
                && (params.original_dst_cid.is_some()
                    || params.retry_src_cid.is_some()
                    || params.stateless_reset_token.is_some()))
        {
            return Err(Error::IllegalValue);
        }

        Ok(params)
    }
}

fn decode_cid<R: Buf>(
    len: usize,
    value: &mut Option<ConnectionId>,
    r: &mut R,
) -> Result<(), Error> {
    if len > MAX_CID_SIZE || value.is_some() {
        return Err(Error::Malformed);
    }
    *value = Some(ConnectionId::from_buf(r, len));
    Ok(())
}

use crate::MAX_STREAM_COUNT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coding() {
        let mut buf = Vec::new();
        let params = TransportParameters {
            initial_max_data: VarInt::from_u32(42),
            initial_max_streams_bidi: VarInt::from_u32(16),
            max_udp_payload_size: VarInt::from_u32(1200),
            initial_src_cid: Some(ConnectionId::new(&[0xab; 8])),
            stateless_reset_token: Some([0xcd; RESET_TOKEN_SIZE].into()),
            min_ack_delay: Some(VarInt::from_u32(1_000)),
            ..TransportParameters::default()
        };
        params.write(&mut buf);
        let decoded =
            TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn server_only_params_rejected_by_server() {
        let mut buf = Vec::new();
        let params = TransportParameters {
            stateless_reset_token: Some([0; RESET_TOKEN_SIZE].into()),
            ..TransportParameters::default()
        };
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut std::io::Cursor::new(&buf)),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn illegal_values_rejected() {
        for params in [
            TransportParameters {
                ack_delay_exponent: VarInt::from_u32(21),
                ..TransportParameters::default()
            },
            TransportParameters {
                max_udp_payload_size: VarInt::from_u32(600),
                ..TransportParameters::default()
            },
            TransportParameters {
                active_connection_id_limit: VarInt::from_u32(1),
                ..TransportParameters::default()
            },
        ] {
            let mut buf = Vec::new();
            params.write(&mut buf);
            assert_eq!(
                TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf)),
                Err(Error::IllegalValue)
            );
        }
    }

    #[test]
    fn resumption_validation() {
        let small = TransportParameters::default();
        let big = TransportParameters {
            initial_max_data: VarInt::from_u32(1024),
            ..TransportParameters::default()
        };
        assert!(big.validate_resumption_from(&small).is_ok());
        assert!(small.validate_resumption_from(&big).is_err());
    }
}
