//! Shared machinery for connection-level tests: a deterministic in-memory network
//! joining a client and a server endpoint, and a scripted handshake session that
//! stands in for TLS.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;

use quill_proto::{
    crypto::{
        self,
        ring::{keys_from_secrets, packet_keys_from_secrets, update_secret, Suite},
        KeyChange, KeyPair, Keys, PacketKey, Session,
    },
    Connection, ConnectionHandle, Endpoint, EndpointConfig, Side, TransportConfig,
    TransportError, TransportParameters,
};

// Deterministic traffic secrets for each level and generation
const HS_CLIENT_SECRET: [u8; 32] = [0x11; 32];
const HS_SERVER_SECRET: [u8; 32] = [0x22; 32];
const APP_CLIENT_SECRET: [u8; 32] = [0x33; 32];
const APP_SERVER_SECRET: [u8; 32] = [0x44; 32];

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_FINISHED: u8 = 3;

/// A handshake object with the shape of TLS 1.3 but none of the cryptography
///
/// Client sends a hello carrying its transport parameters; the server answers with
/// its own and both sides derive fixed traffic secrets; the client's finished
/// message completes the exchange. Real deployments plug a TLS stack in through the
/// same trait.
pub struct ScriptedSession {
    side: Side,
    params: TransportParameters,
    peer_params: Option<TransportParameters>,
    inbox: Vec<u8>,
    hello_sent: bool,
    keys_issued: u8,
    finished_sent: bool,
    complete: bool,
    /// Current 1-RTT secrets, advanced per key update
    app_secrets: (Vec<u8>, Vec<u8>),
}

impl ScriptedSession {
    pub fn new(side: Side, params: TransportParameters) -> Self {
        Self {
            side,
            params,
            peer_params: None,
            inbox: Vec::new(),
            hello_sent: false,
            keys_issued: 0,
            finished_sent: false,
            complete: false,
            app_secrets: (APP_CLIENT_SECRET.to_vec(), APP_SERVER_SECRET.to_vec()),
        }
    }

    fn keys_for(&self, client_secret: &[u8], server_secret: &[u8]) -> Keys {
        let (local, remote) = match self.side {
            Side::Client => (client_secret, server_secret),
            Side::Server => (server_secret, client_secret),
        };
        keys_from_secrets(Suite::Aes128Gcm, local, remote)
    }

    fn encode_params(ty: u8, params: &TransportParameters) -> Vec<u8> {
        let mut body = Vec::new();
        params.write(&mut body);
        let mut out = vec![ty];
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parse one complete message from the inbox, if present
    fn take_message(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.inbox.len() < 3 {
            return None;
        }
        let ty = self.inbox[0];
        let len = u16::from_be_bytes([self.inbox[1], self.inbox[2]]) as usize;
        if self.inbox.len() < 3 + len {
            return None;
        }
        let body = self.inbox[3..3 + len].to_vec();
        self.inbox.drain(..3 + len);
        Some((ty, body))
    }
}

impl Session for ScriptedSession {
    fn is_handshaking(&self) -> bool {
        !self.complete
    }

    fn read_handshake(&mut self, buf: &[u8]) -> Result<bool, TransportError> {
        self.inbox.extend_from_slice(buf);
        while let Some((ty, body)) = self.take_message() {
            match (self.side, ty) {
                (Side::Server, MSG_CLIENT_HELLO) | (Side::Client, MSG_SERVER_HELLO) => {
                    let params =
                        TransportParameters::read(self.side, &mut std::io::Cursor::new(&body))
                            .map_err(TransportError::from)?;
                    self.peer_params = Some(params);
                }
                (Side::Server, MSG_FINISHED) => {
                    self.complete = true;
                }
                _ => {
                    return Err(TransportError {
                        code: quill_proto::TransportErrorCode::PROTOCOL_VIOLATION,
                        frame: None,
                        reason: "unexpected handshake message".into(),
                    });
                }
            }
        }
        Ok(self.peer_params.is_some())
    }

    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError> {
        Ok(self.peer_params)
    }

    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<KeyChange> {
        match self.side {
            Side::Client => {
                if !self.hello_sent {
                    self.hello_sent = true;
                    buf.extend_from_slice(&Self::encode_params(MSG_CLIENT_HELLO, &self.params));
                    return None;
                }
                if self.peer_params.is_some() && self.keys_issued == 0 {
                    self.keys_issued = 1;
                    return Some(KeyChange::Handshake {
                        keys: self.keys_for(&HS_CLIENT_SECRET, &HS_SERVER_SECRET),
                    });
                }
                if self.keys_issued == 1 {
                    self.keys_issued = 2;
                    self.finished_sent = true;
                    self.complete = true;
                    buf.push(MSG_FINISHED);
                    buf.extend_from_slice(&0u16.to_be_bytes());
                    return Some(KeyChange::OneRtt {
                        keys: self.keys_for(&APP_CLIENT_SECRET, &APP_SERVER_SECRET),
                        next: self.advance_app_secrets(),
                    });
                }
                None
            }
            Side::Server => {
                if self.peer_params.is_some() && !self.hello_sent {
                    self.hello_sent = true;
                    buf.extend_from_slice(&Self::encode_params(MSG_SERVER_HELLO, &self.params));
                    return None;
                }
                if self.hello_sent && self.keys_issued == 0 {
                    self.keys_issued = 1;
                    return Some(KeyChange::Handshake {
                        keys: self.keys_for(&HS_CLIENT_SECRET, &HS_SERVER_SECRET),
                    });
                }
                if self.keys_issued == 1 {
                    self.keys_issued = 2;
                    return Some(KeyChange::OneRtt {
                        keys: self.keys_for(&APP_CLIENT_SECRET, &APP_SERVER_SECRET),
                        next: self.advance_app_secrets(),
                    });
                }
                None
            }
        }
    }

    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>> {
        if self.keys_issued < 2 {
            return None;
        }
        Some(self.advance_app_secrets())
    }

    fn early_crypto(&self) -> Option<(Box<dyn crypto::HeaderKey>, Box<dyn crypto::PacketKey>)> {
        None
    }

    fn early_data_accepted(&self) -> Option<bool> {
        None
    }
}

impl ScriptedSession {
    fn advance_app_secrets(&mut self) -> KeyPair<Box<dyn PacketKey>> {
        let next_client = update_secret(&self.app_secrets.0);
        let next_server = update_secret(&self.app_secrets.1);
        self.app_secrets = (next_client, next_server);
        let (local, remote) = match self.side {
            Side::Client => (&self.app_secrets.0, &self.app_secrets.1),
            Side::Server => (&self.app_secrets.1, &self.app_secrets.0),
        };
        packet_keys_from_secrets(Suite::Aes128Gcm, local, remote)
    }
}

/// A client and server endpoint joined by a lossless (unless told otherwise)
/// zero-latency network with a shared clock
pub struct Pair {
    pub client: Endpoint,
    pub server: Endpoint,
    pub client_ch: ConnectionHandle,
    pub server_ch: Option<ConnectionHandle>,
    pub time: Instant,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    /// Datagrams to drop, counted per direction (client-to-server, then reverse)
    pub drop_client_to_server: usize,
    pub drop_server_to_client: usize,
    server_params: TransportParameters,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default(), TransportConfig::default())
    }

    pub fn with_config(client_cfg: TransportConfig, server_cfg: TransportConfig) -> Self {
        let endpoint_config = Arc::new(EndpointConfig::default());
        let client_transport = Arc::new(client_cfg);
        let server_transport = Arc::new(server_cfg);
        let mut client = Endpoint::new(endpoint_config.clone(), client_transport.clone());
        let server = Endpoint::new(endpoint_config, server_transport.clone());
        let client_addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:4434".parse().unwrap();
        let time = Instant::now();

        let client_params =
            TransportParameters::new(&client_transport, &EndpointConfig::default());
        let server_params =
            TransportParameters::new(&server_transport, &EndpointConfig::default());
        let session = Box::new(ScriptedSession::new(Side::Client, client_params));
        let client_ch = client.connect(time, server_addr, session).unwrap();
        Self {
            client,
            server,
            client_ch,
            server_ch: None,
            time,
            client_addr,
            server_addr,
            drop_client_to_server: 0,
            drop_server_to_client: 0,
            server_params,
        }
    }

    pub fn client_conn(&mut self) -> &mut Connection {
        self.client.connection_mut(self.client_ch)
    }

    pub fn server_conn(&mut self) -> &mut Connection {
        let ch = self.server_ch.expect("server connection not yet created");
        self.server.connection_mut(ch)
    }

    /// Exchange packets and fire timers until nothing further happens
    pub fn drive(&mut self) {
        for _ in 0..2000 {
            if !self.step() {
                break;
            }
        }
    }

    /// One round of forwarding and timer processing; returns whether progress
    /// happened
    pub fn step(&mut self) -> bool {
        let mut progress = false;

        // Client to server
        let now = self.time;
        while let Some(transmit) = self.client.connection_mut(self.client_ch).poll_transmit(now, 16)
        {
            progress = true;
            for datagram in split_transmit(&transmit) {
                if self.drop_client_to_server > 0 {
                    self.drop_client_to_server -= 1;
                    continue;
                }
                let session = Box::new(ScriptedSession::new(Side::Server, self.server_params));
                match self.server.handle(
                    now,
                    self.client_addr,
                    None,
                    datagram,
                    Some(session),
                ) {
                    quill_proto::DatagramEvent::NewConnection(ch) => {
                        self.server_ch = Some(ch);
                    }
                    _ => {}
                }
            }
        }

        // Server to client
        if let Some(server_ch) = self.server_ch {
            while let Some(transmit) = self.server.connection_mut(server_ch).poll_transmit(now, 16)
            {
                progress = true;
                for datagram in split_transmit(&transmit) {
                    if self.drop_server_to_client > 0 {
                        self.drop_server_to_client -= 1;
                        continue;
                    }
                    self.client
                        .handle(now, self.server_addr, None, datagram, None);
                }
            }
        }

        if progress {
            return true;
        }

        // Nothing in flight: advance the clock to the next timer
        let mut next: Option<Instant> = self.client.connection_mut(self.client_ch).poll_timeout();
        if let Some(ch) = self.server_ch {
            let server_next = self.server.connection_mut(ch).poll_timeout();
            next = match (next, server_next) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        let Some(next) = next else {
            return false;
        };
        if next <= self.time {
            // Timer already due; fire it without moving the clock
        } else if next - self.time > Duration::from_secs(60) {
            // Nothing actionable in a reasonable horizon
            return false;
        } else {
            self.time = next;
        }
        let now = self.time;
        self.client.connection_mut(self.client_ch).handle_timeout(now);
        if let Some(ch) = self.server_ch {
            self.server.connection_mut(ch).handle_timeout(now);
        }
        true
    }

    /// Advance the clock without delivering anything
    pub fn jump_time(&mut self, duration: Duration) {
        self.time += duration;
        let now = self.time;
        self.client.connection_mut(self.client_ch).handle_timeout(now);
        if let Some(ch) = self.server_ch {
            self.server.connection_mut(ch).handle_timeout(now);
        }
    }

    /// Run the handshake to completion on both sides
    pub fn connect(&mut self) {
        self.drive();
        assert!(!self.client_conn().is_handshaking(), "client still handshaking");
        assert!(self.server_ch.is_some(), "server never saw the connection");
        assert!(!self.server_conn().is_handshaking(), "server still handshaking");
    }
}

fn split_transmit(transmit: &quill_proto::Transmit) -> Vec<BytesMut> {
    match transmit.segment_size {
        Some(size) => transmit
            .contents
            .chunks(size)
            .map(BytesMut::from)
            .collect(),
        None => vec![BytesMut::from(&transmit.contents[..])],
    }
}
