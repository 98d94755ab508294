use std::{
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    config::{EndpointConfig, TransportConfig},
    connection::Connection,
    crypto,
    packet::PartialDecode,
    shared::{ConnectionId, EcnCodepoint},
    transport_parameters::TransportParameters,
    Side, MIN_INITIAL_SIZE,
};

/// Internal identifier for a `Connection` currently associated with an endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

/// Outcome of feeding a datagram to [`Endpoint::handle`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DatagramEvent {
    /// The datagram was routed to an existing connection
    Routed(ConnectionHandle),
    /// A new incoming connection was created
    NewConnection(ConnectionHandle),
    /// The datagram was dropped
    Dropped,
}

/// Errors in the parameters being used to create a new connection
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConnectError {
    /// The given server name was malformed
    #[error("invalid remote address")]
    InvalidRemoteAddress,
    /// No more connections may be created
    #[error("endpoint capacity exhausted")]
    TooManyConnections,
}

/// Errors encountered while admitting an incoming connection
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum AcceptError {
    /// The initial packet was malformed or too small
    #[error("invalid initial packet")]
    InvalidPacket,
    /// The packet used an unsupported QUIC version
    #[error("unsupported version")]
    UnsupportedVersion,
}

/// The part of the protocol state shared by a set of connections
///
/// Admits new connections and hands datagrams to the right connection by
/// destination CID. Large deployments route CIDs to connection workers in their own
/// infrastructure; this endpoint covers the single-socket case and keeps the
/// connection core honest about its boundaries.
pub struct Endpoint {
    config: Arc<EndpointConfig>,
    transport: Arc<TransportConfig>,
    connections: Slab<Connection>,
    cids: FxHashMap<ConnectionId, usize>,
}

impl Endpoint {
    pub fn new(config: Arc<EndpointConfig>, transport: Arc<TransportConfig>) -> Self {
        Self {
            config,
            transport,
            connections: Slab::new(),
            cids: FxHashMap::default(),
        }
    }

    /// Initiate a connection to `remote` using `session` for the handshake
    pub fn connect(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        session: Box<dyn crypto::Session>,
    ) -> Result<ConnectionHandle, ConnectError> {
        let mut rng = rand::rng();
        let local_cid = ConnectionId::random(&mut rng, self.config.local_cid_len);
        // The first destination CID is a placeholder; it seeds the Initial keys
        let rem_cid = ConnectionId::random(&mut rng, 8);
        let mut params = TransportParameters::new(&self.transport, &self.config);
        params.initial_src_cid = Some(local_cid);
        let version = *self
            .config
            .supported_versions
            .first()
            .expect("at least one supported version");
        let conn = Connection::new(
            &self.config,
            self.transport.clone(),
            Side::Client,
            version,
            local_cid,
            rem_cid,
            remote,
            session,
            params,
            now,
        );
        let index = self.connections.insert(conn);
        self.cids.insert(local_cid, index);
        trace!(%local_cid, %remote, "connecting");
        Ok(ConnectionHandle(index))
    }

    /// Process an incoming datagram
    ///
    /// `accept_session` supplies the handshake object for a new incoming
    /// connection; pass `None` on pure-client endpoints.
    pub fn handle(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
        accept_session: Option<Box<dyn crypto::Session>>,
    ) -> DatagramEvent {
        let (dst_cid, is_initial) = match PartialDecode::new(data.clone(), self.config.local_cid_len)
        {
            Ok((partial, _)) => (partial.dst_cid(), partial.is_initial()),
            Err(e) => {
                trace!("dropping unparseable datagram: {e}");
                return DatagramEvent::Dropped;
            }
        };
        if let Some(&index) = self.cids.get(&dst_cid) {
            self.connections[index].handle_datagram(now, remote, ecn, data);
            return DatagramEvent::Routed(ConnectionHandle(index));
        }
        // A fresh Initial for an unknown CID is a new connection attempt
        if is_initial {
            if let Some(session) = accept_session {
                return match self.accept(now, remote, ecn, data, session) {
                    Ok(handle) => DatagramEvent::NewConnection(handle),
                    Err(e) => {
                        debug!("refusing incoming connection: {e}");
                        DatagramEvent::Dropped
                    }
                };
            }
        }
        // CIDs issued after the handshake are routed externally in a real
        // deployment; with a single connection we can still do the right thing
        if self.connections.len() == 1 {
            let (index, conn) = self.connections.iter_mut().next().unwrap();
            conn.handle_datagram(now, remote, ecn, data);
            return DatagramEvent::Routed(ConnectionHandle(index));
        }
        trace!("dropping datagram for unknown connection");
        DatagramEvent::Dropped
    }

    fn accept(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
        session: Box<dyn crypto::Session>,
    ) -> Result<ConnectionHandle, AcceptError> {
        let (partial, _) = PartialDecode::new(data.clone(), self.config.local_cid_len)
            .map_err(|_| AcceptError::InvalidPacket)?;
        if !partial.is_initial() {
            return Err(AcceptError::InvalidPacket);
        }
        // Clients must fill their first flight to prove they can send
        if data.len() < MIN_INITIAL_SIZE as usize {
            return Err(AcceptError::InvalidPacket);
        }
        let version = partial.version().ok_or(AcceptError::InvalidPacket)?;
        if !self.config.supported_versions.contains(&version) {
            return Err(AcceptError::UnsupportedVersion);
        }
        // The client's chosen destination CID seeds the Initial keys and serves as
        // our CID until we issue fresh ones
        let orig_dst_cid = partial.dst_cid();
        let mut params = TransportParameters::new(&self.transport, &self.config);
        params.original_dst_cid = Some(orig_dst_cid);
        params.initial_src_cid = Some(orig_dst_cid);
        let mut token = [0u8; crate::RESET_TOKEN_SIZE];
        let mut signature = vec![0u8; self.config.reset_key.signature_len()];
        self.config.reset_key.sign(&orig_dst_cid, &mut signature);
        token.copy_from_slice(&signature[..crate::RESET_TOKEN_SIZE]);
        params.stateless_reset_token = Some(token.into());

        let mut conn = Connection::new(
            &self.config,
            self.transport.clone(),
            Side::Server,
            version,
            orig_dst_cid,
            // Learned from the packet's source CID when it is processed
            ConnectionId::new(&[]),
            remote,
            session,
            params,
            now,
        );
        conn.handle_datagram(now, remote, ecn, data);
        let index = self.connections.insert(conn);
        self.cids.insert(orig_dst_cid, index);
        trace!(cid = %orig_dst_cid, %remote, "incoming connection");
        Ok(ConnectionHandle(index))
    }

    /// Access a connection by handle
    pub fn connection_mut(&mut self, handle: ConnectionHandle) -> &mut Connection {
        &mut self.connections[handle.0]
    }

    /// Drop a connection whose drain period has ended
    pub fn remove(&mut self, handle: ConnectionHandle) {
        if self.connections.contains(handle.0) {
            let conn = self.connections.remove(handle.0);
            self.cids.retain(|_, &mut index| index != handle.0);
            debug_assert!(conn.is_drained() || conn.is_closed());
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
