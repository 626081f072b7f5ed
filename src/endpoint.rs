use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use rand::rngs::OsRng;
use rand::Rng;
use rustls;
use slab::Slab;
use slog::Logger;

use coding::BufMutExt;
use connection::{ClientConfig, Connection, HandshakeHandle, InvalidState, PacketSender};
use crypto::{self, TokenKey, TLSError};
use packet::{ConnectionId, Header, PacketDecodeError, PartialDecode};
use stream::StreamListener;
use {StreamId, MAX_CID_SIZE, MIN_CID_SIZE, MIN_INITIAL_SIZE, VERSION};

/// Parameters governing the core QUIC state machine.
pub struct Config {
    /// Protocol version to advertise.
    pub version: u32,
    /// Initial connection-level flow control credit offered to the peer.
    pub initial_max_data: u64,
    /// Initial credit for bidirectional streams the peer opens.
    pub initial_max_stream_data_bidi_local: u64,
    /// Initial credit for bidirectional streams we open.
    pub initial_max_stream_data_bidi_remote: u64,
    /// Initial credit for unidirectional streams.
    pub initial_max_stream_data_uni: u64,
    /// Number of bidirectional streams the peer may open.
    pub initial_max_streams_bidi: u64,
    /// Number of unidirectional streams the peer may open.
    pub initial_max_streams_uni: u64,
    /// Maximum duration of inactivity to accept before timing out the
    /// connection (ms). The effective value is the minimum of this and the
    /// peer's own limit. 0 for none.
    pub max_idle_timeout: u64,
    /// Exponent the peer applies to encoded ACK delays.
    pub ack_delay_exponent: u8,
    /// Upper bound on intentional ACK delay (ms).
    pub max_ack_delay: u64,
    /// How many connection IDs issued for us the peer must retain.
    pub active_connection_id_limit: u64,
    /// Length of locally issued connection IDs. This must be either 0 or
    /// between 4 and 18 inclusive; zero-length IDs route by peer address.
    pub local_cid_len: usize,
    /// Whether a server challenges unvalidated addresses with a Retry.
    pub require_address_validation: bool,
    /// Validity window for Retry tokens (µs).
    pub retry_token_lifetime: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: VERSION,
            initial_max_data: 1024 * 1024,
            initial_max_stream_data_bidi_local: 256 * 1024,
            initial_max_stream_data_bidi_remote: 256 * 1024,
            initial_max_stream_data_uni: 128 * 1024,
            initial_max_streams_bidi: 32,
            initial_max_streams_uni: 32,
            max_idle_timeout: 10_000,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            active_connection_id_limit: 2,
            local_cid_len: 8,
            require_address_validation: false,
            retry_token_lifetime: 30 * 60 * 1_000_000,
        }
    }
}

/// Server-side credentials: a TLS configuration built from a DER
/// certificate chain (leaf first) and private key, plus the key with which
/// Retry tokens are signed.
pub struct ServerConfig {
    pub tls_config: Arc<rustls::ServerConfig>,
    pub token_key: Arc<TokenKey>,
}

impl ServerConfig {
    pub fn new(cert_chain: Vec<Vec<u8>>, private_key: Vec<u8>) -> Result<Self, EndpointError> {
        let mut rng = OsRng::new().unwrap();
        Ok(ServerConfig {
            tls_config: Arc::new(crypto::build_server_config(cert_chain, private_key)?),
            token_key: Arc::new(TokenKey::random(&mut rng)),
        })
    }
}

#[derive(Debug, Fail)]
pub enum EndpointError {
    #[fail(display = "failed to configure TLS: {}", _0)]
    Tls(TLSError),
}

impl From<TLSError> for EndpointError {
    fn from(x: TLSError) -> Self {
        EndpointError::Tls(x)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// Discards everything; stands in when a server has no listener factory.
struct NullListener;

impl StreamListener for NullListener {
    fn on_data(&mut self, _: StreamId, _: Bytes, _: bool) {}
    fn on_reset(&mut self, _: StreamId, _: u16) {}
}

/// Builds the stream listener handed to each accepted connection.
pub type ListenerFactory = Box<dyn FnMut() -> Box<dyn StreamListener>>;

/// Owns connections and routes datagrams to them by connection ID, falling
/// back to the peer address when local IDs are zero-length.
///
/// This object performs no I/O of its own: datagrams are fed in through
/// `handle`, and leave through the shared `PacketSender`.
pub struct Endpoint {
    log: Logger,
    rng: OsRng,
    config: Arc<Config>,
    server_config: Option<ServerConfig>,
    listener_factory: Option<ListenerFactory>,
    sender: Rc<RefCell<dyn PacketSender>>,
    connections: Slab<Connection>,
    connection_ids: FnvHashMap<ConnectionId, ConnectionHandle>,
    /// Connections indexed by the CID the client chose for its first Initial
    connection_ids_initial: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_remotes: FnvHashMap<SocketAddrV6, ConnectionHandle>,
    incoming: VecDeque<ConnectionHandle>,
}

impl Endpoint {
    pub fn new(
        log: Logger,
        config: Config,
        server_config: Option<ServerConfig>,
        listener_factory: Option<ListenerFactory>,
        sender: Rc<RefCell<dyn PacketSender>>,
    ) -> Self {
        assert!(
            config.local_cid_len == 0
                || (config.local_cid_len >= MIN_CID_SIZE && config.local_cid_len <= MAX_CID_SIZE)
        );
        Endpoint {
            log,
            rng: OsRng::new().unwrap(),
            config: Arc::new(config),
            server_config,
            listener_factory,
            sender,
            connections: Slab::new(),
            connection_ids: FnvHashMap::default(),
            connection_ids_initial: FnvHashMap::default(),
            connection_remotes: FnvHashMap::default(),
            incoming: VecDeque::new(),
        }
    }

    fn listen(&self) -> bool {
        self.server_config.is_some()
    }

    /// Initiate an outgoing connection. The handshake starts once
    /// `handshake` is invoked on the returned handle.
    pub fn connect(
        &mut self,
        remote: SocketAddrV6,
        client_config: ClientConfig,
        listener: Box<dyn StreamListener>,
    ) -> Result<ConnectionHandle, crypto::ConnectError> {
        let conn = Connection::new_client(
            self.log.clone(),
            self.config.clone(),
            client_config,
            remote,
            self.sender.clone(),
            listener,
        )?;
        let loc_cid = conn.local_cid();
        let handle = {
            let entry = self.connections.vacant_entry();
            let handle = ConnectionHandle(entry.key());
            entry.insert(conn);
            handle
        };
        if self.config.local_cid_len > 0 {
            self.connection_ids.insert(loc_cid, handle);
        }
        self.connection_remotes.insert(remote, handle);
        Ok(handle)
    }

    pub fn handshake(
        &mut self,
        now: u64,
        handle: ConnectionHandle,
    ) -> Result<HandshakeHandle, InvalidState> {
        self.connections[handle.0].handshake(now)
    }

    /// Take the next connection that has completed its handshake.
    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.incoming.pop_front()
    }

    pub fn connection(&self, handle: ConnectionHandle) -> &Connection {
        &self.connections[handle.0]
    }

    pub fn connection_mut(&mut self, handle: ConnectionHandle) -> &mut Connection {
        &mut self.connections[handle.0]
    }

    /// Process an incoming UDP datagram.
    pub fn handle(&mut self, now: u64, remote: SocketAddrV6, data: BytesMut) {
        let datagram_len = data.len();
        let mut data = data;
        loop {
            match PartialDecode::new(data, self.config.local_cid_len) {
                Ok(partial_decode) => {
                    match self.handle_decode(now, remote, partial_decode, datagram_len) {
                        Some(rest) => data = rest,
                        None => return,
                    }
                }
                Err(PacketDecodeError::UnsupportedVersion {
                    source,
                    destination,
                }) => {
                    if !self.listen() {
                        debug!(self.log, "dropping packet with unsupported version");
                        return;
                    }
                    trace!(self.log, "sending version negotiation");
                    let mut buf = Vec::new();
                    Header::VersionNegotiate {
                        random: self.rng.gen(),
                        src_cid: destination,
                        dst_cid: source,
                    }.encode(&mut buf);
                    buf.write::<u32>(self.config.version);
                    let _ = self.sender.borrow_mut().send(remote, buf.into());
                    return;
                }
                Err(e) => {
                    trace!(self.log, "unable to decode invariant header"; "reason" => %e);
                    return;
                }
            }
        }
    }

    fn handle_decode(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        partial_decode: PartialDecode,
        datagram_len: usize,
    ) -> Option<BytesMut> {
        let dst_cid = partial_decode.dst_cid();
        let known = {
            let by_cid = if self.config.local_cid_len > 0 {
                self.connection_ids.get(&dst_cid)
            } else {
                None
            };
            by_cid
                .or_else(|| self.connection_ids_initial.get(&dst_cid))
                .or_else(|| self.connection_remotes.get(&remote))
                .cloned()
        };
        if let Some(handle) = known {
            let rest = self.connections[handle.0].handle_decode(now, partial_decode);
            if self.connections[handle.0].poll_accept() {
                self.incoming.push_back(handle);
            }
            return rest;
        }

        if !self.listen() {
            debug!(self.log, "dropping packet for unrecognized connection";
                   "dst_cid" => %dst_cid);
            return None;
        }
        if !partial_decode.is_initial() {
            debug!(self.log, "ignoring non-initial packet for unknown connection";
                   "dst_cid" => %dst_cid);
            return None;
        }
        if datagram_len < MIN_INITIAL_SIZE {
            debug!(self.log, "ignoring short initial"; "dst_cid" => %dst_cid);
            return None;
        }
        let rem_cid = match partial_decode.src_cid() {
            Some(cid) => cid,
            None => return None,
        };

        let loc_cid = self.new_cid();
        let listener: Box<dyn StreamListener> = match self.listener_factory {
            Some(ref mut factory) => factory(),
            None => Box::new(NullListener),
        };
        let server_config = self.server_config.as_ref().unwrap();
        let conn = Connection::new_server(
            self.log.clone(),
            self.config.clone(),
            server_config.tls_config.clone(),
            server_config.token_key.clone(),
            dst_cid,
            loc_cid,
            rem_cid,
            remote,
            self.sender.clone(),
            listener,
        );
        let handle = {
            let entry = self.connections.vacant_entry();
            let handle = ConnectionHandle(entry.key());
            entry.insert(conn);
            handle
        };
        self.connection_ids_initial.insert(dst_cid, handle);
        if self.config.local_cid_len > 0 {
            self.connection_ids.insert(loc_cid, handle);
        }
        self.connection_remotes.insert(remote, handle);
        trace!(self.log, "accepting initial"; "dst_cid" => %dst_cid, "loc_cid" => %loc_cid);
        self.connections[handle.0].handle_decode(now, partial_decode)
    }

    /// Drop all state for a connection. Call once the application is done
    /// with a closed connection.
    pub fn forget(&mut self, handle: ConnectionHandle) {
        {
            let conn = &self.connections[handle.0];
            self.connection_ids_initial.remove(&conn.init_cid());
            if self.config.local_cid_len > 0 {
                self.connection_ids.remove(&conn.local_cid());
            }
            self.connection_remotes.remove(conn.remote_address());
        }
        self.connections.remove(handle.0);
    }

    fn new_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(&mut self.rng, self.config.local_cid_len);
            if !self.connection_ids.contains_key(&cid) {
                break cid;
            }
            assert!(self.config.local_cid_len > 0);
        }
    }
}
