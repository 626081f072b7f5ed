use std::cell::{Cell, RefCell};
use std::cmp;
use std::collections::BTreeMap;
use std::mem;
use std::net::SocketAddrV6;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rand::rngs::OsRng;
use rustls;
use slog::Logger;

use crypto::{self, Crypto, EncryptionLevel, TlsSession, TokenKey};
use endpoint::Config;
use flow::{FlowControl, FrameSender, NoopFlowControl, SendDecision};
use frame::{self, Frame};
use packet::{
    set_payload_length, ConnectionId, Header, LongType, Packet, PacketNumber, PartialDecode,
    AEAD_TAG_SIZE,
};
use range_set::RangeSet;
use stream::{Assembler, StreamListener, StreamManager};
use transport_parameters::TransportParameters;
use {Directionality, Side, StreamId, TransportError, MAX_CID_SIZE, MIN_INITIAL_SIZE};

/// First packet number assigned in each send direction.
const INITIAL_PACKET_NUMBER: u64 = 1;

/// Ensures all pending ACKs always fit in a single minimum-MTU packet.
const MAX_ACK_BLOCKS: usize = 64;

/// Largest CRYPTO chunk placed in a single packet.
const MAX_CRYPTO_CHUNK: usize = 1024;

/// Transmits encrypted datagrams on behalf of one or more connections.
///
/// Implementations must tolerate concurrent sends if shared between
/// connections; a single connection itself never is.
pub trait PacketSender {
    fn send(&mut self, destination: SocketAddrV6, packet: Box<[u8]>) -> Completion;
    fn destroy(&mut self) -> Completion;
}

/// One-shot completion handle for an asynchronous operation.
#[derive(Clone)]
pub struct Completion(Rc<Cell<bool>>);

impl Completion {
    /// An already-completed handle, for synchronous senders.
    pub fn ready() -> Self {
        Completion(Rc::new(Cell::new(true)))
    }

    pub fn pending() -> (Completion, Signal) {
        let state = Rc::new(Cell::new(false));
        (Completion(state.clone()), Signal(state))
    }

    pub fn is_complete(&self) -> bool {
        self.0.get()
    }
}

/// Completes the `Completion` it was created with.
pub struct Signal(Rc<Cell<bool>>);

impl Signal {
    pub fn complete(self) {
        self.0.set(true);
    }
}

/// One-shot handle resolving when the handshake reaches Ready, or failing
/// with the reason the connection closed first.
#[derive(Clone, Debug)]
pub struct HandshakeHandle(Rc<RefCell<Option<Result<(), ConnectionError>>>>);

impl HandshakeHandle {
    pub fn poll(&self) -> Option<Result<(), ConnectionError>> {
        self.0.borrow().clone()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    BeforeInitial,
    BeforeHello,
    BeforeHandshake,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerState {
    Started,
    BeforeReady,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Client(ClientState),
    Server(ServerState),
}

impl State {
    pub fn is_ready(&self) -> bool {
        match *self {
            State::Client(ClientState::Ready) | State::Server(ServerState::Ready) => true,
            _ => false,
        }
    }

    /// Whether the connection refuses further sends.
    pub fn is_closed(&self) -> bool {
        match *self {
            State::Client(ClientState::Closing)
            | State::Client(ClientState::Closed)
            | State::Server(ServerState::Closing)
            | State::Server(ServerState::Closed) => true,
            _ => false,
        }
    }
}

/// Reasons why a connection was lost.
#[derive(Debug, Clone, Fail)]
pub enum ConnectionError {
    /// The peer doesn't implement the supported version.
    #[fail(display = "peer doesn't implement any supported version")]
    VersionMismatch,
    /// The connection was closed for a transport-level error, locally
    /// detected or reported by the peer.
    #[fail(display = "{}", error_code)]
    TransportError { error_code: TransportError },
    /// The peer's QUIC stack aborted the connection.
    #[fail(display = "aborted by peer: {}", reason)]
    ConnectionClosed { reason: frame::ConnectionClose },
    /// The peer's application closed the connection.
    #[fail(display = "closed by peer application: {}", reason)]
    ApplicationClosed { reason: frame::ApplicationClose },
    /// The peer has become unreachable.
    #[fail(display = "timed out")]
    TimedOut,
}

impl From<TransportError> for ConnectionError {
    fn from(error_code: TransportError) -> Self {
        ConnectionError::TransportError { error_code }
    }
}

/// Returned by operations invoked in a state that does not permit them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Fail)]
#[fail(display = "operation not allowed in the current connection state")]
pub struct InvalidState;

/// Client-side connection parameters.
#[derive(Clone)]
pub struct ClientConfig {
    pub server_name: String,
    pub tls_config: Arc<rustls::ClientConfig>,
}

impl ClientConfig {
    pub fn new(
        server_name: &str,
        validator: Arc<dyn crypto::CertificateValidator>,
    ) -> Result<Self, crypto::TLSError> {
        Ok(ClientConfig {
            server_name: server_name.into(),
            tls_config: Arc::new(crypto::build_client_config(validator)?),
        })
    }
}

/// A packet retained until acknowledged.
struct SentPacket {
    time: u64,
    level: EncryptionLevel,
    /// Frames to re-emit if the packet is declared lost; ACK-only packets
    /// hold nothing
    frames: Vec<Frame>,
}

/// Retains sent packets for retransmission and received packet numbers for
/// ACK synthesis, per encryption level.
struct PacketBuffer {
    sent: BTreeMap<u64, SentPacket>,
    received: [RangeSet; 3],
    largest_acked: u64,
}

impl PacketBuffer {
    fn new() -> Self {
        PacketBuffer {
            sent: BTreeMap::new(),
            received: [RangeSet::new(), RangeSet::new(), RangeSet::new()],
            largest_acked: 0,
        }
    }

    fn on_packet_sent(
        &mut self,
        number: u64,
        level: EncryptionLevel,
        frames: Vec<Frame>,
        time: u64,
    ) {
        self.sent.insert(
            number,
            SentPacket {
                time,
                level,
                frames,
            },
        );
    }

    /// Record a received packet number. Re-receipt is a no-op.
    fn on_packet_received(&mut self, level: EncryptionLevel, number: u64) -> bool {
        let set = &mut self.received[level.index()];
        let fresh = set.insert_one(number);
        if set.len() > MAX_ACK_BLOCKS {
            set.pop_min();
        }
        fresh
    }

    fn has_acks(&self, level: EncryptionLevel) -> bool {
        !self.received[level.index()].is_empty()
    }

    /// Drain the received set for inclusion in an outgoing ACK.
    fn take_acks(&mut self, level: EncryptionLevel) -> RangeSet {
        mem::replace(&mut self.received[level.index()], RangeSet::new())
    }

    /// Everything at or below the largest acknowledged number is delivered.
    fn on_ack_received(&mut self, ack: &frame::Ack) {
        self.largest_acked = cmp::max(self.largest_acked, ack.largest);
        let delivered = self
            .sent
            .range(..=self.largest_acked)
            .map(|(&n, _)| n)
            .collect::<Vec<_>>();
        for number in delivered {
            self.sent.remove(&number);
        }
    }

    /// Remove packets sent before `cutoff` and collect their frames for
    /// re-emission.
    fn take_unacked_sent_before(&mut self, cutoff: u64) -> Vec<Frame> {
        let stale = self
            .sent
            .iter()
            .filter(|&(_, info)| info.time < cutoff && !info.frames.is_empty())
            .map(|(&n, _)| n)
            .collect::<Vec<_>>();
        let mut frames = Vec::new();
        for number in stale {
            frames.extend(self.sent.remove(&number).unwrap().frames);
        }
        frames
    }

    /// Handshake completion renders Initial/Handshake packets moot.
    fn retire_handshake(&mut self) {
        let stale = self
            .sent
            .iter()
            .filter(|&(_, info)| info.level != EncryptionLevel::OneRtt)
            .map(|(&n, _)| n)
            .collect::<Vec<_>>();
        for number in stale {
            self.sent.remove(&number);
        }
        self.received[EncryptionLevel::Initial.index()] = RangeSet::new();
        self.received[EncryptionLevel::Handshake.index()] = RangeSet::new();
    }
}

/// A QUIC connection: the root entity owning identifiers, keys, the TLS
/// session, the packet buffer, and the streams.
///
/// Inbound datagrams enter through `handle_datagram` (directly or routed by
/// an `Endpoint`); outbound frames leave through `send` and the stream
/// helpers. Everything runs on the caller's task; the idle timer is polled
/// through `next_timeout` / `handle_timeout`.
pub struct Connection {
    log: Logger,
    side: Side,
    config: Arc<Config>,
    state: State,
    /// Destination CID of the first Initial packet
    init_cid: ConnectionId,
    loc_cid: ConnectionId,
    rem_cid: ConnectionId,
    rem_cid_set: bool,
    remote: SocketAddrV6,
    sender: Rc<RefCell<dyn PacketSender>>,
    tls: Option<TlsSession>,
    client_config: Option<ClientConfig>,
    initial_crypto: Crypto,
    handshake_crypto: Option<Crypto>,
    one_rtt_crypto: Option<Crypto>,
    next_packet_number: u64,
    largest_rx_packet: u64,
    rx_packet_time: u64,
    buffer: PacketBuffer,
    streams: StreamManager,
    flow: Box<dyn FlowControl>,
    crypto_recv: [Assembler; 3],
    crypto_out_offset: [u64; 3],
    /// Token to include in Initial packets (client, set by Retry)
    token: Bytes,
    /// The client accepts exactly one Retry
    retried: bool,
    /// The server issued a Retry for this connection
    did_retry: bool,
    handshake: Rc<RefCell<Option<Result<(), ConnectionError>>>>,
    ready_reported: bool,
    /// Peer transport parameters
    params: TransportParameters,
    idle_deadline: Option<u64>,
    /// Frames held back by the flow-control hook
    deferred: Vec<Frame>,
    /// Frames to piggyback on the next 1-RTT packet
    pending_frames: Vec<Frame>,
    server_crypto: Option<Arc<rustls::ServerConfig>>,
    token_key: Option<Arc<TokenKey>>,
}

impl Connection {
    /// Create a client connection. The handshake does not begin until
    /// `handshake` is invoked.
    pub fn new_client(
        log: Logger,
        config: Arc<Config>,
        client_config: ClientConfig,
        remote: SocketAddrV6,
        sender: Rc<RefCell<dyn PacketSender>>,
        listener: Box<dyn StreamListener>,
    ) -> Result<Self, crypto::ConnectError> {
        let mut rng = OsRng::new().unwrap();
        let loc_cid = ConnectionId::random(&mut rng, config.local_cid_len);
        let rem_cid = ConnectionId::random(&mut rng, MAX_CID_SIZE);
        let tls = TlsSession::new_client(
            &client_config.tls_config,
            &client_config.server_name,
            &TransportParameters::new(&config),
        )?;
        let log = log.new(o!("connection" => loc_cid));
        let mut this = Connection::new_common(
            log,
            config,
            Side::Client,
            rem_cid,
            loc_cid,
            rem_cid,
            remote,
            sender,
            listener,
        );
        this.tls = Some(tls);
        this.client_config = Some(client_config);
        Ok(this)
    }

    /// Create a server connection for a peer's first Initial packet. The
    /// TLS session is built lazily, once a valid token (if one is required)
    /// has been presented.
    pub fn new_server(
        log: Logger,
        config: Arc<Config>,
        server_crypto: Arc<rustls::ServerConfig>,
        token_key: Arc<TokenKey>,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddrV6,
        sender: Rc<RefCell<dyn PacketSender>>,
        listener: Box<dyn StreamListener>,
    ) -> Self {
        let log = log.new(o!("connection" => loc_cid));
        let mut this = Connection::new_common(
            log,
            config,
            Side::Server,
            init_cid,
            loc_cid,
            rem_cid,
            remote,
            sender,
            listener,
        );
        this.rem_cid_set = true;
        this.server_crypto = Some(server_crypto);
        this.token_key = Some(token_key);
        this
    }

    fn new_common(
        log: Logger,
        config: Arc<Config>,
        side: Side,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddrV6,
        sender: Rc<RefCell<dyn PacketSender>>,
        listener: Box<dyn StreamListener>,
    ) -> Self {
        let initial_crypto = Crypto::new_initial(&init_cid, side);
        let streams = StreamManager::new(
            log.clone(),
            side,
            config.initial_max_streams_bidi,
            config.initial_max_streams_uni,
            listener,
        );
        Connection {
            log,
            side,
            config,
            state: match side {
                Side::Client => State::Client(ClientState::BeforeInitial),
                Side::Server => State::Server(ServerState::Started),
            },
            init_cid,
            loc_cid,
            rem_cid,
            rem_cid_set: false,
            remote,
            sender,
            tls: None,
            client_config: None,
            initial_crypto,
            handshake_crypto: None,
            one_rtt_crypto: None,
            next_packet_number: INITIAL_PACKET_NUMBER,
            largest_rx_packet: 0,
            rx_packet_time: 0,
            buffer: PacketBuffer::new(),
            streams,
            flow: Box::new(NoopFlowControl),
            crypto_recv: [Assembler::new(), Assembler::new(), Assembler::new()],
            crypto_out_offset: [0; 3],
            token: Bytes::new(),
            retried: false,
            did_retry: false,
            handshake: Rc::new(RefCell::new(None)),
            ready_reported: false,
            params: TransportParameters::default(),
            idle_deadline: None,
            deferred: Vec::new(),
            pending_frames: Vec::new(),
            server_crypto: None,
            token_key: None,
        }
    }

    /// Replace the flow-control hook. The default applies no limits.
    pub fn set_flow_control(&mut self, flow: Box<dyn FlowControl>) {
        self.flow = flow;
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.loc_cid
    }

    /// Destination CID of the first Initial packet; the server's routing
    /// key until the client learns its real CID.
    pub fn init_cid(&self) -> ConnectionId {
        self.init_cid
    }

    pub fn remote_cid(&self) -> ConnectionId {
        self.rem_cid
    }

    pub fn remote_address(&self) -> &SocketAddrV6 {
        &self.remote
    }

    /// The largest packet number the peer has acknowledged.
    pub fn largest_acked(&self) -> u64 {
        self.buffer.largest_acked
    }

    /// Packets sent but not yet acknowledged.
    pub fn unacked_packets(&self) -> usize {
        self.buffer.sent.len()
    }

    pub(crate) fn poll_accept(&mut self) -> bool {
        if self.state.is_ready() && !self.ready_reported {
            self.ready_reported = true;
            true
        } else {
            false
        }
    }

    /// Begin the client handshake: send an Initial packet carrying the
    /// ClientHello, padded so the datagram meets the minimum size.
    ///
    /// Fails with `InvalidState` unless this is a client connection that
    /// has not yet started.
    pub fn handshake(&mut self, now: u64) -> Result<HandshakeHandle, InvalidState> {
        match self.state {
            State::Client(ClientState::BeforeInitial) => {}
            _ => return Err(InvalidState),
        }
        trace!(self.log, "starting handshake"; "rem_cid" => %self.rem_cid);
        self.state = State::Client(ClientState::BeforeHello);
        if let Err(e) = self.drive_tls(now) {
            self.close_on_error(now, e);
        }
        Ok(HandshakeHandle(self.handshake.clone()))
    }

    /// Send application frames in a single packet at the highest available
    /// encryption level.
    ///
    /// Returns the packet number used, or `None` if the flow-control hook
    /// deferred the packet.
    pub fn send(&mut self, now: u64, frames: Vec<Frame>) -> Result<Option<u64>, InvalidState> {
        if self.state.is_closed() {
            return Err(InvalidState);
        }
        let level = self.highest_level();
        Ok(self.send_packet_at(now, level, frames, false))
    }

    /// Create a fresh locally-initiated stream.
    pub fn open(&mut self, directionality: Directionality) -> Option<StreamId> {
        self.streams.open(directionality)
    }

    /// Transmit data on a stream.
    ///
    /// # Panics
    /// - when applied to a stream without an active outgoing channel
    pub fn write(
        &mut self,
        now: u64,
        id: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<Option<u64>, InvalidState> {
        if self.state.is_closed() {
            return Err(InvalidState);
        }
        let frame = self.streams.write(id, data, fin);
        let level = self.highest_level();
        Ok(self.send_packet_at(now, level, vec![Frame::Stream(frame)], false))
    }

    /// Seal the send side of a stream.
    pub fn finish(&mut self, now: u64, id: StreamId) -> Result<Option<u64>, InvalidState> {
        self.write(now, id, Bytes::new(), true)
    }

    pub fn ping(&mut self, now: u64) -> Result<Option<u64>, InvalidState> {
        self.send(now, vec![Frame::Ping])
    }

    /// Re-emit the frames of unacknowledged packets sent before `cutoff`
    /// at the current highest encryption level. When to call this is the
    /// caller's loss-recovery policy.
    pub fn retransmit_unacked(
        &mut self,
        now: u64,
        cutoff: u64,
    ) -> Result<Option<u64>, InvalidState> {
        if self.state.is_closed() {
            return Err(InvalidState);
        }
        let frames = self.buffer.take_unacked_sent_before(cutoff);
        if frames.is_empty() {
            return Ok(None);
        }
        trace!(self.log, "retransmitting unacked frames"; "count" => frames.len());
        let level = self.highest_level();
        Ok(self.send_packet_at(now, level, frames, false))
    }

    /// Close the connection, notifying the peer.
    pub fn close(&mut self, now: u64) {
        self.close_inner(
            now,
            Frame::ConnectionClose(frame::ConnectionClose {
                error_code: TransportError::NO_ERROR,
                frame_type: None,
                reason: Bytes::new(),
            }),
            ConnectionError::TransportError {
                error_code: TransportError::NO_ERROR,
            },
        );
    }

    /// Close the connection with an application error.
    pub fn close_with(&mut self, now: u64, error_code: u16, reason: Bytes) {
        let frame = frame::ApplicationClose { error_code, reason };
        self.close_inner(
            now,
            Frame::ApplicationClose(frame.clone()),
            ConnectionError::ApplicationClosed { reason: frame },
        );
    }

    /// Absolute time (µs) at which `handle_timeout` should next run, if any.
    pub fn next_timeout(&self) -> Option<u64> {
        self.idle_deadline
    }

    /// Close silently if the idle deadline has expired.
    pub fn handle_timeout(&mut self, now: u64) {
        if let Some(deadline) = self.idle_deadline {
            if now >= deadline && !self.state.is_closed() {
                debug!(self.log, "idle timeout expired");
                self.transition_closed(ConnectionError::TimedOut);
            }
        }
    }

    /// Process a UDP datagram, which may hold several coalesced packets.
    pub fn handle_datagram(&mut self, now: u64, data: BytesMut) {
        let mut data = data;
        loop {
            match PartialDecode::new(data, self.loc_cid.len()) {
                Ok(partial_decode) => match self.handle_decode(now, partial_decode) {
                    Some(rest) => data = rest,
                    None => return,
                },
                Err(e) => {
                    trace!(self.log, "unable to decode packet"; "reason" => %e);
                    return;
                }
            }
        }
    }

    pub(crate) fn handle_decode(
        &mut self,
        now: u64,
        partial_decode: PartialDecode,
    ) -> Option<BytesMut> {
        let level = partial_decode.level();
        let (packet, rest) = {
            let crypto = match level {
                Some(EncryptionLevel::Initial) => Some(&self.initial_crypto),
                Some(EncryptionLevel::Handshake) => match self.handshake_crypto {
                    Some(ref crypto) => Some(crypto),
                    None => {
                        trace!(self.log, "dropping packet; no handshake keys yet");
                        return None;
                    }
                },
                Some(EncryptionLevel::OneRtt) => match self.one_rtt_crypto {
                    Some(ref crypto) => Some(crypto),
                    None => {
                        trace!(self.log, "dropping packet; no 1-rtt keys yet");
                        return None;
                    }
                },
                None => None,
            };
            match partial_decode.finish(crypto) {
                Ok(x) => x,
                Err(e) => {
                    trace!(self.log, "unable to complete packet decoding"; "reason" => %e);
                    return None;
                }
            }
        };
        self.handle_packet(now, packet, level);
        rest
    }

    fn handle_packet(&mut self, now: u64, mut packet: Packet, level: Option<EncryptionLevel>) {
        let number = match packet.header.number() {
            Some(truncated) => {
                let number = truncated.expand(self.largest_rx_packet + 1);
                let decrypted = {
                    let crypto = match level.unwrap() {
                        EncryptionLevel::Initial => &self.initial_crypto,
                        EncryptionLevel::Handshake => self.handshake_crypto.as_ref().unwrap(),
                        EncryptionLevel::OneRtt => self.one_rtt_crypto.as_ref().unwrap(),
                    };
                    crypto.decrypt(number, &packet.header_data, &mut packet.payload)
                };
                if decrypted.is_err() {
                    debug!(self.log, "failed to authenticate packet"; "pn" => number);
                    return;
                }
                self.buffer.on_packet_received(level.unwrap(), number);
                if number > self.largest_rx_packet {
                    self.largest_rx_packet = number;
                    self.rx_packet_time = now;
                }
                self.reset_idle_timeout(now);
                trace!(self.log, "packet authenticated"; "pn" => number);
                Some(number)
            }
            None => None,
        };

        let result = match self.state {
            State::Client(s) => self.handle_client(now, s, packet, number),
            State::Server(s) => self.handle_server(now, s, packet, number),
        };
        match result {
            Ok(new_state) => {
                if !self.state.is_closed() {
                    self.state = new_state;
                }
            }
            Err(e) => {
                warn!(self.log, "connection error"; "error" => %e);
                self.close_on_error(now, e);
            }
        }
    }

    fn handle_client(
        &mut self,
        now: u64,
        state: ClientState,
        packet: Packet,
        number: Option<u64>,
    ) -> Result<State, TransportError> {
        use self::ClientState::*;
        let Packet {
            header, payload, ..
        } = packet;
        match (state, header) {
            (
                BeforeHello,
                Header::Retry {
                    src_cid,
                    orig_dst_cid,
                    ..
                },
            ) => {
                if self.retried {
                    trace!(self.log, "ignoring second retry");
                    return Ok(State::Client(BeforeHello));
                }
                if orig_dst_cid[..] != self.rem_cid[..] {
                    trace!(self.log, "retry original CID mismatch; dropping");
                    return Ok(State::Client(BeforeHello));
                }
                trace!(self.log, "got retry"; "rem_cid" => %src_cid);
                self.retried = true;
                self.rem_cid = src_cid;
                self.token = payload.freeze();
                self.initial_crypto = Crypto::new_initial(&self.rem_cid, Side::Client);
                self.next_packet_number = INITIAL_PACKET_NUMBER;
                self.buffer = PacketBuffer::new();
                self.crypto_recv = [Assembler::new(), Assembler::new(), Assembler::new()];
                self.crypto_out_offset = [0; 3];
                let client_config = self.client_config.clone().unwrap();
                self.tls = Some(
                    TlsSession::new_client(
                        &client_config.tls_config,
                        &client_config.server_name,
                        &TransportParameters::new(&self.config),
                    ).map_err(|_| TransportError::INTERNAL_ERROR)?,
                );
                self.drive_tls(now)?;
                Ok(State::Client(BeforeHello))
            }
            (BeforeHello, Header::VersionNegotiate { .. }) => {
                debug!(self.log, "remote doesn't support our version");
                self.transition_closed(ConnectionError::VersionMismatch);
                Ok(State::Client(Closed))
            }
            (BeforeHello, Header::Initial { src_cid, .. }) => {
                if !self.rem_cid_set {
                    trace!(self.log, "got remote connection id"; "rem_cid" => %src_cid);
                    self.rem_cid = src_cid;
                    self.rem_cid_set = true;
                }
                if self.process_crypto_payload(now, EncryptionLevel::Initial, payload)? {
                    return Ok(State::Client(Closed));
                }
                if self.handshake_crypto.is_some() {
                    trace!(self.log, "got ServerHello");
                    Ok(State::Client(BeforeHandshake))
                } else {
                    Ok(State::Client(BeforeHello))
                }
            }
            (
                BeforeHandshake,
                Header::Long {
                    ty: LongType::Handshake,
                    ..
                },
            ) => {
                if self.process_crypto_payload(now, EncryptionLevel::Handshake, payload)? {
                    return Ok(State::Client(Closed));
                }
                let handshaking = self.tls.as_ref().unwrap().is_handshaking();
                if !handshaking && self.one_rtt_crypto.is_some() {
                    self.on_ready(now)?;
                    Ok(State::Client(Ready))
                } else {
                    Ok(State::Client(BeforeHandshake))
                }
            }
            (Ready, Header::Short { .. }) => {
                if self.process_payload(now, number.unwrap(), payload)? {
                    Ok(State::Client(Closed))
                } else {
                    Ok(State::Client(Ready))
                }
            }
            (state, header) => {
                trace!(self.log, "dropping unexpected packet"; "state" => ?state,
                       "header" => ?header);
                Ok(State::Client(state))
            }
        }
    }

    fn handle_server(
        &mut self,
        now: u64,
        state: ServerState,
        packet: Packet,
        number: Option<u64>,
    ) -> Result<State, TransportError> {
        use self::ServerState::*;
        let Packet {
            header, payload, ..
        } = packet;
        match (state, header) {
            (Started, Header::Initial { token, .. }) => {
                if self.config.require_address_validation {
                    let valid = {
                        let key = self.token_key.as_ref().unwrap();
                        !token.is_empty()
                            && key.validate(
                                &self.remote,
                                &token,
                                now,
                                self.config.retry_token_lifetime,
                            )
                    };
                    if !valid {
                        trace!(self.log, "sending retry"; "rem_cid" => %self.rem_cid);
                        self.send_retry(now);
                        self.did_retry = true;
                        // The client's next Initial targets our CID
                        self.initial_crypto = Crypto::new_initial(&self.loc_cid, Side::Server);
                        self.buffer = PacketBuffer::new();
                        return Ok(State::Server(Started));
                    }
                }
                if self.tls.is_none() {
                    let mut params = TransportParameters::new(&self.config);
                    if self.did_retry {
                        params.original_connection_id = Some(self.init_cid);
                    }
                    let server_crypto = self.server_crypto.clone().unwrap();
                    self.tls = Some(
                        TlsSession::new_server(&server_crypto, &params)
                            .map_err(|_| TransportError::INTERNAL_ERROR)?,
                    );
                }
                if self.process_crypto_payload(now, EncryptionLevel::Initial, payload)? {
                    return Ok(State::Server(Closed));
                }
                if self.one_rtt_crypto.is_some() {
                    if let Some(params) = self.tls.as_ref().unwrap().transport_parameters()? {
                        self.streams.apply_params(&params);
                        self.flow.on_transport_parameters(&params);
                        self.params = params;
                    }
                    trace!(self.log, "sent server flight");
                    Ok(State::Server(BeforeReady))
                } else {
                    Ok(State::Server(Started))
                }
            }
            (
                BeforeReady,
                Header::Long {
                    ty: LongType::Handshake,
                    ..
                },
            ) => {
                if self.process_crypto_payload(now, EncryptionLevel::Handshake, payload)? {
                    return Ok(State::Server(Closed));
                }
                if !self.tls.as_ref().unwrap().is_handshaking() {
                    trace!(self.log, "client finished");
                    self.on_ready(now)?;
                    Ok(State::Server(Ready))
                } else {
                    Ok(State::Server(BeforeReady))
                }
            }
            (Ready, Header::Short { .. }) => {
                if self.process_payload(now, number.unwrap(), payload)? {
                    Ok(State::Server(Closed))
                } else {
                    Ok(State::Server(Ready))
                }
            }
            (state, header) => {
                trace!(self.log, "dropping unexpected packet"; "state" => ?state,
                       "header" => ?header);
                Ok(State::Server(state))
            }
        }
    }

    /// Handle the payload of an Initial or Handshake packet: reassemble the
    /// CRYPTO stream, feed the TLS session, and transmit whatever it
    /// produces. Returns whether the peer closed the connection.
    fn process_crypto_payload(
        &mut self,
        now: u64,
        level: EncryptionLevel,
        payload: BytesMut,
    ) -> Result<bool, TransportError> {
        for frame in frame::Iter::new(payload.freeze()) {
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack(ack) => {
                    if ack.largest >= self.next_packet_number {
                        debug!(self.log, "peer acked an unsent packet"; "largest" => ack.largest);
                        return Err(TransportError::PROTOCOL_VIOLATION);
                    }
                    self.buffer.on_ack_received(&ack);
                }
                Frame::Crypto(c) => {
                    self.crypto_recv[level.index()].insert(c.offset, c.data)?;
                }
                Frame::ConnectionClose(reason) => {
                    self.handle_peer_close(now, ConnectionError::ConnectionClosed { reason });
                    return Ok(true);
                }
                Frame::ApplicationClose(reason) => {
                    self.handle_peer_close(now, ConnectionError::ApplicationClosed { reason });
                    return Ok(true);
                }
                Frame::Invalid(ty) => {
                    debug!(self.log, "ignoring undecodable remainder"; "type" => %ty);
                }
                frame => {
                    debug!(self.log, "unexpected frame in handshake packet"; "type" => %frame.ty());
                    return Err(TransportError::PROTOCOL_VIOLATION);
                }
            }
        }
        self.feed_tls(level)?;
        self.drive_tls(now)?;
        Ok(false)
    }

    /// Drain contiguous CRYPTO-stream bytes into the TLS session.
    fn feed_tls(&mut self, level: EncryptionLevel) -> Result<(), TransportError> {
        loop {
            let chunk = match self.crypto_recv[level.index()].read() {
                Some(chunk) => chunk,
                None => break,
            };
            match self.tls {
                Some(ref mut tls) => tls.read_handshake(&chunk)?,
                None => return Err(TransportError::INTERNAL_ERROR),
            }
        }
        Ok(())
    }

    /// Transmit pending TLS output and install keys as they appear.
    fn drive_tls(&mut self, now: u64) -> Result<(), TransportError> {
        loop {
            let mut out = Vec::new();
            let keys = match self.tls {
                Some(ref mut tls) => tls.write_handshake(&mut out),
                None => return Ok(()),
            };
            // Output produced after the handshake concluded (e.g. tickets)
            // belongs in the 1-RTT space; during the handshake, bytes go
            // out at the highest level whose keys were installed before
            // they were written.
            let handshaking = self.tls.as_ref().map_or(true, |tls| tls.is_handshaking());
            let level = if self.one_rtt_crypto.is_some() && !handshaking {
                EncryptionLevel::OneRtt
            } else if self.handshake_crypto.is_some() {
                EncryptionLevel::Handshake
            } else {
                EncryptionLevel::Initial
            };
            if !out.is_empty() {
                self.send_crypto(now, level, out);
            }
            match keys {
                Some(crypto::NewKeys::Handshake(crypto)) => {
                    trace!(self.log, "handshake keys ready");
                    debug_assert!(self.handshake_crypto.is_none());
                    self.handshake_crypto = Some(crypto);
                }
                Some(crypto::NewKeys::OneRtt(crypto)) => {
                    trace!(self.log, "1-rtt keys ready");
                    debug_assert!(self.one_rtt_crypto.is_none());
                    self.one_rtt_crypto = Some(crypto);
                }
                None => break,
            }
        }
        Ok(())
    }

    fn send_crypto(&mut self, now: u64, level: EncryptionLevel, data: Vec<u8>) {
        let mut data = Bytes::from(data);
        loop {
            let chunk = data.split_to(cmp::min(data.len(), MAX_CRYPTO_CHUNK));
            let offset = self.crypto_out_offset[level.index()];
            self.crypto_out_offset[level.index()] += chunk.len() as u64;
            let pad = level == EncryptionLevel::Initial && self.side == Side::Client;
            self.send_packet_at(
                now,
                level,
                vec![Frame::Crypto(frame::Crypto {
                    offset,
                    data: chunk,
                })],
                pad,
            );
            if data.is_empty() {
                break;
            }
        }
    }

    /// Handle a 1-RTT payload: frames pass through the packet buffer, the
    /// stream manager, and finally the flow-control hook. Returns whether
    /// the peer closed the connection.
    fn process_payload(
        &mut self,
        now: u64,
        number: u64,
        payload: BytesMut,
    ) -> Result<bool, TransportError> {
        let frames = frame::Iter::new(payload.freeze()).collect::<Vec<_>>();
        let mut ack_eliciting = false;
        for frame in &frames {
            match *frame {
                Frame::Padding => {}
                _ => {
                    trace!(self.log, "got frame"; "pn" => number, "type" => %frame.ty());
                }
            }
            if frame.is_ack_eliciting() {
                ack_eliciting = true;
            }
        }
        for frame in &frames {
            match *frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack(ref ack) => {
                    if ack.largest >= self.next_packet_number {
                        debug!(self.log, "peer acked an unsent packet"; "largest" => ack.largest);
                        return Err(TransportError::PROTOCOL_VIOLATION);
                    }
                    self.buffer.on_ack_received(ack);
                }
                Frame::Crypto(ref c) => {
                    // Post-handshake TLS messages, e.g. ticket delivery
                    self.crypto_recv[EncryptionLevel::OneRtt.index()]
                        .insert(c.offset, c.data.clone())?;
                    self.feed_tls(EncryptionLevel::OneRtt)?;
                    self.drive_tls(now)?;
                }
                Frame::Stream(ref s) => self.streams.on_stream(s.clone())?,
                Frame::ResetStream(ref r) => self.streams.on_reset(r.clone())?,
                Frame::MaxStreams {
                    directionality,
                    count,
                } => self.streams.on_max_streams(directionality, count),
                Frame::MaxData(_) | Frame::MaxStreamData { .. } => {
                    // Credit updates are the flow-control hook's concern
                }
                Frame::PathChallenge(token) => {
                    self.pending_frames.push(Frame::PathResponse(token));
                }
                Frame::PathResponse(_) => {
                    debug!(self.log, "unsolicited PATH_RESPONSE");
                    return Err(TransportError::PROTOCOL_VIOLATION);
                }
                Frame::ConnectionClose(ref reason) => {
                    self.handle_peer_close(
                        now,
                        ConnectionError::ConnectionClosed {
                            reason: reason.clone(),
                        },
                    );
                    return Ok(true);
                }
                Frame::ApplicationClose(ref reason) => {
                    self.handle_peer_close(
                        now,
                        ConnectionError::ApplicationClosed {
                            reason: reason.clone(),
                        },
                    );
                    return Ok(true);
                }
                Frame::Invalid(ty) => {
                    debug!(self.log, "ignoring undecodable remainder"; "type" => %ty);
                }
                _ => {
                    trace!(self.log, "ignoring frame"; "type" => %frame.ty());
                }
            }
        }
        let mut injected = FrameSender::new();
        self.flow.on_receive_packet(&frames, &mut injected);
        self.pending_frames.extend(injected.into_frames());
        if ack_eliciting || !self.pending_frames.is_empty() {
            let level = self.highest_level();
            self.send_packet_at(now, level, Vec::new(), false);
        }
        if !self.deferred.is_empty() {
            let frames = mem::replace(&mut self.deferred, Vec::new());
            let level = self.highest_level();
            self.send_packet_at(now, level, frames, false);
        }
        Ok(false)
    }

    fn highest_level(&self) -> EncryptionLevel {
        if self.one_rtt_crypto.is_some() {
            EncryptionLevel::OneRtt
        } else if self.handshake_crypto.is_some() {
            EncryptionLevel::Handshake
        } else {
            EncryptionLevel::Initial
        }
    }

    /// Assemble, protect, and transmit one packet: flow-control hook, ACK
    /// prepend, packet-number assignment, encryption, buffering.
    fn send_packet_at(
        &mut self,
        now: u64,
        level: EncryptionLevel,
        mut frames: Vec<Frame>,
        pad: bool,
    ) -> Option<u64> {
        let mut injected = FrameSender::new();
        let decision = self.flow.before_send_packet(&frames, &mut injected);
        frames.extend(injected.into_frames());
        if decision == SendDecision::Defer {
            trace!(self.log, "packet deferred by flow control");
            self.deferred.extend(frames);
            return None;
        }
        if level == EncryptionLevel::OneRtt && !self.pending_frames.is_empty() {
            let mut extra = mem::replace(&mut self.pending_frames, Vec::new());
            frames.append(&mut extra);
        }
        if frames.is_empty() && !self.buffer.has_acks(level) && !pad {
            return None;
        }

        let number = self.next_packet_number;
        self.next_packet_number += 1;
        let pn = PacketNumber::new(number, self.buffer.largest_acked);
        let header = match level {
            EncryptionLevel::Initial => Header::Initial {
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                token: self.token.clone(),
                number: pn,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: LongType::Handshake,
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                number: pn,
            },
            EncryptionLevel::OneRtt => Header::Short {
                dst_cid: self.rem_cid,
                number: pn,
                key_phase: false,
            },
        };
        let mut buf = Vec::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();

        let acks = self.buffer.take_acks(level);
        if !acks.is_empty() {
            let delay = now.saturating_sub(self.rx_packet_time) >> self.config.ack_delay_exponent;
            trace!(self.log, "sending ACK"; "ranges" => ?acks.iter().collect::<Vec<_>>());
            frame::Ack::encode(delay, &acks, &mut buf);
        }
        for frame in &frames {
            frame.encode(&mut buf);
        }
        if pad && buf.len() < MIN_INITIAL_SIZE - AEAD_TAG_SIZE {
            buf.resize(MIN_INITIAL_SIZE - AEAD_TAG_SIZE, 0);
        }
        // Header protection samples 4 bytes past the packet number
        while buf.len() < header_len + 4 {
            buf.push(0);
        }
        if level != EncryptionLevel::OneRtt {
            set_payload_length(&mut buf, header_len, pn.len());
        }
        {
            let crypto = match level {
                EncryptionLevel::Initial => &self.initial_crypto,
                EncryptionLevel::Handshake => self.handshake_crypto.as_ref().unwrap(),
                EncryptionLevel::OneRtt => self.one_rtt_crypto.as_ref().unwrap(),
            };
            crypto.encrypt(number, &mut buf, header_len);
            partial_encode.finish(&mut buf, crypto);
        }
        trace!(self.log, "sending packet"; "pn" => number, "level" => %level, "len" => buf.len());
        let retransmits = frames
            .into_iter()
            .filter(|frame| frame.is_ack_eliciting())
            .collect::<Vec<_>>();
        if !retransmits.is_empty() {
            // ACK-only packets are never themselves acknowledged, so
            // retaining them would leak
            self.buffer.on_packet_sent(number, level, retransmits, now);
        }
        let _ = self.sender.borrow_mut().send(self.remote, buf.into());
        self.reset_idle_timeout(now);
        Some(number)
    }

    fn send_retry(&mut self, now: u64) {
        let token = {
            let key = self.token_key.as_ref().unwrap();
            key.generate(&self.remote, now)
        };
        let header = Header::Retry {
            src_cid: self.loc_cid,
            dst_cid: self.rem_cid,
            orig_dst_cid: self.init_cid,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.extend_from_slice(&token);
        let _ = self.sender.borrow_mut().send(self.remote, buf.into());
    }

    /// The handshake has completed: adopt the peer's parameters, retire the
    /// handshake spaces, and resolve the handshake handle.
    fn on_ready(&mut self, now: u64) -> Result<(), TransportError> {
        let params = match self.tls.as_ref().unwrap().transport_parameters()? {
            Some(params) => params,
            None => {
                debug!(self.log, "peer didn't send transport parameters");
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR);
            }
        };
        self.streams.apply_params(&params);
        self.flow.on_transport_parameters(&params);
        self.params = params;
        self.buffer.retire_handshake();
        if self.handshake.borrow().is_none() {
            *self.handshake.borrow_mut() = Some(Ok(()));
        }
        self.reset_idle_timeout(now);
        trace!(self.log, "connection established");
        Ok(())
    }

    fn handle_peer_close(&mut self, now: u64, reason: ConnectionError) {
        debug!(self.log, "connection closed by peer"; "reason" => %reason);
        // The closing packet is ACKed; nothing else is sent in reply
        let level = self.highest_level();
        self.send_packet_at(now, level, Vec::new(), false);
        self.state = match self.side {
            Side::Client => State::Client(ClientState::Closing),
            Side::Server => State::Server(ServerState::Closing),
        };
        self.transition_closed(reason);
    }

    fn close_inner(&mut self, now: u64, frame: Frame, reason: ConnectionError) {
        if self.state.is_closed() {
            return;
        }
        trace!(self.log, "closing connection");
        self.state = match self.side {
            Side::Client => State::Client(ClientState::Closing),
            Side::Server => State::Server(ServerState::Closing),
        };
        let level = self.highest_level();
        self.send_packet_at(now, level, vec![frame], false);
        self.transition_closed(reason);
    }

    fn close_on_error(&mut self, now: u64, error: TransportError) {
        self.close_inner(
            now,
            Frame::ConnectionClose(frame::ConnectionClose {
                error_code: error,
                frame_type: None,
                reason: Bytes::new(),
            }),
            ConnectionError::TransportError { error_code: error },
        );
    }

    fn transition_closed(&mut self, reason: ConnectionError) {
        self.state = match self.side {
            Side::Client => State::Client(ClientState::Closed),
            Side::Server => State::Server(ServerState::Closed),
        };
        if self.handshake.borrow().is_none() {
            *self.handshake.borrow_mut() = Some(Err(reason));
        }
        self.idle_deadline = None;
        let _ = self.sender.borrow_mut().destroy();
    }

    fn reset_idle_timeout(&mut self, now: u64) {
        if self.state.is_closed() {
            return;
        }
        let local = self.config.max_idle_timeout;
        let peer = self.params.max_idle_timeout;
        let timeout = if local == 0 || peer == 0 {
            cmp::max(local, peer)
        } else {
            cmp::min(local, peer)
        };
        self.idle_deadline = if timeout == 0 {
            None
        } else {
            Some(now + timeout * 1000)
        };
    }
}
