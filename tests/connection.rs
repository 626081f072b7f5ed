extern crate bytes;
#[macro_use]
extern crate assert_matches;
extern crate quic_endpoint;
#[macro_use]
extern crate slog;
extern crate slog_term;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use slog::{Drain, Logger};

use quic_endpoint::{
    frame, packet, ClientConfig, ClientState, Completion, Config, Connection, ConnectionError,
    Directionality, Endpoint, Frame, HandshakeHandle, InvalidState, NoopCertificateValidator,
    PacketSender, ServerConfig, ServerState, State, StreamId, StreamListener, TransportError,
};

fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator)
        .use_original_order()
        .build()
        .fuse();
    Logger::root(drain, o!())
}

fn certs() -> (Vec<Vec<u8>>, Vec<u8>) {
    (
        vec![include_bytes!("certs/cert.der").to_vec()],
        include_bytes!("certs/key.der").to_vec(),
    )
}

/// In-memory packet sender recording every datagram.
#[derive(Clone)]
struct Channel {
    queue: Rc<RefCell<VecDeque<(SocketAddrV6, Box<[u8]>)>>>,
    sizes: Rc<RefCell<Vec<usize>>>,
    destroyed: Rc<Cell<bool>>,
}

impl Channel {
    fn new() -> Self {
        Channel {
            queue: Rc::new(RefCell::new(VecDeque::new())),
            sizes: Rc::new(RefCell::new(Vec::new())),
            destroyed: Rc::new(Cell::new(false)),
        }
    }

    fn sent(&self) -> usize {
        self.sizes.borrow().len()
    }
}

impl PacketSender for Channel {
    fn send(&mut self, destination: SocketAddrV6, packet: Box<[u8]>) -> Completion {
        self.sizes.borrow_mut().push(packet.len());
        self.queue.borrow_mut().push_back((destination, packet));
        Completion::ready()
    }

    fn destroy(&mut self) -> Completion {
        self.destroyed.set(true);
        Completion::ready()
    }
}

#[derive(Default)]
struct Record {
    data: Vec<(StreamId, Vec<u8>, bool)>,
    resets: Vec<(StreamId, u16)>,
}

struct Recorder(Rc<RefCell<Record>>);

impl StreamListener for Recorder {
    fn on_data(&mut self, id: StreamId, data: Bytes, fin: bool) {
        self.0.borrow_mut().data.push((id, data.to_vec(), fin));
    }

    fn on_reset(&mut self, id: StreamId, error_code: u16) {
        self.0.borrow_mut().resets.push((id, error_code));
    }
}

struct Pair {
    client: Connection,
    client_channel: Channel,
    client_record: Rc<RefCell<Record>>,
    server: Endpoint,
    server_channel: Channel,
    server_record: Rc<RefCell<Record>>,
    client_addr: SocketAddrV6,
    server_addr: SocketAddrV6,
    now: u64,
}

impl Pair {
    fn new(validate_address: bool) -> Self {
        let log = logger();
        let client_addr = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 1111, 0, 0);
        let server_addr = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4433, 0, 0);

        let server_channel = Channel::new();
        let (chain, key) = certs();
        let server_record = Rc::new(RefCell::new(Record::default()));
        let record = server_record.clone();
        let server = Endpoint::new(
            log.new(o!("side" => "server")),
            Config {
                require_address_validation: validate_address,
                ..Config::default()
            },
            Some(ServerConfig::new(chain, key).unwrap()),
            Some(Box::new(move || {
                Box::new(Recorder(record.clone())) as Box<dyn StreamListener>
            })),
            Rc::new(RefCell::new(server_channel.clone())),
        );

        let client_channel = Channel::new();
        let client_record = Rc::new(RefCell::new(Record::default()));
        let client = Connection::new_client(
            log.new(o!("side" => "client")),
            Arc::new(Config::default()),
            ClientConfig::new("localhost", Arc::new(NoopCertificateValidator)).unwrap(),
            server_addr,
            Rc::new(RefCell::new(client_channel.clone())),
            Box::new(Recorder(client_record.clone())),
        ).unwrap();

        Pair {
            client,
            client_channel,
            client_record,
            server,
            server_channel,
            server_record,
            client_addr,
            server_addr,
            now: 1_000_000,
        }
    }

    /// Shuttle datagrams both ways until neither side has anything to say.
    fn drive(&mut self) {
        loop {
            let mut progressed = false;
            loop {
                let next = self.client_channel.queue.borrow_mut().pop_front();
                match next {
                    Some((destination, data)) => {
                        assert_eq!(destination, self.server_addr);
                        self.now += 1000;
                        self.server
                            .handle(self.now, self.client_addr, BytesMut::from(&data[..]));
                        progressed = true;
                    }
                    None => break,
                }
            }
            loop {
                let next = self.server_channel.queue.borrow_mut().pop_front();
                match next {
                    Some((_, data)) => {
                        self.now += 1000;
                        self.client.handle_datagram(self.now, BytesMut::from(&data[..]));
                        progressed = true;
                    }
                    None => break,
                }
            }
            if !progressed {
                return;
            }
        }
    }

    fn connect(&mut self) -> HandshakeHandle {
        let handle = self.client.handshake(self.now).unwrap();
        self.drive();
        handle
    }
}

#[test]
fn handshake() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    assert_eq!(pair.client.state(), State::Client(ClientState::Ready));
    let incoming = pair.server.accept().expect("an accepted connection");
    assert_eq!(
        pair.server.connection(incoming).state(),
        State::Server(ServerState::Ready),
    );
    // First flight was a padded Initial
    assert!(pair.client_channel.sizes.borrow()[0] >= 1200);
}

#[test]
fn handshake_is_not_restartable() {
    let mut pair = Pair::new(false);
    let _handle = pair.client.handshake(pair.now).unwrap();
    assert_matches!(pair.client.handshake(pair.now), Err(InvalidState));
}

#[test]
fn handshake_with_retry() {
    let mut pair = Pair::new(true);
    let original_cid = pair.client.remote_cid();
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    // The client adopted the CID the Retry advertised and revalidated
    assert_ne!(&pair.client.remote_cid()[..], &original_cid[..]);
    assert_eq!(pair.client.state(), State::Client(ClientState::Ready));
    let incoming = pair.server.accept().expect("an accepted connection");
    assert_eq!(
        pair.server.connection(incoming).state(),
        State::Server(ServerState::Ready),
    );
    // Both the first and the retried Initial were padded to the minimum size
    let sizes = pair.client_channel.sizes.borrow();
    assert!(sizes[0] >= 1200);
    assert!(sizes[1] >= 1200);
}

#[test]
fn stream_delivery_in_order() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    let now = pair.now;
    let (id, first, second) = {
        let conn = pair.server.connection_mut(incoming);
        let id = conn.open(Directionality::Uni).expect("stream within limits");
        let first = conn
            .write(now, id, Bytes::from_static(b"Hello"), false)
            .unwrap()
            .unwrap();
        let second = conn
            .write(now, id, Bytes::from_static(b"world"), true)
            .unwrap()
            .unwrap();
        (id, first, second)
    };
    assert!(second > first);
    pair.drive();

    assert_eq!(
        pair.client_record.borrow().data,
        vec![
            (id, b"Hello".to_vec(), false),
            (id, b"world".to_vec(), true),
        ],
    );
    // The ACKs covered both data packets and nothing is left outstanding
    let conn = pair.server.connection(incoming);
    assert_eq!(conn.largest_acked(), second);
    assert_eq!(conn.unacked_packets(), 0);
}

#[test]
fn stream_delivery_out_of_order() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    let now = pair.now;
    let (id, last) = {
        let conn = pair.server.connection_mut(incoming);
        let id = conn.open(Directionality::Uni).unwrap();
        conn.write(now, id, Bytes::from_static(b"Hello"), false)
            .unwrap();
        let last = conn
            .write(now, id, Bytes::from_static(b"world"), true)
            .unwrap()
            .unwrap();
        (id, last)
    };
    let first = pair.server_channel.queue.borrow_mut().pop_front().unwrap();
    let second = pair.server_channel.queue.borrow_mut().pop_front().unwrap();
    pair.client
        .handle_datagram(pair.now, BytesMut::from(&second.1[..]));
    assert!(pair.client_record.borrow().data.is_empty());
    pair.client
        .handle_datagram(pair.now, BytesMut::from(&first.1[..]));
    pair.drive();

    assert_eq!(
        pair.client_record.borrow().data,
        vec![
            (id, b"Hello".to_vec(), false),
            (id, b"world".to_vec(), true),
        ],
    );
    assert_eq!(pair.server.connection(incoming).largest_acked(), last);
    assert_eq!(pair.server.connection(incoming).unacked_packets(), 0);
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    let now = pair.now;
    let (id, pn) = {
        let conn = pair.server.connection_mut(incoming);
        let id = conn.open(Directionality::Uni).unwrap();
        let pn = conn
            .write(now, id, Bytes::from_static(b"once"), true)
            .unwrap()
            .unwrap();
        (id, pn)
    };
    let datagram = pair.server_channel.queue.borrow_mut().pop_front().unwrap();
    pair.client
        .handle_datagram(pair.now, BytesMut::from(&datagram.1[..]));
    pair.client
        .handle_datagram(pair.now, BytesMut::from(&datagram.1[..]));
    pair.drive();

    assert_eq!(
        pair.client_record.borrow().data,
        vec![(id, b"once".to_vec(), true)],
    );
    assert_eq!(pair.server.connection(incoming).largest_acked(), pn);
}

#[test]
fn ping_elicits_ack() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    let pn = pair.client.ping(pair.now).unwrap().unwrap();
    pair.drive();
    assert_eq!(pair.client.largest_acked(), pn);
    // No application callback for PING
    assert!(pair.server_record.borrow().data.is_empty());
    assert!(pair.server.connection(incoming).state().is_ready());
}

#[test]
fn peer_close() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    let now = pair.now;
    pair.server
        .connection_mut(incoming)
        .send(
            now,
            vec![Frame::ConnectionClose(frame::ConnectionClose {
                error_code: TransportError(123),
                frame_type: Some(frame::Type(0x08)),
                reason: Bytes::from_static(b"Closed"),
            })],
        )
        .unwrap();
    pair.drive();

    assert_eq!(pair.client.state(), State::Client(ClientState::Closed));
    assert!(pair.client_channel.destroyed.get());
    assert_matches!(pair.client.ping(pair.now), Err(InvalidState));
    assert_matches!(pair.client.send(pair.now, vec![Frame::Ping]), Err(InvalidState));
}

#[test]
fn version_negotiation_closes_without_sending() {
    let mut pair = Pair::new(false);
    let handle = pair.client.handshake(pair.now).unwrap();
    // Swallow the Initial and forge a VersionNegotiation in its place
    pair.client_channel.queue.borrow_mut().clear();
    let mut buf = Vec::new();
    packet::Header::VersionNegotiate {
        random: 0x2a,
        src_cid: pair.client.remote_cid(),
        dst_cid: pair.client.local_cid(),
    }.encode(&mut buf);
    buf.extend_from_slice(&[0xfa, 0xce, 0xb0, 0x0c]);

    let sent_before = pair.client_channel.sent();
    pair.client.handle_datagram(pair.now, BytesMut::from(&buf[..]));

    assert_eq!(pair.client.state(), State::Client(ClientState::Closed));
    assert_matches!(handle.poll(), Some(Err(ConnectionError::VersionMismatch)));
    assert!(pair.client_channel.destroyed.get());
    assert_eq!(pair.client_channel.sent(), sent_before);
}

#[test]
fn retransmission_recovers_lost_data() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    let id = pair.client.open(Directionality::Uni).unwrap();
    pair.client
        .write(pair.now, id, Bytes::from_static(b"lost data"), true)
        .unwrap();
    // The datagram never arrives
    pair.client_channel.queue.borrow_mut().clear();
    pair.drive();
    assert!(pair.server_record.borrow().data.is_empty());
    assert_eq!(pair.client.unacked_packets(), 1);

    let cutoff = pair.now + 1;
    pair.client
        .retransmit_unacked(pair.now, cutoff)
        .unwrap()
        .expect("a retransmission");
    pair.drive();

    assert_eq!(
        pair.server_record.borrow().data,
        vec![(id, b"lost data".to_vec(), true)],
    );
    assert_eq!(pair.client.unacked_packets(), 0);
    assert!(pair.server.connection(incoming).state().is_ready());
}

#[test]
fn bidirectional_echo() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    let id = pair.client.open(Directionality::Bi).unwrap();
    pair.client
        .write(pair.now, id, Bytes::from_static(b"ping"), true)
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.server_record.borrow().data,
        vec![(id, b"ping".to_vec(), true)],
    );

    let now = pair.now;
    pair.server
        .connection_mut(incoming)
        .write(now, id, Bytes::from_static(b"pong"), true)
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.client_record.borrow().data,
        vec![(id, b"pong".to_vec(), true)],
    );
}

#[test]
fn stream_reset_reaches_listener() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    let now = pair.now;
    let id = {
        let conn = pair.server.connection_mut(incoming);
        let id = conn.open(Directionality::Uni).unwrap();
        conn.write(now, id, Bytes::from_static(b"partial"), false)
            .unwrap();
        conn.send(
            now,
            vec![Frame::ResetStream(frame::ResetStream {
                id,
                error_code: 7,
                final_size: 7,
            })],
        ).unwrap();
        id
    };
    pair.drive();
    let record = pair.client_record.borrow();
    assert_eq!(record.resets, vec![(id, 7)]);
}

#[test]
fn idle_timeout_closes_silently() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));

    let deadline = pair.client.next_timeout().expect("an idle deadline");
    let sent_before = pair.client_channel.sent();
    pair.client.handle_timeout(deadline + 1);

    assert_eq!(pair.client.state(), State::Client(ClientState::Closed));
    assert!(pair.client_channel.destroyed.get());
    // No CONNECTION_CLOSE is emitted
    assert_eq!(pair.client_channel.sent(), sent_before);
}

#[test]
fn local_close_notifies_peer() {
    let mut pair = Pair::new(false);
    let handle = pair.connect();
    assert_matches!(handle.poll(), Some(Ok(())));
    let incoming = pair.server.accept().unwrap();

    pair.client.close(pair.now);
    assert_eq!(pair.client.state(), State::Client(ClientState::Closed));
    assert!(pair.client_channel.destroyed.get());
    pair.drive();
    assert_eq!(
        pair.server.connection(incoming).state(),
        State::Server(ServerState::Closed),
    );
}
