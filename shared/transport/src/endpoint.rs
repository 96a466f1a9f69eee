//! The transport endpoint: one UDP socket, a peer table, and the poll loop
//! that turns datagrams into listener callbacks.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::connection::{ConnState, Connection, CONNECT_RETRY_INTERVAL, MAX_CONNECT_ATTEMPTS};
use crate::frame::Frame;
use crate::{
    DisconnectReason, EventListener, NoopTransportMetrics, Reliability, TransportError,
    TransportErrorKind, TransportMetrics,
};

/// Transport-level handle of one connection. Stable for the lifetime of the
/// transport; never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub struct TransportConfig {
    /// Socket address to bind. Use port 0 for an ephemeral (client) socket.
    pub listen: SocketAddr,
    /// Shared key checked during the connect handshake.
    pub connection_key: String,
    pub metrics: Arc<dyn TransportMetrics>,
}

impl TransportConfig {
    pub fn new(listen: SocketAddr, connection_key: impl Into<String>) -> TransportConfig {
        TransportConfig {
            listen,
            connection_key: connection_key.into(),
            metrics: Arc::new(NoopTransportMetrics),
        }
    }
}

struct PeerSlot {
    id: PeerId,
    conn: Connection,
}

enum Event {
    Requested(SocketAddr),
    Connected(PeerId, SocketAddr),
    Disconnected(PeerId, SocketAddr, DisconnectReason),
    Receive(PeerId, SocketAddr, Bytes, Reliability),
    Error(Option<SocketAddr>, TransportErrorKind),
}

struct Inner {
    socket: UdpSocket,
    local_addr: SocketAddr,
    connection_key: String,
    metrics: Arc<dyn TransportMetrics>,

    peers: HashMap<SocketAddr, PeerSlot>,
    by_id: HashMap<PeerId, SocketAddr>,
    pending_requests: HashSet<SocketAddr>,
    next_peer_id: u64,

    events: VecDeque<Event>,
    recv_buf: Box<[u8]>,
    stopped: bool,
}

/// The UDP transport. Single-threaded; all callbacks fire from [`poll`].
///
/// [`poll`]: Transport::poll
pub struct Transport {
    inner: Rc<RefCell<Inner>>,
}

impl Transport {
    /// Bind the socket. Failure here is fatal to the host.
    pub fn start(config: TransportConfig) -> Result<Transport, TransportError> {
        let socket = UdpSocket::bind(config.listen).map_err(|source| TransportError::Bind {
            addr: config.listen,
            source,
        })?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        debug!(%local_addr, "transport bound");

        Ok(Transport {
            inner: Rc::new(RefCell::new(Inner {
                socket,
                local_addr,
                connection_key: config.connection_key,
                metrics: config.metrics,
                peers: HashMap::new(),
                by_id: HashMap::new(),
                pending_requests: HashSet::new(),
                next_peer_id: 1,
                events: VecDeque::new(),
                recv_buf: vec![0u8; 64 * 1024].into_boxed_slice(),
                stopped: false,
            })),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.borrow().local_addr
    }

    /// Drain the socket, run timers, invoke listener callbacks, then flush
    /// the per-peer send queues. Never blocks.
    pub fn poll(&self, listener: &mut dyn EventListener) {
        let now = Instant::now();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.stopped {
                return;
            }
            inner.drain_socket(now);
            inner.tick(now);
        }

        loop {
            let event = self.inner.borrow_mut().events.pop_front();
            let Some(event) = event else { break };
            match event {
                Event::Requested(addr) => listener.connection_requested(ConnectionRequest {
                    addr,
                    inner: self.inner.clone(),
                    decided: false,
                }),
                Event::Connected(id, addr) => listener.peer_connected(self.make_peer(id, addr)),
                Event::Disconnected(id, addr, reason) => {
                    listener.peer_disconnected(self.make_peer(id, addr), reason)
                }
                Event::Receive(id, addr, data, class) => {
                    listener.receive(self.make_peer(id, addr), data, class)
                }
                Event::Error(endpoint, kind) => listener.error(endpoint, kind),
            }
        }

        self.inner.borrow_mut().flush(Instant::now());
    }

    /// Begin an outbound connection. The listener later sees either
    /// `peer_connected` or `peer_disconnected(ConnectFailed)`.
    pub fn connect(&self, remote: SocketAddr) -> Result<Peer, TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
            return Err(TransportError::Stopped);
        }
        if let Some(slot) = inner.peers.get(&remote) {
            let id = slot.id;
            drop(inner);
            return Ok(self.make_peer(id, remote));
        }

        let now = Instant::now();
        let id = inner.alloc_peer_id();
        let mut conn = Connection::new(ConnState::Connecting, now);
        conn.connect_attempts = 1;
        conn.next_connect_attempt = now + CONNECT_RETRY_INTERVAL;
        let request = Frame::ConnectRequest {
            key: inner.connection_key.clone(),
        };
        conn.queue_frame(request.encode());
        inner.peers.insert(remote, PeerSlot { id, conn });
        inner.by_id.insert(id, remote);
        inner.flush(now);
        drop(inner);
        Ok(self.make_peer(id, remote))
    }

    /// Close every peer and release the socket. Outbound queues are flushed
    /// on a best-effort basis.
    pub fn stop(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
            return;
        }
        for slot in inner.peers.values_mut() {
            if slot.conn.state == ConnState::Connected {
                slot.conn.queue_frame(Frame::Disconnect.encode());
            }
        }
        inner.flush(Instant::now());
        inner.peers.clear();
        inner.by_id.clear();
        inner.pending_requests.clear();
        inner.events.clear();
        inner.stopped = true;
        debug!("transport stopped");
    }

    fn make_peer(&self, id: PeerId, addr: SocketAddr) -> Peer {
        Peer {
            id,
            addr,
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle to one live connection. Cheap to clone; owned by the transport,
/// the application holds only references.
#[derive(Clone)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    inner: Weak<RefCell<Inner>>,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue one message for transmission. Never blocks; the frame leaves
    /// with the next poll cycle.
    pub fn send(&self, data: &[u8], class: Reliability) -> Result<(), TransportError> {
        let inner = self.inner.upgrade().ok_or(TransportError::Stopped)?;
        let mut inner = inner.borrow_mut();
        if inner.stopped {
            return Err(TransportError::Stopped);
        }
        let addr = *inner.by_id.get(&self.id).ok_or(TransportError::NotConnected)?;
        let now = Instant::now();
        let slot = inner.peers.get_mut(&addr).ok_or(TransportError::NotConnected)?;
        if slot.conn.state != ConnState::Connected {
            return Err(TransportError::NotConnected);
        }
        slot.conn.enqueue_message(data, class, now)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

/// An inbound connection awaiting the host's admission decision. Dropping
/// the request without deciding rejects it.
pub struct ConnectionRequest {
    addr: SocketAddr,
    inner: Rc<RefCell<Inner>>,
    decided: bool,
}

impl ConnectionRequest {
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn accept(mut self) -> Peer {
        self.decided = true;
        let id = self.inner.borrow_mut().accept_request(self.addr, Instant::now());
        Peer {
            id,
            addr: self.addr,
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn reject(mut self) {
        self.decided = true;
        self.inner.borrow_mut().reject_request(self.addr);
    }
}

impl Drop for ConnectionRequest {
    fn drop(&mut self) {
        if !self.decided {
            self.inner.borrow_mut().reject_request(self.addr);
        }
    }
}

impl Inner {
    fn alloc_peer_id(&mut self) -> PeerId {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        id
    }

    fn drain_socket(&mut self, now: Instant) {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, addr)) => {
                    self.metrics.rx_packet(len);
                    let datagram = Bytes::copy_from_slice(&self.recv_buf[..len]);
                    self.process_datagram(addr, datagram, now);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                // A previous send to a dead endpoint can surface here as a
                // reset; the peer will time out on its own schedule.
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!(error = %e, "socket receive failed");
                    break;
                }
            }
        }
    }

    fn process_datagram(&mut self, addr: SocketAddr, datagram: Bytes, now: Instant) {
        let Some(frame) = Frame::decode(datagram) else {
            self.events
                .push_back(Event::Error(Some(addr), TransportErrorKind::MalformedDatagram));
            return;
        };

        if let Some(slot) = self.peers.get_mut(&addr) {
            slot.conn.last_ingress = now;
            let id = slot.id;
            match frame {
                Frame::ConnectRequest { .. } => {
                    // Our accept datagram was lost; answer again.
                    if slot.conn.state == ConnState::Connected {
                        slot.conn.queue_frame(Frame::ConnectAccept.encode());
                    }
                }
                Frame::ConnectAccept => {
                    if slot.conn.state == ConnState::Connecting {
                        slot.conn.state = ConnState::Connected;
                        self.events.push_back(Event::Connected(id, addr));
                    }
                }
                Frame::ConnectReject => {
                    if slot.conn.state == ConnState::Connecting {
                        self.remove_peer(addr);
                        self.events.push_back(Event::Disconnected(
                            id,
                            addr,
                            DisconnectReason::ConnectFailed,
                        ));
                    }
                }
                Frame::Disconnect => {
                    self.remove_peer(addr);
                    self.events
                        .push_back(Event::Disconnected(id, addr, DisconnectReason::Remote));
                }
                Frame::Ping => slot.conn.queue_frame(Frame::Pong.encode()),
                Frame::Pong => {}
                Frame::Data {
                    class,
                    seq,
                    frag_index,
                    frag_count,
                    payload,
                } => {
                    let mut delivered = Vec::new();
                    slot.conn
                        .on_data(class, seq, frag_index, frag_count, payload, &mut delivered);
                    for (data, class) in delivered {
                        self.events.push_back(Event::Receive(id, addr, data, class));
                    }
                }
                Frame::Ack { class, seq } => slot.conn.on_ack(class, seq),
            }
        } else {
            match frame {
                Frame::ConnectRequest { key } => {
                    if key != self.connection_key {
                        trace!(%addr, "connect request with wrong key");
                        self.send_raw(addr, &Frame::ConnectReject.encode());
                        return;
                    }
                    // One admission event per endpoint, however often the
                    // request datagram is repeated.
                    if self.pending_requests.insert(addr) {
                        self.events.push_back(Event::Requested(addr));
                    }
                }
                // Stray traffic from an endpoint we no longer know.
                _ => trace!(%addr, "datagram from unknown endpoint dropped"),
            }
        }
    }

    fn accept_request(&mut self, addr: SocketAddr, now: Instant) -> PeerId {
        self.pending_requests.remove(&addr);
        if let Some(slot) = self.peers.get(&addr) {
            return slot.id;
        }
        let id = self.alloc_peer_id();
        let mut conn = Connection::new(ConnState::Connected, now);
        conn.queue_frame(Frame::ConnectAccept.encode());
        self.peers.insert(addr, PeerSlot { id, conn });
        self.by_id.insert(id, addr);
        self.events.push_back(Event::Connected(id, addr));
        debug!(%addr, peer = %id, "peer accepted");
        id
    }

    fn reject_request(&mut self, addr: SocketAddr) {
        self.pending_requests.remove(&addr);
        self.send_raw(addr, &Frame::ConnectReject.encode());
    }

    fn remove_peer(&mut self, addr: SocketAddr) {
        if let Some(slot) = self.peers.remove(&addr) {
            self.by_id.remove(&slot.id);
        }
    }

    fn tick(&mut self, now: Instant) {
        let mut dropped: Vec<(SocketAddr, PeerId, DisconnectReason)> = Vec::new();

        for (addr, slot) in self.peers.iter_mut() {
            match slot.conn.state {
                ConnState::Connecting => {
                    if now >= slot.conn.next_connect_attempt {
                        if slot.conn.connect_attempts >= MAX_CONNECT_ATTEMPTS {
                            dropped.push((*addr, slot.id, DisconnectReason::ConnectFailed));
                            continue;
                        }
                        slot.conn.connect_attempts += 1;
                        slot.conn.next_connect_attempt = now + CONNECT_RETRY_INTERVAL;
                        let request = Frame::ConnectRequest {
                            key: self.connection_key.clone(),
                        };
                        slot.conn.queue_frame(request.encode());
                    }
                }
                ConnState::Connected => {
                    if let Some(reason) = slot.conn.tick(now) {
                        dropped.push((*addr, slot.id, reason));
                    }
                }
            }
        }

        for (addr, id, reason) in dropped {
            self.remove_peer(addr);
            self.events.push_back(Event::Disconnected(id, addr, reason));
        }
    }

    fn flush(&mut self, now: Instant) {
        let socket = &self.socket;
        let metrics = &self.metrics;
        let events = &mut self.events;

        for (addr, slot) in self.peers.iter_mut() {
            while let Some(encoded) = slot.conn.front_outgoing() {
                match socket.send_to(encoded, *addr) {
                    Ok(sent) => {
                        metrics.tx_packet(sent);
                        slot.conn.last_egress = now;
                        slot.conn.pop_outgoing();
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                    Err(e) => {
                        // Reliable frames come back via retransmission; the
                        // peer stays alive until its timers say otherwise.
                        warn!(%addr, error = %e, "datagram send failed");
                        metrics.send_error();
                        events.push_back(Event::Error(Some(*addr), TransportErrorKind::Send));
                        slot.conn.pop_outgoing();
                    }
                }
            }
        }
    }

    fn send_raw(&self, addr: SocketAddr, encoded: &[u8]) {
        match self.socket.send_to(encoded, addr) {
            Ok(sent) => self.metrics.tx_packet(sent),
            Err(_) => self.metrics.send_error(),
        }
    }
}
