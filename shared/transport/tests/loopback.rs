//! Socket-level tests: two transports talking over localhost.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use vr_transport::{
    ConnectionRequest, DisconnectReason, EventListener, Peer, Reliability, Transport,
    TransportConfig, MAX_FRAGMENT_PAYLOAD,
};

const KEY: &str = "loopback-test";

#[derive(Default)]
struct Recorder {
    accept: bool,
    connected: Vec<Peer>,
    disconnected: Vec<(u64, DisconnectReason)>,
    received: Vec<(Bytes, Reliability)>,
}

impl Recorder {
    fn accepting() -> Recorder {
        Recorder {
            accept: true,
            ..Default::default()
        }
    }
}

impl EventListener for Recorder {
    fn connection_requested(&mut self, request: ConnectionRequest) {
        if self.accept {
            request.accept();
        } else {
            request.reject();
        }
    }

    fn peer_connected(&mut self, peer: Peer) {
        self.connected.push(peer);
    }

    fn peer_disconnected(&mut self, peer: Peer, reason: DisconnectReason) {
        self.disconnected.push((peer.id().0, reason));
    }

    fn receive(&mut self, _peer: Peer, data: Bytes, class: Reliability) {
        self.received.push((data, class));
    }
}

fn bind(key: &str) -> Transport {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Transport::start(TransportConfig::new(addr, key)).unwrap()
}

/// Poll both ends until `done` returns true or the deadline passes.
fn pump(
    a: &Transport,
    la: &mut Recorder,
    b: &Transport,
    lb: &mut Recorder,
    mut done: impl FnMut(&Recorder, &Recorder) -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        a.poll(la);
        b.poll(lb);
        if done(la, lb) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn connect_pair() -> (Transport, Recorder, Transport, Recorder, Peer) {
    let server = bind(KEY);
    let client = bind(KEY);
    let mut on_server = Recorder::accepting();
    let mut on_client = Recorder::accepting();

    let server_peer = client.connect(server.local_addr()).unwrap();
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |s, c| {
        !s.connected.is_empty() && !c.connected.is_empty()
    });
    assert!(ok, "connection did not establish");
    (server, on_server, client, on_client, server_peer)
}

#[test]
fn connect_and_exchange_reliable() {
    let (server, mut on_server, client, mut on_client, server_peer) = connect_pair();

    server_peer
        .send(b"up", Reliability::ReliableOrdered)
        .unwrap();
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |s, _| {
        !s.received.is_empty()
    });
    assert!(ok);
    assert_eq!(on_server.received[0].0.as_ref(), b"up");
    assert_eq!(on_server.received[0].1, Reliability::ReliableOrdered);

    let client_peer = on_server.connected[0].clone();
    client_peer
        .send(b"down", Reliability::Unreliable)
        .unwrap();
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |_, c| {
        !c.received.is_empty()
    });
    assert!(ok);
    assert_eq!(on_client.received[0].0.as_ref(), b"down");
}

#[test]
fn reliable_burst_arrives_in_order() {
    let (server, mut on_server, client, mut on_client, server_peer) = connect_pair();

    for i in 0..50u8 {
        server_peer
            .send(&[i], Reliability::ReliableOrdered)
            .unwrap();
    }
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |s, _| {
        s.received.len() == 50
    });
    assert!(ok, "only {} of 50 arrived", on_server.received.len());
    for (i, (data, _)) in on_server.received.iter().enumerate() {
        assert_eq!(data.as_ref(), &[i as u8]);
    }
}

#[test]
fn oversized_reliable_message_fragments_transparently() {
    let (server, mut on_server, client, mut on_client, server_peer) = connect_pair();

    let big: Vec<u8> = (0..MAX_FRAGMENT_PAYLOAD * 3 + 17)
        .map(|i| (i % 251) as u8)
        .collect();
    server_peer
        .send(&big, Reliability::ReliableOrdered)
        .unwrap();
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |s, _| {
        !s.received.is_empty()
    });
    assert!(ok);
    assert_eq!(on_server.received[0].0.as_ref(), big.as_slice());
}

#[test]
fn sequenced_messages_are_delivered() {
    let (server, mut on_server, client, mut on_client, server_peer) = connect_pair();

    server_peer
        .send(b"state-1", Reliability::ReliableSequenced)
        .unwrap();
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |s, _| {
        !s.received.is_empty()
    });
    assert!(ok);
    assert_eq!(on_server.received[0].1, Reliability::ReliableSequenced);
}

#[test]
fn wrong_connection_key_is_rejected() {
    let server = bind(KEY);
    let client = bind("some-other-key");
    let mut on_server = Recorder::accepting();
    let mut on_client = Recorder::accepting();

    client.connect(server.local_addr()).unwrap();
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |_, c| {
        !c.disconnected.is_empty()
    });
    assert!(ok);
    assert_eq!(on_client.disconnected[0].1, DisconnectReason::ConnectFailed);
    assert!(on_server.connected.is_empty());
}

#[test]
fn host_can_reject_admission() {
    let server = bind(KEY);
    let client = bind(KEY);
    let mut on_server = Recorder::default(); // rejects everything
    let mut on_client = Recorder::accepting();

    client.connect(server.local_addr()).unwrap();
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |_, c| {
        !c.disconnected.is_empty()
    });
    assert!(ok);
    assert_eq!(on_client.disconnected[0].1, DisconnectReason::ConnectFailed);
}

#[test]
fn stop_notifies_the_remote_end() {
    let (server, mut on_server, client, mut on_client, _server_peer) = connect_pair();

    client.stop();
    let ok = {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            server.poll(&mut on_server);
            client.poll(&mut on_client); // no-op once stopped
            if !on_server.disconnected.is_empty() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    };
    assert!(ok);
    assert_eq!(on_server.disconnected[0].1, DisconnectReason::Remote);
}

#[test]
fn send_to_disconnected_peer_fails() {
    let (server, mut on_server, client, mut on_client, server_peer) = connect_pair();

    server.stop();
    let ok = pump(&server, &mut on_server, &client, &mut on_client, |_, c| {
        !c.disconnected.is_empty()
    });
    assert!(ok);
    assert!(server_peer.send(b"x", Reliability::Unreliable).is_err());
}
