//! End-to-end relay scenarios, driven through the state machine with
//! recording peer links. Outbound frames are decoded back through the
//! codec so the full envelope path is exercised.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;

use vr_codec::decode;
use vr_relay::relay::{NoopRelayMetrics, PeerLink, VoiceRelay};
use vr_transport::{PeerId, Reliability, TransportError};
use vr_voice::payload::{self, PayloadKind, CODEC_SETTINGS_LEN};
use vr_voice::{ClientId, PlayerId, VoiceDirected, VoiceDown, VoiceUp};

const SESSION: u32 = 0x5EC0_01AA;

#[derive(Clone, Default)]
struct RecordingLink {
    sent: Rc<RefCell<Vec<(Bytes, Reliability)>>>,
}

impl PeerLink for RecordingLink {
    fn send(&self, data: &[u8], class: Reliability) -> Result<(), TransportError> {
        self.sent
            .borrow_mut()
            .push((Bytes::copy_from_slice(data), class));
        Ok(())
    }
}

struct Harness {
    relay: VoiceRelay<RecordingLink>,
    peers: Vec<(PeerId, PlayerId, RecordingLink)>,
}

impl Harness {
    fn new() -> Harness {
        Harness {
            relay: VoiceRelay::new(SESSION, Arc::new(NoopRelayMetrics)),
            peers: Vec::new(),
        }
    }

    /// Register a peer with player id `[tag; 16]`.
    fn join(&mut self, tag: u8) -> usize {
        let peer = PeerId(tag as u64);
        let player = PlayerId::from_bytes([tag; 16]);
        let link = RecordingLink::default();
        assert!(self.relay.register_peer(peer, link.clone(), player));
        self.peers.push((peer, player, link));
        self.peers.len() - 1
    }

    fn peer(&self, idx: usize) -> PeerId {
        self.peers[idx].0
    }

    fn player(&self, idx: usize) -> PlayerId {
        self.peers[idx].1
    }

    fn voice_up(&mut self, idx: usize, reliable: bool, payload: Bytes) {
        let peer = self.peer(idx);
        self.relay.handle_voice_up(peer, VoiceUp { reliable, payload });
    }

    fn handshake(&mut self, idx: usize, name: &str) -> ClientId {
        self.voice_up(
            idx,
            true,
            payload::build_handshake_request(&[0x11; CODEC_SETTINGS_LEN], name),
        );
        let downs = self.take(idx);
        let response = downs
            .iter()
            .rev()
            .find(|(down, _)| {
                matches!(
                    payload::classify(&down.payload),
                    Ok(PayloadKind::HandshakeResponse)
                )
            })
            .expect("no handshake response")
            .0
            .clone();
        // assigned id sits after magic, type, and session id
        ClientId(u16::from_be_bytes([response.payload[7], response.payload[8]]))
    }

    /// Decode and clear everything sent to one peer.
    fn take(&self, idx: usize) -> Vec<(VoiceDown, Reliability)> {
        self.peers[idx]
            .2
            .sent
            .borrow_mut()
            .drain(..)
            .map(|(raw, class)| (decode::<VoiceDown>(raw).unwrap(), class))
            .collect()
    }

    fn drain_all(&self) {
        for (_, _, link) in &self.peers {
            link.sent.borrow_mut().clear();
        }
    }
}

// ---- Scenario A: single-client handshake ----

#[test]
fn handshake_response_for_first_client() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);

    h.voice_up(
        p1,
        true,
        payload::build_handshake_request(&[0x11; CODEC_SETTINGS_LEN], "A"),
    );

    let downs = h.take(p1);
    assert_eq!(downs.len(), 1);
    let (down, class) = &downs[0];
    assert_eq!(down.from_player, PlayerId::ZERO);
    assert!(down.reliable);
    assert_eq!(*class, Reliability::ReliableOrdered);
    assert_eq!(
        down.payload,
        payload::build_handshake_response(SESSION, ClientId(1), &[])
    );
    // byte-exact: magic, type 5, session id, assigned 1, empty tables
    assert_eq!(&down.payload[..3], &[0x8B, 0xC7, 0x05]);
    assert_eq!(&down.payload[3..7], &SESSION.to_be_bytes());
    assert_eq!(&down.payload[7..9], &[0x00, 0x01]);
}

// ---- Scenario B: two-client fan-out ----

#[test]
fn voice_data_fans_out_to_everyone_else() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    h.handshake(p1, "A");
    h.handshake(p2, "B");
    h.drain_all();

    let voice = payload::build_payload(PayloadKind::VoiceData, &[0xEE; 12]);
    h.voice_up(p1, false, voice.clone());

    let to_p2 = h.take(p2);
    assert_eq!(to_p2.len(), 1);
    let (down, class) = &to_p2[0];
    assert_eq!(down.from_player, h.player(p1));
    assert!(!down.reliable);
    assert_eq!(*class, Reliability::Unreliable);
    assert_eq!(down.payload, voice);
    assert_eq!(down.payload.len(), 15);

    assert!(h.take(p1).is_empty(), "sender must not hear itself");
}

#[test]
fn fanout_count_matches_other_peer_count() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let p3 = h.join(0xA3);

    h.voice_up(p1, true, payload::build_payload(PayloadKind::VoiceData, b"x"));
    assert!(h.take(p1).is_empty());
    assert_eq!(h.take(p2).len(), 1);
    assert_eq!(h.take(p3).len(), 1);
}

#[test]
fn unknown_discriminant_is_relayed_as_voice() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);

    let odd = payload::build_payload(PayloadKind::Unknown(0x63), &[1, 2, 3]);
    h.voice_up(p1, true, odd.clone());

    let to_p2 = h.take(p2);
    assert_eq!(to_p2.len(), 1);
    assert_eq!(to_p2[0].0.payload, odd);
}

// ---- Scenario C: session-mismatch ServerRelay ----

#[test]
fn server_relay_with_wrong_session_is_bounced() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let c2 = h.handshake(p2, "B");
    h.handshake(p1, "A");
    h.drain_all();

    let relayed = payload::build_server_relay(true, SESSION ^ 1, &[c2], &[0xAB; 3]);
    h.voice_up(p1, true, relayed);

    let to_p1 = h.take(p1);
    assert_eq!(to_p1.len(), 1);
    let (down, _) = &to_p1[0];
    assert_eq!(down.from_player, PlayerId::ZERO);
    assert_eq!(
        down.payload,
        payload::build_error_wrong_session(SESSION)
    );
    assert_eq!(down.payload.len(), 11);

    assert!(h.take(p2).is_empty(), "mismatched relay must not fan out");
}

#[test]
fn server_relay_reaches_listed_destinations_only() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let p3 = h.join(0xA3);
    h.handshake(p1, "A");
    let c2 = h.handshake(p2, "B");
    h.handshake(p3, "C");
    h.drain_all();

    let inner = payload::build_payload(PayloadKind::VoiceData, &[0x77; 4]);
    // the sentinel and a long-gone client are both skipped
    let relayed = payload::build_server_relay(
        false,
        SESSION,
        &[c2, ClientId::NONE, ClientId(0x4444)],
        &inner,
    );
    h.voice_up(p1, false, relayed);

    let to_p2 = h.take(p2);
    assert_eq!(to_p2.len(), 1);
    assert_eq!(to_p2[0].0.payload, inner);
    assert_eq!(to_p2[0].0.from_player, h.player(p1));
    assert!(!to_p2[0].0.reliable);
    assert_eq!(to_p2[0].1, Reliability::Unreliable);

    assert!(h.take(p1).is_empty());
    assert!(h.take(p3).is_empty());
}

// ---- Scenario D: directed voice ----

#[test]
fn directed_voice_reaches_only_its_target() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let p3 = h.join(0xA3);
    h.drain_all();

    let voice = payload::build_payload(PayloadKind::VoiceData, &[0x10; 6]);
    let peer1 = h.peer(p1);
    h.relay.handle_voice_directed(
        peer1,
        VoiceDirected {
            target_player: h.player(p2),
            reliable: true,
            payload: voice.clone(),
        },
    );

    let to_p2 = h.take(p2);
    assert_eq!(to_p2.len(), 1);
    assert_eq!(to_p2[0].0.from_player, h.player(p1));
    assert_eq!(to_p2[0].0.payload, voice);
    assert!(h.take(p1).is_empty());
    assert!(h.take(p3).is_empty());
}

#[test]
fn directed_server_only_payloads_are_dropped() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    h.drain_all();

    let peer1 = h.peer(p1);
    h.relay.handle_voice_directed(
        peer1,
        VoiceDirected {
            target_player: h.player(p2),
            reliable: true,
            payload: payload::build_handshake_request(&[0; CODEC_SETTINGS_LEN], "evil"),
        },
    );
    assert!(h.take(p2).is_empty());
}

// ---- Scenario E: disconnect broadcast ----

#[test]
fn disconnect_broadcasts_removal_and_clears_state() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let p3 = h.join(0xA3);
    h.handshake(p1, "A");
    let c2 = h.handshake(p2, "B");
    h.handshake(p3, "C");
    h.voice_up(p2, true, payload::build_client_state(SESSION, &["lobby"]));
    h.drain_all();

    let peer2 = h.peer(p2);
    h.relay.handle_disconnect(peer2);

    for idx in [p1, p3] {
        let downs = h.take(idx);
        assert_eq!(downs.len(), 1, "peer {idx} should hear exactly one removal");
        let (down, class) = &downs[0];
        assert_eq!(down.from_player, PlayerId::ZERO);
        assert!(down.reliable);
        assert_eq!(*class, Reliability::ReliableOrdered);
        assert_eq!(down.payload, payload::build_remove_client(SESSION, c2, 0));
    }

    // the departed client is fully forgotten
    assert!(h.relay.registry().rooms_of(c2).is_none());
    assert!(h.relay.registry().room_members("lobby").is_none());
    assert!(h
        .relay
        .registry()
        .all_metadata()
        .all(|(id, _)| id != c2));
    assert_eq!(h.relay.connected_players(), 2);
}

#[test]
fn disconnect_before_handshake_is_silent() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    h.drain_all();

    let peer2 = h.peer(p2);
    h.relay.handle_disconnect(peer2);
    assert!(h.take(p1).is_empty());
}

// ---- Scenario F: blocked peer-to-peer handshake ----

#[test]
fn peer_to_peer_handshake_inside_relay_envelope_is_dropped() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let c2 = h.handshake(p2, "B");
    h.handshake(p1, "A");
    h.drain_all();

    let inner = payload::build_payload(PayloadKind::HandshakePeerToPeer, &[0x00]);
    let relayed = payload::build_server_relay(true, SESSION, &[c2], &inner);
    h.voice_up(p1, true, relayed);

    assert!(h.take(p1).is_empty());
    assert!(h.take(p2).is_empty());
}

#[test]
fn top_level_server_only_payloads_are_dropped() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    h.drain_all();

    for kind in [
        PayloadKind::HandshakeResponse,
        PayloadKind::ErrorWrongSession,
        PayloadKind::RemoveClient,
        PayloadKind::HandshakePeerToPeer,
    ] {
        h.voice_up(p1, true, payload::build_payload(kind, &[0; 8]));
    }
    assert!(h.take(p2).is_empty());
}

// ---- handshake identity ----

#[test]
fn handshake_is_idempotent_and_updates_metadata() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let first = h.handshake(p1, "A");
    let second = h.handshake(p1, "Anna");
    assert_eq!(first, second);

    let meta: Vec<_> = h.relay.registry().all_metadata().collect();
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].1.name, "Anna");
}

#[test]
fn handshake_lists_other_clients_with_metadata_only() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let _p3 = h.join(0xA3); // joined but never handshakes

    let c1 = h.handshake(p1, "A");
    h.drain_all();

    h.voice_up(
        p2,
        true,
        payload::build_handshake_request(&[0x22; CODEC_SETTINGS_LEN], "B"),
    );
    let downs = h.take(p2);
    assert_eq!(downs.len(), 1);
    let expected_other = payload::PeerInfo {
        client_id: c1,
        name: "A".into(),
        codec_settings: [0x11; CODEC_SETTINGS_LEN],
    };
    assert_eq!(
        downs[0].0.payload,
        payload::build_handshake_response(SESSION, ClientId(2), &[expected_other])
    );
}

// ---- room state ----

#[test]
fn client_state_replaces_rooms_and_rebroadcasts() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let c1 = h.handshake(p1, "A");
    h.handshake(p2, "B");
    h.drain_all();

    let state = payload::build_client_state(SESSION, &["alpha", "beta"]);
    h.voice_up(p1, true, state.clone());

    let rooms = h.relay.registry().rooms_of(c1).unwrap();
    assert!(rooms.contains("alpha") && rooms.contains("beta"));

    let to_p2 = h.take(p2);
    assert_eq!(to_p2.len(), 1);
    assert_eq!(to_p2[0].0.payload, state);
    assert_eq!(to_p2[0].0.from_player, h.player(p1));
    assert!(to_p2[0].0.reliable);

    // the replacement drops the old rooms
    h.voice_up(p1, true, payload::build_client_state(SESSION, &["gamma"]));
    let rooms = h.relay.registry().rooms_of(c1).unwrap();
    assert_eq!(rooms.len(), 1);
    assert!(h.relay.registry().room_members("alpha").is_none());
}

#[test]
fn channel_delta_joins_and_leaves_one_room() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let c1 = h.handshake(p1, "A");
    h.handshake(p2, "B");
    h.drain_all();

    h.voice_up(p1, true, payload::build_channel_delta(SESSION, true, "lobby"));
    assert!(h.relay.registry().rooms_of(c1).unwrap().contains("lobby"));
    assert_eq!(h.take(p2).len(), 1);

    h.voice_up(p1, true, payload::build_channel_delta(SESSION, false, "lobby"));
    assert!(h.relay.registry().rooms_of(c1).is_none());
    assert_eq!(h.take(p2).len(), 1);
}

#[test]
fn room_state_with_wrong_session_is_dropped_without_mutation() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let c1 = h.handshake(p1, "A");
    h.handshake(p2, "B");
    h.drain_all();

    h.voice_up(
        p1,
        true,
        payload::build_client_state(SESSION ^ 1, &["alpha"]),
    );
    assert!(h.relay.registry().rooms_of(c1).is_none());
    assert!(h.take(p2).is_empty(), "no rebroadcast");
    // only ServerRelay mismatches answer with ErrorWrongSession
    assert!(h.take(p1).is_empty());
}

// ---- text ----

#[test]
fn unicast_text_goes_to_one_peer() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let p3 = h.join(0xA3);
    h.handshake(p1, "A");
    let c2 = h.handshake(p2, "B");
    h.handshake(p3, "C");
    h.drain_all();

    let mut body = Vec::new();
    body.extend_from_slice(&SESSION.to_be_bytes());
    body.push(1); // unicast
    body.extend_from_slice(&c2.0.to_be_bytes());
    body.extend_from_slice(b"psst");
    let text = payload::build_payload(PayloadKind::TextData, &body);
    h.voice_up(p1, true, text.clone());

    let to_p2 = h.take(p2);
    assert_eq!(to_p2.len(), 1);
    assert_eq!(to_p2[0].0.payload, text);
    assert!(h.take(p3).is_empty());
}

#[test]
fn room_text_fans_out() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    let p3 = h.join(0xA3);
    h.drain_all();

    let mut body = Vec::new();
    body.extend_from_slice(&SESSION.to_be_bytes());
    body.push(0); // room
    body.extend_from_slice(&[0, 0]);
    body.extend_from_slice(b"hi all");
    h.voice_up(p1, true, payload::build_payload(PayloadKind::TextData, &body));

    assert!(h.take(p1).is_empty());
    assert_eq!(h.take(p2).len(), 1);
    assert_eq!(h.take(p3).len(), 1);
}

// ---- malformed input ----

#[test]
fn short_or_unmagical_payloads_are_dropped() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    let p2 = h.join(0xA2);
    h.drain_all();

    h.voice_up(p1, true, Bytes::from_static(&[0x8B]));
    h.voice_up(p1, true, Bytes::from_static(&[0x12, 0x34, 0x02, 0x00]));
    // truncated server relay header
    h.voice_up(p1, true, payload::build_payload(PayloadKind::ServerRelayReliable, &[0x00]));
    assert!(h.take(p2).is_empty());
    assert!(h.take(p1).is_empty());
}

#[test]
fn voice_from_unbound_peer_is_ignored() {
    let mut h = Harness::new();
    let p1 = h.join(0xA1);
    h.drain_all();

    h.relay.handle_voice_up(
        PeerId(999),
        VoiceUp {
            reliable: true,
            payload: payload::build_payload(PayloadKind::VoiceData, &[1]),
        },
    );
    assert!(h.take(p1).is_empty());
}
