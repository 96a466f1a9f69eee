//! The relay state machine.
//!
//! Driven entirely by inbound `VoiceUp`/`VoiceDirected` messages and peer
//! disconnects. Every payload is classified by its three-byte prefix and
//! either answered (handshake, session errors), applied to the registry
//! (room state), fanned out to other peers, or dropped and counted.
//!
//! The relay never inspects voice payloads beyond the parsed message
//! types, and it does not route by room membership: room-addressed voice
//! is broadcast to every other peer, because the voice protocol itself
//! filters on the receiving side. The membership indices are still kept
//! authoritative so that routing can tighten later without a protocol
//! change.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use vr_codec::MessageCodec;
use vr_transport::{PeerId, Reliability, TransportError};
use vr_voice::payload::{self, PayloadKind, PeerInfo, TextTarget};
use vr_voice::{ClientId, PlayerId, VoiceDirected, VoiceDown, VoiceUp};

use crate::registry::{ClientMetadata, Registry};

/// Outbound side of one connected peer. The transport's `Peer` handle in
/// production; a recording stub in tests.
pub trait PeerLink {
    fn send(&self, data: &[u8], class: Reliability) -> Result<(), TransportError>;
}

impl PeerLink for vr_transport::Peer {
    fn send(&self, data: &[u8], class: Reliability) -> Result<(), TransportError> {
        vr_transport::Peer::send(self, data, class)
    }
}

/// Counters the relay feeds. Wired to the Prometheus recorder in the
/// binary; no-op in tests.
pub trait RelayMetrics: Send + Sync {
    fn player_joined(&self);
    fn player_left(&self);
    fn players_connected(&self, count: usize);
    fn fanout(&self, destinations: usize);
    fn disconnect(&self, reason: &'static str);
    fn error(&self, subsystem: &'static str);
    fn poll_duration(&self, seconds: f64);
    fn poll_overrun(&self);
}

pub struct NoopRelayMetrics;

impl RelayMetrics for NoopRelayMetrics {
    fn player_joined(&self) {}
    fn player_left(&self) {}
    fn players_connected(&self, _count: usize) {}
    fn fanout(&self, _destinations: usize) {}
    fn disconnect(&self, _reason: &'static str) {}
    fn error(&self, _subsystem: &'static str) {}
    fn poll_duration(&self, _seconds: f64) {}
    fn poll_overrun(&self) {}
}

pub struct VoiceRelay<L> {
    session_id: u32,
    registry: Registry<L>,
    metrics: Arc<dyn RelayMetrics>,
}

impl<L: PeerLink> VoiceRelay<L> {
    pub fn new(session_id: u32, metrics: Arc<dyn RelayMetrics>) -> Self {
        VoiceRelay {
            session_id,
            registry: Registry::new(),
            metrics,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn connected_players(&self) -> usize {
        self.registry.connected()
    }

    pub fn registry(&self) -> &Registry<L> {
        &self.registry
    }

    /// Called by the host once the game-level join has supplied the peer's
    /// player identity.
    pub fn register_peer(&mut self, peer: PeerId, link: L, player: PlayerId) -> bool {
        if !self.registry.bind(peer, link, player) {
            warn!(%peer, %player, "join announce for an identity already in use");
            self.metrics.error("session");
            return false;
        }
        debug!(%peer, %player, "player joined");
        self.metrics.player_joined();
        self.metrics.players_connected(self.registry.connected());
        true
    }

    /// Peer went away: drop all of its state and tell everyone else.
    pub fn handle_disconnect(&mut self, peer: PeerId) {
        let Some((player, client)) = self.registry.unbind(peer) else {
            return;
        };
        debug!(%peer, %player, "player left");
        self.metrics.player_left();
        self.metrics.players_connected(self.registry.connected());

        let Some(client) = client else {
            // Never handshook; nobody learned about it.
            return;
        };
        let notice = payload::build_remove_client(self.session_id, client, 0);
        let down = VoiceDown {
            from_player: PlayerId::ZERO,
            reliable: true,
            payload: notice,
        };
        let encoded = MessageCodec::<L>::encode(&down);
        let mut sent = 0usize;
        for link in self.registry.links_except(peer) {
            if link.send(&encoded, Reliability::ReliableOrdered).is_err() {
                self.metrics.error("send");
            }
            sent += 1;
        }
        trace!(%client, peers = sent, "removal broadcast");
    }

    pub fn handle_voice_up(&mut self, peer: PeerId, msg: VoiceUp) {
        let Some(player) = self.registry.player_for_peer(peer) else {
            self.metrics.error("unbound_peer");
            return;
        };
        let kind = match payload::classify(&msg.payload) {
            Ok(kind) => kind,
            Err(_) => {
                self.metrics.error("payload");
                return;
            }
        };
        match kind {
            PayloadKind::VoiceData | PayloadKind::Unknown(_) => {
                self.broadcast(peer, player, msg.reliable, msg.payload);
            }
            PayloadKind::HandshakeRequest => self.handshake(peer, player, &msg.payload),
            PayloadKind::ServerRelayReliable => self.server_relay(peer, player, true, &msg.payload),
            PayloadKind::ServerRelayUnreliable => {
                self.server_relay(peer, player, false, &msg.payload)
            }
            PayloadKind::ClientState => self.client_state(peer, player, msg.payload),
            PayloadKind::DeltaChannelState => self.channel_delta(peer, player, msg.payload),
            PayloadKind::TextData => self.text(peer, player, msg.reliable, msg.payload),
            PayloadKind::HandshakePeerToPeer
            | PayloadKind::HandshakeResponse
            | PayloadKind::ErrorWrongSession
            | PayloadKind::RemoveClient => {
                // Server-originated (or blocked) message types arriving
                // inbound; never forwarded.
                self.metrics.error("server_only");
            }
        }
    }

    /// Host-directed voice: forwarded to exactly one peer, and only for
    /// pass-through payload kinds.
    pub fn handle_voice_directed(&mut self, peer: PeerId, msg: VoiceDirected) {
        let Some(player) = self.registry.player_for_peer(peer) else {
            self.metrics.error("unbound_peer");
            return;
        };
        let kind = match payload::classify(&msg.payload) {
            Ok(kind) => kind,
            Err(_) => {
                self.metrics.error("payload");
                return;
            }
        };
        if kind.server_only() {
            self.metrics.error("server_only");
            return;
        }
        let Some(link) = self.registry.link_for_player(msg.target_player) else {
            self.metrics.error("unknown_destination");
            return;
        };
        let down = VoiceDown {
            from_player: player,
            reliable: msg.reliable,
            payload: msg.payload,
        };
        self.send_down(link, &down);
        self.metrics.fanout(1);
    }

    /// Default relay behavior: hand the payload to every other peer.
    fn broadcast(&self, peer: PeerId, player: PlayerId, reliable: bool, payload: Bytes) {
        let down = VoiceDown {
            from_player: player,
            reliable,
            payload,
        };
        let encoded = MessageCodec::<L>::encode(&down);
        let class = class_for(reliable);
        let mut sent = 0usize;
        for link in self.registry.links_except(peer) {
            if link.send(&encoded, class).is_err() {
                self.metrics.error("send");
            }
            sent += 1;
        }
        self.metrics.fanout(sent);
    }

    fn handshake(&mut self, peer: PeerId, player: PlayerId, raw: &Bytes) {
        let request = match payload::parse_handshake_request(raw) {
            Ok(request) => request,
            Err(error) => {
                debug!(%peer, %error, "malformed handshake request");
                self.metrics.error("handshake");
                return;
            }
        };
        let Some(client) = self.registry.assign_client_id(player) else {
            warn!(%peer, "client identifier space exhausted");
            self.metrics.error("handshake");
            return;
        };
        self.registry.set_metadata(
            client,
            ClientMetadata {
                name: request.name,
                codec_settings: request.codec_settings,
            },
        );

        // Everyone already registered, so the newcomer can route directed
        // voice without unknown-peer gaps. Never the recipient itself.
        let others: Vec<PeerInfo> = self
            .registry
            .all_metadata()
            .filter(|(id, _)| *id != client)
            .map(|(id, meta)| PeerInfo {
                client_id: id,
                name: meta.name.clone(),
                codec_settings: meta.codec_settings,
            })
            .collect();
        let response = payload::build_handshake_response(self.session_id, client, &others);
        debug!(%peer, %client, others = others.len(), "handshake");

        let Some(link) = self.registry.link(peer) else {
            return;
        };
        let down = VoiceDown {
            from_player: PlayerId::ZERO,
            reliable: true,
            payload: response,
        };
        self.send_down(link, &down);
    }

    fn server_relay(&mut self, peer: PeerId, from_player: PlayerId, reliable: bool, raw: &Bytes) {
        let envelope = match payload::parse_server_relay(raw) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.metrics.error("payload");
                return;
            }
        };
        if envelope.session_id != self.session_id {
            self.reject_wrong_session(peer);
            return;
        }
        // A peer-to-peer handshake smuggled through the relay envelope is
        // dropped like its top-level counterpart.
        if payload::classify(&envelope.inner)
            .map_or(false, |kind| kind == PayloadKind::HandshakePeerToPeer)
        {
            self.metrics.error("server_only");
            return;
        }

        let down = VoiceDown {
            from_player,
            reliable,
            payload: envelope.inner,
        };
        let encoded = MessageCodec::<L>::encode(&down);
        let class = class_for(reliable);
        let mut sent = 0usize;
        for destination in envelope.destinations {
            if destination == ClientId::NONE {
                continue;
            }
            // A destination that left between send and relay is skipped;
            // the rest still get theirs.
            let Some(link) = self.registry.link_for_client(destination) else {
                self.metrics.error("unknown_destination");
                continue;
            };
            if link.send(&encoded, class).is_err() {
                self.metrics.error("send");
            }
            sent += 1;
        }
        self.metrics.fanout(sent);
    }

    fn client_state(&mut self, peer: PeerId, player: PlayerId, raw: Bytes) {
        let state = match payload::parse_client_state(&raw) {
            Ok(state) => state,
            Err(_) => {
                self.metrics.error("payload");
                return;
            }
        };
        if state.session_id != self.session_id {
            self.metrics.error("session");
            return;
        }
        let Some(client) = self.registry.client_for_player(player) else {
            self.metrics.error("handshake");
            return;
        };
        let rooms: HashSet<String> = state.rooms.into_iter().collect();
        self.registry.replace_rooms(client, rooms);
        self.broadcast(peer, player, true, raw);
    }

    fn channel_delta(&mut self, peer: PeerId, player: PlayerId, raw: Bytes) {
        let delta = match payload::parse_channel_delta(&raw) {
            Ok(delta) => delta,
            Err(_) => {
                self.metrics.error("payload");
                return;
            }
        };
        if delta.session_id != self.session_id {
            self.metrics.error("session");
            return;
        }
        let Some(client) = self.registry.client_for_player(player) else {
            self.metrics.error("handshake");
            return;
        };
        self.registry.apply_room_delta(client, &delta.room, delta.joined);
        self.broadcast(peer, player, true, raw);
    }

    fn text(&mut self, peer: PeerId, player: PlayerId, reliable: bool, raw: Bytes) {
        let addressing = match payload::parse_text_addressing(&raw) {
            Ok(addressing) => addressing,
            Err(_) => {
                self.metrics.error("payload");
                return;
            }
        };
        if addressing.session_id != self.session_id {
            self.metrics.error("session");
            return;
        }
        match addressing.target {
            TextTarget::Client(target) => {
                let Some(link) = self.registry.link_for_client(target) else {
                    self.metrics.error("unknown_destination");
                    return;
                };
                let down = VoiceDown {
                    from_player: player,
                    reliable,
                    payload: raw,
                };
                self.send_down(link, &down);
                self.metrics.fanout(1);
            }
            TextTarget::Room => self.broadcast(peer, player, reliable, raw),
        }
    }

    fn reject_wrong_session(&self, peer: PeerId) {
        self.metrics.error("session");
        let Some(link) = self.registry.link(peer) else {
            return;
        };
        let down = VoiceDown {
            from_player: PlayerId::ZERO,
            reliable: true,
            payload: payload::build_error_wrong_session(self.session_id),
        };
        self.send_down(link, &down);
    }

    fn send_down(&self, link: &L, down: &VoiceDown) {
        let encoded = MessageCodec::<L>::encode(down);
        if link.send(&encoded, class_for(down.reliable)).is_err() {
            self.metrics.error("send");
        }
    }
}

fn class_for(reliable: bool) -> Reliability {
    if reliable {
        Reliability::ReliableOrdered
    } else {
        Reliability::Unreliable
    }
}
