//! Session bookkeeping: the peer ↔ player ↔ client-id ↔ metadata ↔ rooms
//! relation.
//!
//! Every mutation funnels through this type so the inverted room indices
//! and the id maps can never drift apart. Client identifiers move forward
//! only; nothing is reused while the relay runs.

use std::collections::{HashMap, HashSet};

use vr_transport::PeerId;
use vr_voice::payload::CODEC_SETTINGS_LEN;
use vr_voice::{ClientId, PlayerId};

/// Per-client record captured verbatim from the voice handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMetadata {
    pub name: String,
    pub codec_settings: [u8; CODEC_SETTINGS_LEN],
}

pub struct Registry<L> {
    links: HashMap<PeerId, L>,
    peer_player: HashMap<PeerId, PlayerId>,
    player_peer: HashMap<PlayerId, PeerId>,
    player_client: HashMap<PlayerId, ClientId>,
    client_player: HashMap<ClientId, PlayerId>,
    metadata: HashMap<ClientId, ClientMetadata>,
    client_rooms: HashMap<ClientId, HashSet<String>>,
    room_clients: HashMap<String, HashSet<ClientId>>,
    next_client_id: u16,
}

impl<L> Registry<L> {
    pub fn new() -> Self {
        Registry {
            links: HashMap::new(),
            peer_player: HashMap::new(),
            player_peer: HashMap::new(),
            player_client: HashMap::new(),
            client_player: HashMap::new(),
            metadata: HashMap::new(),
            client_rooms: HashMap::new(),
            room_clients: HashMap::new(),
            next_client_id: ClientId::FIRST.0,
        }
    }

    /// Bind a peer to its player identity. Returns false when the player is
    /// already owned by a different live peer, or when the peer tries to
    /// change identity mid-session; re-binding the same pair is a no-op.
    pub fn bind(&mut self, peer: PeerId, link: L, player: PlayerId) -> bool {
        if let Some(owner) = self.player_peer.get(&player) {
            if *owner != peer {
                return false;
            }
        }
        if let Some(previous) = self.peer_player.get(&peer) {
            if *previous != player {
                return false;
            }
        }
        self.peer_player.insert(peer, player);
        self.player_peer.insert(player, peer);
        self.links.insert(peer, link);
        true
    }

    /// Allocate a client identifier, or return the existing one. `None`
    /// means the 16-bit space is exhausted (the sentinel is never handed
    /// out).
    pub fn assign_client_id(&mut self, player: PlayerId) -> Option<ClientId> {
        if let Some(existing) = self.player_client.get(&player) {
            return Some(*existing);
        }
        if self.next_client_id >= ClientId::NONE.0 {
            return None;
        }
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        self.player_client.insert(player, id);
        self.client_player.insert(id, player);
        Some(id)
    }

    /// Remove every relation for a peer. Returns the player and, if one was
    /// allocated, the client identifier, so the caller can broadcast the
    /// removal. The identifier itself is never released.
    pub fn unbind(&mut self, peer: PeerId) -> Option<(PlayerId, Option<ClientId>)> {
        let player = self.peer_player.remove(&peer)?;
        self.links.remove(&peer);
        self.player_peer.remove(&player);
        let client = self.player_client.remove(&player);
        if let Some(client) = client {
            self.client_player.remove(&client);
            self.metadata.remove(&client);
            self.clear_rooms(client);
        }
        Some((player, client))
    }

    pub fn link(&self, peer: PeerId) -> Option<&L> {
        self.links.get(&peer)
    }

    pub fn link_for_client(&self, client: ClientId) -> Option<&L> {
        let player = self.client_player.get(&client)?;
        let peer = self.player_peer.get(player)?;
        self.links.get(peer)
    }

    pub fn link_for_player(&self, player: PlayerId) -> Option<&L> {
        let peer = self.player_peer.get(&player)?;
        self.links.get(peer)
    }

    pub fn player_for_peer(&self, peer: PeerId) -> Option<PlayerId> {
        self.peer_player.get(&peer).copied()
    }

    pub fn client_for_player(&self, player: PlayerId) -> Option<ClientId> {
        self.player_client.get(&player).copied()
    }

    pub fn player_for_client(&self, client: ClientId) -> Option<PlayerId> {
        self.client_player.get(&client).copied()
    }

    /// All links except the given peer's own.
    pub fn links_except(&self, peer: PeerId) -> impl Iterator<Item = &L> {
        self.links
            .iter()
            .filter(move |(id, _)| **id != peer)
            .map(|(_, link)| link)
    }

    /// Clients with complete metadata, for handshake responses.
    pub fn all_metadata(&self) -> impl Iterator<Item = (ClientId, &ClientMetadata)> {
        self.metadata.iter().map(|(id, meta)| (*id, meta))
    }

    pub fn set_metadata(&mut self, client: ClientId, meta: ClientMetadata) {
        self.metadata.insert(client, meta);
    }

    /// Replace a client's entire room membership.
    pub fn replace_rooms(&mut self, client: ClientId, rooms: HashSet<String>) {
        self.clear_rooms(client);
        for room in &rooms {
            self.room_clients
                .entry(room.clone())
                .or_default()
                .insert(client);
        }
        if !rooms.is_empty() {
            self.client_rooms.insert(client, rooms);
        }
    }

    /// Apply a single join or leave.
    pub fn apply_room_delta(&mut self, client: ClientId, room: &str, joined: bool) {
        if joined {
            self.client_rooms
                .entry(client)
                .or_default()
                .insert(room.to_string());
            self.room_clients
                .entry(room.to_string())
                .or_default()
                .insert(client);
        } else {
            if let Some(rooms) = self.client_rooms.get_mut(&client) {
                rooms.remove(room);
                if rooms.is_empty() {
                    self.client_rooms.remove(&client);
                }
            }
            if let Some(members) = self.room_clients.get_mut(room) {
                members.remove(&client);
                if members.is_empty() {
                    self.room_clients.remove(room);
                }
            }
        }
    }

    pub fn rooms_of(&self, client: ClientId) -> Option<&HashSet<String>> {
        self.client_rooms.get(&client)
    }

    pub fn room_members(&self, room: &str) -> Option<&HashSet<ClientId>> {
        self.room_clients.get(room)
    }

    /// Number of currently-bound peers.
    pub fn connected(&self) -> usize {
        self.links.len()
    }

    fn clear_rooms(&mut self, client: ClientId) {
        if let Some(rooms) = self.client_rooms.remove(&client) {
            for room in rooms {
                if let Some(members) = self.room_clients.get_mut(&room) {
                    members.remove(&client);
                    if members.is_empty() {
                        self.room_clients.remove(&room);
                    }
                }
            }
        }
    }
}

impl<L> Default for Registry<L> {
    fn default() -> Self {
        Self::new()
    }
}
