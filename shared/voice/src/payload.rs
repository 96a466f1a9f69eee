//! The inner voice-protocol payload.
//!
//! Every payload starts with a three-byte prefix: the big-endian magic
//! `0x8BC7` and a one-byte message-type discriminant. The relay never looks
//! past that prefix except for the handful of message types parsed here.
//! All multi-byte integers inside payloads are big-endian, unlike the
//! little-endian envelope fields around them.
//!
//! Strings use the voice protocol's length-prefix convention: a big-endian
//! `u16` where zero means empty and a non-zero value means `length - 1`
//! UTF-8 bytes follow.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::ids::ClientId;

/// Constant marking the start of every voice payload.
pub const VOICE_MAGIC: u16 = 0x8BC7;

/// Magic plus discriminant.
pub const PREFIX_LEN: usize = 3;

/// Size of the opaque codec-settings blob carried by handshakes.
pub const CODEC_SETTINGS_LEN: usize = 9;

pub type VoiceResult<T> = Result<T, VoiceError>;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("truncated voice payload while reading {what}")]
    Truncated { what: &'static str },

    #[error("bad voice magic {found:#06x}")]
    BadMagic { found: u16 },

    #[error("voice payload string is not valid UTF-8")]
    BadString(#[from] std::string::FromUtf8Error),
}

/// Message-type discriminant of a voice payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    ClientState,
    VoiceData,
    TextData,
    HandshakeRequest,
    HandshakeResponse,
    ErrorWrongSession,
    ServerRelayReliable,
    ServerRelayUnreliable,
    DeltaChannelState,
    RemoveClient,
    HandshakePeerToPeer,
    Unknown(u8),
}

impl PayloadKind {
    pub fn from_discriminant(d: u8) -> PayloadKind {
        match d {
            1 => PayloadKind::ClientState,
            2 => PayloadKind::VoiceData,
            3 => PayloadKind::TextData,
            4 => PayloadKind::HandshakeRequest,
            5 => PayloadKind::HandshakeResponse,
            6 => PayloadKind::ErrorWrongSession,
            7 => PayloadKind::ServerRelayReliable,
            8 => PayloadKind::ServerRelayUnreliable,
            9 => PayloadKind::DeltaChannelState,
            10 => PayloadKind::RemoveClient,
            11 => PayloadKind::HandshakePeerToPeer,
            other => PayloadKind::Unknown(other),
        }
    }

    pub fn discriminant(self) -> u8 {
        match self {
            PayloadKind::ClientState => 1,
            PayloadKind::VoiceData => 2,
            PayloadKind::TextData => 3,
            PayloadKind::HandshakeRequest => 4,
            PayloadKind::HandshakeResponse => 5,
            PayloadKind::ErrorWrongSession => 6,
            PayloadKind::ServerRelayReliable => 7,
            PayloadKind::ServerRelayUnreliable => 8,
            PayloadKind::DeltaChannelState => 9,
            PayloadKind::RemoveClient => 10,
            PayloadKind::HandshakePeerToPeer => 11,
            PayloadKind::Unknown(d) => d,
        }
    }

    /// True for message types that carry relay-protocol meaning and must
    /// never be forwarded peer-to-peer. Plain voice data and unknown
    /// discriminants are the only pass-through kinds.
    pub fn server_only(self) -> bool {
        !matches!(self, PayloadKind::VoiceData | PayloadKind::Unknown(_))
    }
}

/// Classify a payload by its three-byte prefix.
pub fn classify(payload: &[u8]) -> VoiceResult<PayloadKind> {
    if payload.len() < PREFIX_LEN {
        return Err(VoiceError::Truncated { what: "payload prefix" });
    }
    let magic = u16::from_be_bytes([payload[0], payload[1]]);
    if magic != VOICE_MAGIC {
        return Err(VoiceError::BadMagic { found: magic });
    }
    Ok(PayloadKind::from_discriminant(payload[2]))
}

/// Prefix a payload body with magic and discriminant.
pub fn build_payload(kind: PayloadKind, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(PREFIX_LEN + body.len());
    out.put_u16(VOICE_MAGIC);
    out.put_u8(kind.discriminant());
    out.put_slice(body);
    out.freeze()
}

// ---- big-endian field readers ----

fn be_u8(buf: &mut Bytes, what: &'static str) -> VoiceResult<u8> {
    if buf.remaining() < 1 {
        return Err(VoiceError::Truncated { what });
    }
    Ok(buf.get_u8())
}

fn be_u16(buf: &mut Bytes, what: &'static str) -> VoiceResult<u16> {
    if buf.remaining() < 2 {
        return Err(VoiceError::Truncated { what });
    }
    Ok(buf.get_u16())
}

fn be_u32(buf: &mut Bytes, what: &'static str) -> VoiceResult<u32> {
    if buf.remaining() < 4 {
        return Err(VoiceError::Truncated { what });
    }
    Ok(buf.get_u32())
}

fn voice_string(buf: &mut Bytes, what: &'static str) -> VoiceResult<String> {
    let prefix = be_u16(buf, what)?;
    if prefix == 0 {
        return Ok(String::new());
    }
    let len = (prefix - 1) as usize;
    if buf.remaining() < len {
        return Err(VoiceError::Truncated { what });
    }
    Ok(String::from_utf8(buf.split_to(len).to_vec())?)
}

// Names only enter the relay through `voice_string`, which bounds them to
// `u16::MAX - 1` bytes; re-encoding cannot overflow the prefix.
fn put_voice_string(out: &mut BytesMut, s: &str) {
    debug_assert!(s.len() < u16::MAX as usize);
    if s.is_empty() {
        out.put_u16(0);
    } else {
        out.put_u16(s.len() as u16 + 1);
        out.put_slice(s.as_bytes());
    }
}

/// Strip the three-byte prefix, leaving the message body.
fn body_of(payload: &Bytes, what: &'static str) -> VoiceResult<Bytes> {
    if payload.len() < PREFIX_LEN {
        return Err(VoiceError::Truncated { what });
    }
    Ok(payload.slice(PREFIX_LEN..))
}

/// A client's first voice message: codec settings plus display name.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub codec_settings: [u8; CODEC_SETTINGS_LEN],
    pub name: String,
}

pub fn parse_handshake_request(payload: &Bytes) -> VoiceResult<HandshakeRequest> {
    let mut buf = body_of(payload, "handshake request")?;
    if buf.remaining() < CODEC_SETTINGS_LEN {
        return Err(VoiceError::Truncated { what: "codec settings" });
    }
    let mut codec_settings = [0u8; CODEC_SETTINGS_LEN];
    buf.copy_to_slice(&mut codec_settings);
    let name = voice_string(&mut buf, "display name")?;
    Ok(HandshakeRequest { codec_settings, name })
}

pub fn build_handshake_request(codec_settings: &[u8; CODEC_SETTINGS_LEN], name: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_slice(codec_settings);
    put_voice_string(&mut body, name);
    build_payload(PayloadKind::HandshakeRequest, &body)
}

/// One already-registered peer, as listed in a handshake response.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub client_id: ClientId,
    pub name: String,
    pub codec_settings: [u8; CODEC_SETTINGS_LEN],
}

/// Build the response to a handshake request. `others` must already exclude
/// the recipient; the trailing room and channel tables are always empty.
pub fn build_handshake_response(session_id: u32, assigned: ClientId, others: &[PeerInfo]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(session_id);
    body.put_u16(assigned.0);
    body.put_u16(others.len() as u16);
    for peer in others {
        put_voice_string(&mut body, &peer.name);
        body.put_u16(peer.client_id.0);
        body.put_slice(&peer.codec_settings);
    }
    body.put_u16(0); // room names
    body.put_u16(0); // channels
    build_payload(PayloadKind::HandshakeResponse, &body)
}

/// The 11-byte session-mismatch notice: the relay's actual session id,
/// twice.
pub fn build_error_wrong_session(session_id: u32) -> Bytes {
    let mut body = BytesMut::with_capacity(8);
    body.put_u32(session_id);
    body.put_u32(session_id);
    build_payload(PayloadKind::ErrorWrongSession, &body)
}

/// The 11-byte removal notice broadcast when a client leaves.
pub fn build_remove_client(session_id: u32, client: ClientId, reason: u16) -> Bytes {
    let mut body = BytesMut::with_capacity(8);
    body.put_u32(session_id);
    body.put_u16(client.0);
    body.put_u16(reason);
    build_payload(PayloadKind::RemoveClient, &body)
}

/// A decoded ServerRelay envelope: destinations plus the payload to fan out.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRelay {
    pub session_id: u32,
    pub destinations: Vec<ClientId>,
    pub inner: Bytes,
}

pub fn parse_server_relay(payload: &Bytes) -> VoiceResult<ServerRelay> {
    let mut buf = body_of(payload, "server relay")?;
    let session_id = be_u32(&mut buf, "session id")?;
    let count = be_u8(&mut buf, "destination count")? as usize;
    let mut destinations = Vec::with_capacity(count);
    for _ in 0..count {
        destinations.push(ClientId(be_u16(&mut buf, "destination id")?));
    }
    let inner_len = be_u16(&mut buf, "inner length")? as usize;
    if buf.remaining() < inner_len {
        return Err(VoiceError::Truncated { what: "inner payload" });
    }
    Ok(ServerRelay {
        session_id,
        destinations,
        inner: buf.split_to(inner_len),
    })
}

pub fn build_server_relay(
    reliable: bool,
    session_id: u32,
    destinations: &[ClientId],
    inner: &[u8],
) -> Bytes {
    let kind = if reliable {
        PayloadKind::ServerRelayReliable
    } else {
        PayloadKind::ServerRelayUnreliable
    };
    let mut body = BytesMut::new();
    body.put_u32(session_id);
    body.put_u8(destinations.len() as u8);
    for dest in destinations {
        body.put_u16(dest.0);
    }
    body.put_u16(inner.len() as u16);
    body.put_slice(inner);
    build_payload(kind, &body)
}

/// A client's full room listing, replacing its previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientState {
    pub session_id: u32,
    pub rooms: Vec<String>,
}

pub fn parse_client_state(payload: &Bytes) -> VoiceResult<ClientState> {
    let mut buf = body_of(payload, "client state")?;
    let session_id = be_u32(&mut buf, "session id")?;
    let count = be_u16(&mut buf, "room count")? as usize;
    let mut rooms = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        rooms.push(voice_string(&mut buf, "room name")?);
    }
    Ok(ClientState { session_id, rooms })
}

pub fn build_client_state(session_id: u32, rooms: &[&str]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(session_id);
    body.put_u16(rooms.len() as u16);
    for room in rooms {
        put_voice_string(&mut body, room);
    }
    build_payload(PayloadKind::ClientState, &body)
}

/// A single join or leave of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDelta {
    pub session_id: u32,
    pub joined: bool,
    pub room: String,
}

pub fn parse_channel_delta(payload: &Bytes) -> VoiceResult<ChannelDelta> {
    let mut buf = body_of(payload, "channel delta")?;
    let session_id = be_u32(&mut buf, "session id")?;
    let joined = be_u8(&mut buf, "joined flag")? != 0;
    let room = voice_string(&mut buf, "room name")?;
    Ok(ChannelDelta { session_id, joined, room })
}

pub fn build_channel_delta(session_id: u32, joined: bool, room: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(session_id);
    body.put_u8(joined as u8);
    put_voice_string(&mut body, room);
    build_payload(PayloadKind::DeltaChannelState, &body)
}

/// Where a text payload is addressed. The text itself stays opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextTarget {
    /// Room-addressed: fanned out to every other peer.
    Room,
    /// Addressed to a single client.
    Client(ClientId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextAddressing {
    pub session_id: u32,
    pub target: TextTarget,
}

pub fn parse_text_addressing(payload: &Bytes) -> VoiceResult<TextAddressing> {
    let mut buf = body_of(payload, "text data")?;
    let session_id = be_u32(&mut buf, "session id")?;
    let kind = be_u8(&mut buf, "recipient kind")?;
    let target_id = be_u16(&mut buf, "target client id")?;
    let target = if kind == 1 {
        TextTarget::Client(ClientId(target_id))
    } else {
        TextTarget::Room
    };
    Ok(TextAddressing { session_id, target })
}
