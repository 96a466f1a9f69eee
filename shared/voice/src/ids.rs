use std::fmt;

use uuid::Uuid;

/// Host-assigned 128-bit identity of a user. Written to the wire as its 16
/// raw bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// The all-zero identifier used as `from_player` on server-originated
    /// envelopes (handshake responses, errors, removal notices).
    pub const ZERO: PlayerId = PlayerId(Uuid::nil());

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PlayerId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Relay-assigned 16-bit handle used inside voice payloads. Allocated from 1
/// upward and never reused while the relay runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u16);

impl ClientId {
    /// Reserved sentinel meaning "no destination".
    pub const NONE: ClientId = ClientId(0xFFFF);

    pub const FIRST: ClientId = ClientId(1);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
