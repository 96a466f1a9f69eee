//! The transport-level envelopes, registered with the message codec.
//!
//! Envelope fields are little-endian; the opaque `payload` inside them uses
//! the big-endian voice-payload conventions of [`crate::payload`].

use bytes::{BufMut, Bytes, BytesMut};
use vr_codec::{get_bytes_lp, get_u8, put_bytes_lp, CodecError, CodecResult, WireMessage};

use crate::ids::PlayerId;

fn get_player_id(buf: &mut Bytes, what: &'static str) -> CodecResult<PlayerId> {
    let raw = get_bytes_lp(buf, what)?;
    let bytes: [u8; 16] = raw
        .as_ref()
        .try_into()
        .map_err(|_| CodecError::Malformed { what })?;
    Ok(PlayerId::from_bytes(bytes))
}

/// Client → server: one opaque voice payload.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceUp {
    pub reliable: bool,
    pub payload: Bytes,
}

impl WireMessage for VoiceUp {
    const NAME: &'static str = "voicerelay.v1.VoiceUp";

    fn write(&self, out: &mut BytesMut) {
        out.put_u8(self.reliable as u8);
        put_bytes_lp(out, &self.payload);
    }

    fn read(buf: &mut Bytes) -> CodecResult<Self> {
        Ok(VoiceUp {
            reliable: get_u8(buf, "reliable flag")? != 0,
            payload: get_bytes_lp(buf, "payload")?,
        })
    }
}

/// Server → client: a payload attributed to its originating player.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceDown {
    pub from_player: PlayerId,
    pub reliable: bool,
    pub payload: Bytes,
}

impl WireMessage for VoiceDown {
    const NAME: &'static str = "voicerelay.v1.VoiceDown";

    fn write(&self, out: &mut BytesMut) {
        put_bytes_lp(out, self.from_player.as_bytes());
        out.put_u8(self.reliable as u8);
        put_bytes_lp(out, &self.payload);
    }

    fn read(buf: &mut Bytes) -> CodecResult<Self> {
        Ok(VoiceDown {
            from_player: get_player_id(buf, "from player id")?,
            reliable: get_u8(buf, "reliable flag")? != 0,
            payload: get_bytes_lp(buf, "payload")?,
        })
    }
}

/// Client (acting as host) → server: a payload for exactly one other player.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceDirected {
    pub target_player: PlayerId,
    pub reliable: bool,
    pub payload: Bytes,
}

impl WireMessage for VoiceDirected {
    const NAME: &'static str = "voicerelay.v1.VoiceDirected";

    fn write(&self, out: &mut BytesMut) {
        put_bytes_lp(out, self.target_player.as_bytes());
        out.put_u8(self.reliable as u8);
        put_bytes_lp(out, &self.payload);
    }

    fn read(buf: &mut Bytes) -> CodecResult<Self> {
        Ok(VoiceDirected {
            target_player: get_player_id(buf, "target player id")?,
            reliable: get_u8(buf, "reliable flag")? != 0,
            payload: get_bytes_lp(buf, "payload")?,
        })
    }
}

/// Host-side binding of a transport peer to its player identity. Sent once,
/// reliably, before any voice traffic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinAnnounce {
    pub player: PlayerId,
}

impl WireMessage for JoinAnnounce {
    const NAME: &'static str = "voicerelay.v1.JoinAnnounce";

    fn write(&self, out: &mut BytesMut) {
        put_bytes_lp(out, self.player.as_bytes());
    }

    fn read(buf: &mut Bytes) -> CodecResult<Self> {
        Ok(JoinAnnounce {
            player: get_player_id(buf, "player id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vr_codec::{decode, MessageCodec};

    fn player(b: u8) -> PlayerId {
        PlayerId::from_bytes([b; 16])
    }

    #[test]
    fn voice_up_layout() {
        let msg = VoiceUp {
            reliable: true,
            payload: Bytes::from_static(&[0x8B, 0xC7, 0x02, 0xAA]),
        };
        let mut out = BytesMut::new();
        msg.write(&mut out);
        // reliable flag, u32 LE length, payload bytes
        assert_eq!(
            out.as_ref(),
            &[0x01, 0x04, 0x00, 0x00, 0x00, 0x8B, 0xC7, 0x02, 0xAA]
        );
    }

    #[test]
    fn voice_down_roundtrip() {
        let msg = VoiceDown {
            from_player: player(0xA1),
            reliable: false,
            payload: Bytes::from_static(b"frame"),
        };
        let encoded = MessageCodec::<()>::encode(&msg);
        assert_eq!(decode::<VoiceDown>(encoded).unwrap(), msg);
    }

    #[test]
    fn directed_roundtrip() {
        let msg = VoiceDirected {
            target_player: player(0x42),
            reliable: true,
            payload: Bytes::from_static(&[0x8B, 0xC7, 0x02]),
        };
        let encoded = MessageCodec::<()>::encode(&msg);
        assert_eq!(decode::<VoiceDirected>(encoded).unwrap(), msg);
    }

    #[test]
    fn player_id_must_be_sixteen_bytes() {
        let mut out = BytesMut::new();
        put_bytes_lp(&mut out, &[0u8; 15]);
        out.put_u8(0);
        put_bytes_lp(&mut out, b"");
        let err = VoiceDown::read(&mut out.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }
}
