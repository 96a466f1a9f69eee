//! Frame layout: one frame per datagram, little-endian fields.
//!
//! ```text
//! [0x01][u16 len][key bytes]                        connect request
//! [0x02] / [0x03] / [0x04]                          accept / reject / disconnect
//! [0x05] / [0x06]                                   ping / pong
//! [0x07][class][u16 seq][frag idx][frag cnt][data]  data
//! [0x08][class][u16 seq]                            ack
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Reliability;

const CONNECT_REQUEST: u8 = 0x01;
const CONNECT_ACCEPT: u8 = 0x02;
const CONNECT_REJECT: u8 = 0x03;
const DISCONNECT: u8 = 0x04;
const PING: u8 = 0x05;
const PONG: u8 = 0x06;
const DATA: u8 = 0x07;
const ACK: u8 = 0x08;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    ConnectRequest {
        key: String,
    },
    ConnectAccept,
    ConnectReject,
    Disconnect,
    Ping,
    Pong,
    Data {
        class: Reliability,
        seq: u16,
        frag_index: u8,
        frag_count: u8,
        payload: Bytes,
    },
    Ack {
        class: Reliability,
        seq: u16,
    },
}

fn class_byte(class: Reliability) -> u8 {
    match class {
        Reliability::Unreliable => 0,
        Reliability::ReliableOrdered => 1,
        Reliability::ReliableSequenced => 2,
    }
}

fn class_from_byte(b: u8) -> Option<Reliability> {
    match b {
        0 => Some(Reliability::Unreliable),
        1 => Some(Reliability::ReliableOrdered),
        2 => Some(Reliability::ReliableSequenced),
        _ => None,
    }
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        match self {
            Frame::ConnectRequest { key } => {
                out.put_u8(CONNECT_REQUEST);
                out.put_u16_le(key.len() as u16);
                out.put_slice(key.as_bytes());
            }
            Frame::ConnectAccept => out.put_u8(CONNECT_ACCEPT),
            Frame::ConnectReject => out.put_u8(CONNECT_REJECT),
            Frame::Disconnect => out.put_u8(DISCONNECT),
            Frame::Ping => out.put_u8(PING),
            Frame::Pong => out.put_u8(PONG),
            Frame::Data {
                class,
                seq,
                frag_index,
                frag_count,
                payload,
            } => {
                out.put_u8(DATA);
                out.put_u8(class_byte(*class));
                out.put_u16_le(*seq);
                out.put_u8(*frag_index);
                out.put_u8(*frag_count);
                out.put_slice(payload);
            }
            Frame::Ack { class, seq } => {
                out.put_u8(ACK);
                out.put_u8(class_byte(*class));
                out.put_u16_le(*seq);
            }
        }
        out.to_vec()
    }

    /// `None` on any malformed datagram; the caller counts and drops it.
    pub fn decode(mut buf: Bytes) -> Option<Frame> {
        if buf.is_empty() {
            return None;
        }
        match buf.get_u8() {
            CONNECT_REQUEST => {
                if buf.remaining() < 2 {
                    return None;
                }
                let len = buf.get_u16_le() as usize;
                if buf.remaining() != len {
                    return None;
                }
                let key = String::from_utf8(buf.to_vec()).ok()?;
                Some(Frame::ConnectRequest { key })
            }
            CONNECT_ACCEPT => Some(Frame::ConnectAccept),
            CONNECT_REJECT => Some(Frame::ConnectReject),
            DISCONNECT => Some(Frame::Disconnect),
            PING => Some(Frame::Ping),
            PONG => Some(Frame::Pong),
            DATA => {
                if buf.remaining() < 5 {
                    return None;
                }
                let class = class_from_byte(buf.get_u8())?;
                let seq = buf.get_u16_le();
                let frag_index = buf.get_u8();
                let frag_count = buf.get_u8();
                if frag_count == 0 || frag_index >= frag_count {
                    return None;
                }
                Some(Frame::Data {
                    class,
                    seq,
                    frag_index,
                    frag_count,
                    payload: buf,
                })
            }
            ACK => {
                if buf.remaining() != 3 {
                    return None;
                }
                let class = class_from_byte(buf.get_u8())?;
                let seq = buf.get_u16_le();
                Some(Frame::Ack { class, seq })
            }
            _ => None,
        }
    }
}

/// Wrapping comparison over the u16 sequence space: true when `a` is in the
/// half-window ahead of `b`.
pub(crate) fn seq_newer(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}
