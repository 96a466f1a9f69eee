//! Length-prefixed typed message codec.
//!
//! Every application message type is identified by a stable 8-byte hash of
//! its canonical name. Outbound messages are written as `hash ++ body`;
//! inbound buffers are dispatched to the handler subscribed for that hash.
//!
//! Both ends must register the same types before any traffic flows so the
//! hash table lines up. Envelope bodies are little-endian throughout; the
//! helpers at the bottom of this module are the single place that encodes
//! that convention.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("message shorter than the type-hash prefix ({len} bytes)")]
    ShortMessage { len: usize },

    #[error("unknown message type hash {hash:#018x}")]
    UnknownType { hash: u64 },

    #[error("message type {name} already registered (or hash collision)")]
    DuplicateType { name: &'static str },

    #[error("message type {name} not registered")]
    Unregistered { name: &'static str },

    #[error("truncated message while reading {what}")]
    Truncated { what: &'static str },

    #[error("malformed field: {what}")]
    Malformed { what: &'static str },
}

/// Stable 8-byte type hash: FNV-1a over the canonical type name.
pub fn type_hash(name: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = OFFSET;
    for &b in name.as_bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// A message with an explicit wire layout and a canonical name.
///
/// `NAME` must never change once clients are in the wild; the type hash is
/// derived from it.
pub trait WireMessage: Sized {
    const NAME: &'static str;

    fn write(&self, out: &mut BytesMut);
    fn read(buf: &mut Bytes) -> CodecResult<Self>;
}

type Handler<Ctx> = Box<dyn FnMut(&mut Bytes, &Ctx) -> CodecResult<()>>;

/// Registry of message types plus the inbound dispatch table.
///
/// `Ctx` is the per-message context handed to subscribers (the originating
/// peer, in the relay).
pub struct MessageCodec<Ctx> {
    registered: HashMap<u64, &'static str>,
    handlers: HashMap<u64, Handler<Ctx>>,
}

impl<Ctx> MessageCodec<Ctx> {
    pub fn new() -> Self {
        Self {
            registered: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Register a message type. Registration must happen in the same order
    /// on every endpoint, before any traffic flows.
    pub fn register<M: WireMessage>(&mut self) -> CodecResult<()> {
        let hash = type_hash(M::NAME);
        if self.registered.insert(hash, M::NAME).is_some() {
            return Err(CodecError::DuplicateType { name: M::NAME });
        }
        trace!(name = M::NAME, hash = format_args!("{hash:#018x}"), "registered message type");
        Ok(())
    }

    /// Subscribe a handler for inbound messages of type `M`.
    pub fn subscribe<M, F>(&mut self, mut handler: F) -> CodecResult<()>
    where
        M: WireMessage + 'static,
        F: FnMut(M, &Ctx) + 'static,
    {
        let hash = type_hash(M::NAME);
        if !self.registered.contains_key(&hash) {
            return Err(CodecError::Unregistered { name: M::NAME });
        }
        self.handlers.insert(
            hash,
            Box::new(move |buf, ctx| {
                let msg = M::read(buf)?;
                handler(msg, ctx);
                Ok(())
            }),
        );
        Ok(())
    }

    /// Append `hash ++ body` for one message.
    pub fn write<M: WireMessage>(out: &mut BytesMut, msg: &M) {
        out.put_u64_le(type_hash(M::NAME));
        msg.write(out);
    }

    /// Encode one message into a fresh buffer.
    pub fn encode<M: WireMessage>(msg: &M) -> Bytes {
        let mut out = BytesMut::new();
        Self::write(&mut out, msg);
        out.freeze()
    }

    /// Read one inbound message and dispatch it to its subscriber.
    pub fn dispatch(&mut self, mut data: Bytes, ctx: &Ctx) -> CodecResult<()> {
        if data.len() < 8 {
            return Err(CodecError::ShortMessage { len: data.len() });
        }
        let hash = data.get_u64_le();
        match self.handlers.get_mut(&hash) {
            Some(handler) => handler(&mut data, ctx),
            None => Err(CodecError::UnknownType { hash }),
        }
    }
}

impl<Ctx> Default for MessageCodec<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a standalone `hash ++ body` buffer as one specific type.
/// Intended for tests and tools; the server side goes through `dispatch`.
pub fn decode<M: WireMessage>(mut data: Bytes) -> CodecResult<M> {
    if data.len() < 8 {
        return Err(CodecError::ShortMessage { len: data.len() });
    }
    let hash = data.get_u64_le();
    if hash != type_hash(M::NAME) {
        return Err(CodecError::UnknownType { hash });
    }
    M::read(&mut data)
}

// ---- little-endian field helpers ----

pub fn get_u8(buf: &mut Bytes, what: &'static str) -> CodecResult<u8> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated { what });
    }
    Ok(buf.get_u8())
}

pub fn get_u32_le(buf: &mut Bytes, what: &'static str) -> CodecResult<u32> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated { what });
    }
    Ok(buf.get_u32_le())
}

/// Read a `u32` length-prefixed byte string.
pub fn get_bytes_lp(buf: &mut Bytes, what: &'static str) -> CodecResult<Bytes> {
    let len = get_u32_le(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated { what });
    }
    Ok(buf.split_to(len))
}

/// Write a `u32` length-prefixed byte string.
pub fn put_bytes_lp(out: &mut BytesMut, data: &[u8]) {
    out.put_u32_le(data.len() as u32);
    out.put_slice(data);
}
