//! Voice relay wire types.
//!
//! Two layers live here, and they use different byte orders on purpose:
//!
//! - The three transport envelopes (`VoiceUp`, `VoiceDown`, `VoiceDirected`)
//!   plus the `JoinAnnounce` host message, encoded through the codec with
//!   little-endian fields.
//! - The opaque voice payload carried inside those envelopes, which the
//!   relay inspects only up to its three-byte prefix (big-endian magic plus
//!   a message-type discriminant) and for a handful of parsed message types.

mod envelope;
mod ids;
pub mod payload;

pub use envelope::{JoinAnnounce, VoiceDirected, VoiceDown, VoiceUp};
pub use ids::{ClientId, PlayerId};
