//! Marmot handoff protocol reference implementation.
//! Message model and line framing only: no sockets, no runtime.

pub mod protocol;
pub mod wire;

pub use protocol::{now_ms, Message, PROTOCOL_VERSION};
pub use wire::{decode_line, encode_line, CodecError, MarmotCodec, ProtocolError};
