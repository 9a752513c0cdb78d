//! Types for the peer wire protocol: the fixed size handshake and the
//! length prefixed messages that follow it.
mod codec;
mod handshake_codec;

pub use codec::*;
pub use handshake_codec::*;

/// Protocol identifier that opens every handshake.
pub static PSTR: [u8; 18] = *b"P2PFILESHARINGPROJ";

/// Size of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 32;
