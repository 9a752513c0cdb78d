use std::{io, path::PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer::{PeerId, PeerMsg};

impl From<mpsc::error::SendError<PeerMsg>> for Error {
    fn from(value: mpsc::error::SendError<PeerMsg>) -> Self {
        Self::SendErrorPeer(value.to_string())
    }
}

/// Broad classes of failures, used to decide what a failure does to the
/// process: configuration errors abort startup, everything else is logged and
/// only affects the session or operation where it happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connection,
    Protocol,
    Storage,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not decode the toml configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The handshake or bitfield exchange took too long")]
    HandshakeTimeout,

    #[error("Peer closed the socket")]
    PeerClosedSocket,

    #[error("Peer {0} is not connected")]
    PeerUnavailable(PeerId),

    #[error("Peer {0} already has an open session")]
    DuplicatePeer(PeerId),

    #[error("Could not send message to Peer: `{0}`")]
    SendErrorPeer(String),

    #[error("Unknown message type `{0}`")]
    UnknownMessage(u8),

    #[error("Message with a length prefix of zero")]
    EmptyFrame,

    #[error("Message type `{id}` does not carry a payload, got {len} bytes")]
    UnexpectedPayload { id: u8, len: usize },

    #[error("Message of {len} bytes is larger than the limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("Bitfield has {got} bytes, expected {expected}")]
    BitfieldLength { expected: usize, got: usize },

    #[error("Could not read the file `{path}`: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Could not write the file `{path}`: {source}")]
    FileWrite { path: PathBuf, source: io::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            Config(_) | Toml(_) => ErrorKind::Config,
            UnknownMessage(_)
            | EmptyFrame
            | UnexpectedPayload { .. }
            | MessageTooLarge { .. }
            | BitfieldLength { .. } => ErrorKind::Protocol,
            FileRead { .. } | FileWrite { .. } => ErrorKind::Storage,
            IO(_)
            | HandshakeInvalid
            | HandshakeTimeout
            | PeerClosedSocket
            | PeerUnavailable(_)
            | DuplicatePeer(_)
            | SendErrorPeer(_) => ErrorKind::Connection,
        }
    }
}
