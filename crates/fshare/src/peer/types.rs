use std::{
    fmt::Display,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::sync::mpsc;

/// Numeric identifier of a peer, as listed in the peer info file and sent in
/// the handshake.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct PeerId(pub u32);

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PeerId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PeerId> for u32 {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

/// Messages used to control the peer state or to make the peer forward a
/// message.
#[derive(Debug)]
pub enum PeerMsg {
    /// Sent by the choker, the peer only forwards it if it is currently
    /// choking the remote.
    Unchoke,
    /// Sent by the choker.
    Choke,
    /// Forward our current bitfield to the remote peer.
    Have(Vec<u8>),
    /// We don't need anything from this peer anymore, usually because the
    /// file is complete.
    NotInterested,
    /// When the program is being gracefuly shutdown, we need to kill the tokio
    /// green thread of the peer.
    Quit,
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// Ctx that is shared with the registry and the choker.
/// The flags are written only by the peer task that owns the session.
#[derive(Debug)]
pub struct PeerCtx {
    pub direction: Direction,
    pub remote_addr: SocketAddr,
    pub id: PeerId,
    pub tx: mpsc::Sender<PeerMsg>,

    /// If we're choking the peer, we don't upload to them.
    pub am_choking: AtomicBool,

    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: AtomicBool,

    /// If the peer is choking us.
    pub peer_choking: AtomicBool,
}

impl PeerCtx {
    pub fn new(
        id: PeerId,
        direction: Direction,
        remote_addr: SocketAddr,
        tx: mpsc::Sender<PeerMsg>,
    ) -> Self {
        Self {
            direction,
            remote_addr,
            id,
            tx,
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
        }
    }

    pub fn is_choking(&self) -> bool {
        self.am_choking.load(Ordering::Acquire)
    }

    pub fn is_choked_by_peer(&self) -> bool {
        self.peer_choking.load(Ordering::Acquire)
    }
}
