//! Wrapper types around Bitvec, and the store of the local and remote piece
//! availability.
use bitvec::prelude::*;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::{error::Error, peer::PeerId};

/// Bitfield where index = piece, the high bit of byte 0 is piece 0.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait FshareBitfield {
    /// An empty bitfield able to hold `pieces` pieces.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Number of bytes on the wire for a bitfield of `pieces` pieces.
    fn byte_len(pieces: usize) -> usize {
        pieces.div_ceil(8)
    }

    /// Rebuild a bitfield from its wire form, which must be exactly
    /// [`FshareBitfield::byte_len`] bytes.
    fn from_snapshot(bytes: &[u8], pieces: usize) -> Result<Bitfield, Error> {
        let expected = Bitfield::byte_len(pieces);
        if bytes.len() != expected {
            return Err(Error::BitfieldLength { expected, got: bytes.len() });
        }
        let mut b = Bitfield::from_vec(bytes.to_vec());
        b.truncate(pieces);
        Ok(b)
    }

    fn snapshot(&self) -> Vec<u8>;

    /// Out of range indices are reported as missing.
    fn has_piece(&self, index: usize) -> bool;

    /// Out of range indices are ignored.
    fn set_piece(&mut self, index: usize);

    fn is_complete(&self) -> bool;

    /// If `remote` has at least one piece that we don't.
    fn wants_from(&self, remote: &Bitfield) -> bool;
}

impl FshareBitfield for Bitfield {
    fn snapshot(&self) -> Vec<u8> {
        self.as_raw_slice().to_vec()
    }

    fn has_piece(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn set_piece(&mut self, index: usize) {
        if index < self.len() {
            self.set(index, true);
        }
    }

    fn is_complete(&self) -> bool {
        self.all()
    }

    fn wants_from(&self, remote: &Bitfield) -> bool {
        remote.iter_ones().any(|i| !self.has_piece(i))
    }
}

/// Piece availability of the local peer, and the last bitfield received from
/// each remote peer.
#[derive(Debug)]
pub struct BitfieldStore {
    pieces: usize,
    local: RwLock<Bitfield>,
    remote: RwLock<HashMap<PeerId, Bitfield>>,
}

impl BitfieldStore {
    pub fn new(pieces: usize, has_file: bool) -> Self {
        let mut local = Bitfield::from_piece(pieces);
        if has_file {
            local.fill(true);
        }
        Self { pieces, local: RwLock::new(local), remote: RwLock::default() }
    }

    pub fn pieces(&self) -> usize {
        self.pieces
    }

    pub async fn set(&self, index: usize) {
        self.local.write().await.set_piece(index);
    }

    pub async fn get(&self, index: usize) -> bool {
        self.local.read().await.has_piece(index)
    }

    pub async fn set_all(&self) {
        self.local.write().await.fill(true);
    }

    pub async fn is_complete(&self) -> bool {
        self.local.read().await.is_complete()
    }

    /// Byte copy of the local bitfield, safe to hand to other tasks.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.local.read().await.snapshot()
    }

    /// Overwrite the cached copy of a remote peer's bitfield. On a length
    /// mismatch the previous copy is kept.
    pub async fn replace_remote(
        &self,
        peer: PeerId,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let bitfield = Bitfield::from_snapshot(bytes, self.pieces)?;
        self.insert_remote(peer, bitfield).await;
        Ok(())
    }

    pub async fn insert_remote(&self, peer: PeerId, bitfield: Bitfield) {
        self.remote.write().await.insert(peer, bitfield);
    }

    pub async fn remote(&self, peer: PeerId) -> Option<Bitfield> {
        self.remote.read().await.get(&peer).cloned()
    }

    pub async fn forget_remote(&self, peer: PeerId) {
        self.remote.write().await.remove(&peer);
    }

    /// If `peer` has any piece missing locally. Peers we have no bitfield
    /// from are not interesting.
    pub async fn is_interesting(&self, peer: PeerId) -> bool {
        let remote = self.remote.read().await;
        let Some(theirs) = remote.get(&peer) else { return false };
        self.wants_from(theirs).await
    }

    /// If `remote` has any piece missing locally.
    pub async fn wants_from(&self, remote: &Bitfield) -> bool {
        self.local.read().await.wants_from(remote)
    }
}
