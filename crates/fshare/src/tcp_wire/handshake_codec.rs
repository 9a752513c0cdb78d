//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Handshakes are only sent once at
//! the beginning of a connection, after that the codec is switched to
//! [`CoreCodec`](super::CoreCodec), keeping the underlying buffers.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{HANDSHAKE_LEN, PSTR};
use crate::{error::Error, peer::PeerId};

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.extend_from_slice(&handshake.serialize());
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }

        let mut pstr = [0; 18];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 10];
        buf.copy_to_slice(&mut reserved);
        let peer_id = PeerId(buf.get_u32());

        Ok(Some(Handshake { pstr, reserved, peer_id }))
    }
}

/// pstr = "P2PFILESHARINGPROJ"
/// The very first message exchanged on a connection, 18 bytes of protocol
/// identifier, 10 zero bytes and the sender's peer id as a big-endian u32.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub pstr: [u8; 18],
    pub reserved: [u8; 10],
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(peer_id: PeerId) -> Self {
        Self { pstr: PSTR, reserved: [0; 10], peer_id }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.extend_from_slice(&self.pstr);
        buf.extend_from_slice(&self.reserved);
        buf.put_u32(self.peer_id.0);

        let mut out = [0u8; HANDSHAKE_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Check the protocol identifier and the zero bytes. Callers decide what
    /// to do with a mismatch, the peer id is always usable.
    pub fn validate(&self) -> bool {
        if self.pstr != PSTR {
            warn!("! handshake with wrong protocol identifier");
            return false;
        }
        if self.reserved != [0; 10] {
            warn!("! handshake with non-zero reserved bytes");
            return false;
        }
        true
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn handshake() {
        let our_handshake = Handshake::new(PeerId(1001));

        assert_eq!(our_handshake.pstr, PSTR);
        assert_eq!(our_handshake.peer_id, PeerId(1001));
        assert!(our_handshake.validate());

        assert_eq!(
            our_handshake.serialize(),
            [
                80, 50, 80, 70, 73, 76, 69, 83, 72, 65, 82, 73, 78, 71, 80, 82,
                79, 74, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 3, 233
            ]
        );
    }

    #[test]
    fn decode() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Handshake::new(PeerId(7)).serialize()[..20]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(Handshake::new(PeerId(7)), &mut buf).unwrap();
        // a message right behind the handshake stays in the buffer
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);

        let handshake = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(handshake.peer_id, PeerId(7));
        assert_eq!(&buf[..], &[0, 0, 0, 1, 2]);
    }

    #[test]
    fn identifier_is_not_enforced() {
        let mut raw = Handshake::new(PeerId(1002)).serialize();
        raw[0] = b'X';
        raw[20] = 1;

        let mut buf = BytesMut::from(&raw[..]);
        let handshake = HandshakeCodec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(handshake.peer_id, PeerId(1002));
        assert!(!handshake.validate());
    }
}
