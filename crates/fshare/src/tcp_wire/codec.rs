use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::Error;

/// Messages exchanged after a successful handshake.
///
/// HAVE carries the sender's whole bitfield, not a piece index, and PIECE
/// carries the whole file.
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    // <len=0001><id=0>
    Choke,
    // <len=0001><id=1>
    Unchoke,
    // <len=0001><id=2>
    Interested,
    // <len=0001><id=3>
    NotInterested,
    // <len=0001+X><id=4><bitfield>
    Have(Vec<u8>),
    // <len=0001+X><id=5><bitfield>
    Bitfield(Vec<u8>),
    // <len=0001><id=6>
    Request,
    // <len=0001+X><id=7><file>
    Piece(Bytes),
}

/// The IDs of the [`Core`] messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for CoreId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CoreId::*;
        match value {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            v => Err(Error::UnknownMessage(v)),
        }
    }
}

impl Core {
    pub fn id(&self) -> CoreId {
        match self {
            Core::Choke => CoreId::Choke,
            Core::Unchoke => CoreId::Unchoke,
            Core::Interested => CoreId::Interested,
            Core::NotInterested => CoreId::NotInterested,
            Core::Have(_) => CoreId::Have,
            Core::Bitfield(_) => CoreId::Bitfield,
            Core::Request => CoreId::Request,
            Core::Piece(_) => CoreId::Piece,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Core::Have(b) | Core::Bitfield(b) => b,
            Core::Piece(b) => b,
            _ => &[],
        }
    }

    /// Size of the message on the wire, length prefix included.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        4 + 1 + self.payload().len()
    }

    fn from_parts(id: u8, payload: BytesMut) -> Result<Self, Error> {
        let id = CoreId::try_from(id)?;

        use CoreId::*;
        if matches!(id, Choke | Unchoke | Interested | NotInterested | Request)
            && !payload.is_empty()
        {
            return Err(Error::UnexpectedPayload {
                id: id as u8,
                len: payload.len(),
            });
        }

        let msg = match id {
            Choke => Core::Choke,
            Unchoke => Core::Unchoke,
            Interested => Core::Interested,
            NotInterested => Core::NotInterested,
            Have => Core::Have(payload.to_vec()),
            Bitfield => Core::Bitfield(payload.to_vec()),
            Request => Core::Request,
            Piece => Core::Piece(payload.freeze()),
        };

        Ok(msg)
    }
}

/// Length prefixed [`Core`] messages. Frames announcing more than `max_len`
/// bytes are refused when sending and skipped when receiving.
#[derive(Debug, Clone)]
pub struct CoreCodec {
    max_len: usize,
    /// Bytes of an oversized frame that still have to be skipped.
    discarding: usize,
}

impl CoreCodec {
    /// `max_len` counts the type byte and the payload, it can't go over what
    /// the length prefix holds.
    pub fn new(max_len: usize) -> Self {
        Self { max_len: max_len.min(u32::MAX as usize), discarding: 0 }
    }
}

impl Default for CoreCodec {
    fn default() -> Self {
        Self::new(u32::MAX as usize)
    }
}

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(&mut self, item: Core, buf: &mut BytesMut) -> Result<(), Error> {
        let payload = item.payload();
        let len = 1 + payload.len();

        if len > self.max_len {
            return Err(Error::MessageTooLarge { len, max: self.max_len });
        }

        buf.reserve(item.len());
        buf.put_u32(len as u32);
        buf.put_u8(item.id() as u8);
        buf.extend_from_slice(payload);

        Ok(())
    }
}

impl Decoder for CoreCodec {
    type Item = Core;
    type Error = Error;

    /// Frames that can't be understood are logged and skipped, the stream
    /// keeps going with the next frame.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Core>, Error> {
        loop {
            if self.discarding > 0 {
                let n = self.discarding.min(buf.len());
                buf.advance(n);
                self.discarding -= n;
                if self.discarding > 0 {
                    return Ok(None);
                }
            }

            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at the length prefix without consuming it, we may not have
            // the whole message yet.
            let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
                as usize;

            if size == 0 {
                warn!("{}, skipping it", Error::EmptyFrame);
                buf.advance(4);
                continue;
            }

            if size > self.max_len {
                let e = Error::MessageTooLarge { len: size, max: self.max_len };
                warn!("{e}, skipping it");
                buf.advance(4);
                self.discarding = size;
                continue;
            }

            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let id = buf.get_u8();
            let payload = buf.split_to(size - 1);

            match Core::from_parts(id, payload) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => warn!("{e}, skipping it"),
            }
        }
    }
}
