//! Connection establishment: handshake, then bitfield exchange.
use std::sync::{atomic::Ordering, Arc};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, FshareBitfield},
    error::Error,
    peer::{
        session::{ConnectionState, Session},
        Connected, Direction, Handshaked, Idle, Peer, PeerCtx,
    },
    tcp_wire::{Core, CoreCodec, Handshake, HandshakeCodec},
    PEER_MSG_BOUND,
};

impl Peer<Idle> {
    /// Exchange handshakes, the outbound side sends first. On success the
    /// socket is switched to the [`CoreCodec`], keeping whatever was already
    /// buffered.
    #[tracing::instrument(skip_all, name = "peer::handshake")]
    pub async fn handshake(self) -> Result<Peer<Handshaked>, Error> {
        let Idle { direction, daemon_ctx, socket, expected_id } = self.state;
        let local_id = daemon_ctx.config.local_id;
        let local = socket.local_addr()?;
        let remote = socket.peer_addr()?;

        let mut session = Session::default();
        let mut socket = Framed::new(socket, HandshakeCodec);
        let our_handshake = Handshake::new(local_id);

        // if we are connecting, send the first handshake
        if direction == Direction::Outbound {
            debug!("{local} sending the first handshake to {remote}");
            socket.send(our_handshake.clone()).await?;
        }

        let their_handshake = match socket.next().await {
            Some(Ok(handshake)) => handshake,
            Some(Err(e)) => return Err(e),
            None => {
                warn!("{remote} did not send a handshake");
                return Err(Error::PeerClosedSocket);
            }
        };
        debug!("{local} received their handshake {remote}");

        if !their_handshake.validate() {
            warn!("{remote} handshake header does not match, accepting it");
        }

        let peer_id = their_handshake.peer_id;

        if peer_id == local_id {
            warn!("{remote} handshake carries our own id");
            return Err(Error::HandshakeInvalid);
        }

        if let Some(expected) = expected_id.filter(|e| *e != peer_id) {
            warn!("{remote} dialed as peer {expected} but it is peer {peer_id}");
        }

        // if inbound, we have already received their first handshake,
        // send our second handshake here.
        if direction == Direction::Inbound {
            debug!("{local} sending the second handshake to {remote}");
            socket.send(our_handshake).await?;
        }

        let old_parts = socket.into_parts();
        let codec = CoreCodec::new(daemon_ctx.config.max_message_len());
        let mut new_parts = FramedParts::new::<Core>(old_parts.io, codec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        match direction {
            Direction::Outbound => daemon_ctx.activity.connection_made(peer_id),
            Direction::Inbound => daemon_ctx.activity.connected_from(peer_id),
        }

        session.advance(ConnectionState::AwaitingBitfield);

        Ok(Peer {
            state: Handshaked { direction, daemon_ctx, socket, peer_id, session },
        })
    }
}

impl Peer<Handshaked> {
    /// Send our bitfield, wait for theirs and tell the peer if we are
    /// interested in it.
    #[tracing::instrument(skip_all, name = "peer::bitfield")]
    pub async fn exchange_bitfields(self) -> Result<Peer<Connected>, Error> {
        let Handshaked { direction, daemon_ctx, mut socket, peer_id, mut session } =
            self.state;
        let remote = socket.get_ref().peer_addr()?;

        debug!("{remote} sending bitfield");
        socket.send(Core::Bitfield(daemon_ctx.pieces.snapshot().await)).await?;

        // kept out of the store until the session is registered, a duplicate
        // session must not touch the state of the registered one.
        let remote_pieces = loop {
            match socket.next().await {
                Some(Ok(Core::Bitfield(bitfield))) => {
                    debug!("{remote} < bitfield");
                    match Bitfield::from_snapshot(&bitfield, daemon_ctx.pieces.pieces()) {
                        Ok(b) => break Some(b),
                        Err(e) => {
                            warn!("{remote} {e}");
                            break None;
                        }
                    }
                }
                Some(Ok(msg)) => {
                    warn!("{remote} sent {:?} before its bitfield, discarding it", msg.id());
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::PeerClosedSocket),
            }
        };

        let interested = match &remote_pieces {
            Some(theirs) => daemon_ctx.pieces.wants_from(theirs).await,
            None => false,
        };

        if interested {
            debug!("{remote} sending interested");
            socket.send(Core::Interested).await?;
        } else {
            debug!("{remote} sending not_interested");
            socket.send(Core::NotInterested).await?;
        }

        let (tx, rx) = mpsc::channel(PEER_MSG_BOUND);
        let ctx = Arc::new(PeerCtx::new(peer_id, direction, remote, tx));
        ctx.am_interested.store(interested, Ordering::Release);

        let (sink, stream) = socket.split();
        session.advance(ConnectionState::Ready);

        Ok(Peer {
            state: Connected {
                ctx,
                daemon_ctx,
                sink,
                stream,
                rx,
                session,
                remote_pieces,
            },
        })
    }
}
