//! A remote peer in the network that we share the file with.
pub mod session;
mod types;

// re-exports
pub use types::*;

use std::sync::{atomic::Ordering, Arc};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, select, sync::mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{
    bitfield::Bitfield,
    daemon::DaemonCtx,
    error::{Error, ErrorKind},
    peer::session::{ConnectionState, Session},
    tcp_wire::{Core, CoreCodec},
};

/// A connection with a remote peer, the state `S` tells how far the
/// connection got.
pub struct Peer<S: PeerState> {
    pub state: S,
}

pub trait PeerState {}

/// A TCP connection that did not exchange handshakes yet.
pub struct Idle {
    pub direction: Direction,
    pub daemon_ctx: Arc<DaemonCtx>,
    pub socket: TcpStream,
    /// For outbound connections, the peer we meant to dial.
    pub expected_id: Option<PeerId>,
}

/// Handshakes were exchanged, bitfields were not.
pub struct Handshaked {
    pub direction: Direction,
    pub daemon_ctx: Arc<DaemonCtx>,
    pub socket: Framed<TcpStream, CoreCodec>,
    pub peer_id: PeerId,
    pub session: Session,
}

/// Ready to exchange any message.
pub struct Connected {
    /// Shared with the registry, the choker can send messages to this peer
    /// through `ctx.tx`.
    pub ctx: Arc<PeerCtx>,
    pub daemon_ctx: Arc<DaemonCtx>,
    pub sink: SplitSink<Framed<TcpStream, CoreCodec>, Core>,
    pub stream: SplitStream<Framed<TcpStream, CoreCodec>>,
    pub rx: mpsc::Receiver<PeerMsg>,
    pub session: Session,
    /// The bitfield received during the exchange, moved into the
    /// [`BitfieldStore`] once the session is registered.
    ///
    /// [`BitfieldStore`]: crate::bitfield::BitfieldStore
    pub remote_pieces: Option<Bitfield>,
}

impl PeerState for Idle {}
impl PeerState for Handshaked {}
impl PeerState for Connected {}

impl Peer<Idle> {
    pub fn new(
        direction: Direction,
        daemon_ctx: Arc<DaemonCtx>,
        socket: TcpStream,
    ) -> Self {
        Self { state: Idle { direction, daemon_ctx, socket, expected_id: None } }
    }

    pub fn expected_id(mut self, id: PeerId) -> Self {
        self.state.expected_id = Some(id);
        self
    }
}

impl Peer<Connected> {
    pub fn id(&self) -> PeerId {
        self.state.ctx.id
    }

    /// Start the event loop of the Peer, listen to messages sent by the
    /// remote peer and by the rest of the daemon, until one side closes the
    /// connection.
    #[tracing::instrument(skip_all, name = "peer::run", fields(peer = %self.id()))]
    pub async fn run(&mut self) -> Result<(), Error> {
        self.state.session.advance(ConnectionState::Ready);
        let remote = self.state.ctx.remote_addr;

        loop {
            select! {
                msg = self.state.stream.next() => {
                    let Some(msg) = msg else {
                        debug!("{remote} closed the connection");
                        break;
                    };
                    if let Err(e) = self.handle_message(msg?).await {
                        match e.kind() {
                            ErrorKind::Protocol | ErrorKind::Storage => {
                                warn!("{remote} {e}");
                            }
                            _ => return Err(e),
                        }
                    }
                }
                msg = self.state.rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        PeerMsg::Unchoke => {
                            if self.state.ctx.am_choking.swap(false, Ordering::AcqRel) {
                                debug!("{remote} sending unchoke");
                                self.state.sink.send(Core::Unchoke).await?;
                            }
                        }
                        PeerMsg::Choke => {
                            debug!("{remote} sending choke");
                            self.state.ctx.am_choking.store(true, Ordering::Release);
                            self.state.sink.send(Core::Choke).await?;
                        }
                        PeerMsg::Have(bitfield) => {
                            debug!("{remote} sending have");
                            self.state.sink.send(Core::Have(bitfield)).await?;
                        }
                        PeerMsg::NotInterested => {
                            if self.state.ctx.am_interested.swap(false, Ordering::AcqRel) {
                                debug!("{remote} sending not_interested");
                                self.state.sink.send(Core::NotInterested).await?;
                            }
                        }
                        PeerMsg::Quit => {
                            debug!("{remote} quitting");
                            break;
                        }
                    }
                }
            }
        }

        self.state.session.advance(ConnectionState::Closed);
        if let Err(e) = self.state.sink.close().await {
            debug!("{remote} could not close the socket: {e}");
        }

        let session = &self.state.session;
        debug!(
            "{remote} closed after {:?}, downloaded {} bytes, uploaded {} bytes",
            session.connected_at.elapsed(),
            session.downloaded,
            session.uploaded,
        );

        Ok(())
    }

    /// Dispatch one message received from the remote peer.
    pub async fn handle_message(&mut self, msg: Core) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let id = self.id();
        let daemon_ctx = self.state.daemon_ctx.clone();

        match msg {
            Core::Choke => {
                debug!("{remote} < choke");
                self.state.ctx.peer_choking.store(true, Ordering::Release);
                // an unanswered request will not be answered anymore
                self.state.session.request_pending = false;
                daemon_ctx.activity.choked_by(id);
            }
            Core::Unchoke => {
                debug!("{remote} < unchoke");
                self.state.ctx.peer_choking.store(false, Ordering::Release);
                daemon_ctx.activity.unchoked_by(id);
                self.request_file().await?;
            }
            Core::Interested => {
                debug!("{remote} < interested");
                daemon_ctx.choker.mark_interested(id).await;
                daemon_ctx.activity.received_interested(id);
            }
            Core::NotInterested => {
                debug!("{remote} < not_interested");
                daemon_ctx.choker.mark_not_interested(id).await;
                daemon_ctx.activity.received_not_interested(id);
            }
            Core::Have(bitfield) => {
                debug!("{remote} < have");
                daemon_ctx.activity.received_have(id);
                daemon_ctx.pieces.replace_remote(id, &bitfield).await?;
                self.update_interest().await?;
            }
            Core::Bitfield(bitfield) => {
                debug!("{remote} < bitfield");
                daemon_ctx.pieces.replace_remote(id, &bitfield).await?;
                self.update_interest().await?;
            }
            Core::Request => {
                debug!("{remote} < request");
                self.serve_request().await?;
            }
            Core::Piece(file) => {
                debug!("{remote} < piece of {} bytes", file.len());
                self.receive_file(file).await?;
            }
        }

        Ok(())
    }

    /// Send interested or not interested if the remote's pieces changed our
    /// interest in it.
    pub async fn update_interest(&mut self) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let interested =
            self.state.daemon_ctx.pieces.is_interesting(self.id()).await;

        if self.state.ctx.am_interested.swap(interested, Ordering::AcqRel)
            == interested
        {
            return Ok(());
        }

        if interested {
            debug!("{remote} sending interested");
            self.state.sink.send(Core::Interested).await?;
        } else {
            debug!("{remote} sending not_interested");
            self.state.sink.send(Core::NotInterested).await?;
        }

        Ok(())
    }
}
