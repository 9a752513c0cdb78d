//! Sessions that finished the bitfield exchange, by peer id, and the code
//! that opens them.
use std::{sync::Arc, time::Duration};

use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    spawn,
    sync::{mpsc::error::TrySendError, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::PeerInfo,
    daemon::DaemonCtx,
    error::Error,
    peer::{Direction, Idle, Peer, PeerCtx, PeerId, PeerMsg},
};

/// Upper bound for the handshake and the bitfield exchange.
pub static HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// At most one session per peer id.
#[derive(Debug, Default)]
pub struct Registry {
    peers: RwLock<HashMap<PeerId, Arc<PeerCtx>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, ctx: Arc<PeerCtx>) -> Result<(), Error> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&ctx.id) {
            return Err(Error::DuplicatePeer(ctx.id));
        }
        peers.insert(ctx.id, ctx);
        Ok(())
    }

    /// Remove the session, only if it is still the registered one. Returns
    /// if it was removed.
    pub async fn remove(&self, ctx: &Arc<PeerCtx>) -> bool {
        let mut peers = self.peers.write().await;
        if peers.get(&ctx.id).is_some_and(|p| Arc::ptr_eq(p, ctx)) {
            peers.remove(&ctx.id);
            return true;
        }
        false
    }

    /// If `ctx` is the session registered for its peer id.
    pub async fn is_registered(&self, ctx: &Arc<PeerCtx>) -> bool {
        self.peers.read().await.get(&ctx.id).is_some_and(|p| Arc::ptr_eq(p, ctx))
    }

    pub async fn get(&self, id: PeerId) -> Option<Arc<PeerCtx>> {
        self.peers.read().await.get(&id).cloned()
    }

    /// Ids of the connected peers, ascending.
    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Send a message to every connected peer.
    pub async fn broadcast(&self, msg: impl Fn() -> PeerMsg) {
        let peers: Vec<Arc<PeerCtx>> =
            self.peers.read().await.values().cloned().collect();

        for peer in peers {
            if let Err(e) = peer.tx.send(msg()).await {
                debug!("could not send to peer {}: {e}", peer.id);
            }
        }
    }

    /// Send our bitfield to every connected peer, as HAVE messages.
    pub async fn broadcast_have(&self, bitfield: Vec<u8>) {
        self.broadcast(|| PeerMsg::Have(bitfield.clone())).await;
    }

    /// Tell the session of `id` to unchoke or choke the remote peer. The
    /// message is queued without waiting, a peer with a full queue misses
    /// this decision and gets the next one.
    pub async fn apply_choke_decision(
        &self,
        id: PeerId,
        should_unchoke: bool,
    ) -> Result<(), Error> {
        let peer = self.get(id).await.ok_or(Error::PeerUnavailable(id))?;
        let msg = if should_unchoke { PeerMsg::Unchoke } else { PeerMsg::Choke };

        match peer.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                warn!("peer {id} is not keeping up, dropping {msg:?}");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::PeerUnavailable(id)),
        }
    }

    /// Make every session close its socket.
    pub async fn quit_all(&self) {
        self.broadcast(|| PeerMsg::Quit).await;
    }

    /// Dial a peer and run the session once it is ready. Returns when the
    /// session is registered or the connection failed.
    #[tracing::instrument(skip_all, name = "registry::outbound", fields(peer = %info.id))]
    pub async fn connect_outbound(
        ctx: Arc<DaemonCtx>,
        info: PeerInfo,
    ) -> Result<(), Error> {
        debug!("connecting to {}", info.addr());
        let socket = TcpStream::connect(info.addr()).await?;
        let peer = Peer::new(Direction::Outbound, ctx.clone(), socket)
            .expected_id(info.id);
        Self::start_and_run_peer(ctx, peer).await
    }

    #[tracing::instrument(skip_all, name = "registry::inbound")]
    pub async fn accept_inbound(
        ctx: Arc<DaemonCtx>,
        socket: TcpStream,
    ) -> Result<(), Error> {
        let peer = Peer::new(Direction::Inbound, ctx.clone(), socket);
        Self::start_and_run_peer(ctx, peer).await
    }

    /// Establish the session, register it and spawn its event loop. When the
    /// loop ends the peer is removed from the registry and the choker.
    async fn start_and_run_peer(
        ctx: Arc<DaemonCtx>,
        peer: Peer<Idle>,
    ) -> Result<(), Error> {
        let establish = async { peer.handshake().await?.exchange_bitfields().await };

        let mut peer = timeout(HANDSHAKE_TIMEOUT, establish)
            .await
            .map_err(|_| Error::HandshakeTimeout)??;

        let peer_ctx = peer.state.ctx.clone();
        let id = peer_ctx.id;

        ctx.peers.insert(peer_ctx.clone()).await?;
        info!(
            "connected with peer {id} at {} ({:?})",
            peer_ctx.remote_addr, peer_ctx.direction
        );

        if let Some(bitfield) = peer.state.remote_pieces.take() {
            ctx.pieces.insert_remote(id, bitfield).await;
        }

        spawn(async move {
            if let Err(e) = peer.run().await {
                warn!("session with peer {id} ended: {e}");
            }

            // a new session for the same id can only register after the
            // removal, so its state is never cleared here.
            if ctx.peers.is_registered(&peer_ctx).await {
                ctx.choker.mark_not_interested(id).await;
                ctx.pieces.forget_remote(id).await;
                ctx.peers.remove(&peer_ctx).await;
            }

            info!("disconnected from peer {id}");
        });

        Ok(())
    }

    /// Accept connections until the task is aborted.
    pub fn spawn_inbound_peers(
        ctx: Arc<DaemonCtx>,
        listener: TcpListener,
    ) -> JoinHandle<()> {
        spawn(async move {
            debug!("accepting connections in {:?}", listener.local_addr());

            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        info!("received inbound connection from {addr}");
                        let ctx = ctx.clone();

                        spawn(async move {
                            if let Err(e) = Self::accept_inbound(ctx, socket).await {
                                warn!("inbound connection from {addr} failed: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("could not accept a connection: {e}"),
                }
            }
        })
    }

    /// Dial every peer listed before us in the peer info file, one after the
    /// other. Failures are logged and the peer is left out.
    pub async fn connect_to_earlier_peers(ctx: Arc<DaemonCtx>) {
        for info in ctx.config.peers_before_local().to_vec() {
            let id = info.id;
            if let Err(e) = Self::connect_outbound(ctx.clone(), info).await {
                warn!("could not connect to peer {id}: {e}");
            }
        }
    }
}
