//! Whole-file transfer between two connected peers.
//!
//! Once unchoked, a peer that misses pieces sends a single REQUEST. The
//! answer is a single PIECE with the whole file, after which the receiver owns
//! every piece.
use std::sync::atomic::Ordering;

use bytes::Bytes;
use futures::SinkExt;
use tokio::spawn;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    peer::{Connected, Peer, PeerMsg},
    tcp_wire::Core,
};

impl Peer<Connected> {
    /// Ask for the file, unless we have it, already asked, or the peer is
    /// choking us.
    pub async fn request_file(&mut self) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;

        if self.state.ctx.is_choked_by_peer() {
            debug!("{remote} is choking us, not requesting");
            return Ok(());
        }
        if self.state.daemon_ctx.pieces.is_complete().await {
            debug!("{remote} unchoked us but we have every piece");
            return Ok(());
        }
        if self.state.session.request_pending {
            debug!("{remote} request already in flight");
            return Ok(());
        }

        debug!("{remote} sending request");
        self.state.session.start_request();
        self.state.sink.send(Core::Request).await?;

        Ok(())
    }

    /// Answer a request with the whole file. Peers we are choking are not
    /// served.
    pub async fn serve_request(&mut self) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;

        if self.state.ctx.is_choking() {
            warn!("{remote} requested while choked, ignoring");
            return Ok(());
        }

        let file = self.state.daemon_ctx.disk.read_full_file().await?;
        let len = file.len();

        debug!("{remote} sending piece of {len} bytes");
        self.state.sink.send(Core::Piece(Bytes::from(file))).await?;
        self.state.session.uploaded += len as u64;

        Ok(())
    }

    /// Persist a received file and tell everyone that we have it.
    #[tracing::instrument(skip_all, name = "transfer::receive", fields(peer = %self.id()))]
    pub async fn receive_file(&mut self, file: Bytes) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let id = self.id();
        let daemon_ctx = self.state.daemon_ctx.clone();

        let rate = self.state.session.finish_request(file.len());

        daemon_ctx.disk.write_full_file(&file).await?;
        daemon_ctx.pieces.set_all().await;

        if let Some(rate) = rate {
            debug!("{remote} download rate {rate:.3} bytes/ms");
            daemon_ctx.choker.record_rate(id, rate).await;
        }

        daemon_ctx.activity.downloaded_from(id);
        if daemon_ctx.activity.download_complete() {
            info!("downloaded the complete file from {id}");
        }

        // nothing left to ask from anyone, this peer included
        if self.state.ctx.am_interested.swap(false, Ordering::AcqRel) {
            debug!("{remote} sending not_interested");
            self.state.sink.send(Core::NotInterested).await?;
        }

        // the peer task must keep reading its own channel, fan out elsewhere
        let snapshot = daemon_ctx.pieces.snapshot().await;
        spawn(async move {
            daemon_ctx.peers.broadcast(|| PeerMsg::NotInterested).await;
            daemon_ctx.peers.broadcast_have(snapshot).await;
        });

        Ok(())
    }
}
