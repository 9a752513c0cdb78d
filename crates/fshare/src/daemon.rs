//! The daemon is the peer process. It owns the state shared by every session
//! and runs the listener, the outbound connections and the choker.
use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, signal, spawn, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    activity::ActivityLog,
    bitfield::BitfieldStore,
    choker::Choker,
    config::{PeerInfo, ResolvedConfig},
    disk::Disk,
    error::Error,
    registry::Registry,
};

/// Context shared by the sessions, the choker and the daemon.
#[derive(Debug)]
pub struct DaemonCtx {
    pub config: ResolvedConfig,
    /// Our own line of the peer info file.
    pub local: PeerInfo,
    pub pieces: BitfieldStore,
    pub peers: Registry,
    pub choker: Choker,
    pub disk: Disk,
    pub activity: ActivityLog,
}

pub struct Daemon {
    pub ctx: Arc<DaemonCtx>,
}

impl Daemon {
    pub fn new(config: ResolvedConfig) -> Result<Self, Error> {
        let local = config.local()?.clone();

        let ctx = DaemonCtx {
            pieces: BitfieldStore::new(config.pieces(), local.has_file),
            peers: Registry::new(),
            choker: Choker::new(config.local_id, config.preferred_neighbors),
            disk: Disk::new(&config),
            activity: ActivityLog::new(config.local_id),
            local,
            config,
        };

        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Listen on the configured port and run until Ctrl-C.
    pub async fn run(self) -> Result<(), Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.ctx.local.port));
        let listener = TcpListener::bind(addr).await?;
        info!("peer {} listening on {addr}", self.ctx.local.id);

        let handle = self.spawn(listener).await;

        signal::ctrl_c().await?;
        info!("shutting down");
        handle.shutdown().await;

        Ok(())
    }

    /// Start accepting connections on `listener`, dial the peers listed
    /// before us and start the choker.
    pub async fn spawn(self, listener: TcpListener) -> DaemonHandle {
        let ctx = self.ctx;

        if ctx.local.has_file {
            match ctx.disk.split_into_pieces().await {
                Ok(n) => info!("shared file has {n} pieces"),
                Err(e) => warn!("{e}"),
            }
        }

        let mut tasks = vec![Registry::spawn_inbound_peers(ctx.clone(), listener)];
        tasks.extend(Choker::spawn(ctx.clone()));
        tasks.push(spawn(Registry::connect_to_earlier_peers(ctx.clone())));

        DaemonHandle { ctx, tasks }
    }
}

/// A running daemon.
pub struct DaemonHandle {
    pub ctx: Arc<DaemonCtx>,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Close the listener, stop the timers and close every session.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.ctx.peers.quit_all().await;
    }
}
