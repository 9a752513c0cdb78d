use std::{future::Future, path::PathBuf, time::Duration};

use bytes::Bytes;
use fshare::{
    bitfield::{Bitfield, FshareBitfield},
    config::{PeerInfo, ResolvedConfig},
    daemon::{Daemon, DaemonHandle},
    peer::PeerId,
    tcp_wire::{Core, CoreCodec, Handshake, HandshakeCodec},
};
use futures::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_util::codec::{Framed, FramedParts};

const SEEDER: PeerId = PeerId(1001);
const LEECHER: PeerId = PeerId(1002);
const FILE_SIZE: usize = 2000;
const PIECE_SIZE: u64 = 300;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .with_file(false)
        .without_time()
        .try_init();
}

fn work_dir() -> PathBuf {
    let mut rng = rand::thread_rng();
    let name: String =
        (0..20).map(|_| rng.sample(Alphanumeric) as char).collect();
    PathBuf::from(format!("/tmp/{name}"))
}

fn file_content() -> Vec<u8> {
    (0..FILE_SIZE).map(|i| (i % 251) as u8).collect()
}

fn config(
    local_id: PeerId,
    peers: Vec<PeerInfo>,
    work_dir: PathBuf,
) -> ResolvedConfig {
    ResolvedConfig {
        local_id,
        preferred_neighbors: 1,
        unchoking_interval: Duration::from_secs(1),
        optimistic_unchoking_interval: Duration::from_secs(1),
        file_name: "shared.dat".into(),
        file_size: FILE_SIZE as u64,
        piece_size: PIECE_SIZE,
        peers,
        work_dir,
    }
}

fn peer_info(id: PeerId, port: u16, has_file: bool) -> PeerInfo {
    PeerInfo { id, host: "127.0.0.1".into(), port, has_file }
}

/// Pieces of the shared file, every one of them set.
fn full_bitfield() -> Vec<u8> {
    let pieces = (FILE_SIZE as u64).div_ceil(PIECE_SIZE) as usize;
    let mut bitfield = Bitfield::from_piece(pieces);
    bitfield.fill(true);
    bitfield.snapshot()
}

/// Start a seeder on a random port, with the shared file on disk.
async fn spawn_seeder(work_dir: PathBuf) -> (DaemonHandle, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = config(SEEDER, vec![peer_info(SEEDER, port, true)], work_dir);
    let daemon = Daemon::new(config).unwrap();
    daemon.ctx.disk.write_full_file(&file_content()).await.unwrap();

    (daemon.spawn(listener).await, port)
}

/// Start an empty peer that dials the seeder at `seeder_port`.
async fn spawn_leecher(seeder_port: u16, work_dir: PathBuf) -> DaemonHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = config(
        LEECHER,
        vec![peer_info(SEEDER, seeder_port, true), peer_info(LEECHER, port, false)],
        work_dir,
    );
    Daemon::new(config).unwrap().spawn(listener).await
}

async fn wait_until<F, Fut>(mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(10), async {
        while !f().await {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Handshake with a daemon by hand, as peer `id`.
async fn raw_connect(port: u16, id: PeerId) -> Framed<TcpStream, CoreCodec> {
    let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut socket = Framed::new(socket, HandshakeCodec);

    socket.send(Handshake::new(id)).await.unwrap();
    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.peer_id, SEEDER);
    assert!(theirs.validate());

    into_core(socket)
}

/// Accept the daemon's connection and answer its handshake as peer `id`.
async fn raw_accept(
    listener: &TcpListener,
    id: PeerId,
) -> Framed<TcpStream, CoreCodec> {
    let (socket, _) = timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("the daemon did not connect")
        .unwrap();
    let mut socket = Framed::new(socket, HandshakeCodec);

    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.peer_id, LEECHER);
    socket.send(Handshake::new(id)).await.unwrap();

    into_core(socket)
}

fn into_core(
    socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, CoreCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts =
        FramedParts::new::<Core>(old_parts.io, CoreCodec::default());
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

async fn next_msg(socket: &mut Framed<TcpStream, CoreCodec>) -> Option<Core> {
    timeout(Duration::from_secs(10), socket.next())
        .await
        .expect("no message in time")
        .map(|m| m.unwrap())
}

/// Next message other than a choke or an unchoke, `None` if nothing else
/// arrives within `wait`. The choker of the other side keeps sending those.
async fn next_skipping_choke(
    socket: &mut Framed<TcpStream, CoreCodec>,
    wait: Duration,
) -> Option<Core> {
    timeout(wait, async {
        loop {
            match socket.next().await {
                Some(Ok(Core::Choke | Core::Unchoke)) => continue,
                Some(Ok(msg)) => return msg,
                other => panic!("session closed: {other:?}"),
            }
        }
    })
    .await
    .ok()
}

// A seeder and an empty peer with k = 1. The empty peer connects to the
// seeder, gets unchoked, downloads the whole file and announces it.
#[tokio::test]
async fn seeder_to_leecher() {
    init_tracing();
    let dir = work_dir();

    let (seeder, seeder_port) = spawn_seeder(dir.clone()).await;
    let leecher = spawn_leecher(seeder_port, dir.clone()).await;

    let (s, l) = (&seeder.ctx, &leecher.ctx);

    assert!(!l.pieces.is_complete().await);

    // connection is registered on both sides
    wait_until(|| async move { s.peers.get(LEECHER).await.is_some() }).await;
    wait_until(|| async move { l.peers.get(SEEDER).await.is_some() }).await;

    wait_until(|| async move { l.pieces.is_complete().await }).await;

    let received = leecher.ctx.disk.read_full_file().await.unwrap();
    assert_eq!(received, file_content());
    assert_eq!(
        leecher.ctx.disk.file_path(),
        dir.join("peer_1002").join("shared.dat")
    );

    let rate = leecher.ctx.choker.rate(SEEDER).await.unwrap();
    assert!(rate > 0.0);

    // the complete file was already recorded in the activity log
    assert!(!leecher.ctx.activity.download_complete());

    // the seeder got the HAVE with the full bitfield
    wait_until(|| async move {
        s.pieces.remote(LEECHER).await.is_some_and(|b| b.is_complete())
    })
    .await;

    // and the leecher is not interested anymore
    wait_until(|| async move { !s.choker.is_interested(LEECHER).await }).await;

    seeder.shutdown().await;
    leecher.shutdown().await;
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

// Speak the wire protocol by hand against a seeder.
#[tokio::test]
async fn wire_session_with_seeder() {
    init_tracing();
    let dir = work_dir();
    let (seeder, port) = spawn_seeder(dir.clone()).await;
    let pieces = (FILE_SIZE as u64).div_ceil(PIECE_SIZE) as usize;

    let mut socket = raw_connect(port, LEECHER).await;

    // their full bitfield comes first
    let Some(Core::Bitfield(theirs)) = next_msg(&mut socket).await else {
        panic!("expected a bitfield");
    };
    assert_eq!(theirs.len(), pieces.div_ceil(8));
    assert!(Bitfield::from_snapshot(&theirs, pieces).unwrap().is_complete());

    socket.send(Core::Bitfield(vec![0; theirs.len()])).await.unwrap();

    // we have nothing the seeder needs
    assert_eq!(next_msg(&mut socket).await, Some(Core::NotInterested));

    let s = &seeder.ctx;
    wait_until(|| async move { s.peers.get(LEECHER).await.is_some() }).await;

    // an unknown message type is skipped, the session goes on
    socket.get_mut().write_all(&[0, 0, 0, 2, 42, 1]).await.unwrap();

    socket.send(Core::Interested).await.unwrap();
    wait_until(|| async move { s.choker.is_interested(LEECHER).await }).await;

    // the only interested peer gets unchoked by the next recomputation
    loop {
        match next_msg(&mut socket).await {
            Some(Core::Unchoke) => break,
            Some(Core::Choke) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }

    socket.send(Core::Request).await.unwrap();

    let piece = loop {
        match next_msg(&mut socket).await {
            Some(Core::Piece(file)) => break file,
            Some(Core::Unchoke | Core::Choke) => continue,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(piece, Bytes::from(file_content()));

    seeder.shutdown().await;

    // the seeder closes the session on shutdown
    timeout(Duration::from_secs(10), async {
        while let Some(msg) = socket.next().await {
            if msg.is_err() {
                break;
            }
        }
    })
    .await
    .expect("session was not closed");

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

// A second session for the same peer id is closed, the first one stays and
// keeps its state.
#[tokio::test]
async fn duplicate_session_is_rejected() {
    init_tracing();
    let dir = work_dir();
    let (seeder, port) = spawn_seeder(dir.clone()).await;

    let mut first = raw_connect(port, LEECHER).await;
    assert!(matches!(next_msg(&mut first).await, Some(Core::Bitfield(_))));
    first.send(Core::Bitfield(vec![0])).await.unwrap();
    assert_eq!(next_msg(&mut first).await, Some(Core::NotInterested));

    let s = &seeder.ctx;
    wait_until(|| async move { s.pieces.remote(LEECHER).await.is_some() }).await;
    let registered = seeder.ctx.peers.get(LEECHER).await.unwrap();

    let mut second = raw_connect(port, LEECHER).await;
    assert!(matches!(next_msg(&mut second).await, Some(Core::Bitfield(_))));
    second.send(Core::Bitfield(full_bitfield())).await.unwrap();
    assert_eq!(next_msg(&mut second).await, Some(Core::NotInterested));

    // closed right after the exchange
    timeout(Duration::from_secs(10), async {
        while let Some(Ok(_)) = second.next().await {}
    })
    .await
    .expect("duplicate session was not closed");

    let still = seeder.ctx.peers.get(LEECHER).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&registered, &still));
    assert_eq!(seeder.ctx.peers.len().await, 1);

    // the bitfield of the rejected session was never stored
    let cached = seeder.ctx.pieces.remote(LEECHER).await.unwrap();
    assert_eq!(cached.snapshot(), vec![0]);

    // the first session still works
    first.send(Core::Interested).await.unwrap();
    wait_until(|| async move { s.choker.is_interested(LEECHER).await }).await;

    seeder.shutdown().await;
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

// The handshake identifier is not enforced.
#[tokio::test]
async fn lenient_handshake() {
    init_tracing();
    let dir = work_dir();
    let (seeder, port) = spawn_seeder(dir.clone()).await;

    let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut raw = Handshake::new(LEECHER).serialize();
    raw[..18].copy_from_slice(b"SOMETHINGELSE12345");
    socket.write_all(&raw).await.unwrap();

    let mut socket = Framed::new(socket, HandshakeCodec);
    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.peer_id, SEEDER);

    let mut socket = into_core(socket);

    assert!(matches!(next_msg(&mut socket).await, Some(Core::Bitfield(_))));
    socket.send(Core::Bitfield(vec![0])).await.unwrap();

    let s = &seeder.ctx;
    wait_until(|| async move { s.peers.get(LEECHER).await.is_some() }).await;

    seeder.shutdown().await;
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

// A peer we are choking gets nothing for its request.
#[tokio::test]
async fn request_while_choked_is_ignored() {
    init_tracing();
    let dir = work_dir();
    let (seeder, port) = spawn_seeder(dir.clone()).await;

    let mut socket = raw_connect(port, LEECHER).await;
    assert!(matches!(next_msg(&mut socket).await, Some(Core::Bitfield(_))));
    socket.send(Core::Bitfield(vec![0])).await.unwrap();
    assert_eq!(next_msg(&mut socket).await, Some(Core::NotInterested));

    // never interested, so never unchoked
    socket.send(Core::Request).await.unwrap();
    assert_eq!(
        next_skipping_choke(&mut socket, Duration::from_millis(2500)).await,
        None
    );

    let registered = seeder.ctx.peers.get(LEECHER).await.unwrap();
    assert!(registered.is_choking());

    seeder.shutdown().await;
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

// Unchokes while a request is in flight don't ask again, a choke forgets the
// request and the next unchoke asks again.
#[tokio::test]
async fn one_request_in_flight() {
    init_tracing();
    let dir = work_dir();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let leecher = spawn_leecher(port, dir.clone()).await;

    let mut socket = raw_accept(&listener, SEEDER).await;
    assert_eq!(next_msg(&mut socket).await, Some(Core::Bitfield(vec![0])));
    socket.send(Core::Bitfield(full_bitfield())).await.unwrap();

    let wait = Duration::from_secs(10);
    let quiet = Duration::from_millis(1500);

    assert_eq!(next_skipping_choke(&mut socket, wait).await, Some(Core::Interested));

    socket.send(Core::Unchoke).await.unwrap();
    socket.send(Core::Unchoke).await.unwrap();
    assert_eq!(next_skipping_choke(&mut socket, wait).await, Some(Core::Request));
    assert_eq!(next_skipping_choke(&mut socket, quiet).await, None);

    socket.send(Core::Choke).await.unwrap();
    socket.send(Core::Unchoke).await.unwrap();
    assert_eq!(next_skipping_choke(&mut socket, wait).await, Some(Core::Request));

    // answering completes the file
    socket.send(Core::Piece(Bytes::from(file_content()))).await.unwrap();
    assert_eq!(
        next_skipping_choke(&mut socket, wait).await,
        Some(Core::NotInterested)
    );
    assert_eq!(
        next_skipping_choke(&mut socket, wait).await,
        Some(Core::Have(full_bitfield()))
    );

    assert!(leecher.ctx.pieces.is_complete().await);
    assert_eq!(leecher.ctx.disk.read_full_file().await.unwrap(), file_content());

    leecher.shutdown().await;
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

// A HAVE replaces the remote bitfield and interest messages are only sent
// when the interest changes.
#[tokio::test]
async fn have_updates_interest() {
    init_tracing();
    let dir = work_dir();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let leecher = spawn_leecher(port, dir.clone()).await;

    let mut socket = raw_accept(&listener, SEEDER).await;
    assert_eq!(next_msg(&mut socket).await, Some(Core::Bitfield(vec![0])));
    socket.send(Core::Bitfield(vec![0])).await.unwrap();

    let wait = Duration::from_secs(10);
    let quiet = Duration::from_millis(1500);

    assert_eq!(
        next_skipping_choke(&mut socket, wait).await,
        Some(Core::NotInterested)
    );

    socket.send(Core::Have(full_bitfield())).await.unwrap();
    assert_eq!(next_skipping_choke(&mut socket, wait).await, Some(Core::Interested));

    // same interest, nothing to say
    socket.send(Core::Have(full_bitfield())).await.unwrap();
    assert_eq!(next_skipping_choke(&mut socket, quiet).await, None);

    // wrong length, logged and dropped
    socket.send(Core::Have(vec![0xFE, 0])).await.unwrap();
    assert_eq!(next_skipping_choke(&mut socket, quiet).await, None);
    let cached = leecher.ctx.pieces.remote(SEEDER).await.unwrap();
    assert_eq!(cached.snapshot(), full_bitfield());

    // the session is still alive and follows the next HAVE
    socket.send(Core::Have(vec![0])).await.unwrap();
    assert_eq!(
        next_skipping_choke(&mut socket, wait).await,
        Some(Core::NotInterested)
    );
    assert!(leecher.ctx.peers.get(SEEDER).await.is_some());

    leecher.shutdown().await;
    let _ = tokio::fs::remove_dir_all(&dir).await;
}
