use tokio::time::Instant;

/// A connection goes through each state once, in order. Only `Ready`
/// sessions are in the registry.
#[derive(Clone, Default, Copy, Debug, PartialEq)]
pub enum ConnectionState {
    /// The TCP connection is open and handshakes are being exchanged.
    #[default]
    Handshaking,

    /// Handshakes were exchanged, waiting for the first bitfield.
    AwaitingBitfield,

    /// Bitfields were exchanged and the interest message was sent.
    Ready,

    /// The socket is closed or being closed, the session is gone.
    Closed,
}

/// Holds and provides facilities to modify the state of a peer session.
#[derive(Debug)]
pub struct Session {
    /// The current state of the connection.
    pub connection: ConnectionState,

    /// If a whole-file request was sent and not answered yet.
    pub request_pending: bool,

    /// When the last request was sent, to measure the download rate.
    pub requested_at: Option<Instant>,

    /// Bytes received in pieces from this peer.
    pub downloaded: u64,

    /// Bytes sent in pieces to this peer.
    pub uploaded: u64,

    pub connected_at: Instant,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connection: ConnectionState::default(),
            request_pending: false,
            requested_at: None,
            downloaded: 0,
            uploaded: 0,
            connected_at: Instant::now(),
        }
    }
}

impl Session {
    /// Move to the next state, states never go back.
    pub fn advance(&mut self, next: ConnectionState) {
        use ConnectionState::*;
        let order = |s: ConnectionState| match s {
            Handshaking => 0,
            AwaitingBitfield => 1,
            Ready => 2,
            Closed => 3,
        };
        if order(next) > order(self.connection) {
            self.connection = next;
        }
    }

    pub fn start_request(&mut self) {
        self.request_pending = true;
        self.requested_at = Some(Instant::now());
    }

    /// Download rate in bytes per millisecond of the request that was just
    /// answered with `len` bytes, if a request was timed.
    pub fn finish_request(&mut self, len: usize) -> Option<f64> {
        self.request_pending = false;
        self.downloaded += len as u64;
        let elapsed = self.requested_at.take()?.elapsed();
        let ms = elapsed.as_millis().max(1) as f64;
        Some(len as f64 / ms)
    }
}
