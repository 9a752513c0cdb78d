//! Human readable record of what happened to the local peer.
//!
//! Every event is a `tracing` event on the [`ACTIVITY_TARGET`] target, the
//! daemon routes that target to `log_peer_<id>.log`.
use std::{
    fmt::Display,
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::info;

use crate::peer::PeerId;

pub const ACTIVITY_TARGET: &str = "activity";

#[derive(Debug)]
pub struct ActivityLog {
    local_id: PeerId,
    complete_logged: AtomicBool,
}

impl ActivityLog {
    pub fn new(local_id: PeerId) -> Self {
        Self { local_id, complete_logged: AtomicBool::new(false) }
    }

    pub fn record(&self, event: impl Display) {
        info!(target: ACTIVITY_TARGET, "{event}");
    }

    pub fn connection_made(&self, remote: PeerId) {
        self.record(format_args!(
            "Peer {} makes a connection to Peer {remote}.",
            self.local_id
        ));
    }

    pub fn connected_from(&self, remote: PeerId) {
        self.record(format_args!(
            "Peer {} is connected from Peer {remote}.",
            self.local_id
        ));
    }

    pub fn preferred_neighbors(&self, peers: &[PeerId]) {
        let list =
            peers.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ");
        self.record(format_args!(
            "Peer {} has the preferred neighbors {list}.",
            self.local_id
        ));
    }

    pub fn optimistic_neighbor(&self, peer: PeerId) {
        self.record(format_args!(
            "Peer {} has the optimistically unchoked neighbor {peer}.",
            self.local_id
        ));
    }

    pub fn unchoked_by(&self, remote: PeerId) {
        self.record(format_args!(
            "Peer {} is unchoked by {remote}.",
            self.local_id
        ));
    }

    pub fn choked_by(&self, remote: PeerId) {
        self.record(format_args!("Peer {} is choked by {remote}.", self.local_id));
    }

    pub fn received_have(&self, remote: PeerId) {
        self.record(format_args!(
            "Peer {} received the 'have' message from {remote}.",
            self.local_id
        ));
    }

    pub fn received_interested(&self, remote: PeerId) {
        self.record(format_args!(
            "Peer {} received the 'interested' message from {remote}.",
            self.local_id
        ));
    }

    pub fn received_not_interested(&self, remote: PeerId) {
        self.record(format_args!(
            "Peer {} received the 'not interested' message from {remote}.",
            self.local_id
        ));
    }

    pub fn downloaded_from(&self, remote: PeerId) {
        self.record(format_args!(
            "Peer {} has downloaded the file from {remote}.",
            self.local_id
        ));
    }

    /// Only the first call is recorded.
    pub fn download_complete(&self) -> bool {
        if self.complete_logged.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.record(format_args!(
            "Peer {} has downloaded the complete file.",
            self.local_id
        ));
        true
    }
}
