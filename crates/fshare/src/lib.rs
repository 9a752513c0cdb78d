pub mod activity;
pub mod bitfield;
pub mod choker;
pub mod config;
pub mod daemon;
pub mod disk;
pub mod error;
pub mod handshake_peer;
pub mod peer;
pub mod registry;
pub mod tcp_wire;
pub mod transfer;

/// Capacity of the channel that feeds each peer task.
pub static PEER_MSG_BOUND: usize = 100;
