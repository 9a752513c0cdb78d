use std::path::PathBuf;

use clap::Parser;
use fshare::config::Config;

#[derive(Parser, Debug, Default)]
#[clap(name = "fshare")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Id of this peer, as listed in the peer info file.
    pub peer_id: u32,

    /// Common configuration, `Common.cfg` or the same keys in a `.toml` file.
    #[clap(short, long, default_value = "Common.cfg")]
    pub common: PathBuf,

    /// List of the peers of the network.
    #[clap(short, long, default_value = "PeerInfo.cfg")]
    pub peer_info: PathBuf,

    /// Directory of the `peer_<id>` folders and of the activity logs.
    #[clap(short, long, default_value = ".")]
    pub work_dir: PathBuf,

    /// Overrides `NumberOfPreferredNeighbors`.
    #[clap(long)]
    pub preferred_neighbors: Option<usize>,

    /// Overrides `UnchokingInterval`, in seconds.
    #[clap(long)]
    pub unchoking_interval: Option<u64>,

    /// Overrides `OptimisticUnchokingInterval`, in seconds.
    #[clap(long)]
    pub optimistic_unchoking_interval: Option<u64>,

    /// Print debug logs to stdout.
    #[clap(short, long)]
    pub verbose: bool,
}

impl Args {
    /// The part of the configuration that can come from CLI flags.
    pub fn cli_config(&self) -> Config {
        Config {
            number_of_preferred_neighbors: self.preferred_neighbors,
            unchoking_interval: self.unchoking_interval,
            optimistic_unchoking_interval: self.optimistic_unchoking_interval,
            ..Default::default()
        }
    }
}
