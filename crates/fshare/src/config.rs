//! Configuration files and CLI flags.
//!
//! We have 2 components for the configuration, in order of priority :
//!
//! CLI Flags --overrides--> File
//!
//! The common file is either the `Key Value` format of `Common.cfg` or the
//! same keys in toml, when the file name ends in `.toml`. The peer list always
//! comes from the `PeerInfo.cfg` format.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;

use crate::{error::Error, peer::PeerId};

/// Values shared by every peer of the network.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// How many peers are unchoked by download rate, `k`.
    pub number_of_preferred_neighbors: Option<usize>,

    /// Seconds between preferred neighbors recomputations.
    pub unchoking_interval: Option<u64>,

    /// Seconds between optimistic unchoke picks.
    pub optimistic_unchoking_interval: Option<u64>,

    pub file_name: Option<String>,

    /// In bytes.
    pub file_size: Option<u64>,

    /// In bytes.
    pub piece_size: Option<u64>,
}

impl Config {
    /// Load the files from disk, merge them with the CLI values and resolve
    /// the final config of the local peer.
    pub fn load(
        common: &Path,
        peer_info: &Path,
        cli_config: Config,
        local_id: PeerId,
        work_dir: PathBuf,
    ) -> Result<ResolvedConfig, Error> {
        let file_config = Self::from_file(common)?;
        let peers = PeerInfo::from_file(peer_info)?;
        Config::merge(file_config, cli_config).resolve(local_id, peers, work_dir)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = read_to_string(path)?;

        if path.extension().is_some_and(|ext| ext == "toml") {
            return Ok(toml::from_str(&content)?);
        }

        content.parse()
    }

    pub fn merge(file_config: Config, cli_config: Config) -> Self {
        Self {
            number_of_preferred_neighbors: cli_config
                .number_of_preferred_neighbors
                .or(file_config.number_of_preferred_neighbors),
            unchoking_interval: cli_config
                .unchoking_interval
                .or(file_config.unchoking_interval),
            optimistic_unchoking_interval: cli_config
                .optimistic_unchoking_interval
                .or(file_config.optimistic_unchoking_interval),
            file_name: cli_config.file_name.or(file_config.file_name),
            file_size: cli_config.file_size.or(file_config.file_size),
            piece_size: cli_config.piece_size.or(file_config.piece_size),
        }
    }

    pub fn resolve(
        self,
        local_id: PeerId,
        peers: Vec<PeerInfo>,
        work_dir: PathBuf,
    ) -> Result<ResolvedConfig, Error> {
        let preferred_neighbors = required(
            self.number_of_preferred_neighbors,
            "NumberOfPreferredNeighbors",
        )?;
        let unchoking_interval =
            required(self.unchoking_interval, "UnchokingInterval")?;
        let optimistic_unchoking_interval = required(
            self.optimistic_unchoking_interval,
            "OptimisticUnchokingInterval",
        )?;
        let file_name = required(self.file_name, "FileName")?;
        let file_size = required(self.file_size, "FileSize")?;
        let piece_size = required(self.piece_size, "PieceSize")?;

        if unchoking_interval == 0 || optimistic_unchoking_interval == 0 {
            return Err(Error::Config(
                "unchoking intervals must be at least 1 second".into(),
            ));
        }
        if file_size == 0 || piece_size == 0 {
            return Err(Error::Config(
                "FileSize and PieceSize cannot be zero".into(),
            ));
        }
        // the whole file travels in one message with a u32 length prefix
        if file_size >= u32::MAX as u64 {
            return Err(Error::Config(format!(
                "FileSize must be below {} bytes",
                u32::MAX
            )));
        }
        if file_name.is_empty() {
            return Err(Error::Config("FileName cannot be empty".into()));
        }
        if !peers.iter().any(|p| p.id == local_id) {
            return Err(Error::Config(format!(
                "peer {local_id} is not listed in the peer info file"
            )));
        }

        Ok(ResolvedConfig {
            local_id,
            preferred_neighbors,
            unchoking_interval: Duration::from_secs(unchoking_interval),
            optimistic_unchoking_interval: Duration::from_secs(
                optimistic_unchoking_interval,
            ),
            file_name,
            file_size,
            piece_size,
            peers,
            work_dir,
        })
    }
}

impl FromStr for Config {
    type Err = Error;

    /// Decode the `Key Value` lines of `Common.cfg`. Blank lines and lines
    /// starting with `#` are ignored, unknown keys are an error.
    fn from_str(input: &str) -> Result<Self, Error> {
        let mut config = Config::default();

        for (n, line) in input.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_whitespace();

            let (Some(key), Some(value), None) =
                (tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(Error::Config(format!(
                    "line {}: expected `Key Value`, got `{line}`",
                    n + 1
                )));
            };

            match key {
                "NumberOfPreferredNeighbors" => {
                    config.number_of_preferred_neighbors =
                        Some(parse_num(key, value)?)
                }
                "UnchokingInterval" => {
                    config.unchoking_interval = Some(parse_num(key, value)?)
                }
                "OptimisticUnchokingInterval" => {
                    config.optimistic_unchoking_interval =
                        Some(parse_num(key, value)?)
                }
                "FileName" => config.file_name = Some(value.to_owned()),
                "FileSize" => config.file_size = Some(parse_num(key, value)?),
                "PieceSize" => config.piece_size = Some(parse_num(key, value)?),
                _ => {
                    return Err(Error::Config(format!(
                        "line {}: unknown key `{key}`",
                        n + 1
                    )))
                }
            }
        }

        Ok(config)
    }
}

/// One line of `PeerInfo.cfg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

impl PeerInfo {
    pub fn from_file(path: &Path) -> Result<Vec<Self>, Error> {
        Self::parse_list(&read_to_string(path)?)
    }

    /// Decode `<id> <host> <port> <hasFile>` lines, keeping the file order.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, Error> {
        let mut peers: Vec<PeerInfo> = Vec::new();

        for (n, line) in input.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();

            let &[id, host, port, has_file] = tokens.as_slice() else {
                return Err(Error::Config(format!(
                    "line {}: expected `<id> <host> <port> <hasFile>`, got \
                     `{line}`",
                    n + 1
                )));
            };

            let id = PeerId(parse_num("peer id", id)?);
            let port = parse_num("port", port)?;
            let has_file = match has_file {
                "1" => true,
                "0" => false,
                v => {
                    return Err(Error::Config(format!(
                        "line {}: hasFile must be 0 or 1, got `{v}`",
                        n + 1
                    )))
                }
            };

            if peers.iter().any(|p| p.id == id) {
                return Err(Error::Config(format!(
                    "line {}: peer {id} is listed twice",
                    n + 1
                )));
            }

            peers.push(PeerInfo { id, host: host.to_owned(), port, has_file });
        }

        Ok(peers)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub local_id: PeerId,
    pub preferred_neighbors: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
    /// In the order of the peer info file.
    pub peers: Vec<PeerInfo>,
    /// Where `peer_<id>` directories and the activity logs live.
    pub work_dir: PathBuf,
}

impl ResolvedConfig {
    pub fn pieces(&self) -> usize {
        self.file_size.div_ceil(self.piece_size) as usize
    }

    /// Largest length prefix a message may announce, the type byte plus a
    /// payload no larger than the file.
    pub fn max_message_len(&self) -> usize {
        self.file_size as usize + 1
    }

    pub fn local(&self) -> Result<&PeerInfo, Error> {
        self.peers.iter().find(|p| p.id == self.local_id).ok_or_else(|| {
            Error::Config(format!("peer {} is not configured", self.local_id))
        })
    }

    /// Peers listed before the local one, the ones we connect to.
    pub fn peers_before_local(&self) -> &[PeerInfo] {
        let end = self
            .peers
            .iter()
            .position(|p| p.id == self.local_id)
            .unwrap_or(0);
        &self.peers[..end]
    }

    /// `<work_dir>/peer_<id>`
    pub fn peer_dir(&self) -> PathBuf {
        self.work_dir.join(format!("peer_{}", self.local_id))
    }

    /// `<work_dir>/log_peer_<id>.log`
    pub fn log_file_name(&self) -> String {
        format!("log_peer_{}.log", self.local_id)
    }
}

fn required<T>(v: Option<T>, key: &str) -> Result<T, Error> {
    v.ok_or_else(|| Error::Config(format!("missing value for `{key}`")))
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value.parse::<T>().map_err(|_| {
        Error::Config(format!("invalid value `{value}` for `{key}`"))
    })
}

fn read_to_string(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("could not read `{}`: {e}", path.display()))
    })
}
