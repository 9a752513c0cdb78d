//! Access to the shared file of the local peer, kept in `<work_dir>/peer_<id>`.
use std::path::PathBuf;

use tokio::fs;
use tracing::debug;

use crate::{config::ResolvedConfig, error::Error};

#[derive(Debug, Clone)]
pub struct Disk {
    dir: PathBuf,
    file_name: String,
    piece_size: u64,
}

impl Disk {
    pub fn new(config: &ResolvedConfig) -> Self {
        Self {
            dir: config.peer_dir(),
            file_name: config.file_name.clone(),
            piece_size: config.piece_size,
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    pub fn piece_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("piece_{index}"))
    }

    pub async fn read_full_file(&self) -> Result<Vec<u8>, Error> {
        let path = self.file_path();
        fs::read(&path).await.map_err(|source| Error::FileRead { path, source })
    }

    /// Replace the shared file with `data`, creating the peer directory if
    /// needed.
    pub async fn write_full_file(&self, data: &[u8]) -> Result<(), Error> {
        fs::create_dir_all(&self.dir).await.map_err(|source| {
            Error::FileWrite { path: self.dir.clone(), source }
        })?;

        let path = self.file_path();
        fs::write(&path, data)
            .await
            .map_err(|source| Error::FileWrite { path: path.clone(), source })?;

        debug!("wrote {} bytes to {path:?}", data.len());
        Ok(())
    }

    /// Write the shared file as `piece_<n>` files of `piece_size` bytes each,
    /// the last one may be shorter. Returns how many pieces were written.
    pub async fn split_into_pieces(&self) -> Result<usize, Error> {
        let data = self.read_full_file().await?;
        let mut count = 0;

        for (index, chunk) in data.chunks(self.piece_size as usize).enumerate()
        {
            let path = self.piece_path(index);
            fs::write(&path, chunk)
                .await
                .map_err(|source| Error::FileWrite { path, source })?;
            count += 1;
        }

        debug!("split {:?} into {count} pieces", self.file_path());
        Ok(count)
    }
}
