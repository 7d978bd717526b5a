use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(any(test, feature = "testing"))]
pub use mock::*;

use crate::core::torrents::{Result, TorrentFileInfo};

/// The persisted record of a torrent, used as a fallback when no live session exists.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentRecord {
    /// The unique identifier of the torrent
    pub id: String,
    /// The known files of the torrent
    pub files: Vec<TorrentFileInfo>,
}

/// The repository which stores the known torrents of the application.
#[async_trait]
pub trait TorrentRepository: Debug + Send + Sync {
    /// Retrieve the stored record of the given torrent.
    ///
    /// It returns [crate::core::torrents::Error::TorrentNotFound] when the torrent is unknown.
    async fn get(&self, torrent_id: &str) -> Result<TorrentRecord>;
}

#[cfg(any(test, feature = "testing"))]
mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        #[derive(Debug)]
        pub TorrentRepository {}

        #[async_trait]
        impl TorrentRepository for TorrentRepository {
            async fn get(&self, torrent_id: &str) -> Result<TorrentRecord>;
        }
    }
}
