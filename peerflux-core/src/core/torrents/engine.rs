use std::cmp::Ordering;
use std::fmt::Debug;
use std::ops::Range;
use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(any(test, feature = "testing"))]
pub use mock::*;

use crate::core::torrents::Result;

/// The alias type used to identify file indexes within a torrent.
pub type FileIndex = usize;

/// A file-relative byte range used for piece priority updates.
pub type ByteRange = Range<u64>;

/// The download priority of the pieces backing a byte range.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PiecePriority {
    /// Indicates that there is no interest in this range and its pieces will be ignored
    None = 0,
    Normal = 1,
    Readahead = 2,
    Next = 3,
    High = 4,
}

impl Default for PiecePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl PartialOrd for PiecePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PiecePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = *self as u8;
        let b = *other as u8;

        a.cmp(&b)
    }
}

impl From<u8> for PiecePriority {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Normal,
            2 => Self::Readahead,
            3 => Self::Next,
            4 => Self::High,
            _ => Self::None,
        }
    }
}

/// The metadata of a single file within a torrent session.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFileInfo {
    /// The index of the file within the torrent
    pub index: FileIndex,
    /// The absolute path of the file on disk
    pub path: PathBuf,
    /// The total length of the file in bytes
    pub length: u64,
    /// The number of bytes of the file which have been downloaded
    pub bytes_completed: u64,
}

impl TorrentFileInfo {
    /// Verify if all bytes of the file have been downloaded.
    pub fn is_complete(&self) -> bool {
        self.length > 0 && self.bytes_completed >= self.length
    }
}

/// The state of a live torrent session within the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// The files of the torrent session
    pub files: Vec<TorrentFileInfo>,
}

impl SessionState {
    /// Get the file info for the given file index.
    pub fn file(&self, index: FileIndex) -> Option<&TorrentFileInfo> {
        self.files.iter().find(|e| e.index == index)
    }
}

/// The facade over the torrent engine consumed by the streaming subsystem.
///
/// Priority updates are advisory towards the engine and can be applied with
/// file-relative byte ranges, which the engine translates to pieces.
#[async_trait]
pub trait TorrentEngine: Debug + Send + Sync {
    /// Retrieve the state of a live torrent session.
    async fn session_state(&self, torrent_id: &str) -> Result<SessionState>;

    /// Update the download priority for the pieces backing the given file-relative byte range.
    async fn set_piece_priority(
        &self,
        torrent_id: &str,
        file_index: FileIndex,
        range: ByteRange,
        priority: PiecePriority,
    ) -> Result<()>;
}

#[cfg(any(test, feature = "testing"))]
mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        #[derive(Debug)]
        pub TorrentEngine {}

        #[async_trait]
        impl TorrentEngine for TorrentEngine {
            async fn session_state(&self, torrent_id: &str) -> Result<SessionState>;
            async fn set_piece_priority(
                &self,
                torrent_id: &str,
                file_index: FileIndex,
                range: ByteRange,
                priority: PiecePriority,
            ) -> Result<()>;
        }
    }
}
