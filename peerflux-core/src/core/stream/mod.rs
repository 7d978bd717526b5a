use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(any(test, feature = "testing"))]
pub use mock::*;
use thiserror::Error;

use crate::core::torrents::TorrentFileInfo;

/// The stream package specific results.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors which can occur while requesting a raw media stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("stream source for torrent {0} is unavailable, {1}")]
    Unavailable(String, String),
    #[error("file index {1} is invalid for torrent {0}")]
    InvalidFileIndex(String, usize),
    #[error("the stream use case has not been configured")]
    NotConfigured,
    #[error("an io error occurred, {0}")]
    Io(String),
}

/// A raw byte reader over a (partially downloaded) torrent file.
///
/// Torrent readers routinely report EOF while the requested piece has not yet
/// arrived; consumers treat such an EOF as transient.
#[async_trait]
pub trait RawMediaReader: Debug + Send + Sync {
    /// Read the next bytes of the file into the given buffer.
    ///
    /// It returns the number of bytes read, with `0` indicating that no data
    /// is currently available at the cursor.
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Put the reader into low-latency mode, trading throughput for responsiveness.
    fn set_responsive(&self);

    /// Release the reader and its underlying engine resources.
    async fn close(&mut self);
}

/// The raw byte stream of a torrent file together with its file metadata.
#[derive(Debug)]
pub struct RawStream {
    /// The reader over the file bytes
    pub reader: Box<dyn RawMediaReader>,
    /// The metadata of the file being read
    pub file: TorrentFileInfo,
}

/// The use case which resolves raw byte streams for torrent files.
#[async_trait]
pub trait MediaStreamUseCase: Debug + Send + Sync {
    /// Request a raw byte stream for the given file of the torrent.
    async fn execute_raw(&self, torrent_id: &str, file_index: usize) -> Result<RawStream>;
}

#[cfg(any(test, feature = "testing"))]
mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        #[derive(Debug)]
        pub RawMediaReader {}

        #[async_trait]
        impl RawMediaReader for RawMediaReader {
            async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
            fn set_responsive(&self);
            async fn close(&mut self);
        }
    }

    mock! {
        #[derive(Debug)]
        pub MediaStreamUseCase {}

        #[async_trait]
        impl MediaStreamUseCase for MediaStreamUseCase {
            async fn execute_raw(&self, torrent_id: &str, file_index: usize) -> Result<RawStream>;
        }
    }
}
