use thiserror::Error;

/// The torrent package specific results.
pub type Result<T> = std::result::Result<T, Error>;

/// The torrent error describes exceptions which have occurred while talking to
/// the torrent engine or its repository.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("torrent {0} could not be found")]
    TorrentNotFound(String),
    #[error("file index {1} is invalid for torrent {0}")]
    InvalidFileIndex(String, usize),
    #[error("the torrent engine is unavailable")]
    EngineUnavailable,
    #[error("the torrent engine operation timed out")]
    Timeout,
    #[error("an engine error occurred, {0}")]
    EngineError(String),
    #[error("an io error occurred, {0}")]
    Io(String),
}
