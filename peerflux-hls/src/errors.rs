use std::time::Duration;

use peerflux_core::core::{media, stream, torrents};
use thiserror::Error;

/// The streaming subsystem specific results.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors which can occur within the streaming subsystem.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("the streaming subsystem has not been configured")]
    NotConfigured,
    #[error("invalid request, {0}")]
    InvalidRequest(String),
    #[error("subtitle track {0} was requested but no subtitle source is available on disk")]
    SubtitleSourceUnavailable(i32),
    #[error("prebuffering timed out after {0:?}")]
    PrebufferTimeout(Duration),
    #[error("the transcoder did not produce a playlist within {0:?}")]
    StartupTimeout(Duration),
    #[error("the transcoder exited unexpectedly, {0}")]
    TranscoderExit(String),
    #[error("the stream stalled for {0:?}")]
    Stalled(Duration),
    #[error("the stream job has been cancelled")]
    Cancelled,
    #[error("{0}")]
    Torrent(#[from] torrents::Error),
    #[error("{0}")]
    Stream(#[from] stream::Error),
    #[error("{0}")]
    Media(#[from] media::Error),
    #[error("an io error occurred, {0}")]
    Io(String),
}

impl Error {
    /// The stable error code used within the http error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotConfigured => "not_configured",
            Error::Torrent(torrents::Error::TorrentNotFound(_)) => "repository_error",
            Error::Torrent(_) => "engine_error",
            _ => "stream_error",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(
            "invalid_request",
            Error::InvalidRequest("lorem".to_string()).code()
        );
        assert_eq!("not_configured", Error::NotConfigured.code());
        assert_eq!(
            "repository_error",
            Error::Torrent(torrents::Error::TorrentNotFound("t1".to_string())).code()
        );
        assert_eq!(
            "engine_error",
            Error::Torrent(torrents::Error::EngineUnavailable).code()
        );
        assert_eq!(
            "stream_error",
            Error::TranscoderExit("lorem".to_string()).code()
        );
    }
}
