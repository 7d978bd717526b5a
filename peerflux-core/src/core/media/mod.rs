use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
#[cfg(any(test, feature = "testing"))]
pub use mock::*;
use thiserror::Error;

/// The media package specific results.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors which can occur while probing media files.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("media probe failed, {0}")]
    ProbeFailed(String),
    #[error("the media probe timed out")]
    Timeout,
    #[error("an io error occurred, {0}")]
    Io(String),
}

/// The technical details of a media file as reported by the prober.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaDetails {
    /// Indicates if the video stream is H.264 encoded
    pub h264: bool,
    /// Indicates if the first audio stream is AAC encoded
    pub aac: bool,
    /// The width of the video stream in pixels
    pub width: Option<u32>,
    /// The height of the video stream in pixels
    pub height: Option<u32>,
    /// The duration of the media in seconds
    pub duration: Option<f64>,
    /// The average frame rate of the video stream
    pub fps: Option<f64>,
}

/// The prober which extracts technical media details from files on disk.
#[async_trait]
pub trait MediaProbe: Debug + Send + Sync {
    /// Probe the given media file for its technical details.
    async fn probe(&self, path: &Path) -> Result<MediaDetails>;
}

#[cfg(any(test, feature = "testing"))]
mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        #[derive(Debug)]
        pub MediaProbe {}

        #[async_trait]
        impl MediaProbe for MediaProbe {
            async fn probe(&self, path: &Path) -> Result<MediaDetails>;
        }
    }
}
