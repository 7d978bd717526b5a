pub use args::*;
pub use process::*;

use thiserror::Error;

mod args;
mod process;

/// The transcoder package specific results.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors which can occur while supervising the transcoder process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("the transcoder has already been started")]
    AlreadyStarted,
    #[error("failed to start the transcoder, {0}")]
    Io(String),
}
