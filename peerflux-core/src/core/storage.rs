use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// The result type for storage actions.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors which can occur while reading or writing application files.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("file {0} could not be found")]
    NotFound(String),
    #[error("file {0} is corrupt and cannot be read, {1}")]
    CorruptData(String, String),
    #[error("failed to write {0}, {1}")]
    WritingFailed(String, String),
}

/// The storage is responsible for storing & retrieving application files on disk.
/// Writes are always staged through a temporary file and renamed into place.
#[derive(Debug, Clone)]
pub struct Storage {
    directory: PathBuf,
}

impl Storage {
    /// Read the deserialized contents of the given filename from within the storage directory.
    pub async fn read<T>(&self, filename: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let path = self.directory.join(filename);

        match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                trace!("Storage file {:?} exists", path);
                match serde_json::from_str::<T>(data.as_str()) {
                    Ok(e) => {
                        debug!("Storage file {} loaded", filename);
                        Ok(e)
                    }
                    Err(e) => Err(Error::CorruptData(filename.to_string(), e.to_string())),
                }
            }
            Err(e) => {
                trace!("Storage file {:?} could not be read, {}", path, e);
                Err(Error::NotFound(filename.to_string()))
            }
        }
    }

    /// Write the given value as json to the storage under the given filename.
    /// The write is atomic towards concurrent readers.
    pub async fn write<T: Serialize + Debug>(&self, filename: &str, value: &T) -> Result<()> {
        let path = self.directory.join(filename);
        let staging = self.directory.join(format!("{}.tmp", filename));
        let path_string = path.to_string_lossy().to_string();

        let data = serde_json::to_string(value)
            .map_err(|e| Error::WritingFailed(path_string.clone(), e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::WritingFailed(path_string.clone(), e.to_string()))?;
        }

        trace!("Writing storage file {:?}", staging);
        tokio::fs::write(&staging, data.as_bytes())
            .await
            .map_err(|e| Error::WritingFailed(path_string.clone(), e.to_string()))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| Error::WritingFailed(path_string.clone(), e.to_string()))?;

        debug!("Storage file {} has been saved", path_string);
        Ok(())
    }

    /// Delete the given path from the file system.
    /// This is a no-op when the path doesn't exist.
    pub async fn delete_path(path: impl AsRef<Path>) {
        let path = path.as_ref();

        if !path.exists() {
            return;
        }

        trace!("Deleting path {:?}", path);
        let result = if path.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };

        match result {
            Ok(_) => debug!("Path {:?} has been removed", path),
            Err(e) => warn!("Failed to remove path {:?}, {}", path, e),
        }
    }

    /// Delete the given path after the given delay has elapsed.
    /// The removal is executed on a background task and outlives the caller.
    pub fn delete_path_later(path: impl Into<PathBuf>, delay: Duration) {
        let path = path.into();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::delete_path(&path).await;
        });
    }
}

impl From<&str> for Storage {
    fn from(value: &str) -> Self {
        Self {
            directory: PathBuf::from(value),
        }
    }
}

impl From<&Path> for Storage {
    fn from(value: &Path) -> Self {
        Self {
            directory: value.to_path_buf(),
        }
    }
}
