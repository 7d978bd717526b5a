use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derive_more::Display;
use log::{debug, info, trace, warn};
use peerflux_core::core::storage::Storage;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transcoder::TranscoderProcess;

/// The name of the remux directory within the base directory.
pub const REMUX_DIRECTORY_NAME: &str = "remux";

/// The key identifying a remux conversion.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
#[display("{}#{}", torrent_id, file_index)]
pub struct RemuxKey {
    pub torrent_id: String,
    pub file_index: usize,
}

/// The observable status of a remux conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RemuxStatus {
    /// The path of the remuxed output file
    pub output: PathBuf,
    /// Indicates if the output file is complete and ready to be served
    pub ready: bool,
}

/// The cache of background codec-copy conversions (MKV container to MP4) which
/// enable direct playback of files the player cannot read natively.
///
/// Conversions write to a staging file and are renamed into place on completion,
/// failed entries are removed so a later request can retry.
#[derive(Debug, Clone)]
pub struct RemuxCache {
    inner: Arc<InnerRemuxCache>,
}

impl RemuxCache {
    pub fn new(binary: impl Into<String>, base_dir: &Path) -> Self {
        Self {
            inner: Arc::new(InnerRemuxCache {
                binary: binary.into(),
                directory: base_dir.join(REMUX_DIRECTORY_NAME),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The directory holding the remuxed outputs.
    pub fn directory(&self) -> &Path {
        self.inner.directory.as_path()
    }

    /// Check the remux status for the given key.
    ///
    /// Entries are reconstructed from completed outputs found on disk, so a
    /// restart of the application doesn't redo finished conversions.
    pub async fn check(&self, key: &RemuxKey) -> Option<RemuxStatus> {
        let mut entries = self.inner.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            return Some(entry.status());
        }

        let output = self.inner.output_path(key);
        if output.exists() {
            trace!("Adopting completed remux output {:?}", output);
            entries.insert(key.clone(), RemuxEntry::completed(output.clone()));
            return Some(RemuxStatus {
                output,
                ready: true,
            });
        }

        None
    }

    /// Trigger a background remux of the given source file.
    /// This operation is idempotent per key, concurrent triggers share one entry.
    pub async fn trigger(&self, key: &RemuxKey, source: PathBuf) -> RemuxStatus {
        let mut entries = self.inner.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            return entry.status();
        }

        let output = self.inner.output_path(key);
        if output.exists() {
            entries.insert(key.clone(), RemuxEntry::completed(output.clone()));
            return RemuxStatus {
                output,
                ready: true,
            };
        }

        let (ready_tx, ready_rx) = watch::channel(false);
        let entry = RemuxEntry {
            output: output.clone(),
            ready: ready_rx,
            error: Arc::new(Mutex::new(None)),
            started_at: Instant::now(),
            cancellation_token: CancellationToken::new(),
        };
        let status = entry.status();

        info!("Starting remux of {:?} to {:?}", source, output);
        let inner = self.inner.clone();
        let cache = self.clone();
        let token = entry.cancellation_token.clone();
        let error = entry.error.clone();
        let started_at = entry.started_at;
        let key = key.clone();
        entries.insert(key.clone(), entry);
        tokio::spawn(async move {
            if let Err(e) = inner.run(&key, source, output, token).await {
                warn!("Remux of {} failed, {}", key, e);
                *error.lock().await = Some(e.clone());
                // remove the entry so a later request can retry the conversion
                cache.remove(&key).await;
            } else {
                info!(
                    "Remux of {} completed after {:?}",
                    key,
                    started_at.elapsed()
                );
                let _ = ready_tx.send(true);
            }
        });

        status
    }

    /// Wait until the remux for the given key has completed.
    /// It returns `false` when the conversion failed or is unknown.
    pub async fn wait_ready(&self, key: &RemuxKey) -> bool {
        let mut ready = match self.inner.entries.lock().await.get(key) {
            Some(entry) => entry.ready.clone(),
            None => return false,
        };

        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return false;
            }
        }

        true
    }

    /// The current number of remux entries.
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Remove all remux entries and artifacts of the given torrent.
    pub async fn purge(&self, torrent_id: &str) {
        {
            let mut entries = self.inner.entries.lock().await;
            entries.retain(|key, entry| {
                if key.torrent_id == torrent_id {
                    entry.cancellation_token.cancel();
                    false
                } else {
                    true
                }
            });
        }

        Storage::delete_path(self.inner.directory.join(torrent_id)).await;
    }

    /// Cancel all running conversions.
    pub async fn shutdown(&self) {
        let entries = self.inner.entries.lock().await;
        for entry in entries.values() {
            entry.cancellation_token.cancel();
        }
    }

    async fn remove(&self, key: &RemuxKey) {
        self.inner.entries.lock().await.remove(key);
    }
}

#[derive(Debug)]
struct InnerRemuxCache {
    binary: String,
    directory: PathBuf,
    entries: Mutex<HashMap<RemuxKey, RemuxEntry>>,
}

impl InnerRemuxCache {
    fn output_path(&self, key: &RemuxKey) -> PathBuf {
        self.directory
            .join(key.torrent_id.as_str())
            .join(format!("{}.mp4", key.file_index))
    }

    /// Execute the conversion, writing to a staging file which is renamed into
    /// place on success.
    async fn run(
        &self,
        key: &RemuxKey,
        source: PathBuf,
        output: PathBuf,
        cancellation_token: CancellationToken,
    ) -> Result<(), String> {
        let workdir = output
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| "invalid output path".to_string())?;
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| e.to_string())?;

        let staging = workdir.join(format!(
            "{}.tmp",
            output.file_name().unwrap_or_default().to_string_lossy()
        ));
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "0:a?".to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            staging.to_string_lossy().to_string(),
        ];

        let process = TranscoderProcess::new(self.binary.as_str(), args, &workdir, None);
        process.start().await.map_err(|e| e.to_string())?;

        let exit = select! {
            _ = cancellation_token.cancelled() => {
                process.stop();
                process.wait().await;
                Storage::delete_path(&staging).await;
                return Err("the remux has been cancelled".to_string());
            }
            exit = process.wait() => exit,
        };

        match exit {
            Some(exit) if exit.success => {
                tokio::fs::rename(&staging, &output)
                    .await
                    .map_err(|e| e.to_string())?;
                debug!("Remux of {} completed at {:?}", key, output);
                Ok(())
            }
            _ => {
                Storage::delete_path(&staging).await;
                Err(process.stderr().await)
            }
        }
    }
}

#[derive(Debug)]
struct RemuxEntry {
    output: PathBuf,
    ready: watch::Receiver<bool>,
    error: Arc<Mutex<Option<String>>>,
    started_at: Instant,
    cancellation_token: CancellationToken,
}

impl RemuxEntry {
    /// Create an entry for an output which already exists on disk.
    fn completed(output: PathBuf) -> Self {
        // the receiver keeps serving the final value after the sender is gone
        let (_, rx) = watch::channel(true);

        Self {
            output,
            ready: rx,
            error: Arc::new(Mutex::new(None)),
            started_at: Instant::now(),
            cancellation_token: CancellationToken::new(),
        }
    }

    fn status(&self) -> RemuxStatus {
        RemuxStatus {
            output: self.output.clone(),
            ready: *self.ready.borrow(),
        }
    }
}
