use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, trace, warn};
use peerflux_core::core::media::{self, MediaDetails, MediaProbe};
use peerflux_core::core::storage::Storage;
use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The filename of the persisted codec cache within the base directory.
pub const CODEC_CACHE_FILENAME: &str = "codec_cache.json";

const CACHE_CAPACITY: usize = 2000;
const PERSIST_DEBOUNCE: Duration = Duration::from_secs(5);
const PROBE_ATTEMPTS: usize = 3;
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(2);

fn entry_access_time() -> SystemTime {
    SystemTime::now()
}

/// A single persisted codec detection result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecCacheEntry {
    pub h264: bool,
    pub aac: bool,
    #[serde(rename = "w", default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(rename = "dur", default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(rename = "fps", default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip, default = "entry_access_time")]
    last_access: SystemTime,
}

impl From<MediaDetails> for CodecCacheEntry {
    fn from(value: MediaDetails) -> Self {
        Self {
            h264: value.h264,
            aac: value.aac,
            width: value.width,
            height: value.height,
            duration: value.duration,
            fps: value.fps,
            last_access: entry_access_time(),
        }
    }
}

impl From<&CodecCacheEntry> for MediaDetails {
    fn from(value: &CodecCacheEntry) -> Self {
        Self {
            h264: value.h264,
            aac: value.aac,
            width: value.width,
            height: value.height,
            duration: value.duration,
            fps: value.fps,
        }
    }
}

/// The read-through cache of codec detection results, keyed by absolute file path.
///
/// Probe results are persisted as json through a debounced background flush, with
/// the least recently accessed entries evicted above the capacity.
#[derive(Debug, Clone)]
pub struct MediaInfoCache {
    inner: Arc<InnerMediaInfoCache>,
}

impl MediaInfoCache {
    /// Create a new cache, loading any previously persisted entries from the base directory.
    pub async fn new(probe: Arc<dyn MediaProbe>, base_dir: &Path) -> Self {
        Self::with_capacity(probe, base_dir, CACHE_CAPACITY).await
    }

    async fn with_capacity(probe: Arc<dyn MediaProbe>, base_dir: &Path, capacity: usize) -> Self {
        let storage = Storage::from(base_dir);
        let entries = match storage.read::<HashMap<String, CodecCacheEntry>>(CODEC_CACHE_FILENAME).await
        {
            Ok(entries) => {
                debug!("Loaded {} codec cache entries", entries.len());
                entries
            }
            Err(e) => {
                trace!("Codec cache not loaded, {}", e);
                HashMap::new()
            }
        };

        Self {
            inner: Arc::new(InnerMediaInfoCache {
                probe,
                storage,
                capacity,
                entries: Mutex::new(entries),
                persist_pending: AtomicBool::new(false),
                cancellation_token: CancellationToken::new(),
            }),
        }
    }

    /// Retrieve the media details for the given file, probing it on a cache miss.
    /// Probe attempts are retried before the failure is returned.
    pub async fn details(&self, path: &Path) -> media::Result<MediaDetails> {
        let key = path.to_string_lossy().to_string();

        {
            let mut entries = self.inner.entries.lock().await;
            if let Some(entry) = entries.get_mut(&key) {
                entry.last_access = entry_access_time();
                return Ok(MediaDetails::from(&*entry));
            }
        }

        let details = self.probe_with_retries(path).await?;
        {
            let mut entries = self.inner.entries.lock().await;
            entries.insert(key, CodecCacheEntry::from(details.clone()));
            Self::evict(&mut entries, self.inner.capacity);
        }
        self.schedule_persist();

        Ok(details)
    }

    /// Retrieve the cached media details for the given file without probing.
    pub async fn cached(&self, path: &Path) -> Option<MediaDetails> {
        let key = path.to_string_lossy().to_string();
        let mut entries = self.inner.entries.lock().await;

        entries.get_mut(&key).map(|entry| {
            entry.last_access = entry_access_time();
            MediaDetails::from(&*entry)
        })
    }

    /// The current number of cached entries.
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Persist the cache to disk immediately.
    pub async fn flush(&self) {
        self.inner.persist_pending.store(false, Ordering::SeqCst);
        let entries = self.inner.entries.lock().await.clone();

        if let Err(e) = self.inner.storage.write(CODEC_CACHE_FILENAME, &entries).await {
            warn!("Failed to persist the codec cache, {}", e);
        }
    }

    /// Stop the background persistence and flush any pending changes.
    pub async fn shutdown(&self) {
        self.inner.cancellation_token.cancel();
        if self.inner.persist_pending.load(Ordering::SeqCst) {
            self.flush().await;
        }
    }

    async fn probe_with_retries(&self, path: &Path) -> media::Result<MediaDetails> {
        let mut attempt = 1;

        loop {
            match self.inner.probe.probe(path).await {
                Ok(details) => return Ok(details),
                Err(e) => {
                    if attempt >= PROBE_ATTEMPTS {
                        return Err(e);
                    }

                    debug!(
                        "Media probe attempt {} for {:?} failed, {}",
                        attempt, path, e
                    );
                    attempt += 1;
                    tokio::time::sleep(PROBE_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Schedule a debounced persist, coalescing writes into one flush per window.
    fn schedule_persist(&self) {
        if self.inner.persist_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let cache = self.clone();
        tokio::spawn(async move {
            select! {
                _ = cache.inner.cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(PERSIST_DEBOUNCE) => {}
            }
            cache.flush().await;
        });
    }

    /// Evict the least recently accessed entries above the capacity.
    fn evict(entries: &mut HashMap<String, CodecCacheEntry>, capacity: usize) {
        while entries.len() > capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());

            match oldest {
                Some(key) => {
                    trace!("Evicting codec cache entry {}", key);
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[derive(Debug)]
struct InnerMediaInfoCache {
    probe: Arc<dyn MediaProbe>,
    storage: Storage,
    capacity: usize,
    entries: Mutex<HashMap<String, CodecCacheEntry>>,
    persist_pending: AtomicBool,
    cancellation_token: CancellationToken,
}
