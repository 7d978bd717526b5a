use derive_more::Display;
use serde::{Deserialize, Serialize};

const DEFAULT_PRELOAD_BYTES: fn() -> u64 = || 8 * 1024 * 1024;
const DEFAULT_AFTER_BYTES: fn() -> u64 = || 64 * 1024 * 1024;
const DEFAULT_BUFFER_BYTES: fn() -> u64 = || 32 * 1024 * 1024;

/// The playback window settings which steer prebuffering and piece priorities.
#[derive(Debug, Display, Clone, Serialize, Deserialize, PartialEq)]
#[display(
    "preload: {} bytes, after: {} bytes, buffer: {} bytes",
    preload_bytes,
    after_bytes,
    buffer_bytes
)]
pub struct WindowSettings {
    /// The number of bytes which must be buffered before the transcoder is started
    #[serde(default = "DEFAULT_PRELOAD_BYTES")]
    pub preload_bytes: u64,
    /// The length of the high priority window ahead of the playback position
    #[serde(default = "DEFAULT_AFTER_BYTES")]
    pub after_bytes: u64,
    /// The capacity of the in-memory ring buffer feeding the transcoder
    #[serde(default = "DEFAULT_BUFFER_BYTES")]
    pub buffer_bytes: u64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            preload_bytes: DEFAULT_PRELOAD_BYTES(),
            after_bytes: DEFAULT_AFTER_BYTES(),
            buffer_bytes: DEFAULT_BUFFER_BYTES(),
        }
    }
}

/// A partial update of the [WindowSettings].
/// Fields which are [None] keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowSettingsUpdate {
    pub preload_bytes: Option<u64>,
    pub after_bytes: Option<u64>,
    pub buffer_bytes: Option<u64>,
}

impl WindowSettings {
    /// Apply the given partial update onto these settings.
    pub fn apply(&mut self, update: WindowSettingsUpdate) {
        if let Some(preload_bytes) = update.preload_bytes {
            self.preload_bytes = preload_bytes;
        }
        if let Some(after_bytes) = update.after_bytes {
            self.after_bytes = after_bytes;
        }
        if let Some(buffer_bytes) = update.buffer_bytes {
            self.buffer_bytes = buffer_bytes;
        }
    }
}
