use std::fmt::Debug;
use std::sync::Arc;

use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscription};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::config::{
    EncodingSettings, EncodingSettingsUpdate, WindowSettings, WindowSettingsUpdate,
};

/// The combined settings of the streaming subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StreamingSettings {
    #[serde(default)]
    pub encoding: EncodingSettings,
    #[serde(default)]
    pub window: WindowSettings,
}

/// The events which are published when the streaming settings change.
#[derive(Debug, Display, Clone)]
pub enum StreamingConfigEvent {
    /// Invoked when the encoding settings have been changed
    #[display("encoding settings have been changed")]
    EncodingChanged(EncodingSettings),
    /// Invoked when the playback window settings have been changed
    #[display("window settings have been changed")]
    WindowChanged(WindowSettings),
}

/// The thread-safe holder of the streaming settings.
/// Updates are atomic and never interrupt jobs which already snapshotted their settings.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    inner: Arc<InnerStreamingConfig>,
}

impl StreamingConfig {
    pub fn new(settings: StreamingSettings) -> Self {
        Self {
            inner: Arc::new(InnerStreamingConfig {
                settings: RwLock::new(settings),
                callbacks: MultiThreadedCallback::new(),
            }),
        }
    }

    /// Retrieve a snapshot of the current encoding settings.
    pub async fn encoding(&self) -> EncodingSettings {
        self.inner.settings.read().await.encoding.clone()
    }

    /// Retrieve a snapshot of the current playback window settings.
    pub async fn window(&self) -> WindowSettings {
        self.inner.settings.read().await.window.clone()
    }

    /// Retrieve a snapshot of all settings.
    pub async fn settings(&self) -> StreamingSettings {
        self.inner.settings.read().await.clone()
    }

    /// Update the encoding settings with the given partial update.
    pub async fn update_encoding(&self, update: EncodingSettingsUpdate) {
        let settings = {
            let mut settings = self.inner.settings.write().await;
            settings.encoding.apply(update);
            settings.encoding.clone()
        };

        debug!("Encoding settings changed to {}", settings);
        self.inner
            .callbacks
            .invoke(StreamingConfigEvent::EncodingChanged(settings));
    }

    /// Update the playback window settings with the given partial update.
    pub async fn update_window(&self, update: WindowSettingsUpdate) {
        let settings = {
            let mut settings = self.inner.settings.write().await;
            settings.window.apply(update);
            settings.window.clone()
        };

        debug!("Window settings changed to {}", settings);
        self.inner
            .callbacks
            .invoke(StreamingConfigEvent::WindowChanged(settings));
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self::new(StreamingSettings::default())
    }
}

impl Callback<StreamingConfigEvent> for StreamingConfig {
    fn subscribe(&self) -> Subscription<StreamingConfigEvent> {
        self.inner.callbacks.subscribe()
    }
}

#[derive(Debug)]
struct InnerStreamingConfig {
    settings: RwLock<StreamingSettings>,
    callbacks: MultiThreadedCallback<StreamingConfigEvent>,
}
