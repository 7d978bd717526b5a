use derive_more::Display;
use serde::{Deserialize, Serialize};

const DEFAULT_PRESET: fn() -> String = || "veryfast".to_string();
const DEFAULT_CRF: fn() -> u32 = || 23;
const DEFAULT_AUDIO_BITRATE: fn() -> String = || "128k".to_string();
const DEFAULT_SEGMENT_DURATION: fn() -> u32 = || 2;

/// The user's transcoder encoding settings.
#[derive(Debug, Display, Clone, Serialize, Deserialize, PartialEq)]
#[display("preset: {}, crf: {}, segment duration: {}s", preset, crf, segment_duration)]
pub struct EncodingSettings {
    /// The x264 speed/quality preset
    #[serde(default = "DEFAULT_PRESET")]
    pub preset: String,
    /// The constant rate factor used for quality based encoding
    #[serde(default = "DEFAULT_CRF")]
    pub crf: u32,
    /// The bitrate used when audio needs to be transcoded
    #[serde(default = "DEFAULT_AUDIO_BITRATE")]
    pub audio_bitrate: String,
    /// The duration of a single HLS segment in seconds
    #[serde(default = "DEFAULT_SEGMENT_DURATION")]
    pub segment_duration: u32,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            preset: DEFAULT_PRESET(),
            crf: DEFAULT_CRF(),
            audio_bitrate: DEFAULT_AUDIO_BITRATE(),
            segment_duration: DEFAULT_SEGMENT_DURATION(),
        }
    }
}

/// A partial update of the [EncodingSettings].
/// Fields which are [None] keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodingSettingsUpdate {
    pub preset: Option<String>,
    pub crf: Option<u32>,
    pub audio_bitrate: Option<String>,
    pub segment_duration: Option<u32>,
}

impl EncodingSettings {
    /// Apply the given partial update onto these settings.
    pub fn apply(&mut self, update: EncodingSettingsUpdate) {
        if let Some(preset) = update.preset {
            self.preset = preset;
        }
        if let Some(crf) = update.crf {
            self.crf = crf;
        }
        if let Some(audio_bitrate) = update.audio_bitrate {
            self.audio_bitrate = audio_bitrate;
        }
        if let Some(segment_duration) = update.segment_duration {
            self.segment_duration = segment_duration;
        }
    }
}
