use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use peerflux_core::core::media::{Error, MediaDetails, MediaProbe, Result};
use serde::Deserialize;
use tokio::process::Command;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const VIDEO_CODEC_TYPE: &str = "video";
const AUDIO_CODEC_TYPE: &str = "audio";
const H264_CODEC_NAME: &str = "h264";
const AAC_CODEC_NAME: &str = "aac";

/// The [MediaProbe] implementation which shells out to an ffprobe-style binary
/// with json output.
#[derive(Debug, Clone)]
pub struct FfprobeMediaProbe {
    binary: String,
    timeout: Duration,
}

impl FfprobeMediaProbe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Parse an ffprobe frame rate fraction such as `30000/1001`.
    fn parse_frame_rate(value: &str) -> Option<f64> {
        let mut parts = value.splitn(2, '/');
        let numerator = parts.next()?.trim().parse::<f64>().ok()?;
        let denominator = match parts.next() {
            Some(e) => e.trim().parse::<f64>().ok()?,
            None => 1.0,
        };

        if numerator <= 0.0 || denominator <= 0.0 {
            return None;
        }

        Some(numerator / denominator)
    }

    fn parse_output(data: &[u8]) -> Result<MediaDetails> {
        let output: FfprobeOutput = serde_json::from_slice(data)
            .map_err(|e| Error::ProbeFailed(format!("invalid probe output, {}", e)))?;

        let video = output
            .streams
            .iter()
            .find(|e| e.codec_type.as_deref() == Some(VIDEO_CODEC_TYPE));
        let audio = output
            .streams
            .iter()
            .find(|e| e.codec_type.as_deref() == Some(AUDIO_CODEC_TYPE));

        Ok(MediaDetails {
            h264: video
                .map(|e| e.codec_name.as_deref() == Some(H264_CODEC_NAME))
                .unwrap_or(false),
            aac: audio
                .map(|e| e.codec_name.as_deref() == Some(AAC_CODEC_NAME))
                .unwrap_or(false),
            width: video.and_then(|e| e.width),
            height: video.and_then(|e| e.height),
            duration: output
                .format
                .and_then(|e| e.duration)
                .and_then(|e| e.parse::<f64>().ok()),
            fps: video
                .and_then(|e| e.avg_frame_rate.as_deref())
                .and_then(Self::parse_frame_rate),
        })
    }
}

#[async_trait]
impl MediaProbe for FfprobeMediaProbe {
    async fn probe(&self, path: &Path) -> Result<MediaDetails> {
        trace!("Probing media file {:?}", path);
        let mut command = Command::new(self.binary.as_str());
        command
            .args(["-v", "error", "-print_format", "json"])
            .args(["-show_streams", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Io(e.to_string()))?;

        if !output.status.success() {
            return Err(Error::ProbeFailed(
                String::from_utf8_lossy(output.stderr.as_slice())
                    .trim()
                    .to_string(),
            ));
        }

        let details = Self::parse_output(output.stdout.as_slice())?;
        debug!("Probed media file {:?} as {:?}", path, details);
        Ok(details)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}
