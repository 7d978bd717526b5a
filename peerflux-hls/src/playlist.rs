use std::path::{Component, Path, PathBuf};

use log::trace;

use crate::{Error, Result};

/// The HLS tag which marks a playlist as complete.
pub const END_LIST_TAG: &str = "#EXT-X-ENDLIST";

const SEGMENT_DURATION_TAG: &str = "#EXTINF:";

/// A single media segment entry of an HLS playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// The relative filename of the segment
    pub filename: String,
    /// The duration of the segment in seconds
    pub duration: f64,
}

/// Parse the ordered segment entries from the given HLS event playlist contents.
/// Comment lines which don't belong to a segment entry are ignored.
pub fn parse_segments(content: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut duration: Option<f64> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(value) = line.strip_prefix(SEGMENT_DURATION_TAG) {
            duration = value.trim_end_matches(',').parse::<f64>().ok();
        } else if !line.starts_with('#') {
            if let Some(duration) = duration.take() {
                segments.push(Segment {
                    filename: line.to_string(),
                    duration,
                });
            }
        }
    }

    segments
}

/// Read the given playlist file and parse its segment entries.
pub async fn parse_segments_file(path: &Path) -> Result<Vec<Segment>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(e.to_string()))?;

    Ok(parse_segments(content.as_str()))
}

/// Verify if the given playlist file contains the HLS end-list tag.
pub async fn has_end_list(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content.contains(END_LIST_TAG),
        Err(e) => {
            trace!("Unable to read playlist {:?}, {}", path, e);
            false
        }
    }
}

/// Rewrite the URI lines of the given playlist contents to carry the track selection
/// as query parameters.
///
/// Comment lines are left untouched. The `audioTrack` parameter is always appended,
/// `subtitleTrack` only when it selects a track (>= 0). The count and relative order
/// of URI lines is preserved.
pub fn rewrite_segment_urls(content: &str, audio_track: i32, subtitle_track: i32) -> String {
    let mut result = String::with_capacity(content.len());

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            result.push_str(line);
        } else {
            let separator = if trimmed.contains('?') { '&' } else { '?' };
            result.push_str(trimmed);
            result.push(separator);
            result.push_str(format!("audioTrack={}", audio_track).as_str());
            if subtitle_track >= 0 {
                result.push_str(format!("&subtitleTrack={}", subtitle_track).as_str());
            }
        }
        result.push('\n');
    }

    result
}

/// Resolve the given segment name against the base directory.
///
/// It returns [Error::InvalidRequest] for absolute names, names containing parent
/// directory components, or any result which would escape the base directory.
pub fn safe_segment_path(base: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);

    if relative.is_absolute() {
        return Err(Error::InvalidRequest(format!(
            "segment name {} is absolute",
            name
        )));
    }

    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "segment name {} escapes the base directory",
                    name
                )))
            }
        }
    }

    let path = base.join(relative);
    if !path.starts_with(base) {
        return Err(Error::InvalidRequest(format!(
            "segment name {} escapes the base directory",
            name
        )));
    }

    Ok(path)
}

/// Build the transcoder subtitle filter argument for burning the given subtitle
/// track of the given file into the video stream.
pub fn subtitle_filter_arg(path: &str, track: i32) -> String {
    let escaped = path
        .replace('\\', "/")
        .replace('\'', "\\'")
        .replace(':', "\\:");

    format!("subtitles='{}':si={}", escaped, track)
}

/// Estimate the byte offset of the given playback position within a file, based on
/// the duration to length ratio.
///
/// It returns `-1` when any of the inputs is non-positive.
pub fn estimate_byte_offset(target_sec: f64, duration_sec: f64, file_length: u64) -> i64 {
    if target_sec <= 0.0 || duration_sec <= 0.0 || file_length == 0 {
        return -1;
    }

    let fraction = (target_sec / duration_sec).clamp(0.0, 1.0);
    (fraction * file_length as f64) as i64
}
