use std::path::PathBuf;

use itertools::Itertools;
use url::Url;

use crate::playlist::subtitle_filter_arg;

/// The analyze/probe budgets used when the input is a seekable file.
const FILE_ANALYZE_DURATION: &str = "10000000";
const FILE_PROBE_SIZE: &str = "20000000";
/// The reduced analyze/probe budgets used when the input is a pipe.
const PIPE_ANALYZE_DURATION: &str = "5000000";
const PIPE_PROBE_SIZE: &str = "5000000";
/// The segment duration used when the configured duration is not positive.
const DEFAULT_SEGMENT_DURATION: u32 = 2;
/// The filename of the multi-variant master playlist.
pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";
/// The filename of a media playlist.
pub const MEDIA_PLAYLIST_NAME: &str = "index.m3u8";

/// The fixed rendition ladder: height and video bitrate pairs.
const VARIANT_PRESETS: [(u32, &str); 3] = [(480, "1500k"), (720, "3000k"), (1080, "6000k")];

/// The input fed to the transcoder.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeInput {
    /// A local file on disk
    File(PathBuf),
    /// Bytes piped into the transcoder's standard input
    Pipe,
    /// An http(s) url served by the engine's own stream endpoint
    Http(Url),
}

impl TranscodeInput {
    fn as_arg(&self) -> String {
        match self {
            TranscodeInput::File(path) => path.to_string_lossy().to_string(),
            TranscodeInput::Pipe => "pipe:0".to_string(),
            TranscodeInput::Http(url) => url.to_string(),
        }
    }

    fn is_pipe(&self) -> bool {
        matches!(self, TranscodeInput::Pipe)
    }

    fn is_http(&self) -> bool {
        matches!(self, TranscodeInput::Http(_))
    }
}

/// A single rendition of the adaptive bitrate ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// The target height of the rendition in pixels
    pub height: u32,
    /// The fixed video bitrate, or [None] for the quality based top rendition
    pub video_bitrate: Option<String>,
    /// The optional rate cap applied to the quality based rendition
    pub max_rate: Option<String>,
}

/// Compute the adaptive bitrate ladder for the given source height.
///
/// Every preset with a height up to the source height qualifies. It returns
/// [None] when fewer than two presets qualify, in which case a single rendition
/// is encoded instead. The top rendition has no fixed bitrate and is encoded
/// quality based with the preset bitrate as its rate cap.
pub fn compute_variants(source_height: u32) -> Option<Vec<Variant>> {
    let qualifying: Vec<&(u32, &str)> = VARIANT_PRESETS
        .iter()
        .filter(|(height, _)| *height <= source_height)
        .collect();

    if qualifying.len() < 2 {
        return None;
    }

    let top = qualifying.len() - 1;
    Some(
        qualifying
            .into_iter()
            .enumerate()
            .map(|(i, (height, bitrate))| {
                if i == top {
                    Variant {
                        height: *height,
                        video_bitrate: None,
                        max_rate: Some((*bitrate).to_string()),
                    }
                } else {
                    Variant {
                        height: *height,
                        video_bitrate: Some((*bitrate).to_string()),
                        max_rate: None,
                    }
                }
            })
            .collect(),
    )
}

/// The full description of a transcoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeSpec {
    pub input: TranscodeInput,
    pub output_dir: PathBuf,
    pub seek_seconds: f64,
    pub segment_duration: u32,
    pub preset: String,
    pub crf: u32,
    pub audio_bitrate: String,
    /// Copy the video stream instead of re-encoding it
    pub stream_copy: bool,
    /// Indicates if the source audio is already AAC encoded
    pub source_is_aac: bool,
    /// The adaptive bitrate ladder, or [None] for a single rendition
    pub variants: Option<Vec<Variant>>,
    pub subtitle_track: i32,
    pub subtitle_file: Option<PathBuf>,
    pub source_height: Option<u32>,
    pub source_fps: Option<f64>,
    pub audio_track: i32,
}

impl TranscodeSpec {
    fn segment_duration(&self) -> u32 {
        if self.segment_duration == 0 {
            DEFAULT_SEGMENT_DURATION
        } else {
            self.segment_duration
        }
    }

    fn subtitle_filter(&self) -> Option<String> {
        if self.subtitle_track < 0 {
            return None;
        }

        self.subtitle_file.as_ref().map(|file| {
            subtitle_filter_arg(file.to_string_lossy().as_ref(), self.subtitle_track)
        })
    }
}

/// Build the ordered transcoder argument list for the given invocation.
pub fn build_args(spec: &TranscodeSpec) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let segment_duration = spec.segment_duration();

    args.extend(flags(&["-hide_banner", "-loglevel", "error", "-nostats"]));
    args.extend(flags(&["-progress", "pipe:1"]));

    if spec.input.is_pipe() {
        args.extend(flags(&["-analyzeduration", PIPE_ANALYZE_DURATION]));
        args.extend(flags(&["-probesize", PIPE_PROBE_SIZE]));
    } else {
        args.extend(flags(&["-analyzeduration", FILE_ANALYZE_DURATION]));
        args.extend(flags(&["-probesize", FILE_PROBE_SIZE]));
    }

    if spec.input.is_http() {
        args.extend(flags(&["-reconnect", "1"]));
        args.extend(flags(&["-reconnect_at_eof", "1"]));
        args.extend(flags(&["-reconnect_streamed", "1"]));
        args.extend(flags(&["-reconnect_delay_max", "5"]));
    }

    if spec.seek_seconds > 0.0 {
        args.push("-ss".to_string());
        args.push(spec.seek_seconds.to_string());
    }

    args.push("-i".to_string());
    args.push(spec.input.as_arg());

    let audio_track = spec.audio_track.max(0);
    match spec.variants.as_ref() {
        Some(variants) if !spec.stream_copy => {
            push_variant_args(&mut args, spec, variants, audio_track, segment_duration)
        }
        _ => push_single_args(&mut args, spec, audio_track, segment_duration),
    }

    args
}

fn push_single_args(
    args: &mut Vec<String>,
    spec: &TranscodeSpec,
    audio_track: i32,
    segment_duration: u32,
) {
    args.push("-map".to_string());
    args.push("0:v:0".to_string());
    args.push("-map".to_string());
    args.push(format!("0:a:{}?", audio_track));

    if spec.stream_copy {
        args.extend(flags(&["-c:v", "copy"]));
    } else {
        args.push("-c:v".to_string());
        args.push("libx264".to_string());
        args.push("-preset".to_string());
        args.push(spec.preset.clone());
        args.push("-crf".to_string());
        args.push(spec.crf.to_string());
        push_keyframe_args(args, spec, segment_duration);

        if let Some(filter) = spec.subtitle_filter() {
            args.push("-vf".to_string());
            args.push(filter);
        }
    }

    push_audio_args(args, spec);
    push_hls_args(args, spec, segment_duration, false);
}

fn push_variant_args(
    args: &mut Vec<String>,
    spec: &TranscodeSpec,
    variants: &[Variant],
    audio_track: i32,
    segment_duration: u32,
) {
    args.push("-filter_complex".to_string());
    args.push(build_filter_graph(spec, variants));

    for (i, variant) in variants.iter().enumerate() {
        args.push("-map".to_string());
        args.push(format!("[v{}]", i));
        args.push("-map".to_string());
        args.push(format!("0:a:{}?", audio_track));

        args.push(format!("-c:v:{}", i));
        args.push("libx264".to_string());
        args.push(format!("-preset:v:{}", i));
        args.push(spec.preset.clone());

        match variant.video_bitrate.as_ref() {
            Some(bitrate) => {
                args.push(format!("-b:v:{}", i));
                args.push(bitrate.clone());
                args.push(format!("-maxrate:v:{}", i));
                args.push(bitrate.clone());
                args.push(format!("-bufsize:v:{}", i));
                args.push(double_rate(bitrate));
            }
            None => {
                args.push(format!("-crf:v:{}", i));
                args.push(spec.crf.to_string());
                if let Some(max_rate) = variant.max_rate.as_ref() {
                    args.push(format!("-maxrate:v:{}", i));
                    args.push(max_rate.clone());
                    args.push(format!("-bufsize:v:{}", i));
                    args.push(double_rate(max_rate));
                }
            }
        }
    }

    push_keyframe_args(args, spec, segment_duration);
    push_audio_args(args, spec);

    args.push("-var_stream_map".to_string());
    args.push(
        (0..variants.len())
            .map(|i| format!("v:{},a:{}", i, i))
            .join(" "),
    );

    push_hls_args(args, spec, segment_duration, true);
}

/// Build the filter graph which splits the source towards every rendition and
/// scales all but the highest one.
fn build_filter_graph(spec: &TranscodeSpec, variants: &[Variant]) -> String {
    let count = variants.len();
    let mut graph = String::from("[0:v]");

    if let Some(filter) = spec.subtitle_filter() {
        graph.push_str(filter.as_str());
        graph.push(',');
    }

    graph.push_str(format!("split={}", count).as_str());
    for i in 0..count {
        graph.push_str(format!("[vt{}]", i).as_str());
    }

    for (i, variant) in variants.iter().enumerate() {
        if i == count - 1 {
            graph.push_str(format!(";[vt{}]copy[v{}]", i, i).as_str());
        } else {
            graph.push_str(format!(";[vt{}]scale=-2:{}[v{}]", i, variant.height, i).as_str());
        }
    }

    graph
}

/// Emit the keyframe alignment flags which keep segment boundaries stable.
fn push_keyframe_args(args: &mut Vec<String>, spec: &TranscodeSpec, segment_duration: u32) {
    match spec.source_fps.filter(|fps| *fps > 0.0) {
        Some(fps) => {
            let gop = (fps * segment_duration as f64).round() as u32;
            args.push("-g".to_string());
            args.push(gop.to_string());
            args.push("-keyint_min".to_string());
            args.push(gop.to_string());
            args.extend(flags(&["-sc_threshold", "0"]));
        }
        None => {
            args.push("-force_key_frames".to_string());
            args.push(format!("expr:gte(t,n_forced*{})", segment_duration));
        }
    }
}

fn push_audio_args(args: &mut Vec<String>, spec: &TranscodeSpec) {
    if spec.stream_copy && spec.source_is_aac {
        args.extend(flags(&["-c:a", "copy"]));
    } else {
        args.extend(flags(&["-c:a", "aac"]));
        args.push("-b:a".to_string());
        args.push(spec.audio_bitrate.clone());
    }
}

fn push_hls_args(
    args: &mut Vec<String>,
    spec: &TranscodeSpec,
    segment_duration: u32,
    multi_variant: bool,
) {
    args.extend(flags(&["-f", "hls"]));
    args.push("-hls_time".to_string());
    args.push(segment_duration.to_string());
    args.extend(flags(&["-hls_playlist_type", "event"]));
    args.extend(flags(&["-hls_flags", "append_list+independent_segments"]));

    if multi_variant {
        args.push("-hls_segment_filename".to_string());
        args.push(
            spec.output_dir
                .join("v%v")
                .join("seg-%05d.ts")
                .to_string_lossy()
                .to_string(),
        );
        args.push("-master_pl_name".to_string());
        args.push(MASTER_PLAYLIST_NAME.to_string());
        args.push(
            spec.output_dir
                .join("v%v")
                .join(MEDIA_PLAYLIST_NAME)
                .to_string_lossy()
                .to_string(),
        );
    } else {
        args.push("-hls_segment_filename".to_string());
        args.push(
            spec.output_dir
                .join("seg-%05d.ts")
                .to_string_lossy()
                .to_string(),
        );
        args.push(
            spec.output_dir
                .join(MEDIA_PLAYLIST_NAME)
                .to_string_lossy()
                .to_string(),
        );
    }
}

fn flags(values: &[&str]) -> Vec<String> {
    values.iter().map(|e| e.to_string()).collect()
}

/// Double the given rate value, used for rate control buffer sizing.
fn double_rate(rate: &str) -> String {
    match rate.strip_suffix('k').and_then(|e| e.parse::<u64>().ok()) {
        Some(value) => format!("{}k", value * 2),
        None => rate.to_string(),
    }
}
