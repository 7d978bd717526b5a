use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscription};
use fx_handle::Handle;
use log::{debug, info, trace, warn};
use peerflux_core::core::config::{EncodingSettings, WindowSettings};
use peerflux_core::core::media::MediaDetails;
use peerflux_core::core::storage::Storage;
use peerflux_core::core::stream::MediaStreamUseCase;
use peerflux_core::core::torrents::{TorrentEngine, TorrentFileInfo};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::{self, RamBuffer};
use crate::manager::{MediaInfoCache, RemuxCache, RemuxKey};
use crate::playlist::{estimate_byte_offset, has_end_list, rewrite_segment_urls};
use crate::priority::PriorityManager;
use crate::transcoder::{
    build_args, compute_variants, TranscodeInput, TranscodeSpec, TranscoderProcess,
    TranscoderStdin, MASTER_PLAYLIST_NAME, MEDIA_PLAYLIST_NAME,
};
use crate::{Error, Result};

const PLAYLIST_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PLAYLIST_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
const PREBUFFER_TIMEOUT: Duration = Duration::from_secs(15);
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const BUFFERING_POLL_INTERVAL: Duration = Duration::from_secs(3);
const BUFFERING_TIMEOUT: Duration = Duration::from_secs(90);
const STALL_ENHANCE_THRESHOLD: Duration = Duration::from_secs(30);
const STALL_BUFFERING_THRESHOLD: Duration = Duration::from_secs(60);
const STALL_ERROR_FILE_THRESHOLD: Duration = Duration::from_secs(90);
const STALL_ERROR_PIPE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// The size of the tail boost applied on initial play for the container indices.
const TAIL_BOOST_BYTES: u64 = 16 * 1024 * 1024;
/// The grace period before an abandoned working directory is removed, letting
/// in-flight segment responses finish.
const WORKDIR_DRAIN_GRACE: Duration = Duration::from_secs(5);

const MKV_EXTENSION: &str = "mkv";

/// The key identifying a stream job session.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
#[display("{}#{}:a{}-s{}", torrent_id, file_index, audio_track, subtitle_track)]
pub struct JobKey {
    pub torrent_id: String,
    pub file_index: usize,
    /// The selected audio track index
    pub audio_track: i32,
    /// The selected subtitle track index, `-1` means no burn-in
    pub subtitle_track: i32,
}

/// The state of a stream job.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum StreamJobState {
    Idle,
    Loading,
    Ready,
    Playing,
    Buffering,
    Seeking,
    Completed,
    Error,
}

impl StreamJobState {
    /// Verify if this state is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamJobState::Completed | StreamJobState::Error)
    }
}

/// The events published by a stream job.
#[derive(Debug, Display, Clone)]
pub enum StreamJobEvent {
    /// Invoked when the state of the job has changed
    #[display("job state changed to {}", _0)]
    StateChanged(StreamJobState),
    /// Invoked when the playlist of the job has become available
    #[display("job playlist is ready")]
    PlaylistReady(PathBuf),
    /// Invoked when the job has not seen new segments for the given duration
    #[display("job stalled for {:?}", _0)]
    Stalled(Duration),
}

/// The outcome observed by ready waiters.
#[derive(Debug, Copy, Clone, PartialEq)]
enum ReadyState {
    Pending,
    Ready,
    Failed,
}

/// The collaborators and settings snapshot handed to a job by the manager.
#[derive(Debug, Clone)]
pub struct StreamJobContext {
    pub stream: Arc<dyn MediaStreamUseCase>,
    pub engine: Option<Arc<dyn TorrentEngine>>,
    pub media_info: MediaInfoCache,
    pub remux: RemuxCache,
    pub transcoder_binary: String,
    pub encoding: EncodingSettings,
    pub window: WindowSettings,
}

/// A single supervised transcode pipeline for one session key.
///
/// The job drives the Loading, Ready, Playing, Buffering and Seeking states on a
/// background task until it completes, fails or is stopped. Seek requests are
/// latched through [StreamJob::request_seek] and consumed at state boundaries.
#[derive(Debug, Clone)]
pub struct StreamJob {
    inner: Arc<InnerStreamJob>,
}

impl StreamJob {
    pub fn new(
        key: JobKey,
        workdir: PathBuf,
        seek_seconds: f64,
        context: StreamJobContext,
    ) -> Self {
        let (ready, _) = watch::channel(ReadyState::Pending);

        Self {
            inner: Arc::new(InnerStreamJob {
                handle: Handle::new(),
                key,
                context,
                workdir: Mutex::new(workdir),
                playlist: Mutex::new(None),
                state: Mutex::new(StreamJobState::Idle),
                seek_seconds: Mutex::new(seek_seconds),
                pending_seek: Mutex::new(None),
                ready: Mutex::new(ready),
                error: Mutex::new(None),
                source: Mutex::new(None),
                priority: Mutex::new(None),
                process: Mutex::new(None),
                media: Mutex::new(None),
                segment_tracking: Mutex::new(SegmentTracking::new()),
                rewritten: Mutex::new(None),
                callbacks: MultiThreadedCallback::new(),
                cancellation_token: CancellationToken::new(),
                loop_done: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Create a job which adopts an already completed playlist from a previous run.
    pub fn adopt_completed(
        key: JobKey,
        workdir: PathBuf,
        playlist: PathBuf,
        context: StreamJobContext,
    ) -> Self {
        let job = Self::new(key, workdir, 0.0, context);

        {
            let inner = job.inner.clone();
            let mut state = inner.state.try_lock().expect("expected an unshared job");
            *state = StreamJobState::Completed;
            let mut playlist_path = inner.playlist.try_lock().expect("expected an unshared job");
            *playlist_path = Some(playlist);
            let ready = inner.ready.try_lock().expect("expected an unshared job");
            // send_replace stores the value even before any waiter subscribed
            ready.send_replace(ReadyState::Ready);
        }
        // the main loop never runs for an adopted job
        job.inner.started.store(true, Ordering::SeqCst);
        job.inner.loop_done.cancel();

        job
    }

    /// The unique handle of this job instance.
    pub fn handle(&self) -> Handle {
        self.inner.handle.clone()
    }

    /// The session key of this job.
    pub fn key(&self) -> &JobKey {
        &self.inner.key
    }

    /// Verify if this job is the same instance as the given job.
    pub fn is_same_instance(&self, other: &StreamJob) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Start the playback pipeline of this job.
    /// This operation is one-shot, later invocations are no-ops.
    pub fn start_playback(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run().await;
        });
    }

    /// The current state of the job.
    pub async fn state(&self) -> StreamJobState {
        *self.inner.state.lock().await
    }

    /// The current working directory of the job.
    pub async fn workdir(&self) -> PathBuf {
        self.inner.workdir.lock().await.clone()
    }

    /// The current playlist path of the job, if any.
    pub async fn playlist_path(&self) -> Option<PathBuf> {
        self.inner.playlist.lock().await.clone()
    }

    /// The seek offset this job transcodes from, in seconds.
    pub async fn seek_seconds(&self) -> f64 {
        *self.inner.seek_seconds.lock().await
    }

    /// The last error of the job, if any.
    pub async fn error(&self) -> Option<Error> {
        self.inner.error.lock().await.clone()
    }

    /// Latch a seek request which is consumed by the job at the next state boundary.
    pub async fn request_seek(&self, target_seconds: f64) {
        debug!("Stream job {} received seek request {}", self, target_seconds);
        *self.inner.pending_seek.lock().await = Some(target_seconds);
    }

    /// The encoded timeline position in microseconds, when a live transcoder exists.
    pub async fn encoded_us(&self) -> Option<i64> {
        let process = self.inner.process.lock().await.clone()?;
        if process.is_done() {
            return None;
        }

        let seek = *self.inner.seek_seconds.lock().await;
        Some((seek * 1_000_000f64) as i64 + process.progress_us())
    }

    /// Verify if the job currently owns a live transcoder process.
    pub async fn has_live_transcoder(&self) -> bool {
        match self.inner.process.lock().await.as_ref() {
            Some(process) => !process.is_done(),
            None => false,
        }
    }

    /// Wait until the job is ready, returning the playlist path or the job error.
    pub async fn wait_ready(&self) -> Result<PathBuf> {
        let mut receiver = self.inner.ready.lock().await.subscribe();

        loop {
            let ready = *receiver.borrow();
            match ready {
                ReadyState::Pending => {
                    if receiver.changed().await.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
                ReadyState::Ready => {
                    return self.playlist_path().await.ok_or(Error::Cancelled);
                }
                ReadyState::Failed => {
                    return Err(self.error().await.unwrap_or(Error::Cancelled));
                }
            }
        }
    }

    /// The playlist contents with the track selection applied to every segment uri.
    /// The rewritten contents are cached until the playlist file changes on disk.
    pub async fn rewritten_playlist(&self, audio_track: i32, subtitle_track: i32) -> Result<String> {
        let playlist = self
            .playlist_path()
            .await
            .ok_or_else(|| Error::InvalidRequest("the playlist is not available".to_string()))?;
        let modified = tokio::fs::metadata(&playlist)
            .await
            .and_then(|e| e.modified())
            .map_err(|e| Error::Io(e.to_string()))?;

        {
            let cache = self.inner.rewritten.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.source == playlist
                    && cached.modified == modified
                    && cached.audio_track == audio_track
                    && cached.subtitle_track == subtitle_track
                {
                    trace!("Serving cached rewritten playlist of {}", self);
                    return Ok(cached.content.clone());
                }
            }
        }

        let content = tokio::fs::read_to_string(&playlist)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let rewritten = rewrite_segment_urls(content.as_str(), audio_track, subtitle_track);

        let mut cache = self.inner.rewritten.lock().await;
        *cache = Some(RewrittenPlaylist {
            source: playlist,
            modified,
            audio_track,
            subtitle_track,
            content: rewritten.clone(),
        });

        Ok(rewritten)
    }

    /// Stop the job and wait until its pipeline has been torn down.
    pub async fn stop(&self) {
        trace!("Stopping stream job {}", self);
        self.inner.cancellation_token.cancel();

        if self.inner.started.load(Ordering::SeqCst) {
            self.inner.loop_done.cancelled().await;
        } else {
            self.inner.cleanup().await;
        }
    }
}

impl Callback<StreamJobEvent> for StreamJob {
    fn subscribe(&self) -> Subscription<StreamJobEvent> {
        self.inner.callbacks.subscribe()
    }
}

impl Display for StreamJob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[derive(Debug, Display)]
#[display("{} ({})", key, handle)]
struct InnerStreamJob {
    handle: Handle,
    key: JobKey,
    context: StreamJobContext,
    workdir: Mutex<PathBuf>,
    playlist: Mutex<Option<PathBuf>>,
    state: Mutex<StreamJobState>,
    /// The seek offset of the current transcoder timeline.
    /// Only the main loop mutates this, and only while consuming a pending seek.
    seek_seconds: Mutex<f64>,
    /// The latched seek request, guarded independently of the job state
    pending_seek: Mutex<Option<f64>>,
    ready: Mutex<watch::Sender<ReadyState>>,
    error: Mutex<Option<Error>>,
    source: Mutex<Option<JobSource>>,
    priority: Mutex<Option<Arc<PriorityManager>>>,
    process: Mutex<Option<TranscoderProcess>>,
    media: Mutex<Option<MediaDetails>>,
    segment_tracking: Mutex<SegmentTracking>,
    rewritten: Mutex<Option<RewrittenPlaylist>>,
    callbacks: MultiThreadedCallback<StreamJobEvent>,
    cancellation_token: CancellationToken,
    loop_done: CancellationToken,
    started: AtomicBool,
}

impl InnerStreamJob {
    /// The main loop of the job pipeline.
    async fn run(&self) {
        self.update_state(StreamJobState::Loading).await;

        loop {
            let state = *self.state.lock().await;
            if state.is_terminal() {
                break;
            }

            let step = select! {
                _ = self.cancellation_token.cancelled() => break,
                step = self.step(state) => step,
            };

            match step {
                Ok(next) => self.update_state(next).await,
                Err(e) => self.fail(e).await,
            }
        }

        self.cleanup().await;
        self.loop_done.cancel();
        debug!("Stream job {} main loop ended", self);
    }

    async fn step(&self, state: StreamJobState) -> Result<StreamJobState> {
        match state {
            StreamJobState::Loading => self.do_loading().await,
            StreamJobState::Ready => self.do_ready().await,
            StreamJobState::Playing => self.do_playing().await,
            StreamJobState::Buffering => self.do_buffering().await,
            StreamJobState::Seeking => self.do_seeking().await,
            state => {
                warn!("Stream job {} cannot step within state {}", self, state);
                Err(Error::Cancelled)
            }
        }
    }

    /// Resolve the data source of the job and prepare it for the transcoder.
    async fn do_loading(&self) -> Result<StreamJobState> {
        let seek = *self.seek_seconds.lock().await;

        trace!("Stream job {} is requesting the raw byte stream", self);
        let mut raw = self
            .context
            .stream
            .execute_raw(self.key.torrent_id.as_str(), self.key.file_index)
            .await?;
        raw.reader.set_responsive();
        let file = raw.file.clone();

        let priority = Arc::new(PriorityManager::new(
            self.context.engine.clone(),
            self.key.torrent_id.clone(),
            self.key.file_index,
            file.length,
        ));
        if seek == 0.0 {
            // container indices live at the end of the file
            priority.boost_tail(TAIL_BOOST_BYTES).await;
        }
        *self.priority.lock().await = Some(priority.clone());

        // trust the on-disk size over a lagging bytes_completed counter
        let on_disk_length = tokio::fs::metadata(file.path.as_path())
            .await
            .map(|e| e.len())
            .unwrap_or(0);
        let file_backed = file.is_complete() || (file.length > 0 && on_disk_length == file.length);

        let source = if file_backed {
            debug!("Stream job {} uses the file source {:?}", self, file.path);
            raw.reader.close().await;

            match self.context.media_info.details(file.path.as_path()).await {
                Ok(details) => *self.media.lock().await = Some(details),
                Err(e) => debug!("Stream job {} media detection failed, {}", self, e),
            }

            JobSource {
                file: file.clone(),
                kind: SourceKind::File,
            }
        } else {
            debug!("Stream job {} uses a piped source", self);
            let buffer = RamBuffer::new(raw.reader, self.context.window.buffer_bytes as usize);

            if let Err(e) = buffer
                .prebuffer(self.context.window.preload_bytes as usize, PREBUFFER_TIMEOUT)
                .await
            {
                buffer.close().await;
                return Err(match e {
                    buffer::Error::PrebufferTimeout(timeout) => Error::PrebufferTimeout(timeout),
                    buffer::Error::Closed => Error::Cancelled,
                });
            }

            debug!(
                "Stream job {} prebuffered {} bytes",
                self,
                buffer.buffered().await
            );

            if let Some(details) = self.context.media_info.cached(file.path.as_path()).await {
                *self.media.lock().await = Some(details);
            }

            let duration = self.duration().await;
            let window_start = estimate_byte_offset(seek, duration, file.length).max(0) as u64;
            priority
                .apply(window_start, window_start + self.context.window.after_bytes)
                .await;

            JobSource {
                file: file.clone(),
                kind: SourceKind::Pipe(buffer),
            }
        };

        if self.key.subtitle_track >= 0 && !file.path.exists() {
            if let SourceKind::Pipe(buffer) = &source.kind {
                buffer.close().await;
            }
            return Err(Error::SubtitleSourceUnavailable(self.key.subtitle_track));
        }

        *self.source.lock().await = Some(source);
        Ok(StreamJobState::Ready)
    }

    /// Launch the transcoder and wait for its first playlist.
    async fn do_ready(&self) -> Result<StreamJobState> {
        let seek = *self.seek_seconds.lock().await;
        let workdir = self.workdir.lock().await.clone();
        let media = self.media.lock().await.clone();
        let (file, is_file_source, stdin) = {
            let source = self.source.lock().await;
            let source = source
                .as_ref()
                .ok_or_else(|| Error::Io("no data source available".to_string()))?;
            let stdin: Option<TranscoderStdin> = match &source.kind {
                SourceKind::File => None,
                SourceKind::Pipe(buffer) => Some(Box::new(buffer.reader())),
            };

            (source.file.clone(), source.is_file(), stdin)
        };

        let stream_copy = is_file_source
            && self.key.subtitle_track < 0
            && media.as_ref().map(|e| e.h264).unwrap_or(false);

        // a stream-copy capable mkv can be remuxed in the background to
        // accelerate future direct playback of the same file
        if stream_copy
            && file
                .path
                .extension()
                .map(|e| e.eq_ignore_ascii_case(MKV_EXTENSION))
                .unwrap_or(false)
        {
            self.context
                .remux
                .trigger(
                    &RemuxKey {
                        torrent_id: self.key.torrent_id.clone(),
                        file_index: self.key.file_index,
                    },
                    file.path.clone(),
                )
                .await;
        }

        let variants = if stream_copy {
            None
        } else {
            media.as_ref().and_then(|e| e.height).and_then(compute_variants)
        };
        let spec = TranscodeSpec {
            input: if is_file_source {
                TranscodeInput::File(file.path.clone())
            } else {
                TranscodeInput::Pipe
            },
            output_dir: workdir.clone(),
            seek_seconds: seek,
            segment_duration: self.context.encoding.segment_duration,
            preset: self.context.encoding.preset.clone(),
            crf: self.context.encoding.crf,
            audio_bitrate: self.context.encoding.audio_bitrate.clone(),
            stream_copy,
            source_is_aac: media.as_ref().map(|e| e.aac).unwrap_or(false),
            variants,
            subtitle_track: self.key.subtitle_track,
            subtitle_file: (self.key.subtitle_track >= 0).then(|| file.path.clone()),
            source_height: media.as_ref().and_then(|e| e.height),
            source_fps: media.as_ref().and_then(|e| e.fps),
            audio_track: self.key.audio_track,
        };

        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let process = TranscoderProcess::new(
            self.context.transcoder_binary.as_str(),
            build_args(&spec),
            &workdir,
            stdin,
        );
        *self.process.lock().await = Some(process.clone());

        info!("Stream job {} is starting the transcoder", self);
        if let Err(e) = process.start().await {
            self.close_source().await;
            return Err(Error::TranscoderExit(e.to_string()));
        }

        // the playlist can take a while for subtitle burn jobs, which scan the
        // entire subtitle stream before the first segment is written
        let deadline = Instant::now() + PLAYLIST_STARTUP_TIMEOUT;
        loop {
            if let Some(playlist) = Self::find_playlist(workdir.as_path()).await {
                debug!("Stream job {} playlist appeared at {:?}", self, playlist);
                *self.playlist.lock().await = Some(playlist.clone());
                self.segment_tracking.lock().await.reset();
                self.signal_ready(ReadyState::Ready).await;
                self.callbacks
                    .invoke(StreamJobEvent::PlaylistReady(playlist));
                return Ok(StreamJobState::Playing);
            }

            if process.is_done() {
                return Err(Error::TranscoderExit(process.stderr().await));
            }
            if Instant::now() >= deadline {
                return Err(Error::StartupTimeout(PLAYLIST_STARTUP_TIMEOUT));
            }

            tokio::time::sleep(PLAYLIST_POLL_INTERVAL).await;
        }
    }

    /// Monitor the running transcoder, consuming seek requests and escalating stalls.
    async fn do_playing(&self) -> Result<StreamJobState> {
        let process = self
            .process
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Io("no transcoder process available".to_string()))?;
        let playlist = self
            .playlist
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Io("no playlist available".to_string()))?;
        let pipe_source = self.is_pipe_source().await;
        let stall_error_threshold = if pipe_source {
            STALL_ERROR_PIPE_THRESHOLD
        } else {
            STALL_ERROR_FILE_THRESHOLD
        };
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);

        loop {
            interval.tick().await;

            if let Some(target) = self.consume_pending_seek().await {
                info!("Stream job {} is seeking to {}s", self, target);
                return Ok(StreamJobState::Seeking);
            }

            if process.is_done() {
                return if has_end_list(playlist.as_path()).await {
                    Ok(StreamJobState::Completed)
                } else {
                    Err(Error::TranscoderExit(process.stderr().await))
                };
            }

            let workdir = self.workdir.lock().await.clone();
            self.refresh_segment_tracking(workdir.as_path()).await;

            let encoded = *self.seek_seconds.lock().await + process.progress();
            let window_start = self.encoded_byte_offset(encoded).await;
            if let Some(window_start) = window_start {
                if let Some(priority) = self.priority.lock().await.as_ref() {
                    priority
                        .apply(window_start, window_start + self.context.window.after_bytes)
                        .await;
                }
            }

            let (stalled, escalation) = {
                let tracking = self.segment_tracking.lock().await;
                (tracking.changed_at.elapsed(), tracking.escalation)
            };
            if stalled >= stall_error_threshold {
                return Err(Error::Stalled(stalled));
            }
            if stalled >= STALL_BUFFERING_THRESHOLD {
                return Ok(StreamJobState::Buffering);
            }
            if stalled >= STALL_ENHANCE_THRESHOLD && escalation < 1 {
                debug!("Stream job {} stalled for {:?}, enhancing priority", self, stalled);
                if let Some(priority) = self.priority.lock().await.as_ref() {
                    priority.enhance_high(window_start.unwrap_or(0)).await;
                }
                self.segment_tracking.lock().await.escalation = 1;
                self.callbacks.invoke(StreamJobEvent::Stalled(stalled));
            }
        }
    }

    /// Try to recover from a stall by boosting priorities and polling for segments.
    async fn do_buffering(&self) -> Result<StreamJobState> {
        let process = self
            .process
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Io("no transcoder process available".to_string()))?;
        let playlist = self
            .playlist
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Io("no playlist available".to_string()))?;
        let deadline = Instant::now() + BUFFERING_TIMEOUT;
        let mut interval = tokio::time::interval(BUFFERING_POLL_INTERVAL);

        loop {
            interval.tick().await;

            if let Some(target) = self.consume_pending_seek().await {
                info!("Stream job {} is seeking to {}s", self, target);
                return Ok(StreamJobState::Seeking);
            }

            let encoded = *self.seek_seconds.lock().await + process.progress();
            if let Some(window_start) = self.encoded_byte_offset(encoded).await {
                if let Some(priority) = self.priority.lock().await.as_ref() {
                    priority.enhance_high(window_start).await;
                }
            }

            let workdir = self.workdir.lock().await.clone();
            if self.refresh_segment_tracking(workdir.as_path()).await {
                info!("Stream job {} recovered from buffering", self);
                return Ok(StreamJobState::Playing);
            }

            if process.is_done() {
                return if has_end_list(playlist.as_path()).await {
                    Ok(StreamJobState::Completed)
                } else {
                    Err(Error::TranscoderExit(process.stderr().await))
                };
            }
            if Instant::now() >= deadline {
                return Err(Error::Stalled(BUFFERING_TIMEOUT));
            }
        }
    }

    /// Tear down the current pipeline and restart it from the new seek offset in a
    /// fresh working directory.
    async fn do_seeking(&self) -> Result<StreamJobState> {
        if let Some(process) = self.process.lock().await.take() {
            process.stop();
            process.wait().await;
        }
        self.close_source().await;

        let old_workdir = self.workdir.lock().await.clone();
        let new_workdir = seek_workdir(old_workdir.as_path());
        tokio::fs::create_dir_all(&new_workdir)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;

        debug!(
            "Stream job {} switches working directory to {:?}",
            self, new_workdir
        );
        *self.workdir.lock().await = new_workdir;
        *self.playlist.lock().await = None;
        *self.rewritten.lock().await = None;
        *self.error.lock().await = None;
        self.segment_tracking.lock().await.reset();
        {
            // a fresh ready latch for the new pipeline generation
            let (ready, _) = watch::channel(ReadyState::Pending);
            *self.ready.lock().await = ready;
        }

        // let in-flight segment responses drain before the directory disappears
        Storage::delete_path_later(old_workdir, WORKDIR_DRAIN_GRACE);

        Ok(StreamJobState::Loading)
    }

    /// Release the process, data source and priorities of the job.
    async fn cleanup(&self) {
        trace!("Stream job {} is cleaning up", self);
        if let Some(process) = self.process.lock().await.take() {
            process.stop();
            process.wait().await;
        }
        self.close_source().await;
        if let Some(priority) = self.priority.lock().await.take() {
            priority.deprioritize().await;
        }

        if self.error.lock().await.is_none() && *self.state.lock().await != StreamJobState::Completed
        {
            *self.error.lock().await = Some(Error::Cancelled);
        }
        let failed = self.error.lock().await.is_some();
        self.signal_ready(if failed {
            ReadyState::Failed
        } else {
            ReadyState::Ready
        })
        .await;
    }

    /// Record the given error and transition into the error state.
    async fn fail(&self, error: Error) {
        warn!("Stream job {} failed, {}", self, error);
        *self.error.lock().await = Some(error);
        self.update_state(StreamJobState::Error).await;
    }

    async fn update_state(&self, new_state: StreamJobState) {
        {
            let mut state = self.state.lock().await;
            if *state == new_state {
                return;
            }
            *state = new_state;
        }

        info!("Stream job {} state changed to {}", self, new_state);
        self.callbacks
            .invoke(StreamJobEvent::StateChanged(new_state));
    }

    /// Close the ready latch exactly once per pipeline generation.
    async fn signal_ready(&self, state: ReadyState) {
        let sender = self.ready.lock().await;
        sender.send_if_modified(|current| {
            if *current == ReadyState::Pending && state != ReadyState::Pending {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    async fn consume_pending_seek(&self) -> Option<f64> {
        let target = self.pending_seek.lock().await.take()?;
        *self.seek_seconds.lock().await = target;

        Some(target)
    }

    async fn close_source(&self) {
        if let Some(source) = self.source.lock().await.take() {
            if let SourceKind::Pipe(buffer) = source.kind {
                buffer.close().await;
            }
        }
    }

    async fn is_pipe_source(&self) -> bool {
        match self.source.lock().await.as_ref() {
            Some(source) => !source.is_file(),
            None => false,
        }
    }

    /// The cached duration of the media in seconds, or `0` when unknown.
    async fn duration(&self) -> f64 {
        self.media
            .lock()
            .await
            .as_ref()
            .and_then(|e| e.duration)
            .unwrap_or(0.0)
    }

    /// Translate an encoded timeline position into a byte offset within the file.
    async fn encoded_byte_offset(&self, encoded_seconds: f64) -> Option<u64> {
        let duration = self.duration().await;
        let length = self.source.lock().await.as_ref().map(|e| e.file.length)?;

        let offset = estimate_byte_offset(encoded_seconds, duration, length);
        if offset < 0 {
            return None;
        }

        Some(offset as u64)
    }

    /// Rescan the working directory for the most recently modified segment.
    /// It returns `true` when a new or grown segment has been observed.
    async fn refresh_segment_tracking(&self, workdir: &Path) -> bool {
        let newest = Self::newest_segment(workdir).await;

        let mut tracking = self.segment_tracking.lock().await;
        if let Some((path, size)) = newest {
            if tracking.path.as_deref() != Some(path.as_path()) || tracking.size != size {
                trace!("Stream job {} observed segment progress at {:?}", self, path);
                tracking.path = Some(path);
                tracking.size = size;
                tracking.changed_at = Instant::now();
                tracking.escalation = 0;
                return true;
            }
        }

        false
    }

    /// Locate the most recently modified segment file, including variant subdirectories.
    async fn newest_segment(workdir: &Path) -> Option<(PathBuf, u64)> {
        let mut newest: Option<(PathBuf, u64, SystemTime)> = None;
        let mut directories = vec![workdir.to_path_buf()];

        while let Some(directory) = directories.pop() {
            let mut entries = match tokio::fs::read_dir(&directory).await {
                Ok(e) => e,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(e) => e,
                    Err(_) => continue,
                };

                if metadata.is_dir() && directory.as_path() == workdir {
                    directories.push(path);
                    continue;
                }
                if path.extension().map(|e| e == "ts").unwrap_or(false) {
                    let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
                    let is_newer = newest
                        .as_ref()
                        .map(|(_, _, newest_modified)| modified > *newest_modified)
                        .unwrap_or(true);

                    if is_newer {
                        newest = Some((path, metadata.len(), modified));
                    }
                }
            }
        }

        newest.map(|(path, size, _)| (path, size))
    }

    /// Locate the first playlist within the working directory, preferring the
    /// multi-variant master playlist.
    async fn find_playlist(workdir: &Path) -> Option<PathBuf> {
        let master = workdir.join(MASTER_PLAYLIST_NAME);
        if tokio::fs::try_exists(&master).await.unwrap_or(false) {
            return Some(master);
        }

        let media = workdir.join(MEDIA_PLAYLIST_NAME);
        if tokio::fs::try_exists(&media).await.unwrap_or(false) {
            return Some(media);
        }

        None
    }

}

/// Derive a fresh seek working directory beside the given directory.
/// Repeated derivations replace the previous seek suffix instead of stacking them.
pub(crate) fn seek_workdir(workdir: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let name = workdir
        .file_name()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let base_name = name.split("-seek-").next().unwrap_or(name.as_str());
    let directory = format!("{}-seek-{}", base_name, nanos);

    workdir
        .parent()
        .map(|e| e.join(directory.as_str()))
        .unwrap_or_else(|| PathBuf::from(directory.as_str()))
}

#[derive(Debug)]
struct JobSource {
    file: TorrentFileInfo,
    kind: SourceKind,
}

impl JobSource {
    fn is_file(&self) -> bool {
        matches!(self.kind, SourceKind::File)
    }
}

#[derive(Debug)]
enum SourceKind {
    File,
    Pipe(RamBuffer),
}

#[derive(Debug)]
struct SegmentTracking {
    path: Option<PathBuf>,
    size: u64,
    changed_at: Instant,
    escalation: u8,
}

impl SegmentTracking {
    fn new() -> Self {
        Self {
            path: None,
            size: 0,
            changed_at: Instant::now(),
            escalation: 0,
        }
    }

    fn reset(&mut self) {
        self.path = None;
        self.size = 0;
        self.changed_at = Instant::now();
        self.escalation = 0;
    }
}

#[derive(Debug)]
struct RewrittenPlaylist {
    source: PathBuf,
    modified: SystemTime,
    audio_track: i32,
    subtitle_track: i32,
    content: String,
}
