use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use log::{debug, info, trace, warn};
use peerflux_core::core::config::{
    EncodingSettings, EncodingSettingsUpdate, StreamingConfig, WindowSettings,
    WindowSettingsUpdate,
};
use peerflux_core::core::media::{self, MediaDetails, MediaProbe};
use peerflux_core::core::storage::Storage;
use peerflux_core::core::stream::MediaStreamUseCase;
use peerflux_core::core::torrents::{self, TorrentEngine, TorrentFileInfo, TorrentRepository};
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::job::{self, JobKey, StreamJob, StreamJobContext, StreamJobEvent, StreamJobState};
use crate::manager::{HealthSnapshot, HealthTracker, MediaInfoCache, RemuxCache, RemuxKey, RemuxStatus};
use crate::playlist::{has_end_list, parse_segments_file};
use crate::transcoder::{MASTER_PLAYLIST_NAME, MEDIA_PLAYLIST_NAME};
use crate::{Error, Result};

/// The estimated cost of a transcoder restart, used by the seek mode decision.
const ESTIMATED_RESTART_COST: Duration = Duration::from_secs(12);
/// Seeks spaced closer than this are logged as a potential seek storm.
const SEEK_STORM_THRESHOLD: Duration = Duration::from_millis(150);
/// The maximum number of automatic restarts per session key.
const MAX_AUTO_RESTARTS: u32 = 2;
/// The grace period before the directory of a replaced job is removed.
const REPLACED_WORKDIR_GRACE: Duration = Duration::from_secs(5);

const AUTO_RESTART_REASON_EXIT: &str = "ffmpeg_exit";
const AUTO_RESTART_REASON_STALL: &str = "watchdog_stall";
const TORRENT_ID_PATTERN: &str = "^[0-9a-fA-F]{40}([0-9a-fA-F]{24})?$";

/// The mode used to execute a seek request.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum SeekMode {
    /// The seek is handled by the player within already produced segments
    #[display("soft")]
    Soft,
    /// The seek requires a new transcoder invocation in a new working directory
    #[display("hard")]
    Hard,
}

impl SeekMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeekMode::Soft => "soft",
            SeekMode::Hard => "hard",
        }
    }
}

/// The builder of a [StreamJobManager].
#[derive(Debug, Default)]
pub struct StreamJobManagerBuilder {
    base_dir: Option<PathBuf>,
    transcoder_binary: Option<String>,
    probe: Option<Arc<dyn MediaProbe>>,
    stream: Option<Arc<dyn MediaStreamUseCase>>,
    engine: Option<Arc<dyn TorrentEngine>>,
    repository: Option<Arc<dyn TorrentRepository>>,
    config: Option<StreamingConfig>,
}

impl StreamJobManagerBuilder {
    pub fn base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn transcoder_binary(mut self, binary: impl Into<String>) -> Self {
        self.transcoder_binary = Some(binary.into());
        self
    }

    pub fn probe(mut self, probe: Arc<dyn MediaProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn stream(mut self, stream: Arc<dyn MediaStreamUseCase>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn TorrentEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn TorrentRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn config(mut self, config: StreamingConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the manager instance.
    ///
    /// # Panics
    ///
    /// It panics when the base directory, transcoder binary, probe or stream
    /// use case haven't been provided.
    pub async fn build(self) -> StreamJobManager {
        let base_dir = self.base_dir.expect("expected a base directory");
        let transcoder_binary = self
            .transcoder_binary
            .expect("expected a transcoder binary");
        let probe = self.probe.expect("expected a media probe");
        let media_info = MediaInfoCache::new(probe, base_dir.as_path()).await;
        let remux = RemuxCache::new(transcoder_binary.as_str(), base_dir.as_path());

        StreamJobManager {
            inner: Arc::new(InnerStreamJobManager {
                base_dir,
                transcoder_binary,
                stream: self.stream.expect("expected a stream use case"),
                engine: self.engine,
                repository: self.repository,
                config: self.config.unwrap_or_default(),
                media_info,
                remux,
                jobs: RwLock::new(HashMap::new()),
                health: HealthTracker::default(),
                restart_counts: Mutex::new(HashMap::new()),
                last_seek_at: Mutex::new(None),
                torrent_id_pattern: Regex::new(TORRENT_ID_PATTERN)
                    .expect("expected the torrent id pattern to be valid"),
            }),
        }
    }
}

/// The manager which multiplexes the stream jobs of the application.
///
/// It owns the job registry, decides between soft and hard seeks, maintains the
/// codec and remux caches, and cleans up orphaned artifacts.
#[derive(Debug, Clone)]
pub struct StreamJobManager {
    inner: Arc<InnerStreamJobManager>,
}

impl StreamJobManager {
    pub fn builder() -> StreamJobManagerBuilder {
        StreamJobManagerBuilder::default()
    }

    /// The base directory holding the streaming artifacts.
    pub fn base_dir(&self) -> &Path {
        self.inner.base_dir.as_path()
    }

    /// Compute a short deterministic fingerprint of the given encoding settings.
    /// It is used to segregate cached outputs with different parameters.
    pub fn compute_profile_hash(settings: &EncodingSettings) -> String {
        // FNV-1a over the profile fields
        let input = format!(
            "{}|{}|{}|{}",
            settings.preset, settings.crf, settings.audio_bitrate, settings.segment_duration
        );
        let mut hash: u32 = 2166136261;
        for byte in input.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(16777619);
        }

        format!("{:08x}", hash)
    }

    /// The working directory used for the given session key.
    pub fn job_directory(&self, key: &JobKey, settings: &EncodingSettings) -> PathBuf {
        self.inner.job_directory(key, settings)
    }

    /// Retrieve the job registered for the given key, or start a new one.
    ///
    /// A completed playlist found in the expected directory is adopted as a
    /// completed job instead of launching a new transcoder.
    pub async fn ensure_job(&self, key: JobKey) -> Result<StreamJob> {
        if let Some(job) = self.inner.jobs.read().await.get(&key) {
            trace!("Serving existing stream job for {}", key);
            return Ok(job.clone());
        }

        let mut jobs = self.inner.jobs.write().await;
        if let Some(job) = jobs.get(&key) {
            return Ok(job.clone());
        }

        let encoding = self.inner.config.encoding().await;
        let workdir = self.inner.job_directory(&key, &encoding);

        if let Some(playlist) = Self::completed_playlist(workdir.as_path()).await {
            info!("Adopting completed playlist {:?} for {}", playlist, key);
            let job = StreamJob::adopt_completed(
                key.clone(),
                workdir,
                playlist,
                self.job_context(encoding).await,
            );
            jobs.insert(key, job.clone());
            return Ok(job);
        }

        let job = StreamJob::new(key.clone(), workdir, 0.0, self.job_context(encoding).await);
        jobs.insert(key.clone(), job.clone());
        drop(jobs);

        info!("Registered new stream job for {}", key);
        self.inner.health.record_job_start().await;
        self.watch_job(&key, &job);
        Self::initialize_job(job.clone());

        Ok(job)
    }

    /// Retrieve the job registered for the given key without creating one.
    pub async fn get_job(&self, key: &JobKey) -> Option<StreamJob> {
        self.inner.jobs.read().await.get(key).cloned()
    }

    /// Execute a seek for the given key, deciding between a soft and a hard seek.
    ///
    /// A hard seek replaces the registered job with a new one in a fresh working
    /// directory, a soft seek leaves the existing job untouched.
    pub async fn seek_job(
        &self,
        key: JobKey,
        target_seconds: f64,
        force_hard: bool,
    ) -> Result<(StreamJob, SeekMode)> {
        self.inner.health.record_seek(target_seconds).await;
        {
            let mut last_seek = self.inner.last_seek_at.lock().await;
            if let Some(previous) = *last_seek {
                if previous.elapsed() < SEEK_STORM_THRESHOLD {
                    debug!(
                        "Seek storm detected for {}, previous seek was {:?} ago",
                        key,
                        previous.elapsed()
                    );
                }
            }
            *last_seek = Some(Instant::now());
        }

        // the mode is decided without holding the registry write lock
        let existing = self.inner.jobs.read().await.get(&key).cloned();
        let segment_duration = self.inner.config.encoding().await.segment_duration;
        let mode = if force_hard {
            SeekMode::Hard
        } else {
            Self::decide_seek_mode(existing.as_ref(), target_seconds, segment_duration).await
        };
        debug!("Seek to {}s for {} decided as {}", target_seconds, key, mode);

        let result = match mode {
            SeekMode::Soft => {
                let job = existing.ok_or_else(|| {
                    Error::InvalidRequest("no job available for a soft seek".to_string())
                })?;
                Ok((job, SeekMode::Soft))
            }
            SeekMode::Hard => self
                .replace_job(key, target_seconds)
                .await
                .map(|job| (job, SeekMode::Hard)),
        };

        if let Err(e) = result.as_ref() {
            self.inner.health.record_seek_failure(&e.to_string()).await;
        }
        result
    }

    /// Stop and unregister the job for the given key.
    pub async fn stop_job(&self, key: &JobKey) {
        let job = self.inner.jobs.write().await.remove(key);
        self.inner.restart_counts.lock().await.remove(key);

        if let Some(job) = job {
            info!("Stopping stream job for {}", key);
            job.stop().await;
        }
    }

    /// Unregister the given job instance and stop it.
    /// The registry entry is only removed when it still holds the same instance.
    pub async fn cleanup_job(&self, key: &JobKey, job: &StreamJob) {
        {
            let mut jobs = self.inner.jobs.write().await;
            let same_instance = jobs
                .get(key)
                .map(|registered| registered.is_same_instance(job))
                .unwrap_or(false);

            if same_instance {
                jobs.remove(key);
            }
        }

        job.stop().await;
    }

    /// Stop all jobs of the given torrent and remove its artifact directories.
    pub async fn purge_torrent(&self, torrent_id: &str) {
        let jobs: Vec<StreamJob> = {
            let mut registry = self.inner.jobs.write().await;
            let keys: Vec<JobKey> = registry
                .keys()
                .filter(|key| key.torrent_id == torrent_id)
                .cloned()
                .collect();

            keys.into_iter().filter_map(|key| registry.remove(&key)).collect()
        };

        info!("Purging {} stream jobs of torrent {}", jobs.len(), torrent_id);
        for job in jobs {
            job.stop().await;
        }
        self.inner
            .restart_counts
            .lock()
            .await
            .retain(|key, _| key.torrent_id != torrent_id);

        Storage::delete_path(self.inner.base_dir.join(torrent_id)).await;
        self.inner.remux.purge(torrent_id).await;
    }

    /// Remove artifact directories which don't belong to a known torrent.
    ///
    /// A subdirectory survives when its name is a valid torrent id which is either
    /// within the given ids or in the currently registered job set.
    pub async fn cleanup_orphan_artifacts(&self, valid_ids: &[String]) {
        let registered: HashSet<String> = self
            .inner
            .jobs
            .read()
            .await
            .keys()
            .map(|key| key.torrent_id.clone())
            .collect();

        let remux_dir = self.inner.remux.directory().to_path_buf();
        for root in [self.inner.base_dir.clone(), remux_dir.clone()] {
            let mut entries = match tokio::fs::read_dir(&root).await {
                Ok(e) => e,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if !path.is_dir() || path == remux_dir {
                    continue;
                }

                let name = entry.file_name().to_string_lossy().to_string();
                let known = valid_ids.contains(&name) || registered.contains(&name);
                if self.inner.torrent_id_pattern.is_match(name.as_str()) && known {
                    continue;
                }

                info!("Removing orphaned artifact directory {:?}", path);
                Storage::delete_path(&path).await;
            }
        }
    }

    /// Resolve the file info of the given torrent file, falling back to the
    /// repository when no live session exists.
    pub async fn resolve_file(
        &self,
        torrent_id: &str,
        file_index: usize,
    ) -> Result<TorrentFileInfo> {
        if let Some(engine) = self.inner.engine.as_ref() {
            match engine.session_state(torrent_id).await {
                Ok(state) => {
                    if let Some(file) = state.file(file_index) {
                        return Ok(file.clone());
                    }
                    return Err(Error::Torrent(torrents::Error::InvalidFileIndex(
                        torrent_id.to_string(),
                        file_index,
                    )));
                }
                Err(e) => trace!("No live session for {}, {}", torrent_id, e),
            }
        }

        let repository = self
            .inner
            .repository
            .as_ref()
            .ok_or(Error::Torrent(torrents::Error::TorrentNotFound(
                torrent_id.to_string(),
            )))?;
        let record = repository.get(torrent_id).await.map_err(Error::Torrent)?;

        record
            .files
            .iter()
            .find(|e| e.index == file_index)
            .cloned()
            .ok_or(Error::Torrent(torrents::Error::InvalidFileIndex(
                torrent_id.to_string(),
                file_index,
            )))
    }

    /// Retrieve the media details of the given file through the codec cache.
    pub async fn media_details(&self, path: &Path) -> media::Result<MediaDetails> {
        self.inner.media_info.details(path).await
    }

    /// Check the remux status for the given key.
    pub async fn check_remux(&self, key: &RemuxKey) -> Option<RemuxStatus> {
        self.inner.remux.check(key).await
    }

    /// Trigger a background remux of the given source file.
    pub async fn trigger_remux(&self, key: &RemuxKey, source: PathBuf) -> RemuxStatus {
        self.inner.remux.trigger(key, source).await
    }

    /// The remux cache of the manager.
    pub fn remux(&self) -> &RemuxCache {
        &self.inner.remux
    }

    /// Retrieve a snapshot of the current encoding settings.
    pub async fn encoding_settings(&self) -> EncodingSettings {
        self.inner.config.encoding().await
    }

    /// Retrieve a snapshot of the current window settings.
    pub async fn window_settings(&self) -> WindowSettings {
        self.inner.config.window().await
    }

    /// Update the encoding settings.
    /// Running jobs keep their snapshotted settings and are not interrupted.
    pub async fn update_encoding_settings(&self, update: EncodingSettingsUpdate) {
        self.inner.config.update_encoding(update).await;
    }

    /// Update the window settings.
    /// Running jobs keep their snapshotted settings and are not interrupted.
    pub async fn update_window_settings(&self, update: WindowSettingsUpdate) {
        self.inner.config.update_window(update).await;
    }

    /// Retrieve the health snapshot of the subsystem.
    pub async fn health(&self) -> HealthSnapshot {
        let active_jobs = self.inner.jobs.read().await.len();
        self.inner.health.snapshot(active_jobs).await
    }

    /// Stop all jobs, flush the caches and release all resources.
    pub async fn shutdown(&self) {
        info!("Shutting down the stream job manager");
        let jobs: Vec<StreamJob> = {
            let mut registry = self.inner.jobs.write().await;
            registry.drain().map(|(_, job)| job).collect()
        };
        for job in jobs {
            job.stop().await;
        }

        self.inner.remux.shutdown().await;
        self.inner.media_info.shutdown().await;
    }

    /// Decide the seek mode for the given target position.
    async fn decide_seek_mode(
        job: Option<&StreamJob>,
        target_seconds: f64,
        segment_duration: u32,
    ) -> SeekMode {
        let job = match job {
            Some(e) => e,
            None => return SeekMode::Hard,
        };
        // a job without a live transcoder cannot serve new positions
        let encoded_us = match job.encoded_us().await {
            Some(e) => e,
            None => return SeekMode::Hard,
        };

        let current = job.seek_seconds().await;
        let encoded = encoded_us as f64 / 1_000_000f64;
        if target_seconds < current {
            // an earlier position would require regenerating the timeline
            return SeekMode::Hard;
        }
        if target_seconds <= encoded {
            return SeekMode::Soft;
        }

        let gap = target_seconds - encoded;
        let restart_cost = ESTIMATED_RESTART_COST.as_secs_f64();
        if gap < restart_cost.min(2.0 * segment_duration as f64) {
            // cheaper to let the encoder catch up than to restart it
            return SeekMode::Soft;
        }

        SeekMode::Hard
    }

    /// Replace the registered job for the given key with a new job transcoding
    /// from the given offset in a fresh working directory.
    async fn replace_job(&self, key: JobKey, seek_seconds: f64) -> Result<StreamJob> {
        let encoding = self.inner.config.encoding().await;
        let workdir = job::seek_workdir(self.inner.job_directory(&key, &encoding).as_path());
        let context = self.job_context(encoding).await;

        let (job, previous) = {
            let mut jobs = self.inner.jobs.write().await;
            let previous = jobs.remove(&key);
            let job = StreamJob::new(key.clone(), workdir, seek_seconds, context);
            jobs.insert(key.clone(), job.clone());

            (job, previous)
        };

        self.inner.health.record_job_start().await;
        self.watch_job(&key, &job);
        Self::initialize_job(job.clone());

        if let Some(previous) = previous {
            let previous_workdir = previous.workdir().await;
            debug!(
                "Replacing stream job for {}, draining {:?}",
                key, previous_workdir
            );
            tokio::spawn(async move {
                previous.stop().await;
            });
            // the old directory is removed only after a drain grace, letting
            // in-flight segment responses finish
            Storage::delete_path_later(previous_workdir, REPLACED_WORKDIR_GRACE);
        }

        Ok(job)
    }

    /// Initialize the working directory of the job and start its playback asynchronously.
    fn initialize_job(job: StreamJob) {
        tokio::spawn(async move {
            let workdir = job.workdir().await;
            if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
                warn!("Failed to initialize job directory {:?}, {}", workdir, e);
            }
            job.start_playback();
        });
    }

    /// Follow the events of the given job to maintain the health counters and
    /// drive the auto-restart watchdog.
    fn watch_job(&self, key: &JobKey, job: &StreamJob) {
        let manager = self.clone();
        let key = key.clone();
        let job = job.clone();
        let mut receiver = fx_callback::Callback::subscribe(&job);

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                match &*event {
                    StreamJobEvent::PlaylistReady(_) => {
                        manager.inner.health.record_playlist_ready().await;
                    }
                    StreamJobEvent::StateChanged(StreamJobState::Error) => {
                        manager.handle_job_error(&key, &job).await;
                        break;
                    }
                    StreamJobEvent::StateChanged(StreamJobState::Completed) => {
                        manager.inner.restart_counts.lock().await.remove(&key);
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    async fn handle_job_error(&self, key: &JobKey, job: &StreamJob) {
        let error = job.error().await;
        let message = error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        let seek_related = job.seek_seconds().await > 0.0;
        self.inner
            .health
            .record_job_failure(message.as_str(), seek_related)
            .await;

        let reason = match error {
            Some(Error::TranscoderExit(_)) => Some(AUTO_RESTART_REASON_EXIT),
            Some(Error::Stalled(_)) => Some(AUTO_RESTART_REASON_STALL),
            _ => None,
        };
        let reason = match reason {
            Some(e) => e,
            None => return,
        };

        {
            let mut counts = self.inner.restart_counts.lock().await;
            let count = counts.entry(key.clone()).or_insert(0);
            if *count >= MAX_AUTO_RESTARTS {
                debug!("Auto-restart budget exhausted for {}", key);
                return;
            }
            *count += 1;
        }

        info!("Auto-restarting stream job for {} ({})", key, reason);
        self.inner.health.record_auto_restart(reason).await;
        let seek_seconds = job.seek_seconds().await;
        self.cleanup_job(key, job).await;
        if let Err(e) = self.replace_job(key.clone(), seek_seconds).await {
            warn!("Auto-restart for {} failed, {}", key, e);
        }
    }

    async fn job_context(&self, encoding: EncodingSettings) -> StreamJobContext {
        StreamJobContext {
            stream: self.inner.stream.clone(),
            engine: self.inner.engine.clone(),
            media_info: self.inner.media_info.clone(),
            remux: self.inner.remux.clone(),
            transcoder_binary: self.inner.transcoder_binary.clone(),
            encoding,
            window: self.inner.config.window().await,
        }
    }

    /// Locate a completed playlist within the given directory, if any.
    /// A playlist only qualifies when it carries the end-list marker and at
    /// least one segment entry.
    async fn completed_playlist(workdir: &Path) -> Option<PathBuf> {
        let master = workdir.join(MASTER_PLAYLIST_NAME);
        if master.exists() {
            // the end-list marker of a multi-variant run lives in the variant playlists
            let variant = workdir.join("v0").join(MEDIA_PLAYLIST_NAME);
            if has_end_list(variant.as_path()).await && Self::has_segments(variant.as_path()).await
            {
                return Some(master);
            }
        }

        let media = workdir.join(MEDIA_PLAYLIST_NAME);
        if has_end_list(media.as_path()).await && Self::has_segments(media.as_path()).await {
            return Some(media);
        }

        None
    }

    async fn has_segments(playlist: &Path) -> bool {
        parse_segments_file(playlist)
            .await
            .map(|e| !e.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug)]
struct InnerStreamJobManager {
    base_dir: PathBuf,
    transcoder_binary: String,
    stream: Arc<dyn MediaStreamUseCase>,
    engine: Option<Arc<dyn TorrentEngine>>,
    repository: Option<Arc<dyn TorrentRepository>>,
    config: StreamingConfig,
    media_info: MediaInfoCache,
    remux: RemuxCache,
    jobs: RwLock<HashMap<JobKey, StreamJob>>,
    health: HealthTracker,
    restart_counts: Mutex<HashMap<JobKey, u32>>,
    last_seek_at: Mutex<Option<Instant>>,
    torrent_id_pattern: Regex,
}

impl InnerStreamJobManager {
    fn job_directory(&self, key: &JobKey, settings: &EncodingSettings) -> PathBuf {
        self.base_dir
            .join(key.torrent_id.as_str())
            .join(key.file_index.to_string())
            .join(format!(
                "a{}-s{}-p{}",
                key.audio_track,
                key.subtitle_track,
                StreamJobManager::compute_profile_hash(settings)
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerflux_core::core::media::MockMediaProbe;
    use peerflux_core::core::stream::{MockMediaStreamUseCase, MockRawMediaReader, RawStream};
    use peerflux_core::core::torrents::TorrentRecord;
    use peerflux_core::{assert_timeout, assert_timeout_eq, init_logger};
    use peerflux_core::core::torrents::MockTorrentRepository;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const TORRENT_ID: &str = "0123456789abcdef0123456789abcdef01234567";
    const COMPLETED_PLAYLIST: &str =
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:4.0,\nseg-00000.ts\n#EXT-X-ENDLIST\n";

    fn job_key() -> JobKey {
        JobKey {
            torrent_id: TORRENT_ID.to_string(),
            file_index: 0,
            audio_track: 0,
            subtitle_track: -1,
        }
    }

    fn write_transcoder(temp_dir: &TempDir, body: &str) -> PathBuf {
        let path = temp_dir.path().join("ffmpeg");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn media_stream(file: TorrentFileInfo) -> Arc<MockMediaStreamUseCase> {
        let mut stream = MockMediaStreamUseCase::new();
        stream.expect_execute_raw().returning(move |_, _| {
            let mut reader = MockRawMediaReader::new();
            reader.expect_set_responsive().return_const(());
            reader.expect_close().return_const(());
            reader.expect_read().returning(|_| Ok(0));
            Ok(RawStream {
                reader: Box::new(reader),
                file: file.clone(),
            })
        });

        Arc::new(stream)
    }

    fn complete_file(temp_dir: &TempDir, filename: &str) -> TorrentFileInfo {
        let path = temp_dir.path().join(filename);
        fs::write(&path, "lorem ipsum dolor").unwrap();

        TorrentFileInfo {
            index: 0,
            path,
            length: 17,
            bytes_completed: 17,
        }
    }

    async fn manager(temp_dir: &TempDir, transcoder_body: &str) -> StreamJobManager {
        let transcoder = write_transcoder(temp_dir, transcoder_body);
        let file = complete_file(temp_dir, "movie.mp4");
        let mut probe = MockMediaProbe::new();
        probe
            .expect_probe()
            .returning(|_| Ok(MediaDetails::default()));

        StreamJobManager::builder()
            .base_dir(temp_dir.path().join("streams"))
            .transcoder_binary(transcoder.to_string_lossy())
            .probe(Arc::new(probe))
            .stream(media_stream(file))
            .build()
            .await
    }

    /// A transcoder which writes a progressing playlist and keeps running.
    fn running_transcoder_body() -> &'static str {
        "printf 'out_time_us=2000000\\nprogress=continue\\n'\nprintf 'data' > seg-00000.ts\nprintf '#EXTM3U\\n#EXTINF:4.0,\\nseg-00000.ts\\n' > index.m3u8\nsleep 30"
    }

    #[test]
    fn test_compute_profile_hash() {
        init_logger!();
        let settings = EncodingSettings::default();

        let result = StreamJobManager::compute_profile_hash(&settings);
        assert_eq!(8, result.len());
        assert_eq!(
            result,
            StreamJobManager::compute_profile_hash(&EncodingSettings::default()),
            "expected the hash to be deterministic"
        );

        for update in [
            EncodingSettings {
                preset: "slow".to_string(),
                ..Default::default()
            },
            EncodingSettings {
                crf: 18,
                ..Default::default()
            },
            EncodingSettings {
                audio_bitrate: "192k".to_string(),
                ..Default::default()
            },
            EncodingSettings {
                segment_duration: 6,
                ..Default::default()
            },
        ] {
            assert_ne!(
                result,
                StreamJobManager::compute_profile_hash(&update),
                "expected the hash to change for {:?}",
                update
            );
        }
    }

    #[tokio::test]
    async fn test_job_directory() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, "true").await;
        let settings = EncodingSettings::default();
        let hash = StreamJobManager::compute_profile_hash(&settings);
        let mut key = job_key();
        key.audio_track = 1;
        key.subtitle_track = 2;

        let result = manager.job_directory(&key, &settings);

        assert_eq!(
            temp_dir
                .path()
                .join("streams")
                .join(TORRENT_ID)
                .join("0")
                .join(format!("a1-s2-p{}", hash)),
            result
        );
    }

    #[tokio::test]
    async fn test_ensure_job_returns_single_instance() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, running_transcoder_body()).await;

        let first = manager.ensure_job(job_key()).await.unwrap();
        let second = manager.ensure_job(job_key()).await.unwrap();

        assert!(
            first.is_same_instance(&second),
            "expected the same job instance to be served"
        );
        assert_eq!(1, manager.health().await.active_jobs);
        assert_eq!(1, manager.health().await.total_job_starts);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_ensure_job_adopts_completed_playlist() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, "true").await;
        let settings = manager.encoding_settings().await;
        let workdir = manager.job_directory(&job_key(), &settings);
        fs::create_dir_all(&workdir).unwrap();
        fs::write(workdir.join(MEDIA_PLAYLIST_NAME), COMPLETED_PLAYLIST).unwrap();

        let job = manager.ensure_job(job_key()).await.unwrap();

        assert_eq!(StreamJobState::Completed, job.state().await);
        assert_eq!(
            Some(workdir.join(MEDIA_PLAYLIST_NAME)),
            job.playlist_path().await
        );
    }

    #[tokio::test]
    async fn test_seek_job_soft_and_hard() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, running_transcoder_body()).await;

        // create a job transcoding from 10s with an encoded progress of 2s
        let (job, mode) = manager.seek_job(job_key(), 10.0, true).await.unwrap();
        assert_eq!(SeekMode::Hard, mode);
        job.wait_ready().await.unwrap();
        assert_timeout_eq!(
            Duration::from_secs(2),
            12_000_000i64,
            job.encoded_us().await.unwrap_or(0)
        );

        // the target is already within the produced timeline
        let (soft_job, mode) = manager.seek_job(job_key(), 12.0, false).await.unwrap();
        assert_eq!(SeekMode::Soft, mode);
        assert!(soft_job.is_same_instance(&job));

        // an earlier target requires a new timeline
        let (_, mode) = manager.seek_job(job_key(), 5.0, false).await.unwrap();
        assert_eq!(SeekMode::Hard, mode);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_seek_job_hard_for_distant_target() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, running_transcoder_body()).await;
        let (job, _) = manager.seek_job(job_key(), 10.0, true).await.unwrap();
        job.wait_ready().await.unwrap();
        let initial_workdir = job.workdir().await;

        let (new_job, mode) = manager.seek_job(job_key(), 100.0, false).await.unwrap();

        assert_eq!(SeekMode::Hard, mode);
        assert!(
            !new_job.is_same_instance(&job),
            "expected the job to have been replaced"
        );
        assert_ne!(
            initial_workdir,
            new_job.workdir().await,
            "expected a fresh working directory"
        );

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_seek_job_without_job_is_hard() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, running_transcoder_body()).await;

        let (_, mode) = manager.seek_job(job_key(), 42.0, false).await.unwrap();

        assert_eq!(SeekMode::Hard, mode);
        assert_eq!(1, manager.health().await.total_seek_requests);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_job_instance_matched() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, running_transcoder_body()).await;
        let job = manager.ensure_job(job_key()).await.unwrap();

        // a replacement registers a new instance under the same key
        let (replacement, _) = manager.seek_job(job_key(), 100.0, true).await.unwrap();

        // cleaning up the old instance must not unregister the replacement
        manager.cleanup_job(&job_key(), &job).await;
        let current = manager.ensure_job(job_key()).await.unwrap();
        assert!(
            current.is_same_instance(&replacement),
            "expected the replacement to remain registered"
        );

        manager.cleanup_job(&job_key(), &replacement).await;
        assert_eq!(0, manager.health().await.active_jobs);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_purge_torrent() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, running_transcoder_body()).await;
        let job = manager.ensure_job(job_key()).await.unwrap();
        job.wait_ready().await.unwrap();
        let workdir = job.workdir().await;

        manager.purge_torrent(TORRENT_ID).await;

        assert_eq!(0, manager.health().await.active_jobs);
        assert!(
            !workdir.exists(),
            "expected the torrent artifacts to have been removed"
        );
    }

    #[tokio::test]
    async fn test_cleanup_orphan_artifacts() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, "true").await;
        let base = manager.base_dir().to_path_buf();
        let valid = base.join(TORRENT_ID);
        let invalid_name = base.join("lorem-ipsum");
        let unknown = base.join("ffffffffffffffffffffffffffffffffffffffff");
        for dir in [&valid, &invalid_name, &unknown] {
            fs::create_dir_all(dir).unwrap();
        }

        manager
            .cleanup_orphan_artifacts(&[TORRENT_ID.to_string()])
            .await;

        assert!(valid.exists(), "expected the valid torrent dir to survive");
        assert!(!invalid_name.exists(), "expected the invalid dir to be removed");
        assert!(!unknown.exists(), "expected the unknown dir to be removed");
    }

    #[tokio::test]
    async fn test_resolve_file_repository_fallback() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let transcoder = write_transcoder(&temp_dir, "true");
        let file = complete_file(&temp_dir, "movie.mp4");
        let record_file = file.clone();
        let mut probe = MockMediaProbe::new();
        probe
            .expect_probe()
            .returning(|_| Ok(MediaDetails::default()));
        let mut repository = MockTorrentRepository::new();
        repository.expect_get().returning(move |id| {
            Ok(TorrentRecord {
                id: id.to_string(),
                files: vec![record_file.clone()],
            })
        });
        let manager = StreamJobManager::builder()
            .base_dir(temp_dir.path().join("streams"))
            .transcoder_binary(transcoder.to_string_lossy())
            .probe(Arc::new(probe))
            .stream(media_stream(file.clone()))
            .repository(Arc::new(repository))
            .build()
            .await;

        let result = manager.resolve_file(TORRENT_ID, 0).await.unwrap();
        assert_eq!(file, result);

        let result = manager.resolve_file(TORRENT_ID, 9).await;
        assert_eq!(
            Err(Error::Torrent(torrents::Error::InvalidFileIndex(
                TORRENT_ID.to_string(),
                9
            ))),
            result
        );
    }

    #[tokio::test]
    async fn test_auto_restart_on_transcoder_exit() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        // fails fast after producing a playlist without an end-list marker
        let manager = manager(
            &temp_dir,
            "printf '#EXTM3U\\n#EXTINF:4.0,\\nseg-00000.ts\\n' > index.m3u8\nexit 1",
        )
        .await;

        let job = manager.ensure_job(job_key()).await.unwrap();
        job.wait_ready().await.unwrap();

        assert_timeout!(
            Duration::from_secs(15),
            manager.health().await.total_auto_restarts >= 1,
            "expected an automatic restart to have been recorded"
        );
        let health = manager.health().await;
        assert_eq!(
            Some(AUTO_RESTART_REASON_EXIT.to_string()),
            health.last_auto_restart_reason
        );
        assert!(health.total_job_failures >= 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_settings_roundtrip() {
        init_logger!();
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(&temp_dir, "true").await;

        manager
            .update_encoding_settings(EncodingSettingsUpdate {
                preset: Some("slow".to_string()),
                ..Default::default()
            })
            .await;

        let result = manager.encoding_settings().await;
        assert_eq!("slow", result.preset.as_str());
        assert_eq!(EncodingSettings::default().crf, result.crf);

        manager
            .update_window_settings(WindowSettingsUpdate {
                preload_bytes: Some(1024),
                ..Default::default()
            })
            .await;

        let result = manager.window_settings().await;
        assert_eq!(1024, result.preload_bytes);
        assert_eq!(WindowSettings::default().after_bytes, result.after_bytes);
    }
}
