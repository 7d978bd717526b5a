use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use peerflux_core::core::torrents::{ByteRange, PiecePriority, TorrentEngine};
use tokio::sync::Mutex;

/// The size of the high priority band at the start of the playback window.
const HIGH_BAND_BYTES: u64 = 4 * 1024 * 1024;
/// The size of the next priority band following the high band.
const NEXT_BAND_BYTES: u64 = 8 * 1024 * 1024;
/// The size of the expanded high priority band used during stall recovery.
const ENHANCED_HIGH_BYTES: u64 = 12 * 1024 * 1024;
/// The size of the guard zones protecting container headers and trailer indices.
const GUARD_BYTES: u64 = 8 * 1024 * 1024;
/// The timeout applied to every engine priority call.
const ENGINE_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// The priority manager translates a moving byte window over a file into tiered
/// per-piece download priorities on the torrent engine.
///
/// Priority updates are advisory, engine failures never propagate to the caller.
#[derive(Debug)]
pub struct PriorityManager {
    engine: Option<Arc<dyn TorrentEngine>>,
    torrent_id: String,
    file_index: usize,
    file_length: u64,
    state: Mutex<PriorityState>,
}

#[derive(Debug, Default)]
struct PriorityState {
    /// The previously applied window bounds
    previous: Option<(u64, u64)>,
    guards_applied: bool,
}

impl PriorityManager {
    pub fn new(
        engine: Option<Arc<dyn TorrentEngine>>,
        torrent_id: impl Into<String>,
        file_index: usize,
        file_length: u64,
    ) -> Self {
        Self {
            engine,
            torrent_id: torrent_id.into(),
            file_index,
            file_length,
            state: Mutex::new(PriorityState::default()),
        }
    }

    /// Apply the given playback window to the engine as tiered piece priorities.
    ///
    /// Any part of the previous window which no longer intersects the new window is
    /// deprioritized, skipping the guard zones.
    pub async fn apply(&self, window_start: u64, window_end: u64) {
        if !self.is_active() {
            return;
        }

        let start = window_start.min(self.file_length);
        let end = window_end.min(self.file_length);
        if start >= end {
            return;
        }

        let mut state = self.state.lock().await;
        if !state.guards_applied && self.guards_active() {
            self.apply_guards().await;
            state.guards_applied = true;
        }

        trace!(
            "Applying priority window [{}, {}) to torrent {}",
            start,
            end,
            self.torrent_id
        );
        let high_end = (start + HIGH_BAND_BYTES).min(end);
        let next_end = (high_end + NEXT_BAND_BYTES).min(end);

        self.set(start..high_end, PiecePriority::High).await;
        self.set(high_end..next_end, PiecePriority::Next).await;
        self.set(next_end..end, PiecePriority::Readahead).await;

        if let Some((previous_start, previous_end)) = state.previous {
            self.deprioritize_range(previous_start..previous_start.max(start).min(previous_end))
                .await;
            self.deprioritize_range(previous_end.min(previous_start.max(end))..previous_end)
                .await;
        }

        state.previous = Some((start, end));
    }

    /// Expand the high priority band at the given position, used during stall recovery.
    pub async fn enhance_high(&self, window_start: u64) {
        if !self.is_active() {
            return;
        }

        let start = window_start.min(self.file_length);
        let end = (start + ENHANCED_HIGH_BYTES).min(self.file_length);

        debug!(
            "Enhancing high priority band [{}, {}) of torrent {}",
            start, end, self.torrent_id
        );
        self.set(start..end, PiecePriority::High).await;
    }

    /// Boost the download priority of the file tail which holds the container indices.
    pub async fn boost_tail(&self, bytes: u64) {
        if !self.is_active() {
            return;
        }

        let start = self.file_length.saturating_sub(bytes);
        debug!(
            "Boosting tail [{}, {}) of torrent {}",
            start, self.file_length, self.torrent_id
        );
        self.set(start..self.file_length, PiecePriority::High).await;
    }

    /// Release all interest in the file, used on job teardown.
    pub async fn deprioritize(&self) {
        if !self.is_active() {
            return;
        }

        debug!(
            "Deprioritizing file {} of torrent {}",
            self.file_index, self.torrent_id
        );
        self.set(0..self.file_length, PiecePriority::None).await;
        self.state.lock().await.previous = None;
    }

    fn is_active(&self) -> bool {
        self.engine.is_some() && self.file_length > 0
    }

    fn guards_active(&self) -> bool {
        self.file_length > 2 * GUARD_BYTES
    }

    /// Apply the always-on guard zones protecting the container header and trailer.
    async fn apply_guards(&self) {
        trace!(
            "Applying priority guard zones to torrent {}",
            self.torrent_id
        );
        self.set(0..GUARD_BYTES, PiecePriority::Normal).await;
        self.set(
            self.file_length - GUARD_BYTES..self.file_length,
            PiecePriority::Normal,
        )
        .await;
    }

    /// Deprioritize the given abandoned range, skipping the guard zones.
    async fn deprioritize_range(&self, range: ByteRange) {
        let mut range = range;
        if self.guards_active() {
            range.start = range.start.max(GUARD_BYTES);
            range.end = range.end.min(self.file_length - GUARD_BYTES);
        }

        self.set(range, PiecePriority::None).await;
    }

    /// Write the given priority to the engine, swallowing any failure.
    async fn set(&self, range: ByteRange, priority: PiecePriority) {
        let engine = match self.engine.as_ref() {
            Some(e) => e,
            None => return,
        };
        if range.start >= range.end {
            return;
        }

        let result = tokio::time::timeout(
            ENGINE_CALL_TIMEOUT,
            engine.set_piece_priority(
                self.torrent_id.as_str(),
                self.file_index,
                range.clone(),
                priority,
            ),
        )
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(
                "Priority update {:?} for range {:?} failed, {}",
                priority, range, e
            ),
            Err(_) => debug!(
                "Priority update {:?} for range {:?} timed out",
                priority, range
            ),
        }
    }
}
