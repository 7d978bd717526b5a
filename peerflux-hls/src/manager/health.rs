use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// The aggregated health snapshot of the streaming subsystem, served by the
/// health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub active_jobs: usize,
    pub total_job_starts: u64,
    pub total_job_failures: u64,
    pub total_seek_requests: u64,
    pub total_seek_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_job_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_playlist_ready: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_job_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_job_error_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seek_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seek_target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seek_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seek_error_at: Option<DateTime<Utc>>,
    pub total_auto_restarts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_auto_restart_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_auto_restart_reason: Option<String>,
}

/// The tracker which accumulates the health counters and last-event timestamps.
#[derive(Debug, Default)]
pub struct HealthTracker {
    state: Mutex<HealthSnapshot>,
}

impl HealthTracker {
    pub async fn record_job_start(&self) {
        let mut state = self.state.lock().await;
        state.total_job_starts += 1;
        state.last_job_started_at = Some(Utc::now());
    }

    /// Record a job failure.
    /// Failures of jobs with a non-zero seek offset also count as seek failures.
    pub async fn record_job_failure(&self, error: &str, seek_related: bool) {
        let mut state = self.state.lock().await;
        state.total_job_failures += 1;
        state.last_job_error = Some(error.to_string());
        state.last_job_error_at = Some(Utc::now());

        if seek_related {
            state.total_seek_failures += 1;
            state.last_seek_error = Some(error.to_string());
            state.last_seek_error_at = Some(Utc::now());
        }
    }

    pub async fn record_playlist_ready(&self) {
        self.state.lock().await.last_playlist_ready = Some(Utc::now());
    }

    pub async fn record_seek(&self, target: f64) {
        let mut state = self.state.lock().await;
        state.total_seek_requests += 1;
        state.last_seek_at = Some(Utc::now());
        state.last_seek_target = Some(target);
    }

    pub async fn record_seek_failure(&self, error: &str) {
        let mut state = self.state.lock().await;
        state.total_seek_failures += 1;
        state.last_seek_error = Some(error.to_string());
        state.last_seek_error_at = Some(Utc::now());
    }

    pub async fn record_auto_restart(&self, reason: &str) {
        let mut state = self.state.lock().await;
        state.total_auto_restarts += 1;
        state.last_auto_restart_at = Some(Utc::now());
        state.last_auto_restart_reason = Some(reason.to_string());
    }

    /// Take a snapshot of the current counters with the given active job count.
    pub async fn snapshot(&self, active_jobs: usize) -> HealthSnapshot {
        let mut snapshot = self.state.lock().await.clone();
        snapshot.active_jobs = active_jobs;

        snapshot
    }
}
