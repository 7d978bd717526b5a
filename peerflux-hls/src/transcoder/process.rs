use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::transcoder::{Error, Result};

/// The progress key emitted by the transcoder on its progress stream.
const PROGRESS_TIME_KEY: &str = "out_time_us=";
/// The maximum number of captured stderr bytes, older output is dropped.
const STDERR_TAIL_LIMIT: usize = 16 * 1024;

/// The byte source piped into the transcoder's standard input.
pub type TranscoderStdin = Box<dyn AsyncRead + Send + Unpin>;

/// The exit outcome of a transcoder process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessExit {
    /// Indicates if the process exited with a zero status code
    pub success: bool,
    /// The exit code of the process, if any
    pub code: Option<i32>,
    /// Indicates if the process ended because it was stopped
    pub cancelled: bool,
}

/// A single supervised transcoder invocation.
///
/// The supervisor parses the progress stream for the encoded time, captures the
/// stderr tail, and publishes the exit outcome. It never interprets the exit
/// code itself, that is up to its consumer.
#[derive(Clone)]
pub struct TranscoderProcess {
    inner: Arc<InnerTranscoderProcess>,
}

impl TranscoderProcess {
    pub fn new(
        binary: impl Into<String>,
        args: Vec<String>,
        workdir: impl Into<PathBuf>,
        stdin: Option<TranscoderStdin>,
    ) -> Self {
        Self {
            inner: Arc::new(InnerTranscoderProcess {
                binary: binary.into(),
                args,
                workdir: workdir.into(),
                stdin_source: Mutex::new(stdin),
                progress_us: AtomicI64::new(0),
                stderr_tail: Mutex::new(String::new()),
                exit: Mutex::new(None),
                started: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                done_token: CancellationToken::new(),
                cancellation_token: CancellationToken::new(),
            }),
        }
    }

    /// Start the transcoder process.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let stdin_source = self.inner.stdin_source.lock().await.take();
        let mut command = Command::new(self.inner.binary.as_str());
        command
            .args(self.inner.args.as_slice())
            .current_dir(self.inner.workdir.as_path())
            .stdin(if stdin_source.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(
            "Starting transcoder {} {}",
            self.inner.binary,
            self.inner.args.join(" ")
        );
        let mut child = command.spawn().map_err(|e| {
            self.inner.done_token.cancel();
            Error::Io(e.to_string())
        })?;
        debug!("Transcoder process started in {:?}", self.inner.workdir);

        if let Some(stdout) = child.stdout.take() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.parse_progress(stdout).await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.capture_stderr(stderr).await;
            });
        }
        if let Some(mut source) = stdin_source {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(e) = tokio::io::copy(&mut source, &mut stdin).await {
                        trace!("Transcoder stdin pump ended, {}", e);
                    }
                });
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.monitor(child).await;
        });

        Ok(())
    }

    /// Stop the transcoder process.
    /// This operation is idempotent.
    pub fn stop(&self) {
        self.inner.cancellation_token.cancel();
    }

    /// Wait for the process to exit, returning its exit outcome.
    /// It returns [None] when the process was never started.
    pub async fn wait(&self) -> Option<ProcessExit> {
        self.inner.done_token.cancelled().await;
        self.inner.exit.lock().await.clone()
    }

    /// The future which completes when the process has exited.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.done_token.clone().cancelled_owned()
    }

    /// Verify if the process has exited.
    pub fn is_done(&self) -> bool {
        self.inner.done_token.is_cancelled()
    }

    /// The latest encoded time reported by the process in microseconds.
    pub fn progress_us(&self) -> i64 {
        self.inner.progress_us.load(Ordering::Relaxed)
    }

    /// The latest encoded time reported by the process in seconds.
    pub fn progress(&self) -> f64 {
        self.progress_us() as f64 / 1_000_000f64
    }

    /// The captured stderr tail of the process.
    pub async fn stderr(&self) -> String {
        self.inner.stderr_tail.lock().await.trim().to_string()
    }
}

impl Debug for TranscoderProcess {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscoderProcess")
            .field("binary", &self.inner.binary)
            .field("workdir", &self.inner.workdir)
            .field("started", &self.inner.started)
            .field("done", &self.inner.done_token.is_cancelled())
            .finish()
    }
}

struct InnerTranscoderProcess {
    binary: String,
    args: Vec<String>,
    workdir: PathBuf,
    stdin_source: Mutex<Option<TranscoderStdin>>,
    progress_us: AtomicI64,
    stderr_tail: Mutex<String>,
    exit: Mutex<Option<ProcessExit>>,
    started: AtomicBool,
    cancelled: AtomicBool,
    done_token: CancellationToken,
    cancellation_token: CancellationToken,
}

impl InnerTranscoderProcess {
    /// Supervise the child process until it exits or is stopped.
    async fn monitor(&self, mut child: Child) {
        let status = select! {
            status = child.wait() => Some(status),
            _ = self.cancellation_token.cancelled() => None,
        };
        let status = match status {
            Some(status) => status,
            None => {
                debug!("Stopping transcoder process");
                self.cancelled.store(true, Ordering::SeqCst);
                if let Err(e) = child.start_kill() {
                    trace!("Transcoder process kill failed, {}", e);
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => ProcessExit {
                success: status.success(),
                code: status.code(),
                cancelled: self.cancelled.load(Ordering::SeqCst),
            },
            Err(e) => {
                warn!("Transcoder process wait failed, {}", e);
                ProcessExit {
                    success: false,
                    code: None,
                    cancelled: self.cancelled.load(Ordering::SeqCst),
                }
            }
        };

        debug!("Transcoder process exited with {:?}", exit);
        *self.exit.lock().await = Some(exit);
        self.done_token.cancel();
    }

    /// Parse the progress stream line-by-line for the encoded time.
    async fn parse_progress(&self, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(value) = line.strip_prefix(PROGRESS_TIME_KEY) {
                if let Ok(progress) = value.trim().parse::<i64>() {
                    self.progress_us.store(progress, Ordering::Relaxed);
                }
            }
        }
    }

    /// Capture the stderr of the process into a bounded tail buffer.
    async fn capture_stderr(&self, mut stderr: ChildStderr) {
        let mut chunk = [0u8; 4096];

        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let mut tail = self.stderr_tail.lock().await;
                    tail.push_str(String::from_utf8_lossy(&chunk[..read]).as_ref());
                    if tail.len() > STDERR_TAIL_LIMIT {
                        let excess = tail.len() - STDERR_TAIL_LIMIT;
                        tail.drain(..excess);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerflux_core::init_logger;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_progress_and_stderr() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let process = TranscoderProcess::new(
            "sh",
            vec![
                "-c".to_string(),
                "printf 'frame=10\\nout_time_us=1500000\\nprogress=continue\\n'; printf 'lorem stderr' 1>&2"
                    .to_string(),
            ],
            temp_dir.path(),
            None,
        );

        process.start().await.unwrap();
        let result = process.wait().await.unwrap();

        assert_eq!(true, result.success);
        assert_eq!(Some(0), result.code);
        assert_eq!(false, result.cancelled);
        peerflux_core::assert_timeout_eq!(
            Duration::from_millis(500),
            1_500_000i64,
            process.progress_us()
        );
        assert_eq!(1.5, process.progress());
        peerflux_core::assert_timeout_eq!(
            Duration::from_millis(500),
            "lorem stderr".to_string(),
            process.stderr().await
        );
    }

    #[tokio::test]
    async fn test_stop() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let process = TranscoderProcess::new(
            "sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
            temp_dir.path(),
            None,
        );

        process.start().await.unwrap();
        assert_eq!(false, process.is_done());

        process.stop();
        process.stop();
        let result = process.wait().await.unwrap();

        assert_eq!(true, result.cancelled);
        assert_eq!(false, result.success);
        assert_eq!(true, process.is_done());
    }

    #[tokio::test]
    async fn test_exit_code() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let process = TranscoderProcess::new(
            "sh",
            vec!["-c".to_string(), "exit 3".to_string()],
            temp_dir.path(),
            None,
        );

        process.start().await.unwrap();
        let result = process.wait().await.unwrap();

        assert_eq!(false, result.success);
        assert_eq!(Some(3), result.code);
        assert_eq!(false, result.cancelled);
    }

    #[tokio::test]
    async fn test_stdin_pump() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let stdin: TranscoderStdin = Box::new(Cursor::new(b"lorem ipsum".to_vec()));
        let process = TranscoderProcess::new(
            "sh",
            vec!["-c".to_string(), "cat > stdin.txt".to_string()],
            temp_dir.path(),
            Some(stdin),
        );

        process.start().await.unwrap();
        let result = process.wait().await.unwrap();

        assert_eq!(true, result.success);
        let content = std::fs::read_to_string(temp_dir.path().join("stdin.txt")).unwrap();
        assert_eq!("lorem ipsum", content);
    }

    #[tokio::test]
    async fn test_start_twice() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let process = TranscoderProcess::new(
            "sh",
            vec!["-c".to_string(), "true".to_string()],
            temp_dir.path(),
            None,
        );

        process.start().await.unwrap();
        let result = process.start().await;

        assert_eq!(Err(Error::AlreadyStarted), result);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let process = TranscoderProcess::new(
            "peerflux-nonexistent-binary",
            vec![],
            temp_dir.path(),
            None,
        );

        let result = process.start().await;

        assert!(result.is_err(), "expected the spawn to fail");
        assert_eq!(true, process.is_done());
        assert_eq!(None, process.wait().await);
    }

    #[tokio::test]
    async fn test_done_future() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let process = TranscoderProcess::new(
            "sh",
            vec!["-c".to_string(), "true".to_string()],
            temp_dir.path(),
            None,
        );

        process.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), process.done())
            .await
            .expect("expected the done future to complete");

        assert_eq!(true, process.is_done());
    }
}
