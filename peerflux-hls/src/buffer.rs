use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use peerflux_core::core::stream::RawMediaReader;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// The chunk size used by the filler while reading from the source.
const FILL_CHUNK_SIZE: usize = 64 * 1024;
/// The maximum duration the source is allowed to repeatedly report EOF before
/// the buffer treats the source as terminally stalled.
const SOURCE_STALL_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(200);

/// The buffer package specific results.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors which can occur while prebuffering.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("prebuffering timed out after {0:?}")]
    PrebufferTimeout(Duration),
    #[error("the buffer has been closed")]
    Closed,
}

/// An in-memory ring buffer which bridges an eventually-consistent torrent reader
/// to the byte stream consumed by the transcoder.
///
/// A single background filler reads the source in fixed chunks. Torrent readers
/// routinely report EOF while a piece has not yet arrived, so EOF is retried with
/// an exponential backoff until [SOURCE_STALL_TIMEOUT] elapses without progress.
/// Bytes are delivered to the consumer in the exact order produced by the source.
#[derive(Debug, Clone)]
pub struct RamBuffer {
    inner: Arc<InnerRamBuffer>,
}

impl RamBuffer {
    /// Create a new buffer over the given source and start its filler task.
    pub fn new(source: Box<dyn RawMediaReader>, capacity: usize) -> Self {
        let inner = Arc::new(InnerRamBuffer {
            state: Mutex::new(BufferState {
                ring: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
                closed: false,
                source_done: false,
                source_error: None,
            }),
            data_available: Notify::new(),
            space_available: Notify::new(),
            cancellation_token: CancellationToken::new(),
        });

        let filler = inner.clone();
        tokio::spawn(async move {
            filler.fill(source).await;
        });

        Self { inner }
    }

    /// Block until at least `target` bytes are buffered, the source has ended,
    /// or the timeout elapses.
    pub async fn prebuffer(&self, target: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.data_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock().await;
                if state.closed {
                    return Err(Error::Closed);
                }
                if state.len >= target || state.source_done {
                    return Ok(());
                }
            }

            select! {
                _ = self.inner.cancellation_token.cancelled() => return Err(Error::Closed),
                _ = tokio::time::sleep_until(deadline) => return Err(Error::PrebufferTimeout(timeout)),
                _ = &mut notified => {}
            }
        }
    }

    /// Read buffered bytes into the given buffer, blocking until data is available.
    ///
    /// It returns [io::ErrorKind::BrokenPipe] once the buffer has been closed, the
    /// sticky source error after the buffer has drained, or `Ok(0)` for a clean
    /// source end after drain.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.inner.data_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "the buffer has been closed",
                    ));
                }
                if state.len > 0 {
                    let read = state.pop(buf);
                    self.inner.space_available.notify_waiters();
                    return Ok(read);
                }
                if state.source_done {
                    return match state.source_error.as_ref() {
                        Some(e) => Err(io::Error::other(e.clone())),
                        None => Ok(0),
                    };
                }
            }

            notified.await;
        }
    }

    /// The instantaneous number of buffered bytes.
    pub async fn buffered(&self) -> usize {
        self.inner.state.lock().await.len
    }

    /// Close the buffer, waking all waiters and releasing the source.
    /// This operation is idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }

        debug!("Closing ram buffer");
        self.inner.cancellation_token.cancel();
        self.inner.data_available.notify_waiters();
        self.inner.space_available.notify_waiters();
    }

    /// Create an [AsyncRead] adapter over this buffer, used as the transcoder stdin.
    pub fn reader(&self) -> impl AsyncRead + Send + Unpin + 'static {
        let buffer = self.clone();
        let stream = futures::stream::unfold(buffer, |buffer| async move {
            let mut chunk = vec![0u8; FILL_CHUNK_SIZE];
            match buffer.read(&mut chunk).await {
                Ok(0) => None,
                Ok(read) => {
                    chunk.truncate(read);
                    Some((Ok(Bytes::from(chunk)), buffer))
                }
                Err(e) => Some((Err(e), buffer)),
            }
        });

        StreamReader::new(Box::pin(stream))
    }
}

#[derive(Debug)]
struct InnerRamBuffer {
    state: Mutex<BufferState>,
    data_available: Notify,
    space_available: Notify,
    cancellation_token: CancellationToken,
}

impl InnerRamBuffer {
    /// The main loop of the filler task.
    async fn fill(&self, mut source: Box<dyn RawMediaReader>) {
        let mut chunk = vec![0u8; FILL_CHUNK_SIZE];
        let mut backoff = BACKOFF_INITIAL;
        let mut stalled_since: Option<Instant> = None;

        loop {
            let free = match self.wait_for_space().await {
                Some(e) => e,
                None => break,
            };

            let read_len = free.min(chunk.len());
            let read = select! {
                _ = self.cancellation_token.cancelled() => break,
                result = source.read(&mut chunk[..read_len]) => result,
            };

            match read {
                Ok(0) => {
                    // the torrent reader reports EOF while the piece hasn't arrived yet
                    let stalled = stalled_since.get_or_insert_with(Instant::now);
                    if stalled.elapsed() >= SOURCE_STALL_TIMEOUT {
                        warn!(
                            "Buffer source stalled for {:?}, ending the stream",
                            SOURCE_STALL_TIMEOUT
                        );
                        self.complete(Some(format!(
                            "the source stalled for {}s",
                            SOURCE_STALL_TIMEOUT.as_secs()
                        )))
                        .await;
                        break;
                    }

                    select! {
                        _ = self.cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Ok(read) => {
                    stalled_since = None;
                    backoff = BACKOFF_INITIAL;

                    let mut state = self.state.lock().await;
                    if state.closed {
                        break;
                    }
                    state.push(&chunk[..read]);
                    drop(state);
                    self.data_available.notify_waiters();
                }
                Err(e) => {
                    debug!("Buffer source ended with an error, {}", e);
                    self.complete(Some(e.to_string())).await;
                    break;
                }
            }
        }

        self.complete(None).await;
        source.close().await;
        trace!("Ram buffer filler ended");
    }

    /// Wait until the ring has free space, returning the available capacity.
    /// It returns [None] when the buffer has been closed in the meantime.
    async fn wait_for_space(&self) -> Option<usize> {
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                let free = state.ring.len() - state.len;
                if free > 0 {
                    return Some(free);
                }
            }

            select! {
                _ = self.cancellation_token.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Mark the source as terminally ended, keeping the first recorded error sticky.
    async fn complete(&self, error: Option<String>) {
        let mut state = self.state.lock().await;
        if !state.source_done {
            state.source_done = true;
            state.source_error = error;
        }
        drop(state);
        self.data_available.notify_waiters();
    }
}

#[derive(Debug)]
struct BufferState {
    ring: Box<[u8]>,
    /// The read position within the ring
    head: usize,
    /// The number of buffered bytes
    len: usize,
    closed: bool,
    source_done: bool,
    source_error: Option<String>,
}

impl BufferState {
    /// Append the given bytes to the ring.
    /// The caller must have verified that the ring has sufficient free space.
    fn push(&mut self, data: &[u8]) {
        let capacity = self.ring.len();
        let mut tail = (self.head + self.len) % capacity;

        for byte in data {
            self.ring[tail] = *byte;
            tail = (tail + 1) % capacity;
        }
        self.len += data.len();
    }

    /// Pop buffered bytes into the given buffer, returning the number of copied bytes.
    fn pop(&mut self, buf: &mut [u8]) -> usize {
        let capacity = self.ring.len();
        let read = buf.len().min(self.len);

        for item in buf.iter_mut().take(read) {
            *item = self.ring[self.head];
            self.head = (self.head + 1) % capacity;
        }
        self.len -= read;

        read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use peerflux_core::init_logger;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    /// A scripted source which replays the given read results towards the filler.
    #[derive(Debug)]
    struct ScriptedReader {
        script: Mutex<VecDeque<ScriptItem>>,
        closed: Arc<AtomicBool>,
        reads: Option<UnboundedSender<()>>,
    }

    #[derive(Debug)]
    enum ScriptItem {
        Data(Vec<u8>),
        Eof,
        Error(String),
        Pending,
    }

    impl ScriptedReader {
        fn new(script: Vec<ScriptItem>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                closed: Arc::new(AtomicBool::new(false)),
                reads: None,
            }
        }
    }

    #[async_trait]
    impl RawMediaReader for ScriptedReader {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(reads) = self.reads.as_ref() {
                let _ = reads.send(());
            }
            match self.script.lock().await.pop_front() {
                Some(ScriptItem::Data(data)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok(len)
                }
                Some(ScriptItem::Eof) | None => Ok(0),
                Some(ScriptItem::Error(e)) => Err(io::Error::other(e)),
                Some(ScriptItem::Pending) => {
                    futures::future::pending::<()>().await;
                    Ok(0)
                }
            }
        }

        fn set_responsive(&self) {}

        async fn close(&mut self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn test_read_preserves_source_order() {
        init_logger!();
        let source = ScriptedReader::new(vec![
            ScriptItem::Data(b"lorem ".to_vec()),
            ScriptItem::Eof,
            ScriptItem::Data(b"ipsum ".to_vec()),
            ScriptItem::Data(b"dolor".to_vec()),
        ]);
        let buffer = RamBuffer::new(Box::new(source), 1024);

        let mut result = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            match buffer.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => result.extend_from_slice(&chunk[..read]),
                Err(e) => panic!("expected no error, but got {}", e),
            }
        }

        assert_eq!(b"lorem ipsum dolor".to_vec(), result);
    }

    #[tokio::test]
    async fn test_prebuffer() {
        init_logger!();
        let source = ScriptedReader::new(vec![
            ScriptItem::Data(vec![1u8; 512]),
            ScriptItem::Data(vec![2u8; 512]),
            ScriptItem::Pending,
        ]);
        let buffer = RamBuffer::new(Box::new(source), 4096);

        let result = buffer.prebuffer(1024, Duration::from_secs(2)).await;

        assert_eq!(Ok(()), result);
        assert!(
            buffer.buffered().await >= 1024,
            "expected the buffered count to be at least the prebuffer target"
        );
    }

    #[tokio::test]
    async fn test_prebuffer_timeout() {
        init_logger!();
        let source = ScriptedReader::new(vec![ScriptItem::Data(vec![1u8; 64]), ScriptItem::Pending]);
        let buffer = RamBuffer::new(Box::new(source), 4096);

        let result = buffer.prebuffer(1024, Duration::from_millis(100)).await;

        assert_eq!(Err(Error::PrebufferTimeout(Duration::from_millis(100))), result);
    }

    #[tokio::test]
    async fn test_read_after_close() {
        init_logger!();
        let source = ScriptedReader::new(vec![ScriptItem::Pending]);
        let closed = source.closed.clone();
        let buffer = RamBuffer::new(Box::new(source), 1024);

        buffer.close().await;
        buffer.close().await;
        let result = buffer.read(&mut [0u8; 16]).await;

        match result {
            Err(e) => assert_eq!(io::ErrorKind::BrokenPipe, e.kind()),
            Ok(read) => assert!(false, "expected an error, but got {} bytes", read),
        }
        peerflux_core::assert_timeout!(
            Duration::from_millis(500),
            closed.load(Ordering::Relaxed),
            "expected the source to have been closed"
        );
    }

    #[tokio::test]
    async fn test_sticky_source_error_after_drain() {
        init_logger!();
        let source = ScriptedReader::new(vec![
            ScriptItem::Data(b"lorem".to_vec()),
            ScriptItem::Error("connection reset".to_string()),
        ]);
        let buffer = RamBuffer::new(Box::new(source), 1024);

        let mut chunk = [0u8; 16];
        let read = loop {
            let read = buffer.read(&mut chunk).await.unwrap();
            if read > 0 {
                break read;
            }
        };
        assert_eq!(b"lorem", &chunk[..read]);

        let result = buffer.read(&mut chunk).await;
        match &result {
            Err(e) => assert_eq!("connection reset", e.to_string()),
            _ => assert!(false, "expected the sticky source error, but got {:?}", result),
        }

        let result = buffer.read(&mut chunk).await;
        assert!(
            result.is_err(),
            "expected the source error to remain sticky"
        );
    }

    #[tokio::test]
    async fn test_transient_eof_is_retried() {
        init_logger!();
        let (tx, mut rx) = unbounded_channel();
        let mut source = ScriptedReader::new(vec![
            ScriptItem::Eof,
            ScriptItem::Eof,
            ScriptItem::Data(b"ipsum".to_vec()),
            ScriptItem::Pending,
        ]);
        source.reads = Some(tx);
        let buffer = RamBuffer::new(Box::new(source), 1024);

        let mut chunk = [0u8; 16];
        let read = buffer.read(&mut chunk).await.unwrap();

        assert_eq!(b"ipsum", &chunk[..read]);
        let mut reads = 0;
        while rx.try_recv().is_ok() {
            reads += 1;
        }
        assert!(
            reads >= 3,
            "expected the transient EOFs to have been retried, but got {} reads",
            reads
        );
    }

    #[tokio::test]
    async fn test_reader_adapter() {
        init_logger!();
        let source = ScriptedReader::new(vec![
            ScriptItem::Data(b"lorem ipsum".to_vec()),
            ScriptItem::Error("source gone".to_string()),
        ]);
        let buffer = RamBuffer::new(Box::new(source), 1024);

        let mut reader = buffer.reader();
        let mut data = Vec::new();
        let result = reader.read_to_end(&mut data).await;

        assert_eq!(b"lorem ipsum".to_vec(), data);
        assert!(
            result.is_err(),
            "expected the source error to surface through the adapter"
        );
    }
}
