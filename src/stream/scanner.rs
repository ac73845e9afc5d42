// Cancellation-aware line scanner over an upstream byte stream, with idle
// detection via the shared watcher and a pooled read buffer.

use super::idle::{Done, IdleWatcher, Touch};
use super::pool::BufferPool;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

pub type ByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static>>;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub max_line_size: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            buffer_size: 64 * 1024,
            max_line_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("request cancelled")]
    Cancelled,
    /// The idle watcher fired: no upstream bytes within the timeout. This is
    /// distinct from a normal EOF.
    #[error("stream idle timeout")]
    IdleAborted,
    #[error("line exceeds maximum size of {0} bytes")]
    LineTooLong(usize),
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

pub struct LineScanner {
    reader: BufReader<StreamReader<ByteStream, Bytes>>,
    buf: Vec<u8>,
    pool: &'static BufferPool,
    cancel: CancellationToken,
    idle_fired: CancellationToken,
    touch: Touch,
    done: Done,
    max_line_size: usize,
    closed: bool,
}

impl LineScanner {
    pub fn new(
        cancel: CancellationToken,
        body: ByteStream,
        watcher: &IdleWatcher,
        cfg: ScannerConfig,
    ) -> Self {
        let idle_fired = CancellationToken::new();
        let trigger = idle_fired.clone();
        // On idle the pending read is aborted, which surfaces to the caller
        // the way a closed upstream body would.
        let (touch, done) = watcher.register(
            cfg.idle_timeout,
            Box::new(move || {
                trigger.cancel();
            }),
        );

        let pool = BufferPool::global();
        let buf = pool.get(cfg.buffer_size);

        Self {
            reader: BufReader::with_capacity(cfg.buffer_size, StreamReader::new(body)),
            buf,
            pool,
            cancel,
            idle_fired,
            touch,
            done,
            max_line_size: cfg.max_line_size,
            closed: false,
        }
    }

    /// Reads the next line. Returns Ok(false) on clean EOF. The line is
    /// available via [`line`] until the next call.
    pub async fn scan(&mut self) -> Result<bool, ScanError> {
        if self.cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        if self.idle_fired.is_cancelled() {
            return Err(ScanError::IdleAborted);
        }

        self.buf.clear();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ScanError::Cancelled),
            _ = self.idle_fired.cancelled() => Err(ScanError::IdleAborted),
            read = self.reader.read_until(b'\n', &mut self.buf) => {
                match read {
                    Ok(0) => Ok(false),
                    Ok(n) => {
                        (self.touch)();
                        if n > self.max_line_size {
                            return Err(ScanError::LineTooLong(self.max_line_size));
                        }
                        while matches!(self.buf.last(), Some(&b'\n') | Some(&b'\r')) {
                            self.buf.pop();
                        }
                        Ok(true)
                    }
                    Err(e) => {
                        if self.idle_fired.is_cancelled() {
                            Err(ScanError::IdleAborted)
                        } else {
                            Err(ScanError::Io(e))
                        }
                    }
                }
            }
        }
    }

    /// The current line, without its trailing newline.
    pub fn line(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the buffer to the pool and releases the idle registration.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        (self.done)();
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

impl Drop for LineScanner {
    fn drop(&mut self) {
        self.close();
    }
}
